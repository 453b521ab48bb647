//! Concurrency tests: idempotency races, lock ordering and balance safety

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::timeout;
use wallet_ledger::{
    DepositRequest, Ledger, LedgerError, LedgerStorage, MemoryStorage, OwnerId, TransferRequest,
    WithdrawRequest,
};

const DEADLINE: Duration = Duration::from_secs(30);

async fn ledger_with_owners(owners: i64, opening_balance: i64) -> Arc<Ledger<MemoryStorage>> {
    let ledger = Ledger::new(MemoryStorage::new());
    ledger.bootstrap_system_accounts().await.unwrap();
    for owner in 1..=owners {
        ledger.open_account(OwnerId(owner)).await.unwrap();
        ledger
            .deposit(DepositRequest {
                owner: OwnerId(owner),
                amount: opening_balance,
                idempotency_key: format!("open-{}", owner),
                reference: None,
            })
            .await
            .unwrap();
    }
    Arc::new(ledger)
}

fn transfer(from: i64, to: i64, amount: i64, fee: i64, key: String) -> TransferRequest {
    TransferRequest {
        from_owner: OwnerId(from),
        to_owner: OwnerId(to),
        amount,
        fee: Some(fee),
        idempotency_key: key,
        reference: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_key_deposits_post_once() {
    let ledger = ledger_with_owners(1, 500_000).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .deposit(DepositRequest {
                    owner: OwnerId(1),
                    amount: 100_000,
                    idempotency_key: "d1".to_string(),
                    reference: None,
                })
                .await
        }));
    }

    let mut receipts = Vec::new();
    for handle in handles {
        let receipt = timeout(DEADLINE, handle).await.unwrap().unwrap().unwrap();
        receipts.push(receipt);
    }

    let first = receipts[0].transaction_id;
    assert!(receipts.iter().all(|r| r.transaction_id == first));
    assert_eq!(receipts.iter().filter(|r| !r.replayed).count(), 1);
    assert_eq!(ledger.get_balance(OwnerId(1)).await.unwrap().balance, 600_000);

    let deposits = ledger
        .storage()
        .list_transactions()
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.idempotency_key == "d1")
        .count();
    assert_eq!(deposits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposing_transfers_do_not_deadlock() {
    let ledger = ledger_with_owners(2, 10_000_000).await;

    let mut handles = Vec::new();
    for i in 0..100 {
        let ledger = ledger.clone();
        let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
        handles.push(tokio::spawn(async move {
            ledger
                .transfer(transfer(from, to, 10_000, 0, format!("swap-{}", i)))
                .await
        }));
    }

    for handle in handles {
        timeout(DEADLINE, handle)
            .await
            .expect("transfer did not finish, possible deadlock")
            .unwrap()
            .unwrap();
    }

    // Equal numbers of transfers in each direction cancel out
    assert_eq!(ledger.get_balance(OwnerId(1)).await.unwrap().balance, 10_000_000);
    assert_eq!(ledger.get_balance(OwnerId(2)).await.unwrap().balance, 10_000_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_random_transfers_conserve_money() {
    const OWNERS: i64 = 6;
    const OPENING: i64 = 1_000_000;
    let ledger = ledger_with_owners(OWNERS, OPENING).await;

    let mut rng = rand::thread_rng();
    let mut handles = Vec::new();
    for i in 0..200 {
        let from = rng.gen_range(1..=OWNERS);
        let mut to = rng.gen_range(1..=OWNERS);
        if to == from {
            to = from % OWNERS + 1;
        }
        let amount = rng.gen_range(10_000..=400_000);
        let fee = rng.gen_range(0..=1_000);

        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .transfer(transfer(from, to, amount, fee, format!("rand-{}", i)))
                .await
        }));
    }

    let mut collected_fees = 0;
    for handle in handles {
        match timeout(DEADLINE, handle)
            .await
            .expect("transfer did not finish, possible deadlock")
            .unwrap()
        {
            Ok(receipt) => collected_fees += receipt.fee,
            Err(LedgerError::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected transfer failure: {}", e),
        }
    }

    let mut total = 0;
    for owner in 1..=OWNERS {
        let balance = ledger.get_balance(OwnerId(owner)).await.unwrap().balance;
        assert!(balance >= 0, "owner {} went negative: {}", owner, balance);
        total += balance;
    }
    assert_eq!(total + collected_fees, OWNERS * OPENING);

    let report = ledger.verify_integrity().await.unwrap();
    assert!(report.is_valid, "{:?}", report.issues);
    assert_eq!(report.net_position, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_withdrawals_never_overdraw() {
    let ledger = ledger_with_owners(1, 100_000).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .withdraw(WithdrawRequest {
                    owner: OwnerId(1),
                    amount: 30_000,
                    idempotency_key: format!("w-{}", i),
                    reference: None,
                })
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match timeout(DEADLINE, handle).await.unwrap().unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected withdrawal failure: {}", e),
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(ledger.get_balance(OwnerId(1)).await.unwrap().balance, 10_000);
}
