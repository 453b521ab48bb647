//! Basic wallet usage example

use wallet_ledger::{
    telemetry, DepositRequest, Ledger, LedgerConfig, LedgerError, MemoryStorage, OwnerId,
    SystemAccount, TransferRequest, WithdrawRequest,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();
    println!("👛 Wallet Ledger - Basic Wallet Example\n");

    // Create a new ledger with in-memory storage
    let config = LedgerConfig::from_env()?;
    let ledger = Ledger::with_config(MemoryStorage::new(), config);

    // 1. System accounts and wallets
    println!("🏦 Opening accounts...");
    let (reserve, fees) = ledger.bootstrap_system_accounts().await?;
    println!("  ✓ Reserve account #{} ({})", reserve.id, reserve.label());
    println!("  ✓ Fee account #{} ({})", fees.id, fees.label());

    let alice = OwnerId(1);
    let bob = OwnerId(2);
    for owner in [alice, bob] {
        let account = ledger.open_account(owner).await?;
        println!("  ✓ Wallet #{} for {}", account.id, account.label());
    }
    println!();

    // 2. Money in
    println!("💰 Deposits...");
    let receipt = ledger
        .deposit(DepositRequest {
            owner: alice,
            amount: 600_000,
            idempotency_key: "demo-dep-1".to_string(),
            reference: None,
        })
        .await?;
    println!("  ✓ {} (ref {})", receipt.message, receipt.reference);

    // Retrying the same request is harmless
    let replay = ledger
        .deposit(DepositRequest {
            owner: alice,
            amount: 600_000,
            idempotency_key: "demo-dep-1".to_string(),
            reference: None,
        })
        .await?;
    println!(
        "  ✓ Retry replayed transaction #{}, balance still {}",
        replay.transaction_id, replay.balance
    );
    println!();

    // 3. Transfer with a fee
    println!("🔁 Transfers...");
    let transfer = ledger
        .transfer(TransferRequest {
            from_owner: alice,
            to_owner: bob,
            amount: 100_000,
            fee: Some(5_000),
            idempotency_key: "demo-p2p-1".to_string(),
            reference: None,
        })
        .await?;
    println!("  ✓ {}", transfer.message);
    println!(
        "    Sender: {}  Recipient: {}  Fee: {}",
        transfer.sender_balance, transfer.recipient_balance, transfer.fee
    );
    println!();

    // 4. Money out, including a rejected withdrawal
    println!("🏧 Withdrawals...");
    let receipt = ledger
        .withdraw(WithdrawRequest {
            owner: bob,
            amount: 40_000,
            idempotency_key: "demo-wdr-1".to_string(),
            reference: None,
        })
        .await?;
    println!("  ✓ {}, balance {}", receipt.message, receipt.balance);

    match ledger
        .withdraw(WithdrawRequest {
            owner: bob,
            amount: 1_000_000,
            idempotency_key: "demo-wdr-2".to_string(),
            reference: None,
        })
        .await
    {
        Err(LedgerError::InsufficientBalance {
            available,
            required,
        }) => println!(
            "  ✗ Rejected: available {}, required {}",
            available, required
        ),
        other => println!("  ? Unexpected outcome: {:?}", other),
    }
    println!();

    // 5. Balances and audit
    println!("📊 Balances...");
    for owner in [alice, bob] {
        let view = ledger.get_balance(owner).await?;
        println!("  {} {}: {}", view.currency, view.owner, view.balance);
    }
    for system in [SystemAccount::Reserve, SystemAccount::Fee] {
        let account = ledger.get_system_account(system).await?;
        println!("  {}: {}", account.label(), account.balance);
    }
    println!();

    let report = ledger.verify_integrity().await?;
    println!("🔍 Integrity check");
    println!(
        "  Accounts: {}, transactions: {}, postings: {}",
        report.accounts_checked, report.transactions_checked, report.postings_checked
    );
    println!("  Net position: {}", report.net_position);
    println!(
        "  Status: {}",
        if report.is_valid { "✓ balanced" } else { "✗ issues found" }
    );
    for issue in &report.issues {
        println!("    - {}", issue);
    }

    Ok(())
}
