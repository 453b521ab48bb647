//! Ledger invariants: running balances, zero-sum transactions and audits
//!
//! These checks run inside the storage layer, so they hold regardless of
//! which code path wrote the postings. A violation is always a defect and is
//! reported as [`LedgerError::Integrity`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::*;

/// Apply a posting to the running balance of its (locked) account
pub fn apply_posting(account: &mut Account, posting: &NewPosting) -> LedgerResult<()> {
    if posting.amount == 0 {
        return Err(LedgerError::Integrity(format!(
            "zero-amount posting for transaction {}",
            posting.transaction_id
        )));
    }

    if posting.account_id != account.id {
        return Err(LedgerError::Integrity(format!(
            "posting for account {} applied to account {}",
            posting.account_id, account.id
        )));
    }

    if posting.currency != account.currency {
        return Err(LedgerError::Integrity(format!(
            "posting currency {} does not match account {} currency {}",
            posting.currency, account.id, account.currency
        )));
    }

    account.balance = account
        .balance
        .checked_add(posting.amount)
        .ok_or_else(|| {
            LedgerError::Integrity(format!("balance overflow on account {}", account.id))
        })?;
    account.updated_at = chrono::Utc::now().naive_utc();

    Ok(())
}

/// Check the double-entry law for one transaction
pub fn check_zero_sum(transaction: &Transaction, postings: &[Posting]) -> LedgerResult<()> {
    if postings.len() < 2 {
        return Err(LedgerError::Integrity(format!(
            "transaction {} has {} posting(s), at least two are required",
            transaction.id,
            postings.len()
        )));
    }

    if let Some(stray) = postings
        .iter()
        .find(|p| p.transaction_id != transaction.id)
    {
        return Err(LedgerError::Integrity(format!(
            "posting {} belongs to transaction {}, not {}",
            stray.id, stray.transaction_id, transaction.id
        )));
    }

    let sum: i128 = postings.iter().map(|p| i128::from(p.amount)).sum();
    if sum != 0 {
        return Err(LedgerError::Integrity(format!(
            "postings of transaction {} sum to {}",
            transaction.id, sum
        )));
    }

    Ok(())
}

/// Check that no user account holds a negative balance
pub fn check_balances<'a>(accounts: impl IntoIterator<Item = &'a Account>) -> LedgerResult<()> {
    for account in accounts {
        if account.is_user() && account.balance < 0 {
            return Err(LedgerError::Integrity(format!(
                "negative balance {} on {}",
                account.balance,
                account.label()
            )));
        }
    }
    Ok(())
}

/// Report on ledger integrity across all committed data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerIntegrityReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub accounts_checked: usize,
    pub transactions_checked: usize,
    pub postings_checked: usize,
    /// Sum of every account balance; zero for a consistent ledger
    pub net_position: i128,
}

/// Audit the whole ledger.
///
/// Checks the zero-sum law per transaction, `balance == SUM(postings)` per
/// account and non-negative user balances.
pub fn audit(
    accounts: &[Account],
    transactions: &[Transaction],
    postings: &[Posting],
) -> LedgerIntegrityReport {
    let mut issues = Vec::new();

    let mut by_transaction: HashMap<TransactionId, Vec<Posting>> = HashMap::new();
    let mut by_account: HashMap<AccountId, i128> = HashMap::new();
    for posting in postings {
        by_transaction
            .entry(posting.transaction_id)
            .or_default()
            .push(posting.clone());
        *by_account.entry(posting.account_id).or_default() += i128::from(posting.amount);
    }

    for transaction in transactions {
        if !transaction.is_posted() {
            issues.push(format!(
                "transaction {} is committed with status {}",
                transaction.id, transaction.status
            ));
        }
        let legs = by_transaction
            .remove(&transaction.id)
            .unwrap_or_default();
        if let Err(e) = check_zero_sum(transaction, &legs) {
            issues.push(e.to_string());
        }
    }

    for orphan in by_transaction.keys() {
        issues.push(format!("postings reference unknown transaction {}", orphan));
    }

    let mut net_position: i128 = 0;
    for account in accounts {
        net_position += i128::from(account.balance);
        let posted = by_account.remove(&account.id).unwrap_or_default();
        if posted != i128::from(account.balance) {
            issues.push(format!(
                "balance of {} is {} but its postings sum to {}",
                account.label(),
                account.balance,
                posted
            ));
        }
    }
    if let Err(e) = check_balances(accounts) {
        issues.push(e.to_string());
    }

    for orphan in by_account.keys() {
        issues.push(format!("postings reference unknown account {}", orphan));
    }

    if net_position != 0 {
        issues.push(format!("account balances sum to {}", net_position));
    }

    LedgerIntegrityReport {
        is_valid: issues.is_empty(),
        issues,
        accounts_checked: accounts.len(),
        transactions_checked: transactions.len(),
        postings_checked: postings.len(),
        net_position,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction(id: i64) -> Transaction {
        let now = chrono::Utc::now().naive_utc();
        Transaction {
            id: TransactionId(id),
            idempotency_key: format!("key-{}", id),
            kind: TransactionKind::Deposit,
            status: TransactionStatus::Posted,
            amount: 100,
            currency: "NGN".to_string(),
            reference: "ref".to_string(),
            from_account: Some(AccountId(2)),
            to_account: Some(AccountId(1)),
            created_at: now,
            posted_at: Some(now),
        }
    }

    fn posting(id: i64, transaction_id: i64, account_id: i64, amount: i64) -> Posting {
        Posting {
            id: PostingId(id),
            transaction_id: TransactionId(transaction_id),
            account_id: AccountId(account_id),
            amount,
            currency: "NGN".to_string(),
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    #[test]
    fn test_apply_posting_updates_running_balance() {
        let mut account = Account::user(AccountId(1), OwnerId(1), "NGN");
        let credit = NewPosting {
            transaction_id: TransactionId(1),
            account_id: AccountId(1),
            amount: 500,
            currency: "NGN".to_string(),
        };
        apply_posting(&mut account, &credit).unwrap();
        assert_eq!(account.balance, 500);

        let debit = NewPosting {
            amount: -200,
            ..credit.clone()
        };
        apply_posting(&mut account, &debit).unwrap();
        assert_eq!(account.balance, 300);
    }

    #[test]
    fn test_apply_posting_rejects_zero_and_foreign_currency() {
        let mut account = Account::user(AccountId(1), OwnerId(1), "NGN");
        let zero = NewPosting {
            transaction_id: TransactionId(1),
            account_id: AccountId(1),
            amount: 0,
            currency: "NGN".to_string(),
        };
        assert!(matches!(
            apply_posting(&mut account, &zero),
            Err(LedgerError::Integrity(_))
        ));

        let usd = NewPosting {
            amount: 10,
            currency: "USD".to_string(),
            ..zero
        };
        assert!(matches!(
            apply_posting(&mut account, &usd),
            Err(LedgerError::Integrity(_))
        ));
        assert_eq!(account.balance, 0);
    }

    #[test]
    fn test_zero_sum() {
        let txn = transaction(1);
        let balanced = vec![posting(1, 1, 2, -100), posting(2, 1, 1, 100)];
        assert!(check_zero_sum(&txn, &balanced).is_ok());

        let unbalanced = vec![posting(1, 1, 2, -100), posting(2, 1, 1, 90)];
        let err = check_zero_sum(&txn, &unbalanced).unwrap_err();
        assert!(err.to_string().contains("sum to -10"));

        let single = vec![posting(1, 1, 1, 100)];
        assert!(check_zero_sum(&txn, &single).is_err());
    }

    #[test]
    fn test_negative_user_balance_is_rejected() {
        let mut user = Account::user(AccountId(1), OwnerId(1), "NGN");
        let mut reserve =
            Account::system(AccountId(2), SystemAccount::Reserve, "sys_reserve", "NGN");
        reserve.balance = -1_000;
        assert!(check_balances([&user, &reserve]).is_ok());

        user.balance = -1;
        assert!(check_balances([&user, &reserve]).is_err());
    }

    #[test]
    fn test_audit_detects_drift() {
        let mut user = Account::user(AccountId(1), OwnerId(1), "NGN");
        let mut reserve =
            Account::system(AccountId(2), SystemAccount::Reserve, "sys_reserve", "NGN");
        user.balance = 100;
        reserve.balance = -100;
        let postings = vec![posting(1, 1, 2, -100), posting(2, 1, 1, 100)];
        let transactions = vec![transaction(1)];

        let report = audit(&[user.clone(), reserve.clone()], &transactions, &postings);
        assert!(report.is_valid, "{:?}", report.issues);
        assert_eq!(report.net_position, 0);

        user.balance = 150;
        let report = audit(&[user, reserve], &transactions, &postings);
        assert!(!report.is_valid);
        assert!(report.issues.iter().any(|i| i.contains("postings sum to 100")));
    }
}
