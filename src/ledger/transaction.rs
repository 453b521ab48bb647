//! Posting plans and transaction recording

use tracing::debug;

use crate::traits::*;
use crate::types::*;

/// One signed leg of a planned transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingLeg {
    pub account_id: AccountId,
    pub amount: i64,
}

/// A balanced set of legs ready to be written inside a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingPlan {
    pub transaction: NewTransaction,
    pub legs: Vec<PostingLeg>,
}

impl PostingPlan {
    /// Sum of all legs, zero for a valid plan
    pub fn net(&self) -> i128 {
        self.legs.iter().map(|l| i128::from(l.amount)).sum()
    }
}

/// Transaction builder for creating balanced posting plans
#[derive(Debug)]
pub struct TransactionBuilder {
    transaction: NewTransaction,
    legs: Vec<PostingLeg>,
}

impl TransactionBuilder {
    /// Create a new transaction builder
    pub fn new(
        kind: TransactionKind,
        idempotency_key: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            transaction: NewTransaction {
                idempotency_key: idempotency_key.into(),
                kind,
                amount: 0,
                currency: currency.into(),
                reference: String::new(),
                from_account: None,
                to_account: None,
            },
            legs: Vec::new(),
        }
    }

    /// Set the principal amount recorded on the transaction
    pub fn amount(mut self, amount: i64) -> Self {
        self.transaction.amount = amount;
        self
    }

    /// Set the reference for the transaction
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.transaction.reference = reference.into();
        self
    }

    /// Set the principal source and destination accounts
    pub fn between(mut self, from: AccountId, to: AccountId) -> Self {
        self.transaction.from_account = Some(from);
        self.transaction.to_account = Some(to);
        self
    }

    /// Add a debit leg
    pub fn debit(mut self, account_id: AccountId, amount: i64) -> Self {
        self.legs.push(PostingLeg {
            account_id,
            amount: -amount,
        });
        self
    }

    /// Add a credit leg
    pub fn credit(mut self, account_id: AccountId, amount: i64) -> Self {
        self.legs.push(PostingLeg { account_id, amount });
        self
    }

    /// Build the plan, checking the double-entry rules
    pub fn build(self) -> LedgerResult<PostingPlan> {
        let plan = PostingPlan {
            transaction: self.transaction,
            legs: self.legs,
        };

        if plan.legs.len() < 2 {
            return Err(LedgerError::Integrity(format!(
                "{} plan has {} leg(s), at least two are required",
                plan.transaction.kind,
                plan.legs.len()
            )));
        }

        if plan.legs.iter().any(|l| l.amount == 0) {
            return Err(LedgerError::Integrity(format!(
                "{} plan contains a zero-amount leg",
                plan.transaction.kind
            )));
        }

        if plan.net() != 0 {
            return Err(LedgerError::Integrity(format!(
                "{} plan is not balanced: legs sum to {}",
                plan.transaction.kind,
                plan.net()
            )));
        }

        Ok(plan)
    }
}

/// Writes posting plans into a unit of work
pub struct TransactionManager;

impl TransactionManager {
    /// Create the transaction and its postings inside `uow`.
    ///
    /// Every account referenced by the plan must already be locked by `uow`.
    pub async fn record<U: UnitOfWork>(uow: &mut U, plan: PostingPlan) -> LedgerResult<Transaction> {
        let currency = plan.transaction.currency.clone();
        let transaction = uow.create_transaction(plan.transaction).await?;

        for leg in plan.legs {
            let posting = uow
                .create_posting(NewPosting {
                    transaction_id: transaction.id,
                    account_id: leg.account_id,
                    amount: leg.amount,
                    currency: currency.clone(),
                })
                .await?;
            debug!(
                transaction_id = %transaction.id,
                account_id = %posting.account_id,
                amount = posting.amount,
                "posting written"
            );
        }

        Ok(transaction)
    }
}

/// Posting plans for the wallet operations
pub mod patterns {
    use super::*;

    /// Parameters shared by every wallet operation
    #[derive(Debug, Clone)]
    pub struct PlanContext<'a> {
        pub idempotency_key: &'a str,
        pub currency: &'a str,
        pub reference: &'a str,
    }

    /// Deposit: debit the reserve, credit the user
    pub fn deposit(
        ctx: PlanContext<'_>,
        reserve: AccountId,
        user: AccountId,
        amount: i64,
    ) -> LedgerResult<PostingPlan> {
        TransactionBuilder::new(TransactionKind::Deposit, ctx.idempotency_key, ctx.currency)
            .amount(amount)
            .reference(ctx.reference)
            .between(reserve, user)
            .debit(reserve, amount)
            .credit(user, amount)
            .build()
    }

    /// Withdrawal: debit the user, credit the reserve
    pub fn withdrawal(
        ctx: PlanContext<'_>,
        user: AccountId,
        reserve: AccountId,
        amount: i64,
    ) -> LedgerResult<PostingPlan> {
        TransactionBuilder::new(TransactionKind::Withdrawal, ctx.idempotency_key, ctx.currency)
            .amount(amount)
            .reference(ctx.reference)
            .between(user, reserve)
            .debit(user, amount)
            .credit(reserve, amount)
            .build()
    }

    /// Transfer: debit the sender by amount + fee, credit the recipient by
    /// amount and the fee account by fee
    pub fn transfer(
        ctx: PlanContext<'_>,
        sender: AccountId,
        recipient: AccountId,
        fee_account: Option<AccountId>,
        amount: i64,
        fee: i64,
    ) -> LedgerResult<PostingPlan> {
        let total_debit = amount.checked_add(fee).ok_or_else(|| {
            LedgerError::Integrity(format!("transfer total overflows: {} + {}", amount, fee))
        })?;

        let builder =
            TransactionBuilder::new(TransactionKind::P2p, ctx.idempotency_key, ctx.currency)
                .amount(amount)
                .reference(ctx.reference)
                .between(sender, recipient)
                .debit(sender, total_debit)
                .credit(recipient, amount);

        let builder = match (fee, fee_account) {
            (0, _) => builder,
            (fee, Some(fee_account)) => builder.credit(fee_account, fee),
            (_, None) => {
                return Err(LedgerError::Integrity(
                    "transfer fee requires a fee account".to_string(),
                ))
            }
        };

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::patterns::*;
    use super::*;
    use proptest::prelude::*;

    fn ctx() -> PlanContext<'static> {
        PlanContext {
            idempotency_key: "key-1",
            currency: "NGN",
            reference: "REF-1",
        }
    }

    #[test]
    fn test_deposit_plan() {
        let plan = deposit(ctx(), AccountId(1), AccountId(10), 100_000).unwrap();
        assert_eq!(plan.transaction.kind, TransactionKind::Deposit);
        assert_eq!(plan.transaction.from_account, Some(AccountId(1)));
        assert_eq!(plan.transaction.to_account, Some(AccountId(10)));
        assert_eq!(
            plan.legs,
            vec![
                PostingLeg {
                    account_id: AccountId(1),
                    amount: -100_000
                },
                PostingLeg {
                    account_id: AccountId(10),
                    amount: 100_000
                },
            ]
        );
    }

    #[test]
    fn test_transfer_plan_with_fee_has_three_legs() {
        let plan = transfer(
            ctx(),
            AccountId(10),
            AccountId(11),
            Some(AccountId(2)),
            100_000,
            5_000,
        )
        .unwrap();
        assert_eq!(plan.legs.len(), 3);
        assert_eq!(plan.legs[0].amount, -105_000);
        assert_eq!(plan.net(), 0);
    }

    #[test]
    fn test_transfer_plan_without_fee_has_two_legs() {
        let plan = transfer(ctx(), AccountId(10), AccountId(11), None, 100_000, 0).unwrap();
        assert_eq!(plan.legs.len(), 2);
    }

    #[test]
    fn test_unbalanced_plan_is_rejected() {
        let result = TransactionBuilder::new(TransactionKind::Refund, "k", "NGN")
            .debit(AccountId(1), 100)
            .credit(AccountId(2), 90)
            .build();
        assert!(matches!(result, Err(LedgerError::Integrity(_))));

        let result = TransactionBuilder::new(TransactionKind::Refund, "k", "NGN")
            .credit(AccountId(2), 90)
            .build();
        assert!(matches!(result, Err(LedgerError::Integrity(_))));
    }

    proptest! {
        #[test]
        fn transfer_plans_always_balance(amount in 1i64..1_000_000_000, fee in 0i64..1_000_000) {
            let plan = transfer(ctx(), AccountId(5), AccountId(6), Some(AccountId(2)), amount, fee).unwrap();
            prop_assert_eq!(plan.net(), 0);
            prop_assert!(plan.legs.iter().all(|l| l.amount != 0));
        }
    }
}
