//! Main ledger orchestrator: deposits, withdrawals and transfers
//!
//! Every operation follows the same template: validate, check the idempotency
//! key, open a unit of work, lock the accounts in global lock order, check
//! balances under the lock, write the transaction and its postings, commit.

use std::time::Instant;
use tracing::{debug, error, info};

use crate::config::LedgerConfig;
use crate::ledger::account::{ensure_active, AccountManager};
use crate::ledger::idempotency::{IdempotencyCheck, IdempotencyGuard};
use crate::ledger::invariants::{self, LedgerIntegrityReport};
use crate::ledger::locking::lock_order;
use crate::ledger::transaction::{patterns, TransactionManager};
use crate::traits::*;
use crate::types::*;
use crate::utils::validation;

/// Main ledger system that orchestrates all wallet operations
#[derive(Debug, Clone)]
pub struct Ledger<S: LedgerStorage> {
    storage: S,
    config: LedgerConfig,
    account_manager: AccountManager<S>,
    idempotency: IdempotencyGuard<S>,
}

impl<S: LedgerStorage + Clone> Ledger<S> {
    /// Create a new ledger with the default configuration
    pub fn new(storage: S) -> Self {
        Self::with_config(storage, LedgerConfig::default())
    }

    /// Create a new ledger with custom limits
    pub fn with_config(storage: S, config: LedgerConfig) -> Self {
        Self {
            account_manager: AccountManager::new(storage.clone(), config.clone()),
            idempotency: IdempotencyGuard::new(storage.clone()),
            storage,
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    // Account operations
    /// Create the reserve and fee accounts
    pub async fn bootstrap_system_accounts(&self) -> LedgerResult<(Account, Account)> {
        self.account_manager.bootstrap_system_accounts().await
    }

    /// Open the wallet of an owner
    pub async fn open_account(&self, owner: OwnerId) -> LedgerResult<Account> {
        self.account_manager.open_account(owner).await
    }

    /// Get the wallet of an owner
    pub async fn get_account(&self, owner: OwnerId) -> LedgerResult<Option<Account>> {
        self.account_manager.get_account(owner).await
    }

    /// Get a system account
    pub async fn get_system_account(&self, account: SystemAccount) -> LedgerResult<Account> {
        self.account_manager.get_system_account_required(account).await
    }

    /// Current balance of an owner's wallet
    pub async fn get_balance(&self, owner: OwnerId) -> LedgerResult<BalanceView> {
        self.account_manager.get_balance(owner).await
    }

    /// Freeze an owner's wallet
    pub async fn freeze_account(&self, owner: OwnerId) -> LedgerResult<Account> {
        self.account_manager.freeze_account(owner).await
    }

    /// Unfreeze an owner's wallet
    pub async fn unfreeze_account(&self, owner: OwnerId) -> LedgerResult<Account> {
        self.account_manager.unfreeze_account(owner).await
    }

    // Transaction lookups
    /// Get a transaction by ID
    pub async fn get_transaction(&self, transaction_id: TransactionId) -> LedgerResult<Transaction> {
        self.storage
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(transaction_id.to_string()))
    }

    /// Get the postings of a transaction
    pub async fn get_transaction_postings(
        &self,
        transaction_id: TransactionId,
    ) -> LedgerResult<Vec<Posting>> {
        self.get_transaction(transaction_id).await?;
        self.storage.get_postings(transaction_id).await
    }

    // Wallet operations
    /// Move external money into a wallet
    pub async fn deposit(&self, request: DepositRequest) -> LedgerResult<TransactionReceipt> {
        let started = Instant::now();
        info!(
            owner = %request.owner,
            amount = request.amount,
            key = %request.idempotency_key,
            "deposit started"
        );

        let outcome = self.deposit_inner(&request).await;
        self.finish("deposit", started, outcome)
    }

    async fn deposit_inner(&self, request: &DepositRequest) -> LedgerResult<TransactionReceipt> {
        validation::validate_idempotency_key(&request.idempotency_key)?;
        validation::validate_amount(
            request.amount,
            self.config.min_deposit,
            self.config.max_amount,
        )?;

        let kind = TransactionKind::Deposit;
        if let IdempotencyCheck::Replay(transaction) =
            self.idempotency.check(&request.idempotency_key, kind).await?
        {
            return self.replay_single(transaction, request.owner).await;
        }

        let reference = request
            .reference
            .clone()
            .unwrap_or_else(|| validation::generate_reference(kind));

        match self.execute_deposit(request, &reference).await {
            Ok((transaction, balance)) => Ok(TransactionReceipt {
                transaction_id: transaction.id,
                status: transaction.status,
                balance,
                reference,
                message: format!(
                    "Successfully deposited {}",
                    validation::format_major_units(request.amount, &self.config.currency)
                ),
                replayed: false,
            }),
            Err(LedgerError::DuplicateIdempotencyKey(key)) => {
                let transaction = self.idempotency.resolve_conflict(&key, kind).await?;
                self.replay_single(transaction, request.owner).await
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_deposit(
        &self,
        request: &DepositRequest,
        reference: &str,
    ) -> LedgerResult<(Transaction, i64)> {
        let mut uow = self.storage.begin_unit_of_work().await?;
        let user = uow.get_account_for_update(request.owner).await?;
        ensure_active(&user)?;
        let reserve = uow
            .get_system_account_for_update(SystemAccount::Reserve)
            .await?;

        let plan = patterns::deposit(
            self.plan_context(&request.idempotency_key, reference),
            reserve.id,
            user.id,
            request.amount,
        )?;
        let transaction = TransactionManager::record(&mut uow, plan).await?;
        let transaction = committed(uow.commit().await?, transaction.id)?;
        info!(
            transaction_id = %transaction.id,
            kind = transaction.kind.as_str(),
            "transaction posted"
        );

        Ok((transaction, user.balance + request.amount))
    }

    /// Move wallet money out of the system
    pub async fn withdraw(&self, request: WithdrawRequest) -> LedgerResult<TransactionReceipt> {
        let started = Instant::now();
        info!(
            owner = %request.owner,
            amount = request.amount,
            key = %request.idempotency_key,
            "withdraw started"
        );

        let outcome = self.withdraw_inner(&request).await;
        self.finish("withdraw", started, outcome)
    }

    async fn withdraw_inner(&self, request: &WithdrawRequest) -> LedgerResult<TransactionReceipt> {
        validation::validate_idempotency_key(&request.idempotency_key)?;
        validation::validate_amount(
            request.amount,
            self.config.min_withdraw,
            self.config.max_amount,
        )?;

        let kind = TransactionKind::Withdrawal;
        if let IdempotencyCheck::Replay(transaction) =
            self.idempotency.check(&request.idempotency_key, kind).await?
        {
            return self.replay_single(transaction, request.owner).await;
        }

        let reference = request
            .reference
            .clone()
            .unwrap_or_else(|| validation::generate_reference(kind));

        match self.execute_withdraw(request, &reference).await {
            Ok((transaction, balance)) => Ok(TransactionReceipt {
                transaction_id: transaction.id,
                status: transaction.status,
                balance,
                reference,
                message: format!(
                    "Successfully withdrew {}",
                    validation::format_major_units(request.amount, &self.config.currency)
                ),
                replayed: false,
            }),
            Err(LedgerError::DuplicateIdempotencyKey(key)) => {
                let transaction = self.idempotency.resolve_conflict(&key, kind).await?;
                self.replay_single(transaction, request.owner).await
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_withdraw(
        &self,
        request: &WithdrawRequest,
        reference: &str,
    ) -> LedgerResult<(Transaction, i64)> {
        let mut uow = self.storage.begin_unit_of_work().await?;
        let user = uow.get_account_for_update(request.owner).await?;
        ensure_active(&user)?;

        if user.balance < request.amount {
            return Err(LedgerError::InsufficientBalance {
                available: user.balance,
                required: request.amount,
            });
        }

        let reserve = uow
            .get_system_account_for_update(SystemAccount::Reserve)
            .await?;

        let plan = patterns::withdrawal(
            self.plan_context(&request.idempotency_key, reference),
            user.id,
            reserve.id,
            request.amount,
        )?;
        let transaction = TransactionManager::record(&mut uow, plan).await?;
        let transaction = committed(uow.commit().await?, transaction.id)?;
        info!(
            transaction_id = %transaction.id,
            kind = transaction.kind.as_str(),
            "transaction posted"
        );

        Ok((transaction, user.balance - request.amount))
    }

    /// Move money between two wallets, charging an optional fee to the sender
    pub async fn transfer(&self, request: TransferRequest) -> LedgerResult<TransferReceipt> {
        let started = Instant::now();
        info!(
            from_owner = %request.from_owner,
            to_owner = %request.to_owner,
            amount = request.amount,
            fee = ?request.fee,
            key = %request.idempotency_key,
            "transfer started"
        );

        let outcome = self.transfer_inner(&request).await;
        self.finish("transfer", started, outcome)
    }

    async fn transfer_inner(&self, request: &TransferRequest) -> LedgerResult<TransferReceipt> {
        validation::validate_distinct_owners(request.from_owner, request.to_owner)?;
        validation::validate_amount(
            request.amount,
            self.config.min_transfer,
            self.config.max_amount,
        )?;
        let fee = request.fee.unwrap_or(self.config.default_transfer_fee);
        let total_debit = validation::validate_fee(request.amount, fee)?;
        validation::validate_idempotency_key(&request.idempotency_key)?;

        let kind = TransactionKind::P2p;
        if let IdempotencyCheck::Replay(transaction) =
            self.idempotency.check(&request.idempotency_key, kind).await?
        {
            return self.replay_transfer(transaction, request).await;
        }

        let reference = request
            .reference
            .clone()
            .unwrap_or_else(|| validation::generate_reference(kind));

        match self
            .execute_transfer(request, fee, total_debit, &reference)
            .await
        {
            Ok((transaction, sender_balance, recipient_balance)) => Ok(TransferReceipt {
                transaction_id: transaction.id,
                status: transaction.status,
                sender_balance,
                recipient_balance,
                fee,
                reference,
                message: format!(
                    "Successfully transferred {}",
                    validation::format_major_units(request.amount, &self.config.currency)
                ),
                replayed: false,
            }),
            Err(LedgerError::DuplicateIdempotencyKey(key)) => {
                let transaction = self.idempotency.resolve_conflict(&key, kind).await?;
                self.replay_transfer(transaction, request).await
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_transfer(
        &self,
        request: &TransferRequest,
        fee: i64,
        total_debit: i64,
        reference: &str,
    ) -> LedgerResult<(Transaction, i64, i64)> {
        // Unlocked reads, only used to learn the account IDs to lock.
        let sender = self
            .account_manager
            .get_account_required(request.from_owner)
            .await?;
        let recipient = self
            .account_manager
            .get_account_required(request.to_owner)
            .await?;

        let mut uow = self.storage.begin_unit_of_work().await?;

        // Lock by account ID, never by argument position, so that opposite
        // transfers between the same pair queue on the same first lock.
        let (first, second) = lock_order(sender.id, recipient.id);
        let first = uow.lock_account(first).await?;
        let second = uow.lock_account(second).await?;
        let (sender, recipient) = if first.id == sender.id {
            (first, second)
        } else {
            (second, first)
        };
        ensure_active(&sender)?;
        ensure_active(&recipient)?;

        if sender.balance < total_debit {
            return Err(LedgerError::InsufficientBalance {
                available: sender.balance,
                required: total_debit,
            });
        }

        let fee_account = if fee > 0 {
            Some(
                uow.get_system_account_for_update(SystemAccount::Fee)
                    .await?
                    .id,
            )
        } else {
            None
        };

        let plan = patterns::transfer(
            self.plan_context(&request.idempotency_key, reference),
            sender.id,
            recipient.id,
            fee_account,
            request.amount,
            fee,
        )?;
        let transaction = TransactionManager::record(&mut uow, plan).await?;
        let transaction = committed(uow.commit().await?, transaction.id)?;
        info!(
            transaction_id = %transaction.id,
            kind = transaction.kind.as_str(),
            "transaction posted"
        );

        Ok((
            transaction,
            sender.balance - total_debit,
            recipient.balance + request.amount,
        ))
    }

    // Replays
    async fn replay_single(
        &self,
        transaction: Transaction,
        owner: OwnerId,
    ) -> LedgerResult<TransactionReceipt> {
        let account = self.account_manager.get_account_required(owner).await?;
        if !transaction.involves(account.id) {
            return Err(ValidationError::KeyReusedForDifferentOperation(
                transaction.idempotency_key,
            )
            .into());
        }

        debug!(
            transaction_id = %transaction.id,
            owner = %owner,
            "idempotent replay"
        );
        Ok(TransactionReceipt {
            transaction_id: transaction.id,
            status: transaction.status,
            balance: account.balance,
            reference: transaction.reference,
            message: "Request already processed".to_string(),
            replayed: true,
        })
    }

    async fn replay_transfer(
        &self,
        transaction: Transaction,
        request: &TransferRequest,
    ) -> LedgerResult<TransferReceipt> {
        let sender = self
            .account_manager
            .get_account_required(request.from_owner)
            .await?;
        let recipient = self
            .account_manager
            .get_account_required(request.to_owner)
            .await?;
        if transaction.from_account != Some(sender.id)
            || transaction.to_account != Some(recipient.id)
        {
            return Err(ValidationError::KeyReusedForDifferentOperation(
                transaction.idempotency_key,
            )
            .into());
        }

        let postings = self.storage.get_postings(transaction.id).await?;
        let sender_debit: i64 = postings
            .iter()
            .filter(|p| p.account_id == sender.id && p.is_debit())
            .map(|p| -p.amount)
            .sum();

        debug!(
            transaction_id = %transaction.id,
            from_owner = %request.from_owner,
            "idempotent replay"
        );
        Ok(TransferReceipt {
            transaction_id: transaction.id,
            status: transaction.status,
            sender_balance: sender.balance,
            recipient_balance: recipient.balance,
            fee: sender_debit - transaction.amount,
            reference: transaction.reference,
            message: "Request already processed".to_string(),
            replayed: true,
        })
    }

    // Integrity
    /// Validate the integrity of the whole ledger
    pub async fn verify_integrity(&self) -> LedgerResult<LedgerIntegrityReport> {
        let accounts = self.storage.list_accounts().await?;
        let transactions = self.storage.list_transactions().await?;
        let postings = self.storage.list_postings().await?;

        let report = invariants::audit(&accounts, &transactions, &postings);
        if !report.is_valid {
            error!(issues = ?report.issues, "ledger integrity check failed");
        }
        Ok(report)
    }

    fn plan_context<'a>(&'a self, key: &'a str, reference: &'a str) -> patterns::PlanContext<'a> {
        patterns::PlanContext {
            idempotency_key: key,
            currency: &self.config.currency,
            reference,
        }
    }

    /// Log the outcome and hide internal failures from the caller
    fn finish<T>(
        &self,
        operation: &str,
        started: Instant,
        outcome: LedgerResult<T>,
    ) -> LedgerResult<T> {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(value) => {
                info!(operation, elapsed_ms, "operation succeeded");
                Ok(value)
            }
            Err(e) if e.is_internal() => {
                error!(
                    operation,
                    elapsed_ms,
                    error = %e,
                    kind = ?e.kind(),
                    "operation failed"
                );
                Err(e.into_public())
            }
            Err(e) => {
                info!(operation, elapsed_ms, error = %e, "operation rejected");
                Err(e)
            }
        }
    }
}

/// Pick the transaction created by this operation out of a commit result
fn committed(posted: Vec<Transaction>, id: TransactionId) -> LedgerResult<Transaction> {
    posted
        .into_iter()
        .find(|t| t.id == id)
        .ok_or_else(|| LedgerError::Integrity(format!("transaction {} missing after commit", id)))
}
