//! Traits for storage abstraction

use async_trait::async_trait;

use crate::types::*;

/// Storage abstraction for the ledger system
///
/// This trait allows the ledger core to work with any storage backend that
/// offers row-level exclusive locks, unique constraints and all-or-nothing
/// units of work (PostgreSQL, SQLite, in-memory, etc.). Methods on the store
/// itself read committed state and never block on row locks.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Unit of work type handed out by [`LedgerStorage::begin_unit_of_work`]
    type UnitOfWork: UnitOfWork;

    /// Open an atomic unit of work
    async fn begin_unit_of_work(&self) -> LedgerResult<Self::UnitOfWork>;

    /// Provision the single user account of an owner
    async fn create_user_account(&self, owner: OwnerId, currency: &str) -> LedgerResult<Account>;

    /// Create a system account, returning the existing one if already present
    async fn create_system_account(
        &self,
        account: SystemAccount,
        external_id: &str,
        currency: &str,
    ) -> LedgerResult<Account>;

    /// Get the user account of an owner
    async fn get_account(&self, owner: OwnerId) -> LedgerResult<Option<Account>>;

    /// Get a system account
    async fn get_system_account(&self, account: SystemAccount) -> LedgerResult<Option<Account>>;

    /// Set the frozen flag of a user account. Waits for the row lock.
    async fn set_frozen(&self, owner: OwnerId, frozen: bool) -> LedgerResult<Account>;

    /// List all accounts
    async fn list_accounts(&self) -> LedgerResult<Vec<Account>>;

    /// Find the committed transaction created with an idempotency key
    async fn find_transaction_by_key(&self, key: &str) -> LedgerResult<Option<Transaction>>;

    /// Get a transaction by ID
    async fn get_transaction(&self, transaction_id: TransactionId)
        -> LedgerResult<Option<Transaction>>;

    /// Get the postings of a transaction
    async fn get_postings(&self, transaction_id: TransactionId) -> LedgerResult<Vec<Posting>>;

    /// List all committed transactions
    async fn list_transactions(&self) -> LedgerResult<Vec<Transaction>>;

    /// List all committed postings
    async fn list_postings(&self) -> LedgerResult<Vec<Posting>>;
}

/// An all-or-nothing group of ledger writes.
///
/// Row locks taken through this handle are held until [`UnitOfWork::commit`]
/// or [`UnitOfWork::rollback`]. Dropping the handle without committing
/// discards every write and releases every lock.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Lock an account by ID, blocking until the lock is available
    async fn lock_account(&mut self, account_id: AccountId) -> LedgerResult<Account>;

    /// Lock the user account of an owner
    async fn get_account_for_update(&mut self, owner: OwnerId) -> LedgerResult<Account>;

    /// Lock a system account
    async fn get_system_account_for_update(
        &mut self,
        account: SystemAccount,
    ) -> LedgerResult<Account>;

    /// Create a pending transaction. Fails with
    /// [`LedgerError::DuplicateIdempotencyKey`] when the key is taken.
    async fn create_transaction(&mut self, transaction: NewTransaction)
        -> LedgerResult<Transaction>;

    /// Write a posting and apply it to the locked account's running balance
    async fn create_posting(&mut self, posting: NewPosting) -> LedgerResult<Posting>;

    /// Validate the ledger invariants and make every write visible at once
    async fn commit(self) -> LedgerResult<Vec<Transaction>>;

    /// Discard every write and release every lock
    async fn rollback(self) -> LedgerResult<()>;
}
