//! In-memory storage implementation for testing and development
//!
//! Committed state lives in [`Tables`] behind a read/write lock. Every account
//! row additionally owns an async mutex standing in for a row-level exclusive
//! lock: a [`MemoryUnitOfWork`] holds the mutex guards of the rows it touches
//! until it commits or is dropped, and stages all writes privately so that
//! nothing becomes visible before commit.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::{debug, error};

use crate::ledger::invariants;
use crate::ledger::locking::LockKey;
use crate::traits::*;
use crate::types::*;

fn poisoned<T>(_: PoisonError<T>) -> LedgerError {
    LedgerError::Storage("memory storage lock poisoned".to_string())
}

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    owners: HashMap<OwnerId, AccountId>,
    system: HashMap<SystemAccount, AccountId>,
    transactions: BTreeMap<TransactionId, Transaction>,
    postings: Vec<Posting>,
    idempotency_keys: HashMap<String, TransactionId>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<Tables>,
    row_locks: RwLock<HashMap<AccountId, Arc<RowLock<()>>>>,
    next_account_id: AtomicI64,
    next_transaction_id: AtomicI64,
    next_posting_id: AtomicI64,
    /// Number of postings still allowed before an injected failure
    posting_fault: Mutex<Option<usize>>,
}

impl Inner {
    fn row_lock(&self, account_id: AccountId) -> LedgerResult<Arc<RowLock<()>>> {
        if let Some(lock) = self.row_locks.read().map_err(poisoned)?.get(&account_id) {
            return Ok(lock.clone());
        }
        Ok(self
            .row_locks
            .write()
            .map_err(poisoned)?
            .entry(account_id)
            .or_default()
            .clone())
    }

    fn committed_account(&self, account_id: AccountId) -> LedgerResult<Account> {
        self.tables
            .read()
            .map_err(poisoned)?
            .accounts
            .get(&account_id)
            .cloned()
            .ok_or_else(|| LedgerError::AccountNotFound(format!("account {}", account_id)))
    }

    fn owner_account_id(&self, owner: OwnerId) -> LedgerResult<AccountId> {
        self.tables
            .read()
            .map_err(poisoned)?
            .owners
            .get(&owner)
            .copied()
            .ok_or_else(|| LedgerError::AccountNotFound(format!("owner {}", owner)))
    }

    fn system_account_id(&self, account: SystemAccount) -> LedgerResult<AccountId> {
        self.tables
            .read()
            .map_err(poisoned)?
            .system
            .get(&account)
            .copied()
            .ok_or_else(|| LedgerError::AccountNotFound(format!("{} system account", account)))
    }

    fn take_posting_fault(&self) -> LedgerResult<bool> {
        let mut fault = self.posting_fault.lock().map_err(poisoned)?;
        match *fault {
            Some(0) => {
                *fault = None;
                Ok(true)
            }
            Some(remaining) => {
                *fault = Some(remaining - 1);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

/// In-memory storage implementation for testing and development
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the posting write after the next `successful` ones fail with a
    /// storage error, simulating a crash in the middle of a unit of work.
    pub fn fail_after_postings(&self, successful: usize) -> LedgerResult<()> {
        *self.inner.posting_fault.lock().map_err(poisoned)? = Some(successful);
        Ok(())
    }

    fn next_account_id(&self) -> AccountId {
        AccountId(self.inner.next_account_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl LedgerStorage for MemoryStorage {
    type UnitOfWork = MemoryUnitOfWork;

    async fn begin_unit_of_work(&self) -> LedgerResult<MemoryUnitOfWork> {
        Ok(MemoryUnitOfWork::new(self.inner.clone()))
    }

    async fn create_user_account(&self, owner: OwnerId, currency: &str) -> LedgerResult<Account> {
        let account = {
            let mut tables = self.inner.tables.write().map_err(poisoned)?;
            if tables.owners.contains_key(&owner) {
                return Err(LedgerError::AccountExists(format!("owner {}", owner)));
            }
            let account = Account::user(self.next_account_id(), owner, currency);
            tables.owners.insert(owner, account.id);
            tables.accounts.insert(account.id, account.clone());
            account
        };
        self.inner.row_lock(account.id)?;
        Ok(account)
    }

    async fn create_system_account(
        &self,
        account: SystemAccount,
        external_id: &str,
        currency: &str,
    ) -> LedgerResult<Account> {
        let created = {
            let mut tables = self.inner.tables.write().map_err(poisoned)?;
            if let Some(existing) = tables
                .system
                .get(&account)
                .and_then(|id| tables.accounts.get(id))
            {
                return Ok(existing.clone());
            }
            let created = Account::system(self.next_account_id(), account, external_id, currency);
            tables.system.insert(account, created.id);
            tables.accounts.insert(created.id, created.clone());
            created
        };
        self.inner.row_lock(created.id)?;
        Ok(created)
    }

    async fn get_account(&self, owner: OwnerId) -> LedgerResult<Option<Account>> {
        let tables = self.inner.tables.read().map_err(poisoned)?;
        Ok(tables
            .owners
            .get(&owner)
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    async fn get_system_account(&self, account: SystemAccount) -> LedgerResult<Option<Account>> {
        let tables = self.inner.tables.read().map_err(poisoned)?;
        Ok(tables
            .system
            .get(&account)
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    async fn set_frozen(&self, owner: OwnerId, frozen: bool) -> LedgerResult<Account> {
        let account_id = self.inner.owner_account_id(owner)?;
        let row = self.inner.row_lock(account_id)?;
        let _guard = row.lock_owned().await;

        let mut tables = self.inner.tables.write().map_err(poisoned)?;
        let account = tables
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| LedgerError::AccountNotFound(format!("owner {}", owner)))?;
        account.frozen = frozen;
        account.updated_at = chrono::Utc::now().naive_utc();
        Ok(account.clone())
    }

    async fn list_accounts(&self) -> LedgerResult<Vec<Account>> {
        Ok(self
            .inner
            .tables
            .read()
            .map_err(poisoned)?
            .accounts
            .values()
            .cloned()
            .collect())
    }

    async fn find_transaction_by_key(&self, key: &str) -> LedgerResult<Option<Transaction>> {
        let tables = self.inner.tables.read().map_err(poisoned)?;
        Ok(tables
            .idempotency_keys
            .get(key)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> LedgerResult<Option<Transaction>> {
        Ok(self
            .inner
            .tables
            .read()
            .map_err(poisoned)?
            .transactions
            .get(&transaction_id)
            .cloned())
    }

    async fn get_postings(&self, transaction_id: TransactionId) -> LedgerResult<Vec<Posting>> {
        Ok(self
            .inner
            .tables
            .read()
            .map_err(poisoned)?
            .postings
            .iter()
            .filter(|p| p.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn list_transactions(&self) -> LedgerResult<Vec<Transaction>> {
        Ok(self
            .inner
            .tables
            .read()
            .map_err(poisoned)?
            .transactions
            .values()
            .cloned()
            .collect())
    }

    async fn list_postings(&self) -> LedgerResult<Vec<Posting>> {
        Ok(self.inner.tables.read().map_err(poisoned)?.postings.clone())
    }
}

/// An account row held under its exclusive lock, with staged changes
struct LockedRow {
    _guard: OwnedMutexGuard<()>,
    account: Account,
}

/// Unit of work over [`MemoryStorage`]
pub struct MemoryUnitOfWork {
    inner: Arc<Inner>,
    locked: BTreeMap<LockKey, LockedRow>,
    transactions: Vec<Transaction>,
    postings: Vec<Posting>,
    finished: bool,
}

impl MemoryUnitOfWork {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            locked: BTreeMap::new(),
            transactions: Vec::new(),
            postings: Vec::new(),
            finished: false,
        }
    }

    fn locked_row_mut(&mut self, account_id: AccountId) -> Option<&mut LockedRow> {
        self.locked
            .values_mut()
            .find(|row| row.account.id == account_id)
    }

    fn check_invariants(&self) -> LedgerResult<()> {
        for transaction in &self.transactions {
            let postings: Vec<Posting> = self
                .postings
                .iter()
                .filter(|p| p.transaction_id == transaction.id)
                .cloned()
                .collect();
            invariants::check_zero_sum(transaction, &postings)?;
        }
        invariants::check_balances(self.locked.values().map(|row| &row.account))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_account(&mut self, account_id: AccountId) -> LedgerResult<Account> {
        let snapshot = self.inner.committed_account(account_id)?;
        let key = LockKey::for_account(&snapshot);

        if let Some(row) = self.locked.get(&key) {
            return Ok(row.account.clone());
        }

        if let Some(last) = self.locked.keys().next_back() {
            if key < *last {
                return Err(LedgerError::Integrity(format!(
                    "lock order violation: {} requested after {}",
                    key, last
                )));
            }
        }

        let row = self.inner.row_lock(account_id)?;
        let guard = row.lock_owned().await;
        // Re-read under the lock; the snapshot above is advisory only.
        let account = self.inner.committed_account(account_id)?;
        debug!(account_id = %account.id, kind = account.kind.as_str(), "row lock acquired");

        self.locked.insert(
            key,
            LockedRow {
                _guard: guard,
                account: account.clone(),
            },
        );
        Ok(account)
    }

    async fn get_account_for_update(&mut self, owner: OwnerId) -> LedgerResult<Account> {
        let account_id = self.inner.owner_account_id(owner)?;
        self.lock_account(account_id).await
    }

    async fn get_system_account_for_update(
        &mut self,
        account: SystemAccount,
    ) -> LedgerResult<Account> {
        let account_id = self.inner.system_account_id(account)?;
        self.lock_account(account_id).await
    }

    async fn create_transaction(
        &mut self,
        transaction: NewTransaction,
    ) -> LedgerResult<Transaction> {
        if transaction.idempotency_key.trim().is_empty() {
            return Err(ValidationError::MissingIdempotencyKey.into());
        }

        let taken = self
            .inner
            .tables
            .read()
            .map_err(poisoned)?
            .idempotency_keys
            .contains_key(&transaction.idempotency_key)
            || self
                .transactions
                .iter()
                .any(|t| t.idempotency_key == transaction.idempotency_key);
        if taken {
            return Err(LedgerError::DuplicateIdempotencyKey(
                transaction.idempotency_key,
            ));
        }

        let id = TransactionId(self.inner.next_transaction_id.fetch_add(1, Ordering::SeqCst) + 1);
        let created = Transaction {
            id,
            idempotency_key: transaction.idempotency_key,
            kind: transaction.kind,
            status: TransactionStatus::Pending,
            amount: transaction.amount,
            currency: transaction.currency,
            reference: transaction.reference,
            from_account: transaction.from_account,
            to_account: transaction.to_account,
            created_at: chrono::Utc::now().naive_utc(),
            posted_at: None,
        };
        self.transactions.push(created.clone());
        Ok(created)
    }

    async fn create_posting(&mut self, posting: NewPosting) -> LedgerResult<Posting> {
        if self.inner.take_posting_fault()? {
            return Err(LedgerError::Storage(format!(
                "injected failure writing posting for transaction {}",
                posting.transaction_id
            )));
        }

        if !self
            .transactions
            .iter()
            .any(|t| t.id == posting.transaction_id)
        {
            return Err(LedgerError::Integrity(format!(
                "posting references transaction {} outside this unit of work",
                posting.transaction_id
            )));
        }

        let row = self.locked_row_mut(posting.account_id).ok_or_else(|| {
            LedgerError::Integrity(format!(
                "posting to account {} which is not locked",
                posting.account_id
            ))
        })?;
        invariants::apply_posting(&mut row.account, &posting)?;

        let written = Posting {
            id: PostingId(self.inner.next_posting_id.fetch_add(1, Ordering::SeqCst) + 1),
            transaction_id: posting.transaction_id,
            account_id: posting.account_id,
            amount: posting.amount,
            currency: posting.currency,
            created_at: chrono::Utc::now().naive_utc(),
        };
        self.postings.push(written.clone());
        Ok(written)
    }

    async fn commit(mut self) -> LedgerResult<Vec<Transaction>> {
        if let Err(e) = self.check_invariants() {
            error!(error = %e, "invariant violation at commit, aborting unit of work");
            return Err(e);
        }

        let now = chrono::Utc::now().naive_utc();
        let mut tables = self.inner.tables.write().map_err(poisoned)?;

        // Unique constraint, checked atomically with the writes below.
        if let Some(duplicate) = self
            .transactions
            .iter()
            .find(|t| tables.idempotency_keys.contains_key(&t.idempotency_key))
        {
            return Err(LedgerError::DuplicateIdempotencyKey(
                duplicate.idempotency_key.clone(),
            ));
        }

        for row in self.locked.values() {
            tables.accounts.insert(row.account.id, row.account.clone());
        }

        let mut posted = Vec::with_capacity(self.transactions.len());
        for transaction in self.transactions.drain(..) {
            let mut transaction = transaction;
            transaction.status = TransactionStatus::Posted;
            transaction.posted_at = Some(now);
            tables
                .idempotency_keys
                .insert(transaction.idempotency_key.clone(), transaction.id);
            tables
                .transactions
                .insert(transaction.id, transaction.clone());
            posted.push(transaction);
        }
        tables.postings.append(&mut self.postings);
        drop(tables);

        self.finished = true;
        debug!(transactions = posted.len(), "unit of work committed");
        Ok(posted)
    }

    async fn rollback(mut self) -> LedgerResult<()> {
        debug!(
            transactions = self.transactions.len(),
            postings = self.postings.len(),
            "unit of work rolled back"
        );
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        if !self.finished && !self.transactions.is_empty() {
            debug!(
                transactions = self.transactions.len(),
                "unit of work dropped without commit, discarding writes"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn seeded() -> (MemoryStorage, Account, Account) {
        let storage = MemoryStorage::new();
        let reserve = storage
            .create_system_account(SystemAccount::Reserve, "sys_reserve", "NGN")
            .await
            .unwrap();
        let user = storage.create_user_account(OwnerId(1), "NGN").await.unwrap();
        (storage, user, reserve)
    }

    fn new_transaction(key: &str, from: AccountId, to: AccountId) -> NewTransaction {
        NewTransaction {
            idempotency_key: key.to_string(),
            kind: TransactionKind::Deposit,
            amount: 1_000,
            currency: "NGN".to_string(),
            reference: "ref".to_string(),
            from_account: Some(from),
            to_account: Some(to),
        }
    }

    fn new_posting(transaction_id: TransactionId, account_id: AccountId, amount: i64) -> NewPosting {
        NewPosting {
            transaction_id,
            account_id,
            amount,
            currency: "NGN".to_string(),
        }
    }

    #[tokio::test]
    async fn test_one_account_per_owner() {
        let (storage, _, _) = seeded().await;
        let err = storage
            .create_user_account(OwnerId(1), "NGN")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountExists(_)));
    }

    #[tokio::test]
    async fn test_system_account_creation_is_idempotent() {
        let (storage, _, reserve) = seeded().await;
        let again = storage
            .create_system_account(SystemAccount::Reserve, "sys_reserve", "NGN")
            .await
            .unwrap();
        assert_eq!(again.id, reserve.id);
    }

    #[tokio::test]
    async fn test_commit_publishes_all_writes() {
        let (storage, user, reserve) = seeded().await;
        let mut uow = storage.begin_unit_of_work().await.unwrap();
        uow.lock_account(user.id).await.unwrap();
        uow.lock_account(reserve.id).await.unwrap();
        let txn = uow
            .create_transaction(new_transaction("k1", reserve.id, user.id))
            .await
            .unwrap();
        assert!(txn.is_pending());
        uow.create_posting(new_posting(txn.id, reserve.id, -1_000))
            .await
            .unwrap();
        uow.create_posting(new_posting(txn.id, user.id, 1_000))
            .await
            .unwrap();

        // Nothing is visible before commit.
        assert!(storage.find_transaction_by_key("k1").await.unwrap().is_none());
        assert_eq!(storage.get_account(OwnerId(1)).await.unwrap().unwrap().balance, 0);

        let posted = uow.commit().await.unwrap();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].is_posted());
        assert_eq!(storage.get_account(OwnerId(1)).await.unwrap().unwrap().balance, 1_000);
        assert_eq!(
            storage
                .get_system_account(SystemAccount::Reserve)
                .await
                .unwrap()
                .unwrap()
                .balance,
            -1_000
        );
        assert_eq!(storage.get_postings(txn.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unbalanced_commit_is_aborted() {
        let (storage, user, reserve) = seeded().await;
        let mut uow = storage.begin_unit_of_work().await.unwrap();
        uow.lock_account(user.id).await.unwrap();
        uow.lock_account(reserve.id).await.unwrap();
        let txn = uow
            .create_transaction(new_transaction("k1", reserve.id, user.id))
            .await
            .unwrap();
        uow.create_posting(new_posting(txn.id, reserve.id, -1_000))
            .await
            .unwrap();
        uow.create_posting(new_posting(txn.id, user.id, 900))
            .await
            .unwrap();

        let err = uow.commit().await.unwrap_err();
        assert!(matches!(err, LedgerError::Integrity(_)));
        assert!(storage.list_transactions().await.unwrap().is_empty());
        assert!(storage.list_postings().await.unwrap().is_empty());
        assert_eq!(storage.get_account(OwnerId(1)).await.unwrap().unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_negative_user_balance_is_aborted() {
        let (storage, user, reserve) = seeded().await;
        let mut uow = storage.begin_unit_of_work().await.unwrap();
        uow.lock_account(user.id).await.unwrap();
        uow.lock_account(reserve.id).await.unwrap();
        let txn = uow
            .create_transaction(new_transaction("k1", user.id, reserve.id))
            .await
            .unwrap();
        uow.create_posting(new_posting(txn.id, user.id, -1_000))
            .await
            .unwrap();
        uow.create_posting(new_posting(txn.id, reserve.id, 1_000))
            .await
            .unwrap();

        assert!(matches!(
            uow.commit().await,
            Err(LedgerError::Integrity(_))
        ));
        assert!(storage.find_transaction_by_key("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_posting_requires_lock() {
        let (storage, user, reserve) = seeded().await;
        let mut uow = storage.begin_unit_of_work().await.unwrap();
        uow.lock_account(user.id).await.unwrap();
        let txn = uow
            .create_transaction(new_transaction("k1", reserve.id, user.id))
            .await
            .unwrap();
        let err = uow
            .create_posting(new_posting(txn.id, reserve.id, -1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_lock_order_is_enforced() {
        let (storage, user, reserve) = seeded().await;
        let mut uow = storage.begin_unit_of_work().await.unwrap();
        uow.lock_account(reserve.id).await.unwrap();
        let err = uow.lock_account(user.id).await.unwrap_err();
        assert!(err.to_string().contains("lock order violation"));
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let (storage, user, reserve) = seeded().await;
        for attempt in 0..2 {
            let mut uow = storage.begin_unit_of_work().await.unwrap();
            uow.lock_account(user.id).await.unwrap();
            uow.lock_account(reserve.id).await.unwrap();
            let result = uow
                .create_transaction(new_transaction("same", reserve.id, user.id))
                .await;
            if attempt == 0 {
                let txn = result.unwrap();
                uow.create_posting(new_posting(txn.id, reserve.id, -1_000))
                    .await
                    .unwrap();
                uow.create_posting(new_posting(txn.id, user.id, 1_000))
                    .await
                    .unwrap();
                uow.commit().await.unwrap();
            } else {
                assert!(matches!(
                    result,
                    Err(LedgerError::DuplicateIdempotencyKey(_))
                ));
            }
        }
    }

    #[tokio::test]
    async fn test_row_lock_blocks_until_release() {
        let (storage, user, _) = seeded().await;
        let mut holder = storage.begin_unit_of_work().await.unwrap();
        holder.lock_account(user.id).await.unwrap();

        let contender_storage = storage.clone();
        let contender = tokio::spawn(async move {
            let mut uow = contender_storage.begin_unit_of_work().await.unwrap();
            uow.lock_account(user.id).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        holder.rollback().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), contender)
            .await
            .expect("contender should acquire the lock after rollback")
            .unwrap();
    }

    #[tokio::test]
    async fn test_injected_posting_failure() {
        let (storage, user, reserve) = seeded().await;
        storage.fail_after_postings(1).unwrap();

        let mut uow = storage.begin_unit_of_work().await.unwrap();
        uow.lock_account(user.id).await.unwrap();
        uow.lock_account(reserve.id).await.unwrap();
        let txn = uow
            .create_transaction(new_transaction("k1", reserve.id, user.id))
            .await
            .unwrap();
        uow.create_posting(new_posting(txn.id, reserve.id, -1_000))
            .await
            .unwrap();
        let err = uow
            .create_posting(new_posting(txn.id, user.id, 1_000))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        drop(uow);

        assert!(storage.list_transactions().await.unwrap().is_empty());
        assert!(storage.list_postings().await.unwrap().is_empty());
    }
}
