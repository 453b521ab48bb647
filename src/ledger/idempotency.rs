//! Idempotency guard: replays requests whose key was already processed

use tracing::{debug, warn};

use crate::traits::*;
use crate::types::*;

/// Result of looking up an idempotency key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// Key never committed; the operation may run
    Fresh,
    /// Key belongs to this committed transaction; replay it
    Replay(Transaction),
}

/// Maps client-supplied keys to committed transactions.
///
/// Keys are only ever persisted by the unit of work that creates their
/// transaction, so a lookup sees either nothing or a fully committed result.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard<S: LedgerStorage> {
    storage: S,
}

impl<S: LedgerStorage> IdempotencyGuard<S> {
    /// Create a new guard over the given storage
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Look up `key` before starting work.
    ///
    /// A key committed by a different kind of operation is rejected instead of
    /// being replayed.
    pub async fn check(&self, key: &str, kind: TransactionKind) -> LedgerResult<IdempotencyCheck> {
        match self.storage.find_transaction_by_key(key).await? {
            None => Ok(IdempotencyCheck::Fresh),
            Some(transaction) => {
                ensure_same_kind(&transaction, key, kind)?;
                debug!(
                    key,
                    transaction_id = %transaction.id,
                    "idempotency key already processed"
                );
                Ok(IdempotencyCheck::Replay(transaction))
            }
        }
    }

    /// Resolve a lost race on `key`: the winner has committed, so load its
    /// transaction for replay.
    pub async fn resolve_conflict(
        &self,
        key: &str,
        kind: TransactionKind,
    ) -> LedgerResult<Transaction> {
        warn!(key, "idempotency key taken by a concurrent request, replaying");
        let transaction = self
            .storage
            .find_transaction_by_key(key)
            .await?
            .ok_or_else(|| {
                LedgerError::Storage(format!(
                    "idempotency key '{}' conflicted but no committed transaction is visible",
                    key
                ))
            })?;
        ensure_same_kind(&transaction, key, kind)?;
        Ok(transaction)
    }
}

fn ensure_same_kind(transaction: &Transaction, key: &str, kind: TransactionKind) -> LedgerResult<()> {
    if transaction.kind != kind {
        return Err(ValidationError::KeyReusedForDifferentOperation(key.to_string()).into());
    }
    Ok(())
}
