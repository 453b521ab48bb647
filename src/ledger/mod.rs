//! Ledger module: accounts, postings, locking, idempotency and the orchestrator

pub mod account;
pub mod core;
pub mod idempotency;
pub mod invariants;
pub mod locking;
pub mod transaction;

pub use self::core::*;
pub use account::*;
pub use idempotency::*;
pub use invariants::LedgerIntegrityReport;
pub use locking::{lock_order, LockKey};
pub use transaction::*;
