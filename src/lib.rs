//! # Wallet Ledger
//!
//! Double-entry ledger core for a consumer wallet: deposits, withdrawals and
//! peer to peer transfers with fees, applied atomically and exactly once per
//! idempotency key.
//!
//! ## Features
//!
//! - **Double-entry postings**: every transaction is a set of signed postings summing to zero
//! - **Balance safety**: user balances are checked under exclusive row locks and never go negative
//! - **Deadlock freedom**: accounts are always locked in one global order
//! - **Idempotency**: repeating a request with the same key replays the original result
//! - **Storage abstraction**: database-agnostic design with trait-based storage and units of work
//!
//! ## Quick Start
//!
//! ```rust
//! use wallet_ledger::{DepositRequest, Ledger, MemoryStorage, OwnerId};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> wallet_ledger::LedgerResult<()> {
//! let ledger = Ledger::new(MemoryStorage::new());
//! ledger.bootstrap_system_accounts().await?;
//! ledger.open_account(OwnerId(1)).await?;
//!
//! let receipt = ledger
//!     .deposit(DepositRequest {
//!         owner: OwnerId(1),
//!         amount: 500_000,
//!         idempotency_key: "dep-1".to_string(),
//!         reference: None,
//!     })
//!     .await?;
//! assert_eq!(receipt.balance, 500_000);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod ledger;
pub mod telemetry;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::{ConfigError, LedgerConfig};
pub use ledger::*;
pub use traits::*;
pub use types::*;
pub use utils::memory_storage::{MemoryStorage, MemoryUnitOfWork};

// Re-export transaction patterns for convenience
pub use ledger::transaction::patterns;
