//! Core types and data structures for the wallet ledger

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Stable identifier of an account row. Ascending ids define the lock order.
    AccountId
);
numeric_id!(
    /// Identifier of a ledger transaction
    TransactionId
);
numeric_id!(
    /// Identifier of a single posting
    PostingId
);
numeric_id!(
    /// Identifier of the wallet owner (one user account per owner)
    OwnerId
);

/// Account kinds known to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    /// Customer wallet; its balance can never go negative
    User,
    /// Counter-leg for money entering or leaving the system
    Reserve,
    /// Accumulates transfer fees
    Fee,
    /// Any other internal account
    System,
}

impl AccountKind {
    /// Only user accounts are held to the non-negative balance rule
    pub fn is_user(&self) -> bool {
        matches!(self, AccountKind::User)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::User => "user",
            AccountKind::Reserve => "reserve",
            AccountKind::Fee => "fee",
            AccountKind::System => "system",
        }
    }
}

/// The named system accounts created at bootstrap.
///
/// Declaration order is the order in which system accounts are locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemAccount {
    Reserve,
    Fee,
}

impl SystemAccount {
    pub fn kind(&self) -> AccountKind {
        match self {
            SystemAccount::Reserve => AccountKind::Reserve,
            SystemAccount::Fee => AccountKind::Fee,
        }
    }

    /// Maps an account kind back to the system account it denotes
    pub fn from_kind(kind: AccountKind) -> Option<Self> {
        match kind {
            AccountKind::Reserve => Some(SystemAccount::Reserve),
            AccountKind::Fee => Some(SystemAccount::Fee),
            AccountKind::User | AccountKind::System => None,
        }
    }
}

impl fmt::Display for SystemAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemAccount::Reserve => write!(f, "reserve"),
            SystemAccount::Fee => write!(f, "fee"),
        }
    }
}

/// Wallet or system account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique, stable identifier
    pub id: AccountId,
    /// What the account represents
    pub kind: AccountKind,
    /// Owner of a user account; `None` for system accounts
    pub owner: Option<OwnerId>,
    /// External name of a system account (e.g. `sys_reserve`)
    pub external_id: Option<String>,
    /// Balance in the smallest currency unit
    pub balance: i64,
    /// ISO currency code
    pub currency: String,
    /// Frozen accounts accept no new postings
    pub frozen: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Account {
    /// Create a new, empty user account
    pub fn user(id: AccountId, owner: OwnerId, currency: impl Into<String>) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id,
            kind: AccountKind::User,
            owner: Some(owner),
            external_id: None,
            balance: 0,
            currency: currency.into(),
            frozen: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a new, empty system account
    pub fn system(
        id: AccountId,
        account: SystemAccount,
        external_id: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id,
            kind: account.kind(),
            owner: None,
            external_id: Some(external_id.into()),
            balance: 0,
            currency: currency.into(),
            frozen: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_user(&self) -> bool {
        self.kind.is_user()
    }

    /// Human readable label used in errors and logs
    pub fn label(&self) -> String {
        match (&self.owner, &self.external_id) {
            (Some(owner), _) => format!("owner {}", owner),
            (None, Some(external_id)) => external_id.clone(),
            (None, None) => format!("account {}", self.id),
        }
    }
}

/// Transaction kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    P2p,
    Fee,
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::P2p => "p2p",
            TransactionKind::Fee => "fee",
            TransactionKind::Refund => "refund",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a transaction.
///
/// `Pending` only exists inside an open unit of work; committed transactions
/// are always `Posted`. `Reversed` is reserved for compensating transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Posted,
    Failed,
    Reversed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Posted => "posted",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Reversed => "reversed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical money movement, made of two or more postings summing to zero
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Client-supplied key, unique across all transaction kinds
    pub idempotency_key: String,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    /// Principal amount moved, in the smallest currency unit
    pub amount: i64,
    pub currency: String,
    pub reference: String,
    /// Account debited by the principal leg
    pub from_account: Option<AccountId>,
    /// Account credited by the principal leg
    pub to_account: Option<AccountId>,
    pub created_at: NaiveDateTime,
    pub posted_at: Option<NaiveDateTime>,
}

impl Transaction {
    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    pub fn is_posted(&self) -> bool {
        self.status == TransactionStatus::Posted
    }

    /// Whether the given account is one of the principal legs
    pub fn involves(&self, account_id: AccountId) -> bool {
        self.from_account == Some(account_id) || self.to_account == Some(account_id)
    }
}

/// Fields needed to open a transaction inside a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub idempotency_key: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub currency: String,
    pub reference: String,
    pub from_account: Option<AccountId>,
    pub to_account: Option<AccountId>,
}

/// A single signed ledger entry: positive credits, negative debits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub id: PostingId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub amount: i64,
    pub currency: String,
    pub created_at: NaiveDateTime,
}

impl Posting {
    pub fn is_credit(&self) -> bool {
        self.amount > 0
    }

    pub fn is_debit(&self) -> bool {
        self.amount < 0
    }
}

/// Fields needed to write a posting inside a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPosting {
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub amount: i64,
    pub currency: String,
}

/// Deposit request (external money into a wallet)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    pub owner: OwnerId,
    pub amount: i64,
    pub idempotency_key: String,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Withdrawal request (wallet money out of the system)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub owner: OwnerId,
    pub amount: i64,
    pub idempotency_key: String,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Peer to peer transfer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_owner: OwnerId,
    pub to_owner: OwnerId,
    pub amount: i64,
    /// Fee charged to the sender; the configured default applies when absent
    #[serde(default)]
    pub fee: Option<i64>,
    pub idempotency_key: String,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Outcome of a deposit or withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    /// Balance of the requesting wallet after the operation
    pub balance: i64,
    pub reference: String,
    pub message: String,
    /// True when the receipt was served from an earlier request with the same key
    pub replayed: bool,
}

/// Outcome of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub sender_balance: i64,
    pub recipient_balance: i64,
    pub fee: i64,
    pub reference: String,
    pub message: String,
    pub replayed: bool,
}

/// Current balance of a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    pub owner: OwnerId,
    pub account_id: AccountId,
    pub balance: i64,
    pub currency: String,
    pub frozen: bool,
}

/// Business-rule violations in a request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("amount must be positive")]
    NonPositiveAmount,
    #[error("amount {amount} is below the minimum of {minimum}")]
    BelowMinimum { amount: i64, minimum: i64 },
    #[error("amount {amount} exceeds the maximum of {maximum}")]
    AboveMaximum { amount: i64, maximum: i64 },
    #[error("idempotency key is required")]
    MissingIdempotencyKey,
    #[error("cannot transfer to the same account")]
    SameAccount,
    #[error("fee cannot be negative")]
    NegativeFee,
    #[error("idempotency key '{0}' was already used for a different operation")]
    KeyReusedForDifferentOperation(String),
}

/// Error classes exposed to callers of the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientBalance,
    Conflict,
    Integrity,
    Infrastructure,
}

/// Errors that can occur in the ledger system
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Account already exists: {0}")]
    AccountExists(String),
    #[error("Account is frozen: {0}")]
    AccountFrozen(String),
    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: i64, required: i64 },
    #[error("Duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),
    #[error("Ledger integrity violation: {0}")]
    Integrity(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Internal error")]
    Internal { retryable: bool },
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Validation(_)
            | LedgerError::AccountExists(_)
            | LedgerError::AccountFrozen(_) => ErrorKind::Validation,
            LedgerError::AccountNotFound(_) | LedgerError::TransactionNotFound(_) => {
                ErrorKind::NotFound
            }
            LedgerError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            LedgerError::DuplicateIdempotencyKey(_) => ErrorKind::Conflict,
            LedgerError::Integrity(_) | LedgerError::Internal { retryable: false } => {
                ErrorKind::Integrity
            }
            LedgerError::Storage(_) | LedgerError::Internal { retryable: true } => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Infrastructure failures can be retried with the same idempotency key
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }

    /// Integrity and infrastructure failures are never shown to callers verbatim
    pub fn is_internal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Integrity | ErrorKind::Infrastructure)
    }

    /// Replaces internal failures with an opaque error, keeping named business errors
    pub fn into_public(self) -> Self {
        match self {
            LedgerError::Integrity(_) => LedgerError::Internal { retryable: false },
            LedgerError::Storage(_) | LedgerError::DuplicateIdempotencyKey(_) => {
                LedgerError::Internal { retryable: true }
            }
            other => other,
        }
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
