//! Deadlock-free lock ordering over accounts
//!
//! Every unit of work acquires its row locks in ascending [`LockKey`] order:
//! user accounts first, by ascending [`AccountId`], then the system accounts
//! in the fixed order reserve, fee. Two operations sharing accounts therefore
//! always contend on the lowest shared key first and never wait on each other
//! in a cycle.

use std::fmt;

use crate::types::*;

/// Position of an account in the global lock order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    /// User and other non-named accounts, ordered by ID
    Account(AccountId),
    /// Named system accounts, always locked after every user account
    System(SystemAccount),
}

impl LockKey {
    /// Lock key of an account row
    pub fn for_account(account: &Account) -> Self {
        match SystemAccount::from_kind(account.kind) {
            Some(system) => LockKey::System(system),
            None => LockKey::Account(account.id),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Account(id) => write!(f, "account {}", id),
            LockKey::System(system) => write!(f, "system account {}", system),
        }
    }
}

/// Order two accounts for locking, independent of argument position
pub fn lock_order(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
