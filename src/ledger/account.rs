//! Account provisioning and lookup

use tracing::info;

use crate::config::LedgerConfig;
use crate::traits::*;
use crate::types::*;

/// Account manager for wallet and system accounts
#[derive(Debug, Clone)]
pub struct AccountManager<S: LedgerStorage> {
    pub(crate) storage: S,
    config: LedgerConfig,
}

impl<S: LedgerStorage> AccountManager<S> {
    /// Create a new account manager
    pub fn new(storage: S, config: LedgerConfig) -> Self {
        Self { storage, config }
    }

    /// Create the reserve and fee accounts if they do not exist yet
    pub async fn bootstrap_system_accounts(&self) -> LedgerResult<(Account, Account)> {
        let reserve = self
            .storage
            .create_system_account(
                SystemAccount::Reserve,
                &self.config.reserve_account,
                &self.config.currency,
            )
            .await?;
        let fee = self
            .storage
            .create_system_account(
                SystemAccount::Fee,
                &self.config.fee_account,
                &self.config.currency,
            )
            .await?;
        info!(reserve_id = %reserve.id, fee_id = %fee.id, "system accounts ready");
        Ok((reserve, fee))
    }

    /// Open the wallet of a newly provisioned owner
    pub async fn open_account(&self, owner: OwnerId) -> LedgerResult<Account> {
        let account = self
            .storage
            .create_user_account(owner, &self.config.currency)
            .await?;
        info!(owner = %owner, account_id = %account.id, "account opened");
        Ok(account)
    }

    /// Get the wallet of an owner
    pub async fn get_account(&self, owner: OwnerId) -> LedgerResult<Option<Account>> {
        self.storage.get_account(owner).await
    }

    /// Get the wallet of an owner, returning an error if not found
    pub async fn get_account_required(&self, owner: OwnerId) -> LedgerResult<Account> {
        self.storage
            .get_account(owner)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(format!("owner {}", owner)))
    }

    /// Get a system account, returning an error if not found
    pub async fn get_system_account_required(&self, account: SystemAccount) -> LedgerResult<Account> {
        self.storage
            .get_system_account(account)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(format!("{} system account", account)))
    }

    /// Current balance of an owner's wallet
    pub async fn get_balance(&self, owner: OwnerId) -> LedgerResult<BalanceView> {
        let account = self.get_account_required(owner).await?;
        Ok(BalanceView {
            owner,
            account_id: account.id,
            balance: account.balance,
            currency: account.currency,
            frozen: account.frozen,
        })
    }

    /// Block all further postings to an owner's wallet
    pub async fn freeze_account(&self, owner: OwnerId) -> LedgerResult<Account> {
        let account = self.storage.set_frozen(owner, true).await?;
        info!(owner = %owner, account_id = %account.id, "account frozen");
        Ok(account)
    }

    /// Allow postings to an owner's wallet again
    pub async fn unfreeze_account(&self, owner: OwnerId) -> LedgerResult<Account> {
        let account = self.storage.set_frozen(owner, false).await?;
        info!(owner = %owner, account_id = %account.id, "account unfrozen");
        Ok(account)
    }
}

/// Reject postings to a frozen wallet. Call with the locked row.
pub fn ensure_active(account: &Account) -> LedgerResult<()> {
    if account.frozen {
        return Err(LedgerError::AccountFrozen(account.label()));
    }
    Ok(())
}
