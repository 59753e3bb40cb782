use std::sync::Arc;

use chrono::{DateTime, Utc};
use dice_domain::{ChatId, Points, UserAccount, UserId};
use ledger_store::{AccountRepository, BetRepository, LedgerStoreError, LedgerStores};
use platform_core::RewardsSection;
use settlement::LockRegistry;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("user {user_id} is already registered in chat {chat_id}")]
    AlreadyRegistered { user_id: UserId, chat_id: ChatId },
    #[error("user {user_id} is not registered in chat {chat_id}")]
    NotFound { user_id: UserId, chat_id: ChatId },
    #[error("already signed in today")]
    AlreadySignedIn,
    #[error("{pending} bets are still waiting for a draw")]
    PendingBets { pending: usize },
    #[error("balance {balance} is not below the welfare threshold {threshold}")]
    BalanceTooHigh { balance: Points, threshold: Points },
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerStoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardPolicy {
    pub initial_balance: Points,
    pub sign_in_bonus: Points,
    pub welfare_amount: Points,
    pub welfare_threshold: Points,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            initial_balance: Points(1000),
            sign_in_bonus: Points(1000),
            welfare_amount: Points(1000),
            welfare_threshold: Points(1000),
        }
    }
}

impl From<&RewardsSection> for RewardPolicy {
    fn from(section: &RewardsSection) -> Self {
        Self {
            initial_balance: Points(section.initial_balance),
            sign_in_bonus: Points(section.sign_in_bonus),
            welfare_amount: Points(section.welfare_amount),
            welfare_threshold: Points(section.welfare_threshold),
        }
    }
}

/// Registration and reward credits. Every balance change runs under the user's lock.
#[derive(Clone)]
pub struct AccountService {
    accounts: Arc<dyn AccountRepository>,
    bets: Arc<dyn BetRepository>,
    locks: Arc<LockRegistry>,
    policy: RewardPolicy,
}

impl std::fmt::Debug for AccountService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountService")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl AccountService {
    #[must_use]
    pub fn new(stores: &LedgerStores, locks: Arc<LockRegistry>, policy: RewardPolicy) -> Self {
        Self {
            accounts: stores.accounts.clone(),
            bets: stores.bets.clone(),
            locks,
            policy,
        }
    }

    async fn require_account(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<UserAccount, AccountError> {
        self.accounts
            .get_account(user_id, chat_id)
            .await?
            .ok_or(AccountError::NotFound { user_id, chat_id })
    }

    pub async fn register(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        username: String,
    ) -> Result<UserAccount, AccountError> {
        let _guard = self.locks.acquire_user_lock(user_id).await;
        if self.accounts.get_account(user_id, chat_id).await?.is_some() {
            return Err(AccountError::AlreadyRegistered { user_id, chat_id });
        }
        let account = UserAccount {
            user_id,
            chat_id,
            username,
            balance: self.policy.initial_balance,
            last_sign_in_at: None,
            created_at: Utc::now(),
        };
        self.accounts
            .insert_account(&account)
            .await
            .map_err(|err| match err {
                LedgerStoreError::DuplicateAccount { user_id, chat_id } => {
                    AccountError::AlreadyRegistered { user_id, chat_id }
                }
                other => other.into(),
            })?;
        info!(
            user_id = %user_id,
            chat_id = %chat_id,
            balance = account.balance.as_u64(),
            "account registered"
        );
        Ok(account)
    }

    /// Credits the daily bonus once per UTC calendar day.
    pub async fn sign_in(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        now: DateTime<Utc>,
    ) -> Result<UserAccount, AccountError> {
        let _guard = self.locks.acquire_user_lock(user_id).await;
        let account = self.require_account(user_id, chat_id).await?;
        if account
            .last_sign_in_at
            .is_some_and(|last| last.date_naive() == now.date_naive())
        {
            return Err(AccountError::AlreadySignedIn);
        }
        let balance = self
            .accounts
            .record_sign_in(user_id, chat_id, self.policy.sign_in_bonus, now)
            .await?;
        info!(
            user_id = %user_id,
            chat_id = %chat_id,
            bonus = self.policy.sign_in_bonus.as_u64(),
            balance = balance.as_u64(),
            "daily sign-in credited"
        );
        Ok(UserAccount {
            balance,
            last_sign_in_at: Some(now),
            ..account
        })
    }

    /// Tops up a broke player who has nothing left riding on a draw.
    pub async fn claim_welfare(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<UserAccount, AccountError> {
        let _guard = self.locks.acquire_user_lock(user_id).await;
        let account = self.require_account(user_id, chat_id).await?;
        let pending = self.bets.count_pending_bets(user_id, chat_id).await?;
        if pending > 0 {
            return Err(AccountError::PendingBets { pending });
        }
        if account.balance >= self.policy.welfare_threshold {
            return Err(AccountError::BalanceTooHigh {
                balance: account.balance,
                threshold: self.policy.welfare_threshold,
            });
        }
        let balance = self
            .accounts
            .credit_balance(user_id, chat_id, self.policy.welfare_amount)
            .await?;
        info!(
            user_id = %user_id,
            chat_id = %chat_id,
            amount = self.policy.welfare_amount.as_u64(),
            balance = balance.as_u64(),
            "welfare credited"
        );
        Ok(UserAccount { balance, ..account })
    }

    pub async fn account(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<UserAccount, AccountError> {
        self.require_account(user_id, chat_id).await
    }
}
