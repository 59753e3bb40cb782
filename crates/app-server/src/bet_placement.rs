use std::sync::Arc;

use chrono::Utc;
use dice_domain::{Bet, BetType, ChatId, Points, UserId};
use ledger_store::{
    AccountRepository, BetRepository, ChatSessionRepository, IssueStateStore, LedgerStoreError,
    LedgerStores,
};
use settlement::LockRegistry;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum BetPlacementError {
    #[error("bet amount must be positive")]
    InvalidAmount,
    #[error("draws are not enabled in chat {0}")]
    DrawsDisabled(ChatId),
    #[error("no open round in chat {0}")]
    NoOpenIssue(ChatId),
    #[error("user {user_id} is not registered in chat {chat_id}")]
    AccountNotFound { user_id: UserId, chat_id: ChatId },
    #[error("insufficient funds: balance {balance}, stake {requested}")]
    InsufficientFunds { balance: Points, requested: Points },
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerStoreError),
}

#[derive(Clone)]
pub struct BetPlacementService {
    sessions: Arc<dyn ChatSessionRepository>,
    accounts: Arc<dyn AccountRepository>,
    bets: Arc<dyn BetRepository>,
    issues: Arc<dyn IssueStateStore>,
    locks: Arc<LockRegistry>,
}

impl std::fmt::Debug for BetPlacementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BetPlacementService").finish_non_exhaustive()
    }
}

impl BetPlacementService {
    #[must_use]
    pub fn new(stores: &LedgerStores, locks: Arc<LockRegistry>) -> Self {
        Self {
            sessions: stores.sessions.clone(),
            accounts: stores.accounts.clone(),
            bets: stores.bets.clone(),
            issues: stores.issues.clone(),
            locks,
        }
    }

    /// Debits the stake and records a pending bet against the chat's open issue.
    pub async fn place_bet(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        bet_type: BetType,
        amount: Points,
    ) -> Result<Bet, BetPlacementError> {
        if amount.is_zero() {
            return Err(BetPlacementError::InvalidAmount);
        }
        let draws_enabled = self
            .sessions
            .get_session(chat_id)
            .await?
            .is_some_and(|s| s.enabled);
        if !draws_enabled {
            return Err(BetPlacementError::DrawsDisabled(chat_id));
        }
        let issue_id = self
            .issues
            .get_open_issue(chat_id)
            .await?
            .ok_or(BetPlacementError::NoOpenIssue(chat_id))?;

        let _guard = self.locks.acquire_user_lock(user_id).await;
        // The round may have closed while this call waited for the lock.
        if self.issues.get_open_issue(chat_id).await?.as_ref() != Some(&issue_id) {
            return Err(BetPlacementError::NoOpenIssue(chat_id));
        }
        let account = self
            .accounts
            .get_account(user_id, chat_id)
            .await?
            .ok_or(BetPlacementError::AccountNotFound { user_id, chat_id })?;
        if account.balance < amount {
            return Err(BetPlacementError::InsufficientFunds {
                balance: account.balance,
                requested: amount,
            });
        }
        let balance_after = self
            .accounts
            .debit_balance(user_id, chat_id, amount)
            .await
            .map_err(|err| match err {
                LedgerStoreError::InsufficientBalance { balance, requested } => {
                    BetPlacementError::InsufficientFunds { balance, requested }
                }
                other => other.into(),
            })?;

        let bet = Bet::pending(user_id, chat_id, issue_id, bet_type, amount, Utc::now());
        if let Err(err) = self.bets.insert_bet_on_open_issue(&bet).await {
            self.refund_stake(user_id, chat_id, amount).await;
            return Err(match err {
                LedgerStoreError::IssueClosed { issue_id, .. } => {
                    info!(
                        user_id = %user_id,
                        chat_id = %chat_id,
                        issue_id = %issue_id,
                        "bet refused, issue closed before it was recorded"
                    );
                    BetPlacementError::NoOpenIssue(chat_id)
                }
                other => other.into(),
            });
        }
        info!(
            user_id = %user_id,
            chat_id = %chat_id,
            issue_id = %bet.issue_id,
            bet_type = bet_type.as_str(),
            amount = amount.as_u64(),
            balance_after = balance_after.as_u64(),
            "bet placed"
        );
        Ok(bet)
    }

    async fn refund_stake(&self, user_id: UserId, chat_id: ChatId, amount: Points) {
        if let Err(err) = self.accounts.credit_balance(user_id, chat_id, amount).await {
            error!(
                user_id = %user_id,
                chat_id = %chat_id,
                amount = amount.as_u64(),
                error = %err,
                "failed to refund stake after bet write failure"
            );
        }
    }
}
