use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dice_domain::{
    Bet, BetId, ChatDrawSession, ChatId, DrawResult, IssueId, Points, SettleStatus,
    UserAccount, UserId,
};

use crate::{
    AccountRepository, BetRepository, BetSettlementCommit, ChatSessionRepository, DrawRepository,
    IssueStateStore, LedgerStoreError, PageRequest, SettlementCommitOutcome,
};

#[derive(Debug, Default)]
struct LedgerState {
    sessions: HashMap<ChatId, ChatDrawSession>,
    accounts: HashMap<(UserId, ChatId), UserAccount>,
    bets: Vec<Bet>,
    draws: Vec<DrawResult>,
    open_issues: HashMap<ChatId, IssueId>,
}

impl LedgerState {
    fn account_mut(
        &mut self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<&mut UserAccount, LedgerStoreError> {
        self.accounts
            .get_mut(&(user_id, chat_id))
            .ok_or(LedgerStoreError::AccountNotFound { user_id, chat_id })
    }
}

/// Ledger kept behind one lock so that settlement commits and bet inserts
/// against the open issue stay atomic.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLedgerRepository {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedgerRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerStoreError> {
        self.state.lock().map_err(|_| LedgerStoreError::LockPoisoned)
    }
}

fn page<T: Clone>(items: impl Iterator<Item = T>, page: PageRequest) -> Vec<T> {
    items.skip(page.offset).take(page.limit).collect()
}

#[async_trait]
impl ChatSessionRepository for InMemoryLedgerRepository {
    async fn upsert_session(&self, session: &ChatDrawSession) -> Result<(), LedgerStoreError> {
        self.lock()?
            .sessions
            .insert(session.chat_id, session.clone());
        Ok(())
    }

    async fn get_session(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<ChatDrawSession>, LedgerStoreError> {
        Ok(self.lock()?.sessions.get(&chat_id).cloned())
    }

    async fn set_session_enabled(
        &self,
        chat_id: ChatId,
        enabled: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError> {
        let mut state = self.lock()?;
        let Some(session) = state.sessions.get_mut(&chat_id) else {
            return Ok(false);
        };
        session.enabled = enabled;
        session.updated_at = updated_at;
        Ok(true)
    }

    async fn list_enabled_sessions(&self) -> Result<Vec<ChatDrawSession>, LedgerStoreError> {
        let state = self.lock()?;
        let mut sessions: Vec<_> = state
            .sessions
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.chat_id);
        Ok(sessions)
    }
}

#[async_trait]
impl AccountRepository for InMemoryLedgerRepository {
    async fn insert_account(&self, account: &UserAccount) -> Result<(), LedgerStoreError> {
        let mut state = self.lock()?;
        let key = (account.user_id, account.chat_id);
        if state.accounts.contains_key(&key) {
            return Err(LedgerStoreError::DuplicateAccount {
                user_id: account.user_id,
                chat_id: account.chat_id,
            });
        }
        state.accounts.insert(key, account.clone());
        Ok(())
    }

    async fn get_account(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<Option<UserAccount>, LedgerStoreError> {
        Ok(self.lock()?.accounts.get(&(user_id, chat_id)).cloned())
    }

    async fn credit_balance(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        amount: Points,
    ) -> Result<Points, LedgerStoreError> {
        let mut state = self.lock()?;
        let account = state.account_mut(user_id, chat_id)?;
        account.balance = account.balance.checked_add(amount)?;
        Ok(account.balance)
    }

    async fn debit_balance(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        amount: Points,
    ) -> Result<Points, LedgerStoreError> {
        let mut state = self.lock()?;
        let account = state.account_mut(user_id, chat_id)?;
        account.balance = account.balance.checked_sub(amount).map_err(|_| {
            LedgerStoreError::InsufficientBalance {
                balance: account.balance,
                requested: amount,
            }
        })?;
        Ok(account.balance)
    }

    async fn record_sign_in(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        bonus: Points,
        signed_in_at: DateTime<Utc>,
    ) -> Result<Points, LedgerStoreError> {
        let mut state = self.lock()?;
        let account = state.account_mut(user_id, chat_id)?;
        account.balance = account.balance.checked_add(bonus)?;
        account.last_sign_in_at = Some(signed_in_at);
        Ok(account.balance)
    }
}

#[async_trait]
impl BetRepository for InMemoryLedgerRepository {
    async fn insert_bet(&self, bet: &Bet) -> Result<(), LedgerStoreError> {
        self.lock()?.bets.push(bet.clone());
        Ok(())
    }

    async fn insert_bet_on_open_issue(&self, bet: &Bet) -> Result<(), LedgerStoreError> {
        let mut state = self.lock()?;
        if state.open_issues.get(&bet.chat_id) != Some(&bet.issue_id) {
            return Err(LedgerStoreError::IssueClosed {
                chat_id: bet.chat_id,
                issue_id: bet.issue_id.clone(),
            });
        }
        state.bets.push(bet.clone());
        Ok(())
    }

    async fn get_bet(&self, bet_id: BetId) -> Result<Option<Bet>, LedgerStoreError> {
        Ok(self
            .lock()?
            .bets
            .iter()
            .find(|b| b.bet_id == bet_id)
            .cloned())
    }

    async fn list_bets_for_issue(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
    ) -> Result<Vec<Bet>, LedgerStoreError> {
        Ok(self
            .lock()?
            .bets
            .iter()
            .filter(|b| b.chat_id == chat_id && &b.issue_id == issue_id)
            .cloned()
            .collect())
    }

    async fn list_user_bets(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        page_req: PageRequest,
    ) -> Result<Vec<Bet>, LedgerStoreError> {
        let state = self.lock()?;
        Ok(page(
            state
                .bets
                .iter()
                .rev()
                .filter(|b| b.user_id == user_id && b.chat_id == chat_id)
                .cloned(),
            page_req,
        ))
    }

    async fn count_pending_bets(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<usize, LedgerStoreError> {
        Ok(self
            .lock()?
            .bets
            .iter()
            .filter(|b| b.user_id == user_id && b.chat_id == chat_id && !b.is_settled())
            .count())
    }

    async fn commit_bet_settlement(
        &self,
        commit: &BetSettlementCommit,
    ) -> Result<SettlementCommitOutcome, LedgerStoreError> {
        let mut state = self.lock()?;
        let bet_index = state
            .bets
            .iter()
            .position(|b| b.bet_id == commit.bet_id)
            .ok_or(LedgerStoreError::BetNotFound(commit.bet_id))?;
        if state.bets[bet_index].is_settled() {
            return Ok(SettlementCommitOutcome::AlreadySettled);
        }

        // Compute the new balance before touching the bet so a failure leaves both unchanged.
        let account = state.account_mut(commit.user_id, commit.chat_id)?;
        let new_balance = account.balance.checked_add(commit.credit)?;
        account.balance = new_balance;

        let bet = &mut state.bets[bet_index];
        bet.settle_status = SettleStatus::Settled;
        bet.result = Some(commit.result);
        bet.updated_at = commit.settled_at;
        Ok(SettlementCommitOutcome::Committed { new_balance })
    }
}

#[async_trait]
impl DrawRepository for InMemoryLedgerRepository {
    async fn insert_draw(&self, draw: &DrawResult) -> Result<(), LedgerStoreError> {
        let mut state = self.lock()?;
        if state
            .draws
            .iter()
            .any(|d| d.chat_id == draw.chat_id && d.issue_id == draw.issue_id)
        {
            return Err(LedgerStoreError::DuplicateDraw {
                chat_id: draw.chat_id,
                issue_id: draw.issue_id.clone(),
            });
        }
        state.draws.push(draw.clone());
        Ok(())
    }

    async fn get_draw(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
    ) -> Result<Option<DrawResult>, LedgerStoreError> {
        Ok(self
            .lock()?
            .draws
            .iter()
            .find(|d| d.chat_id == chat_id && &d.issue_id == issue_id)
            .cloned())
    }

    async fn list_recent_draws(
        &self,
        chat_id: ChatId,
        page_req: PageRequest,
    ) -> Result<Vec<DrawResult>, LedgerStoreError> {
        let state = self.lock()?;
        Ok(page(
            state
                .draws
                .iter()
                .rev()
                .filter(|d| d.chat_id == chat_id)
                .cloned(),
            page_req,
        ))
    }
}

#[async_trait]
impl IssueStateStore for InMemoryLedgerRepository {
    async fn get_open_issue(&self, chat_id: ChatId) -> Result<Option<IssueId>, LedgerStoreError> {
        Ok(self.lock()?.open_issues.get(&chat_id).cloned())
    }

    async fn set_open_issue(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
    ) -> Result<(), LedgerStoreError> {
        self.lock()?.open_issues.insert(chat_id, issue_id.clone());
        Ok(())
    }

    async fn delete_open_issue(&self, chat_id: ChatId) -> Result<(), LedgerStoreError> {
        self.lock()?.open_issues.remove(&chat_id);
        Ok(())
    }

    async fn take_open_issue(&self, chat_id: ChatId) -> Result<Option<IssueId>, LedgerStoreError> {
        Ok(self.lock()?.open_issues.remove(&chat_id))
    }
}
