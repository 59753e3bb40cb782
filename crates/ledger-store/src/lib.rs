mod in_memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dice_domain::{
    Bet, BetId, BetResult, ChatDrawSession, ChatId, DomainError, DrawResult, IssueId, MoneyError,
    Points, UserAccount, UserId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use in_memory::InMemoryLedgerRepository;
pub use postgres::{PostgresIssueStateStore, PostgresLedgerRepository};

#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("account not found for user {user_id} in chat {chat_id}")]
    AccountNotFound { user_id: UserId, chat_id: ChatId },
    #[error("account already exists for user {user_id} in chat {chat_id}")]
    DuplicateAccount { user_id: UserId, chat_id: ChatId },
    #[error("balance {balance} cannot cover {requested}")]
    InsufficientBalance { balance: Points, requested: Points },
    #[error("bet not found: {0:?}")]
    BetNotFound(BetId),
    #[error("issue {issue_id} is no longer open in chat {chat_id}")]
    IssueClosed { chat_id: ChatId, issue_id: IssueId },
    #[error("draw already recorded for chat {chat_id} issue {issue_id}")]
    DuplicateDraw { chat_id: ChatId, issue_id: IssueId },
    #[error("money error: {0}")]
    Money(#[from] MoneyError),
}

impl From<DomainError> for LedgerStoreError {
    fn from(err: DomainError) -> Self {
        Self::InvalidRow(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
        }
    }
}

/// Balance credit and bet status change that must land together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetSettlementCommit {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub credit: Points,
    pub result: BetResult,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementCommitOutcome {
    Committed { new_balance: Points },
    AlreadySettled,
}

#[async_trait]
pub trait ChatSessionRepository: Send + Sync {
    /// Inserts or replaces the session row for `session.chat_id`.
    async fn upsert_session(&self, session: &ChatDrawSession) -> Result<(), LedgerStoreError>;

    async fn get_session(&self, chat_id: ChatId)
    -> Result<Option<ChatDrawSession>, LedgerStoreError>;

    /// Returns `false` when no session exists for the chat.
    async fn set_session_enabled(
        &self,
        chat_id: ChatId,
        enabled: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError>;

    async fn list_enabled_sessions(&self) -> Result<Vec<ChatDrawSession>, LedgerStoreError>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn insert_account(&self, account: &UserAccount) -> Result<(), LedgerStoreError>;

    async fn get_account(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<Option<UserAccount>, LedgerStoreError>;

    /// Returns the balance after the credit.
    async fn credit_balance(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        amount: Points,
    ) -> Result<Points, LedgerStoreError>;

    /// Returns the balance after the debit. Never lets the balance go below zero.
    async fn debit_balance(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        amount: Points,
    ) -> Result<Points, LedgerStoreError>;

    /// Credits `bonus` and stamps the sign-in time in one write.
    async fn record_sign_in(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        bonus: Points,
        signed_in_at: DateTime<Utc>,
    ) -> Result<Points, LedgerStoreError>;
}

#[async_trait]
pub trait BetRepository: Send + Sync {
    async fn insert_bet(&self, bet: &Bet) -> Result<(), LedgerStoreError>;

    /// Inserts the bet only while `bet.issue_id` is still the chat's open
    /// issue, failing with [`LedgerStoreError::IssueClosed`] otherwise. The
    /// check and the insert cannot interleave with `take_open_issue`.
    async fn insert_bet_on_open_issue(&self, bet: &Bet) -> Result<(), LedgerStoreError>;

    async fn get_bet(&self, bet_id: BetId) -> Result<Option<Bet>, LedgerStoreError>;

    async fn list_bets_for_issue(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
    ) -> Result<Vec<Bet>, LedgerStoreError>;

    /// Newest first.
    async fn list_user_bets(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        page: PageRequest,
    ) -> Result<Vec<Bet>, LedgerStoreError>;

    async fn count_pending_bets(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<usize, LedgerStoreError>;

    /// Applies the credit and marks the bet settled atomically. A bet that is
    /// already settled is left untouched.
    async fn commit_bet_settlement(
        &self,
        commit: &BetSettlementCommit,
    ) -> Result<SettlementCommitOutcome, LedgerStoreError>;
}

#[async_trait]
pub trait DrawRepository: Send + Sync {
    async fn insert_draw(&self, draw: &DrawResult) -> Result<(), LedgerStoreError>;

    async fn get_draw(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
    ) -> Result<Option<DrawResult>, LedgerStoreError>;

    /// Newest first.
    async fn list_recent_draws(
        &self,
        chat_id: ChatId,
        page: PageRequest,
    ) -> Result<Vec<DrawResult>, LedgerStoreError>;
}

/// Per-chat token of the open betting round. Each call is atomic per key.
#[async_trait]
pub trait IssueStateStore: Send + Sync {
    async fn get_open_issue(&self, chat_id: ChatId) -> Result<Option<IssueId>, LedgerStoreError>;

    async fn set_open_issue(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
    ) -> Result<(), LedgerStoreError>;

    async fn delete_open_issue(&self, chat_id: ChatId) -> Result<(), LedgerStoreError>;

    /// Reads and clears the token in one step.
    async fn take_open_issue(&self, chat_id: ChatId) -> Result<Option<IssueId>, LedgerStoreError>;
}

/// Handles to every store the game needs, shared across services.
#[derive(Clone)]
pub struct LedgerStores {
    pub sessions: Arc<dyn ChatSessionRepository>,
    pub accounts: Arc<dyn AccountRepository>,
    pub bets: Arc<dyn BetRepository>,
    pub draws: Arc<dyn DrawRepository>,
    pub issues: Arc<dyn IssueStateStore>,
}

impl LedgerStores {
    #[must_use]
    pub fn in_memory() -> Self {
        let ledger = Arc::new(InMemoryLedgerRepository::new());
        Self {
            sessions: ledger.clone(),
            accounts: ledger.clone(),
            bets: ledger.clone(),
            draws: ledger.clone(),
            issues: ledger,
        }
    }

    #[must_use]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let ledger = Arc::new(PostgresLedgerRepository::new(pool.clone()));
        Self {
            sessions: ledger.clone(),
            accounts: ledger.clone(),
            bets: ledger.clone(),
            draws: ledger,
            issues: Arc::new(PostgresIssueStateStore::new(pool)),
        }
    }
}

impl std::fmt::Debug for LedgerStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStores").finish_non_exhaustive()
    }
}
