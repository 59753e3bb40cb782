use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dice_domain::{
    Bet, BetId, BetResult, BetType, ChatDrawSession, ChatId, DrawFaces, DrawResult, IssueId,
    Points, SettleStatus, UserAccount, UserId,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AccountRepository, BetRepository, BetSettlementCommit, ChatSessionRepository, DrawRepository,
    IssueStateStore, LedgerStoreError, PageRequest, SettlementCommitOutcome,
};

const SCHEMA_SQL: &str = include_str!("../../../migrations/0001_dice_lottery.sql");

fn db_err(e: sqlx::Error) -> LedgerStoreError {
    LedgerStoreError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn limit_offset(page: PageRequest) -> (i64, i64) {
    (
        i64::try_from(page.limit).unwrap_or(i64::MAX),
        i64::try_from(page.offset).unwrap_or(i64::MAX),
    )
}

#[derive(Debug, Clone)]
pub struct PostgresLedgerRepository {
    pool: PgPool,
}

impl PostgresLedgerRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates every table the game uses when missing.
    pub async fn ensure_schema(&self) -> Result<(), LedgerStoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn balance_of(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<Option<Points>, LedgerStoreError> {
        let row = sqlx::query("SELECT balance FROM user_accounts WHERE user_id = $1 AND chat_id = $2")
            .bind(user_id.0)
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| -> Result<Points, LedgerStoreError> {
            Ok(Points::from_i64(r.try_get("balance").map_err(db_err)?)?)
        })
        .transpose()
    }
}

fn row_to_session(row: &PgRow) -> Result<ChatDrawSession, LedgerStoreError> {
    let cycle: i32 = row.try_get("draw_cycle_minutes").map_err(db_err)?;
    Ok(ChatDrawSession {
        chat_id: ChatId(row.try_get("chat_id").map_err(db_err)?),
        draw_cycle_minutes: u32::try_from(cycle)
            .map_err(|_| LedgerStoreError::InvalidRow(format!("draw_cycle_minutes {cycle}")))?,
        enabled: row.try_get("enabled").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_account(row: &PgRow) -> Result<UserAccount, LedgerStoreError> {
    Ok(UserAccount {
        user_id: UserId(row.try_get("user_id").map_err(db_err)?),
        chat_id: ChatId(row.try_get("chat_id").map_err(db_err)?),
        username: row.try_get("username").map_err(db_err)?,
        balance: Points::from_i64(row.try_get("balance").map_err(db_err)?)?,
        last_sign_in_at: row.try_get("last_sign_in_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn row_to_bet(row: &PgRow) -> Result<Bet, LedgerStoreError> {
    let bet_type: String = row.try_get("bet_type").map_err(db_err)?;
    let settle_status: String = row.try_get("settle_status").map_err(db_err)?;
    let result: Option<String> = row.try_get("result").map_err(db_err)?;
    Ok(Bet {
        bet_id: BetId(row.try_get::<Uuid, _>("bet_id").map_err(db_err)?),
        user_id: UserId(row.try_get("user_id").map_err(db_err)?),
        chat_id: ChatId(row.try_get("chat_id").map_err(db_err)?),
        issue_id: IssueId::parse(row.try_get::<String, _>("issue_id").map_err(db_err)?)?,
        bet_type: bet_type.parse::<BetType>()?,
        amount: Points::from_i64(row.try_get("amount").map_err(db_err)?)?,
        settle_status: SettleStatus::parse(&settle_status)?,
        result: result.as_deref().map(BetResult::parse).transpose()?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn die_column(row: &PgRow, column: &str) -> Result<u8, LedgerStoreError> {
    let value: i16 = row.try_get(column).map_err(db_err)?;
    u8::try_from(value).map_err(|_| LedgerStoreError::InvalidRow(format!("{column} {value}")))
}

fn row_to_draw(row: &PgRow) -> Result<DrawResult, LedgerStoreError> {
    let faces = DrawFaces::from_values(
        die_column(row, "die_one")?,
        die_column(row, "die_two")?,
        die_column(row, "die_three")?,
    )?;
    Ok(DrawResult::new(
        ChatId(row.try_get("chat_id").map_err(db_err)?),
        IssueId::parse(row.try_get::<String, _>("issue_id").map_err(db_err)?)?,
        faces,
        row.try_get("drawn_at").map_err(db_err)?,
    ))
}

#[async_trait]
impl ChatSessionRepository for PostgresLedgerRepository {
    async fn upsert_session(&self, session: &ChatDrawSession) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO chat_draw_sessions (chat_id, draw_cycle_minutes, enabled, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (chat_id) DO UPDATE SET
                draw_cycle_minutes = EXCLUDED.draw_cycle_minutes,
                enabled = EXCLUDED.enabled,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(session.chat_id.0)
        .bind(i32::try_from(session.draw_cycle_minutes).unwrap_or(i32::MAX))
        .bind(session.enabled)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_session(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<ChatDrawSession>, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT chat_id, draw_cycle_minutes, enabled, updated_at
            FROM chat_draw_sessions
            WHERE chat_id = $1
            "#,
        )
        .bind(chat_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn set_session_enabled(
        &self,
        chat_id: ChatId,
        enabled: bool,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError> {
        let result = sqlx::query(
            "UPDATE chat_draw_sessions SET enabled = $2, updated_at = $3 WHERE chat_id = $1",
        )
        .bind(chat_id.0)
        .bind(enabled)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_enabled_sessions(&self) -> Result<Vec<ChatDrawSession>, LedgerStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT chat_id, draw_cycle_minutes, enabled, updated_at
            FROM chat_draw_sessions
            WHERE enabled
            ORDER BY chat_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_session).collect()
    }
}

#[async_trait]
impl AccountRepository for PostgresLedgerRepository {
    async fn insert_account(&self, account: &UserAccount) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_accounts (
                user_id, chat_id, username, balance, last_sign_in_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(account.user_id.0)
        .bind(account.chat_id.0)
        .bind(&account.username)
        .bind(account.balance.to_i64()?)
        .bind(account.last_sign_in_at)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerStoreError::DuplicateAccount {
                    user_id: account.user_id,
                    chat_id: account.chat_id,
                }
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    async fn get_account(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<Option<UserAccount>, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, chat_id, username, balance, last_sign_in_at, created_at
            FROM user_accounts
            WHERE user_id = $1 AND chat_id = $2
            "#,
        )
        .bind(user_id.0)
        .bind(chat_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn credit_balance(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        amount: Points,
    ) -> Result<Points, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE user_accounts SET balance = balance + $3
            WHERE user_id = $1 AND chat_id = $2
            RETURNING balance
            "#,
        )
        .bind(user_id.0)
        .bind(chat_id.0)
        .bind(amount.to_i64()?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(LedgerStoreError::AccountNotFound { user_id, chat_id })?;
        Ok(Points::from_i64(row.try_get("balance").map_err(db_err)?)?)
    }

    async fn debit_balance(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        amount: Points,
    ) -> Result<Points, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE user_accounts SET balance = balance - $3
            WHERE user_id = $1 AND chat_id = $2 AND balance >= $3
            RETURNING balance
            "#,
        )
        .bind(user_id.0)
        .bind(chat_id.0)
        .bind(amount.to_i64()?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => Ok(Points::from_i64(row.try_get("balance").map_err(db_err)?)?),
            None => match self.balance_of(user_id, chat_id).await? {
                Some(balance) => Err(LedgerStoreError::InsufficientBalance {
                    balance,
                    requested: amount,
                }),
                None => Err(LedgerStoreError::AccountNotFound { user_id, chat_id }),
            },
        }
    }

    async fn record_sign_in(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        bonus: Points,
        signed_in_at: DateTime<Utc>,
    ) -> Result<Points, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE user_accounts SET balance = balance + $3, last_sign_in_at = $4
            WHERE user_id = $1 AND chat_id = $2
            RETURNING balance
            "#,
        )
        .bind(user_id.0)
        .bind(chat_id.0)
        .bind(bonus.to_i64()?)
        .bind(signed_in_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(LedgerStoreError::AccountNotFound { user_id, chat_id })?;
        Ok(Points::from_i64(row.try_get("balance").map_err(db_err)?)?)
    }
}

#[async_trait]
impl BetRepository for PostgresLedgerRepository {
    async fn insert_bet(&self, bet: &Bet) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO bets (
                bet_id, user_id, chat_id, issue_id, bet_type, amount,
                settle_status, result, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(bet.bet_id.0)
        .bind(bet.user_id.0)
        .bind(bet.chat_id.0)
        .bind(bet.issue_id.as_str())
        .bind(bet.bet_type.as_str())
        .bind(bet.amount.to_i64()?)
        .bind(bet.settle_status.as_str())
        .bind(bet.result.map(BetResult::as_str))
        .bind(bet.created_at)
        .bind(bet.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_bet_on_open_issue(&self, bet: &Bet) -> Result<(), LedgerStoreError> {
        // FOR SHARE makes a concurrent take_open_issue wait for this insert,
        // or makes this insert see the token already gone.
        let inserted = sqlx::query(
            r#"
            INSERT INTO bets (
                bet_id, user_id, chat_id, issue_id, bet_type, amount,
                settle_status, result, created_at, updated_at
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            WHERE EXISTS (
                SELECT 1 FROM open_issues
                WHERE chat_id = $3 AND issue_id = $4
                FOR SHARE
            )
            "#,
        )
        .bind(bet.bet_id.0)
        .bind(bet.user_id.0)
        .bind(bet.chat_id.0)
        .bind(bet.issue_id.as_str())
        .bind(bet.bet_type.as_str())
        .bind(bet.amount.to_i64()?)
        .bind(bet.settle_status.as_str())
        .bind(bet.result.map(BetResult::as_str))
        .bind(bet.created_at)
        .bind(bet.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if inserted.rows_affected() == 0 {
            return Err(LedgerStoreError::IssueClosed {
                chat_id: bet.chat_id,
                issue_id: bet.issue_id.clone(),
            });
        }
        Ok(())
    }

    async fn get_bet(&self, bet_id: BetId) -> Result<Option<Bet>, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT bet_id, user_id, chat_id, issue_id, bet_type, amount,
                   settle_status, result, created_at, updated_at
            FROM bets
            WHERE bet_id = $1
            "#,
        )
        .bind(bet_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_bet).transpose()
    }

    async fn list_bets_for_issue(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
    ) -> Result<Vec<Bet>, LedgerStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT bet_id, user_id, chat_id, issue_id, bet_type, amount,
                   settle_status, result, created_at, updated_at
            FROM bets
            WHERE chat_id = $1 AND issue_id = $2
            ORDER BY created_at ASC, bet_id ASC
            "#,
        )
        .bind(chat_id.0)
        .bind(issue_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_bet).collect()
    }

    async fn list_user_bets(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        page: PageRequest,
    ) -> Result<Vec<Bet>, LedgerStoreError> {
        let (limit, offset) = limit_offset(page);
        let rows = sqlx::query(
            r#"
            SELECT bet_id, user_id, chat_id, issue_id, bet_type, amount,
                   settle_status, result, created_at, updated_at
            FROM bets
            WHERE user_id = $1 AND chat_id = $2
            ORDER BY created_at DESC, bet_id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id.0)
        .bind(chat_id.0)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_bet).collect()
    }

    async fn count_pending_bets(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<usize, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS pending
            FROM bets
            WHERE user_id = $1 AND chat_id = $2 AND settle_status = 'pending'
            "#,
        )
        .bind(user_id.0)
        .bind(chat_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let pending: i64 = row.try_get("pending").map_err(db_err)?;
        Ok(usize::try_from(pending).unwrap_or(usize::MAX))
    }

    async fn commit_bet_settlement(
        &self,
        commit: &BetSettlementCommit,
    ) -> Result<SettlementCommitOutcome, LedgerStoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let updated = sqlx::query(
            r#"
            UPDATE bets SET settle_status = 'settled', result = $2, updated_at = $3
            WHERE bet_id = $1 AND settle_status = 'pending'
            "#,
        )
        .bind(commit.bet_id.0)
        .bind(commit.result.as_str())
        .bind(commit.settled_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(SettlementCommitOutcome::AlreadySettled);
        }

        let row = sqlx::query(
            r#"
            UPDATE user_accounts SET balance = balance + $3
            WHERE user_id = $1 AND chat_id = $2
            RETURNING balance
            "#,
        )
        .bind(commit.user_id.0)
        .bind(commit.chat_id.0)
        .bind(commit.credit.to_i64()?)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            tx.rollback().await.map_err(db_err)?;
            return Err(LedgerStoreError::AccountNotFound {
                user_id: commit.user_id,
                chat_id: commit.chat_id,
            });
        };
        let new_balance = Points::from_i64(row.try_get("balance").map_err(db_err)?)?;

        tx.commit().await.map_err(db_err)?;
        Ok(SettlementCommitOutcome::Committed { new_balance })
    }
}

#[async_trait]
impl DrawRepository for PostgresLedgerRepository {
    async fn insert_draw(&self, draw: &DrawResult) -> Result<(), LedgerStoreError> {
        let [one, two, three] = draw.outcome.faces.values();
        sqlx::query(
            r#"
            INSERT INTO draw_results (
                chat_id, issue_id, die_one, die_two, die_three,
                total, parity, size, triplet, drawn_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(draw.chat_id.0)
        .bind(draw.issue_id.as_str())
        .bind(i16::from(one))
        .bind(i16::from(two))
        .bind(i16::from(three))
        .bind(i16::from(draw.outcome.total))
        .bind(draw.outcome.parity.as_str())
        .bind(draw.outcome.size.as_str())
        .bind(draw.outcome.triplet)
        .bind(draw.drawn_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerStoreError::DuplicateDraw {
                    chat_id: draw.chat_id,
                    issue_id: draw.issue_id.clone(),
                }
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    async fn get_draw(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
    ) -> Result<Option<DrawResult>, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT chat_id, issue_id, die_one, die_two, die_three, drawn_at
            FROM draw_results
            WHERE chat_id = $1 AND issue_id = $2
            "#,
        )
        .bind(chat_id.0)
        .bind(issue_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_draw).transpose()
    }

    async fn list_recent_draws(
        &self,
        chat_id: ChatId,
        page: PageRequest,
    ) -> Result<Vec<DrawResult>, LedgerStoreError> {
        let (limit, offset) = limit_offset(page);
        let rows = sqlx::query(
            r#"
            SELECT chat_id, issue_id, die_one, die_two, die_three, drawn_at
            FROM draw_results
            WHERE chat_id = $1
            ORDER BY issue_id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(chat_id.0)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_draw).collect()
    }
}

/// Open-issue tokens kept in the `open_issues` table so they survive restarts.
#[derive(Debug, Clone)]
pub struct PostgresIssueStateStore {
    pool: PgPool,
}

impl PostgresIssueStateStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_issue(row: &PgRow) -> Result<IssueId, LedgerStoreError> {
    Ok(IssueId::parse(
        row.try_get::<String, _>("issue_id").map_err(db_err)?,
    )?)
}

#[async_trait]
impl IssueStateStore for PostgresIssueStateStore {
    async fn get_open_issue(&self, chat_id: ChatId) -> Result<Option<IssueId>, LedgerStoreError> {
        let row = sqlx::query("SELECT issue_id FROM open_issues WHERE chat_id = $1")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_issue).transpose()
    }

    async fn set_open_issue(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
    ) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO open_issues (chat_id, issue_id, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chat_id) DO UPDATE SET
                issue_id = EXCLUDED.issue_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(chat_id.0)
        .bind(issue_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_open_issue(&self, chat_id: ChatId) -> Result<(), LedgerStoreError> {
        sqlx::query("DELETE FROM open_issues WHERE chat_id = $1")
            .bind(chat_id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn take_open_issue(&self, chat_id: ChatId) -> Result<Option<IssueId>, LedgerStoreError> {
        let row = sqlx::query("DELETE FROM open_issues WHERE chat_id = $1 RETURNING issue_id")
            .bind(chat_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_issue).transpose()
    }
}
