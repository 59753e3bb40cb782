mod announcer;
mod dice_channel;
mod lock_registry;

use std::sync::Arc;

use chrono::Utc;
use dice_domain::{
    Bet, BetResult, BetType, ChatId, DrawOutcome, DrawResult, IssueId, MoneyError, Points,
};
use ledger_store::{
    BetRepository, BetSettlementCommit, DrawRepository, IssueStateStore, LedgerStoreError,
    LedgerStores, PageRequest, SettlementCommitOutcome,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub use announcer::{DrawAnnouncer, NoopDrawAnnouncer};
pub use dice_channel::{
    DiceChannel, DiceChannelError, RandDiceChannel, ScriptedDiceChannel, roll_draw,
};
pub use lock_registry::{LockGuard, LockRegistry};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerStoreError),
    #[error("money error: {0}")]
    Money(#[from] MoneyError),
    #[error("dice channel error: {0}")]
    DiceChannel(#[from] DiceChannelError),
}

impl SettlementError {
    #[must_use]
    pub fn is_chat_unreachable(&self) -> bool {
        matches!(
            self,
            Self::DiceChannel(DiceChannelError::ChatUnreachable(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetPayout {
    pub multiplier: u64,
    pub credit: Points,
    pub result: BetResult,
}

/// Pure payout rule: the stake times the bet type's multiplier for this outcome.
pub fn compute_payout(
    bet_type: BetType,
    amount: Points,
    outcome: &DrawOutcome,
) -> Result<BetPayout, MoneyError> {
    let multiplier = bet_type.payout_multiplier(outcome);
    Ok(BetPayout {
        multiplier,
        credit: amount.checked_mul(multiplier)?,
        result: if multiplier > 0 {
            BetResult::Win
        } else {
            BetResult::Loss
        },
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSummary {
    pub settled: usize,
    pub winners: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total_credit: Points,
}

#[derive(Debug)]
pub enum DrawTick {
    /// Nothing was open, so only a fresh issue was opened.
    Opened { next_issue: IssueId },
    /// The closed issue was drawn. `next_issue` is `None` when reopening failed.
    Drawn {
        draw: DrawResult,
        next_issue: Option<IssueId>,
    },
    /// Betting on `closed_issue` stays closed and its bets stay pending.
    Aborted {
        closed_issue: IssueId,
        error: SettlementError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BetSettlement {
    Committed { credit: Points, result: BetResult },
    AlreadySettled,
}

/// Closes issues, draws them, and pays out their bets.
#[derive(Clone)]
pub struct SettlementEngine {
    bets: Arc<dyn BetRepository>,
    draws: Arc<dyn DrawRepository>,
    issues: Arc<dyn IssueStateStore>,
    dice: Arc<dyn DiceChannel>,
    announcer: Arc<dyn DrawAnnouncer>,
    locks: Arc<LockRegistry>,
}

impl std::fmt::Debug for SettlementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementEngine").finish_non_exhaustive()
    }
}

impl SettlementEngine {
    #[must_use]
    pub fn new(
        stores: &LedgerStores,
        dice: Arc<dyn DiceChannel>,
        announcer: Arc<dyn DrawAnnouncer>,
        locks: Arc<LockRegistry>,
    ) -> Self {
        Self {
            bets: stores.bets.clone(),
            draws: stores.draws.clone(),
            issues: stores.issues.clone(),
            dice,
            announcer,
            locks,
        }
    }

    #[must_use]
    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Mints a token that sorts after `previous` (or the chat's latest draw) and opens betting on it.
    pub async fn open_issue(
        &self,
        chat_id: ChatId,
        previous: Option<&IssueId>,
        cycle_minutes: u32,
    ) -> Result<IssueId, SettlementError> {
        let latest_drawn = match previous {
            Some(_) => None,
            None => self
                .draws
                .list_recent_draws(
                    chat_id,
                    PageRequest {
                        limit: 1,
                        offset: 0,
                    },
                )
                .await?
                .into_iter()
                .next()
                .map(|d| d.issue_id),
        };
        let issue_id = IssueId::mint_after(previous.or(latest_drawn.as_ref()), Utc::now());
        self.issues.set_open_issue(chat_id, &issue_id).await?;
        info!(chat_id = %chat_id, issue_id = %issue_id, cycle_minutes, "issue opened");
        if let Err(err) = self
            .announcer
            .announce_issue_opened(chat_id, &issue_id, cycle_minutes)
            .await
        {
            warn!(chat_id = %chat_id, issue_id = %issue_id, error = %err, "issue announcement failed");
        }
        Ok(issue_id)
    }

    /// One scheduler tick up to reopening betting. Payout is left to [`Self::settle_issue`].
    ///
    /// `retry_issue` is a previously closed issue whose draw failed; it is drawn instead of
    /// closing the current token.
    pub async fn run_draw_tick(
        &self,
        chat_id: ChatId,
        retry_issue: Option<IssueId>,
        cycle_minutes: u32,
    ) -> Result<DrawTick, SettlementError> {
        let closed = match retry_issue {
            Some(issue_id) => Some(issue_id),
            None => self.issues.take_open_issue(chat_id).await?,
        };
        let Some(closed_issue) = closed else {
            let next_issue = self.open_issue(chat_id, None, cycle_minutes).await?;
            return Ok(DrawTick::Opened { next_issue });
        };

        let draw = match self.draw_issue(chat_id, &closed_issue).await {
            Ok(draw) => draw,
            Err(error) => {
                warn!(
                    chat_id = %chat_id,
                    issue_id = %closed_issue,
                    error = %error,
                    "draw aborted, bets stay pending"
                );
                return Ok(DrawTick::Aborted {
                    closed_issue,
                    error,
                });
            }
        };

        let next_issue = match self
            .open_issue(chat_id, Some(&closed_issue), cycle_minutes)
            .await
        {
            Ok(issue_id) => Some(issue_id),
            Err(err) => {
                warn!(chat_id = %chat_id, error = %err, "failed to open next issue");
                None
            }
        };
        Ok(DrawTick::Drawn { draw, next_issue })
    }

    async fn draw_issue(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
    ) -> Result<DrawResult, SettlementError> {
        if let Some(existing) = self.draws.get_draw(chat_id, issue_id).await? {
            return Ok(existing);
        }
        let faces = roll_draw(self.dice.as_ref(), chat_id).await?;
        let draw = DrawResult::new(chat_id, issue_id.clone(), faces, Utc::now());
        match self.draws.insert_draw(&draw).await {
            Ok(()) => {}
            Err(LedgerStoreError::DuplicateDraw { .. }) => {
                if let Some(existing) = self.draws.get_draw(chat_id, issue_id).await? {
                    return Ok(existing);
                }
            }
            Err(err) => return Err(err.into()),
        }
        info!(
            chat_id = %chat_id,
            issue_id = %issue_id,
            faces = ?draw.outcome.faces.values(),
            total = draw.outcome.total,
            parity = draw.outcome.parity.as_str(),
            size = draw.outcome.size.as_str(),
            triplet = draw.outcome.triplet,
            "draw recorded"
        );
        if let Err(err) = self.announcer.announce_draw(&draw).await {
            warn!(chat_id = %chat_id, issue_id = %issue_id, error = %err, "draw announcement failed");
        }
        Ok(draw)
    }

    /// Pays out every bet on `issue_id`. Settled bets are skipped, so reruns change nothing.
    pub async fn settle_issue(
        &self,
        chat_id: ChatId,
        issue_id: &IssueId,
        draw: &DrawResult,
    ) -> Result<SettlementSummary, SettlementError> {
        let bets = self.bets.list_bets_for_issue(chat_id, issue_id).await?;
        let mut summary = SettlementSummary::default();
        for bet in &bets {
            match self.settle_bet(bet, &draw.outcome).await {
                Ok(BetSettlement::Committed { credit, result }) => {
                    summary.settled += 1;
                    if result == BetResult::Win {
                        summary.winners += 1;
                    }
                    summary.total_credit = summary.total_credit.checked_add(credit)?;
                }
                Ok(BetSettlement::AlreadySettled) => summary.skipped += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        chat_id = %chat_id,
                        issue_id = %issue_id,
                        bet_id = %bet.bet_id.0,
                        user_id = %bet.user_id,
                        error = %err,
                        "bet settlement failed"
                    );
                }
            }
        }
        info!(
            chat_id = %chat_id,
            issue_id = %issue_id,
            settled = summary.settled,
            winners = summary.winners,
            skipped = summary.skipped,
            failed = summary.failed,
            total_credit = summary.total_credit.as_u64(),
            "issue settled"
        );
        Ok(summary)
    }

    async fn settle_bet(
        &self,
        bet: &Bet,
        outcome: &DrawOutcome,
    ) -> Result<BetSettlement, SettlementError> {
        let _guard = self.locks.acquire_user_lock(bet.user_id).await;
        if bet.is_settled() {
            return Ok(BetSettlement::AlreadySettled);
        }
        let payout = compute_payout(bet.bet_type, bet.amount, outcome)?;
        let commit = BetSettlementCommit {
            bet_id: bet.bet_id,
            user_id: bet.user_id,
            chat_id: bet.chat_id,
            credit: payout.credit,
            result: payout.result,
            settled_at: Utc::now(),
        };
        match self.bets.commit_bet_settlement(&commit).await? {
            SettlementCommitOutcome::Committed { .. } => Ok(BetSettlement::Committed {
                credit: payout.credit,
                result: payout.result,
            }),
            SettlementCommitOutcome::AlreadySettled => Ok(BetSettlement::AlreadySettled),
        }
    }
}
