use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dice_domain::{ChatDrawSession, ChatId, DEFAULT_DRAW_CYCLE_MINUTES, IssueId};
use ledger_store::{ChatSessionRepository, IssueStateStore, LedgerStoreError, LedgerStores};
use platform_core::SchedulerSection;
use serde::Serialize;
use settlement::{DrawTick, LockRegistry, SettlementEngine, SettlementError};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerStoreError),
    #[error("settlement error: {0}")]
    Settlement(#[from] SettlementError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawSchedulerConfig {
    pub default_cycle_minutes: u32,
    /// Wall-clock length of one cycle minute. Tests shrink or pause it.
    pub cycle_unit: Duration,
    pub max_draw_retries: u32,
}

impl Default for DrawSchedulerConfig {
    fn default() -> Self {
        Self {
            default_cycle_minutes: DEFAULT_DRAW_CYCLE_MINUTES,
            cycle_unit: Duration::from_secs(60),
            max_draw_retries: 3,
        }
    }
}

impl From<&SchedulerSection> for DrawSchedulerConfig {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            default_cycle_minutes: section.default_cycle_minutes.max(1),
            cycle_unit: Duration::from_secs(section.cycle_unit_secs.max(1)),
            max_draw_retries: section.max_draw_retries,
        }
    }
}

impl DrawSchedulerConfig {
    fn period(&self, cycle_minutes: u32) -> Duration {
        self.cycle_unit.saturating_mul(cycle_minutes.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleStatus {
    pub chat_id: ChatId,
    pub running: bool,
    pub draw_cycle_minutes: u32,
    pub open_issue: Option<IssueId>,
}

struct ChatTask {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    cycle_minutes: u32,
}

struct SchedulerInner {
    engine: SettlementEngine,
    sessions: Arc<dyn ChatSessionRepository>,
    issues: Arc<dyn IssueStateStore>,
    locks: Arc<LockRegistry>,
    config: DrawSchedulerConfig,
    tasks: Mutex<HashMap<ChatId, ChatTask>>,
}

/// Owns one recurring draw task per running chat.
#[derive(Clone)]
pub struct DrawScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for DrawScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrawScheduler")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl DrawScheduler {
    #[must_use]
    pub fn new(
        stores: &LedgerStores,
        engine: SettlementEngine,
        config: DrawSchedulerConfig,
    ) -> Self {
        let locks = engine.locks().clone();
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                sessions: stores.sessions.clone(),
                issues: stores.issues.clone(),
                locks,
                config,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<ChatId, ChatTask>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn shutdown_task(chat_id: ChatId, task: ChatTask) {
        let _ = task.shutdown_tx.send(());
        if let Err(err) = task.handle.await {
            warn!(chat_id = %chat_id, error = %err, "draw task ended abnormally");
        }
    }

    /// Starts (or restarts) the chat's draw task, keeping any open issue from a previous run.
    pub async fn start(
        &self,
        chat_id: ChatId,
        cycle_minutes: Option<u32>,
    ) -> Result<ScheduleStatus, SchedulerError> {
        let _guard = self.inner.locks.acquire_chat_lock(chat_id).await;

        let previous = self.tasks().remove(&chat_id);
        if let Some(task) = previous {
            info!(chat_id = %chat_id, "replacing running draw task");
            Self::shutdown_task(chat_id, task).await;
        }

        let cycle_minutes = match cycle_minutes {
            Some(minutes) => minutes.max(1),
            None => self
                .inner
                .sessions
                .get_session(chat_id)
                .await?
                .map_or(self.inner.config.default_cycle_minutes, |s| {
                    s.draw_cycle_minutes
                }),
        };

        let open_issue = match self.inner.issues.get_open_issue(chat_id).await? {
            Some(issue_id) => {
                info!(chat_id = %chat_id, issue_id = %issue_id, "resuming open issue");
                issue_id
            }
            None => {
                self.inner
                    .engine
                    .open_issue(chat_id, None, cycle_minutes)
                    .await?
            }
        };

        self.inner
            .sessions
            .upsert_session(&ChatDrawSession::enabled(chat_id, cycle_minutes, Utc::now()))
            .await?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = ChatDrawLoop {
            chat_id,
            cycle_minutes,
            period: self.inner.config.period(cycle_minutes),
            max_draw_retries: self.inner.config.max_draw_retries,
            engine: self.inner.engine.clone(),
            sessions: self.inner.sessions.clone(),
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));
        self.tasks().insert(
            chat_id,
            ChatTask {
                shutdown_tx,
                handle,
                cycle_minutes,
            },
        );
        info!(chat_id = %chat_id, cycle_minutes, issue_id = %open_issue, "draw schedule started");

        Ok(ScheduleStatus {
            chat_id,
            running: true,
            draw_cycle_minutes: cycle_minutes,
            open_issue: Some(open_issue),
        })
    }

    /// Disables draws for the chat and cancels its task. The open issue is kept.
    pub async fn stop(&self, chat_id: ChatId) -> Result<ScheduleStatus, SchedulerError> {
        let _guard = self.inner.locks.acquire_chat_lock(chat_id).await;

        self.inner
            .sessions
            .set_session_enabled(chat_id, false, Utc::now())
            .await?;
        let task = self.tasks().remove(&chat_id);
        let cycle_minutes = match task {
            Some(task) => {
                let cycle_minutes = task.cycle_minutes;
                Self::shutdown_task(chat_id, task).await;
                info!(chat_id = %chat_id, "draw schedule stopped");
                cycle_minutes
            }
            None => {
                info!(chat_id = %chat_id, "no running draw task");
                self.inner
                    .sessions
                    .get_session(chat_id)
                    .await?
                    .map_or(self.inner.config.default_cycle_minutes, |s| {
                        s.draw_cycle_minutes
                    })
            }
        };

        Ok(ScheduleStatus {
            chat_id,
            running: false,
            draw_cycle_minutes: cycle_minutes,
            open_issue: self.inner.issues.get_open_issue(chat_id).await?,
        })
    }

    /// Restarts every chat whose session is still enabled. Returns how many were started.
    pub async fn resume_enabled_sessions(&self) -> Result<usize, SchedulerError> {
        let sessions = self.inner.sessions.list_enabled_sessions().await?;
        let mut resumed = 0;
        for session in sessions {
            match self
                .start(session.chat_id, Some(session.draw_cycle_minutes))
                .await
            {
                Ok(_) => resumed += 1,
                Err(err) => {
                    warn!(chat_id = %session.chat_id, error = %err, "failed to resume draw schedule");
                }
            }
        }
        info!(resumed, "draw schedules resumed");
        Ok(resumed)
    }

    #[must_use]
    pub fn running_chats(&self) -> Vec<ChatId> {
        let mut chats: Vec<ChatId> = self
            .tasks()
            .iter()
            .filter(|(_, task)| !task.handle.is_finished())
            .map(|(chat_id, _)| *chat_id)
            .collect();
        chats.sort_by_key(|chat_id| chat_id.0);
        chats
    }

    /// Cancels every task without touching sessions, so they resume on next boot.
    pub async fn shutdown(&self) {
        let tasks: Vec<(ChatId, ChatTask)> = self.tasks().drain().collect();
        for (chat_id, task) in tasks {
            Self::shutdown_task(chat_id, task).await;
        }
    }
}

async fn join_payout(chat_id: ChatId, payout: JoinHandle<()>) {
    if let Err(err) = payout.await {
        warn!(chat_id = %chat_id, error = %err, "payout task ended abnormally");
    }
}

struct PendingRetry {
    issue_id: IssueId,
    attempts: u32,
}

struct ChatDrawLoop {
    chat_id: ChatId,
    cycle_minutes: u32,
    period: Duration,
    max_draw_retries: u32,
    engine: SettlementEngine,
    sessions: Arc<dyn ChatSessionRepository>,
}

impl ChatDrawLoop {
    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry: Option<PendingRetry> = None;
        let mut last_payout: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!(chat_id = %self.chat_id, "draw task shutdown");
                    break;
                }
                _ = ticker.tick() => {
                    let retry_issue = retry.as_ref().map(|r| r.issue_id.clone());
                    match self
                        .engine
                        .run_draw_tick(self.chat_id, retry_issue, self.cycle_minutes)
                        .await
                    {
                        Ok(DrawTick::Opened { next_issue }) => {
                            info!(chat_id = %self.chat_id, issue_id = %next_issue, "tick found no open issue");
                        }
                        Ok(DrawTick::Drawn { draw, next_issue }) => {
                            retry = None;
                            if next_issue.is_none() {
                                warn!(chat_id = %self.chat_id, "betting stays closed until the next tick");
                            }
                            last_payout = Some(self.spawn_payout(draw, last_payout.take()));
                        }
                        Ok(DrawTick::Aborted { closed_issue, error }) => {
                            if error.is_chat_unreachable() {
                                self.disable_unreachable_chat(&error).await;
                                break;
                            }
                            retry = self.next_retry(retry.take(), closed_issue).await;
                        }
                        Err(err) => {
                            warn!(chat_id = %self.chat_id, error = %err, "draw tick failed");
                        }
                    }
                }
            }
        }

        if let Some(payout) = last_payout {
            join_payout(self.chat_id, payout).await;
        }
    }

    /// Payouts of one chat run in issue order: each waits for the one before it.
    fn spawn_payout(
        &self,
        draw: dice_domain::DrawResult,
        previous: Option<JoinHandle<()>>,
    ) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let chat_id = self.chat_id;
        tokio::spawn(async move {
            if let Some(previous) = previous {
                join_payout(chat_id, previous).await;
            }
            if let Err(err) = engine.settle_issue(chat_id, &draw.issue_id, &draw).await {
                warn!(chat_id = %chat_id, issue_id = %draw.issue_id, error = %err, "payout failed");
            }
        })
    }

    async fn next_retry(
        &self,
        previous: Option<PendingRetry>,
        closed_issue: IssueId,
    ) -> Option<PendingRetry> {
        let attempts = previous
            .filter(|r| r.issue_id == closed_issue)
            .map_or(1, |r| r.attempts + 1);
        if attempts <= self.max_draw_retries {
            info!(
                chat_id = %self.chat_id,
                issue_id = %closed_issue,
                attempts,
                "draw will be retried next tick"
            );
            return Some(PendingRetry {
                issue_id: closed_issue,
                attempts,
            });
        }
        error!(
            chat_id = %self.chat_id,
            issue_id = %closed_issue,
            attempts,
            "giving up on draw, bets stay pending"
        );
        if let Err(err) = self
            .engine
            .open_issue(self.chat_id, Some(&closed_issue), self.cycle_minutes)
            .await
        {
            warn!(chat_id = %self.chat_id, error = %err, "failed to open issue after giving up");
        }
        None
    }

    async fn disable_unreachable_chat(&self, error: &SettlementError) {
        warn!(chat_id = %self.chat_id, error = %error, "chat unreachable, disabling draws");
        if let Err(err) = self
            .sessions
            .set_session_enabled(self.chat_id, false, Utc::now())
            .await
        {
            warn!(chat_id = %self.chat_id, error = %err, "failed to disable session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dice_domain::{Bet, BetType, Points, SettleStatus, UserAccount, UserId};
    use settlement::{DiceChannelError, NoopDrawAnnouncer, ScriptedDiceChannel};

    const CHAT: ChatId = ChatId(-1001);

    fn scheduler(
        stores: &LedgerStores,
        dice: ScriptedDiceChannel,
        max_draw_retries: u32,
    ) -> DrawScheduler {
        let engine = SettlementEngine::new(
            stores,
            Arc::new(dice),
            Arc::new(NoopDrawAnnouncer),
            Arc::new(LockRegistry::new()),
        );
        DrawScheduler::new(
            stores,
            engine,
            DrawSchedulerConfig {
                default_cycle_minutes: 1,
                cycle_unit: Duration::from_secs(60),
                max_draw_retries,
            },
        )
    }

    async fn recent_draw_count(stores: &LedgerStores) -> usize {
        stores
            .draws
            .list_recent_draws(CHAT, ledger_store::PageRequest::default())
            .await
            .expect("draws")
            .len()
    }

    #[tokio::test]
    async fn payout_runs_after_a_previous_payout_panicked() {
        let stores = LedgerStores::in_memory();
        let issue = IssueId::parse("20240101120000").expect("issue");
        let user = UserId(9);
        stores
            .accounts
            .insert_account(&UserAccount {
                user_id: user,
                chat_id: CHAT,
                username: "erin".to_string(),
                balance: Points(0),
                last_sign_in_at: None,
                created_at: Utc::now(),
            })
            .await
            .expect("account");
        let bet = Bet::pending(user, CHAT, issue.clone(), BetType::Small, Points(10), Utc::now());
        stores.bets.insert_bet(&bet).await.expect("bet");

        let worker = ChatDrawLoop {
            chat_id: CHAT,
            cycle_minutes: 1,
            period: Duration::from_secs(60),
            max_draw_retries: 3,
            engine: SettlementEngine::new(
                &stores,
                Arc::new(ScriptedDiceChannel::repeating(1)),
                Arc::new(NoopDrawAnnouncer),
                Arc::new(LockRegistry::new()),
            ),
            sessions: stores.sessions.clone(),
        };
        let crashed = tokio::spawn(async { panic!("payout crashed") });
        let draw = dice_domain::DrawResult::new(
            CHAT,
            issue,
            dice_domain::DrawFaces::from_values(1, 2, 3).expect("faces"),
            Utc::now(),
        );
        worker
            .spawn_payout(draw, Some(crashed))
            .await
            .expect("payout task");

        let settled = stores
            .bets
            .get_bet(bet.bet_id)
            .await
            .expect("bet")
            .expect("exists");
        assert_eq!(settled.settle_status, SettleStatus::Settled);
        let account = stores
            .accounts
            .get_account(user, CHAT)
            .await
            .expect("get")
            .expect("account");
        assert_eq!(account.balance, Points(20));
    }

    async fn session_enabled(stores: &LedgerStores) -> bool {
        stores
            .sessions
            .get_session(CHAT)
            .await
            .expect("session")
            .is_some_and(|s| s.enabled)
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_leaves_one_task() {
        let stores = LedgerStores::in_memory();
        let dice = ScriptedDiceChannel::repeating(1);
        let scheduler = scheduler(&stores, dice.clone(), 3);

        let first = scheduler.start(CHAT, Some(1)).await.expect("start");
        let second = scheduler.start(CHAT, Some(1)).await.expect("restart");
        assert_eq!(first.open_issue, second.open_issue);
        assert_eq!(scheduler.running_chats(), vec![CHAT]);

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(recent_draw_count(&stores).await, 2);
        assert_eq!(dice.roll_count(), 6);

        scheduler.shutdown().await;
        assert!(!scheduler.running_chats().contains(&CHAT));
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_minutes_scale_the_period() {
        let stores = LedgerStores::in_memory();
        let dice = ScriptedDiceChannel::repeating(2);
        let scheduler = scheduler(&stores, dice.clone(), 3);

        scheduler.start(CHAT, Some(3)).await.expect("start");
        tokio::time::sleep(Duration::from_secs(170)).await;
        assert_eq!(dice.roll_count(), 0);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(dice.roll_count(), 3);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_ticks_and_keeps_issue() {
        let stores = LedgerStores::in_memory();
        let dice = ScriptedDiceChannel::repeating(4);
        let scheduler = scheduler(&stores, dice.clone(), 3);

        let started = scheduler.start(CHAT, None).await.expect("start");
        let stopped = scheduler.stop(CHAT).await.expect("stop");
        assert!(!stopped.running);
        assert_eq!(stopped.open_issue, started.open_issue);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(dice.roll_count(), 0);
        assert!(!session_enabled(&stores).await);
        assert!(!scheduler.running_chats().contains(&CHAT));

        let again = scheduler.stop(CHAT).await.expect("second stop");
        assert!(!again.running);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_settles_bets_on_persisted_issue() {
        let stores = LedgerStores::in_memory();
        let issue = IssueId::parse("20240101120000").expect("issue");
        let user = UserId(7);
        stores
            .sessions
            .upsert_session(&ChatDrawSession::enabled(CHAT, 1, Utc::now()))
            .await
            .expect("session");
        stores
            .issues
            .set_open_issue(CHAT, &issue)
            .await
            .expect("issue");
        stores
            .accounts
            .insert_account(&UserAccount {
                user_id: user,
                chat_id: CHAT,
                username: "carol".to_string(),
                balance: Points(1000),
                last_sign_in_at: None,
                created_at: Utc::now(),
            })
            .await
            .expect("account");
        let bet = Bet::pending(user, CHAT, issue.clone(), BetType::Triplet, Points(50), Utc::now());
        stores.bets.insert_bet(&bet).await.expect("bet");

        let scheduler = scheduler(&stores, ScriptedDiceChannel::repeating(3), 3);
        assert_eq!(scheduler.resume_enabled_sessions().await.expect("resume"), 1);

        tokio::time::sleep(Duration::from_secs(65)).await;
        let draw = stores
            .draws
            .get_draw(CHAT, &issue)
            .await
            .expect("draw")
            .expect("drawn");
        assert!(draw.outcome.triplet);
        let settled = stores
            .bets
            .get_bet(bet.bet_id)
            .await
            .expect("bet")
            .expect("exists");
        assert_eq!(settled.settle_status, SettleStatus::Settled);
        let account = stores
            .accounts
            .get_account(user, CHAT)
            .await
            .expect("account")
            .expect("exists");
        assert_eq!(account.balance, Points(1500));

        let reopened = stores
            .issues
            .get_open_issue(CHAT)
            .await
            .expect("issue")
            .expect("reopened");
        assert!(reopened > issue);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_roll_is_retried_for_the_same_issue() {
        let stores = LedgerStores::in_memory();
        let dice = ScriptedDiceChannel::repeating(2);
        dice.push_failure(DiceChannelError::Transport("timeout".to_string()));
        let scheduler = scheduler(&stores, dice.clone(), 3);

        let started = scheduler.start(CHAT, Some(1)).await.expect("start");
        let closed = started.open_issue.expect("issue");

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(recent_draw_count(&stores).await, 0);
        assert!(
            stores
                .issues
                .get_open_issue(CHAT)
                .await
                .expect("issue")
                .is_none()
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(
            stores
                .draws
                .get_draw(CHAT, &closed)
                .await
                .expect("draw")
                .is_some()
        );
        assert_eq!(dice.roll_count(), 4);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_open_a_fresh_issue() {
        let stores = LedgerStores::in_memory();
        let scheduler = scheduler(&stores, ScriptedDiceChannel::new(), 1);

        let started = scheduler.start(CHAT, Some(1)).await.expect("start");
        let stranded = started.open_issue.expect("issue");

        tokio::time::sleep(Duration::from_secs(150)).await;
        let fresh = stores
            .issues
            .get_open_issue(CHAT)
            .await
            .expect("issue")
            .expect("reopened");
        assert!(fresh > stranded);
        assert_eq!(recent_draw_count(&stores).await, 0);
        assert!(scheduler.running_chats().contains(&CHAT));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_chat_disables_session_and_ends_task() {
        let stores = LedgerStores::in_memory();
        let dice = ScriptedDiceChannel::repeating(5);
        dice.push_failure(DiceChannelError::ChatUnreachable(CHAT));
        let scheduler = scheduler(&stores, dice.clone(), 3);

        scheduler.start(CHAT, Some(1)).await.expect("start");
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert!(!session_enabled(&stores).await);
        assert!(!scheduler.running_chats().contains(&CHAT));
        assert_eq!(dice.roll_count(), 1);
    }
}
