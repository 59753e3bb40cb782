use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dice_domain::{Bet, BetType, ChatId, DrawResult, Points, UserAccount, UserId};
use ledger_store::{BetRepository, DrawRepository, LedgerStoreError, LedgerStores, PageRequest};
use ops_http::{CommandError, GameCommandPort, ScheduleView};
use platform_core::ErrorCode;

use crate::account_service::{AccountError, AccountService};
use crate::bet_placement::{BetPlacementError, BetPlacementService};
use crate::draw_scheduler::{DrawScheduler, ScheduleStatus, SchedulerError};

impl From<SchedulerError> for CommandError {
    fn from(err: SchedulerError) -> Self {
        CommandError::new(ErrorCode::ScheduleFailed, err.to_string())
    }
}

impl From<BetPlacementError> for CommandError {
    fn from(err: BetPlacementError) -> Self {
        let code = match &err {
            BetPlacementError::InvalidAmount => ErrorCode::RequestInvalid,
            BetPlacementError::DrawsDisabled(_) => ErrorCode::DrawsDisabled,
            BetPlacementError::NoOpenIssue(_) => ErrorCode::NoOpenIssue,
            BetPlacementError::AccountNotFound { .. } => ErrorCode::NotFound,
            BetPlacementError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            BetPlacementError::Ledger(_) => ErrorCode::InternalError,
        };
        CommandError::new(code, err.to_string())
    }
}

impl From<AccountError> for CommandError {
    fn from(err: AccountError) -> Self {
        let code = match &err {
            AccountError::AlreadyRegistered { .. } => ErrorCode::AlreadyExists,
            AccountError::NotFound { .. } => ErrorCode::NotFound,
            AccountError::AlreadySignedIn => ErrorCode::AlreadySignedIn,
            AccountError::PendingBets { .. } | AccountError::BalanceTooHigh { .. } => {
                ErrorCode::WelfareNotEligible
            }
            AccountError::Ledger(_) => ErrorCode::InternalError,
        };
        CommandError::new(code, err.to_string())
    }
}

fn ledger_failure(err: LedgerStoreError) -> CommandError {
    CommandError::new(ErrorCode::InternalError, err.to_string())
}

impl From<ScheduleStatus> for ScheduleView {
    fn from(status: ScheduleStatus) -> Self {
        Self {
            chat_id: status.chat_id,
            running: status.running,
            draw_cycle_minutes: status.draw_cycle_minutes,
            open_issue: status.open_issue,
        }
    }
}

/// Backs the ops surface with the scheduler, bet placement and accounts.
#[derive(Clone)]
pub struct GameService {
    scheduler: DrawScheduler,
    placement: BetPlacementService,
    accounts: AccountService,
    bets: Arc<dyn BetRepository>,
    draws: Arc<dyn DrawRepository>,
}

impl std::fmt::Debug for GameService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameService")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl GameService {
    #[must_use]
    pub fn new(
        stores: &LedgerStores,
        scheduler: DrawScheduler,
        placement: BetPlacementService,
        accounts: AccountService,
    ) -> Self {
        Self {
            scheduler,
            placement,
            accounts,
            bets: stores.bets.clone(),
            draws: stores.draws.clone(),
        }
    }
}

#[async_trait]
impl GameCommandPort for GameService {
    async fn start_schedule(
        &self,
        chat_id: ChatId,
        cycle_minutes: Option<u32>,
    ) -> Result<ScheduleView, CommandError> {
        if cycle_minutes == Some(0) {
            return Err(CommandError::new(
                ErrorCode::RequestInvalid,
                "cycle_minutes must be at least 1",
            ));
        }
        Ok(self.scheduler.start(chat_id, cycle_minutes).await?.into())
    }

    async fn stop_schedule(&self, chat_id: ChatId) -> Result<ScheduleView, CommandError> {
        Ok(self.scheduler.stop(chat_id).await?.into())
    }

    async fn place_bet(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        bet_type: BetType,
        amount: Points,
    ) -> Result<Bet, CommandError> {
        Ok(self
            .placement
            .place_bet(user_id, chat_id, bet_type, amount)
            .await?)
    }

    async fn register(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        username: String,
    ) -> Result<UserAccount, CommandError> {
        Ok(self.accounts.register(user_id, chat_id, username).await?)
    }

    async fn sign_in(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<UserAccount, CommandError> {
        Ok(self.accounts.sign_in(user_id, chat_id, Utc::now()).await?)
    }

    async fn claim_welfare(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<UserAccount, CommandError> {
        Ok(self.accounts.claim_welfare(user_id, chat_id).await?)
    }

    async fn account(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<UserAccount, CommandError> {
        Ok(self.accounts.account(user_id, chat_id).await?)
    }

    async fn recent_draws(
        &self,
        chat_id: ChatId,
        limit: usize,
    ) -> Result<Vec<DrawResult>, CommandError> {
        self.draws
            .list_recent_draws(chat_id, PageRequest { limit, offset: 0 })
            .await
            .map_err(ledger_failure)
    }

    async fn user_bets(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Bet>, CommandError> {
        self.bets
            .list_user_bets(user_id, chat_id, PageRequest { limit, offset: 0 })
            .await
            .map_err(ledger_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::account_service::RewardPolicy;
    use crate::draw_scheduler::DrawSchedulerConfig;
    use dice_domain::SettleStatus;
    use settlement::{LockRegistry, NoopDrawAnnouncer, ScriptedDiceChannel, SettlementEngine};

    const CHAT: ChatId = ChatId(-77);
    const DAVE: UserId = UserId(31);

    fn game(stores: &LedgerStores, dice: ScriptedDiceChannel) -> GameService {
        let locks = Arc::new(LockRegistry::new());
        let engine = SettlementEngine::new(
            stores,
            Arc::new(dice),
            Arc::new(NoopDrawAnnouncer),
            locks.clone(),
        );
        let scheduler = DrawScheduler::new(stores, engine, DrawSchedulerConfig::default());
        GameService::new(
            stores,
            scheduler,
            BetPlacementService::new(stores, locks.clone()),
            AccountService::new(stores, locks, RewardPolicy::default()),
        )
    }

    #[tokio::test]
    async fn betting_before_start_reports_draws_disabled() {
        let stores = LedgerStores::in_memory();
        let game = game(&stores, ScriptedDiceChannel::repeating(1));
        game.register(CHAT, DAVE, "dave".to_string())
            .await
            .expect("register");

        let err = game
            .place_bet(CHAT, DAVE, BetType::Big, Points(10))
            .await
            .expect_err("disabled");
        assert_eq!(err.code, ErrorCode::DrawsDisabled);
    }

    #[tokio::test]
    async fn account_errors_map_to_codes() {
        let stores = LedgerStores::in_memory();
        let game = game(&stores, ScriptedDiceChannel::repeating(1));

        let missing = game.account(CHAT, DAVE).await.expect_err("missing");
        assert_eq!(missing.code, ErrorCode::NotFound);

        game.register(CHAT, DAVE, "dave".to_string())
            .await
            .expect("register");
        let duplicate = game
            .register(CHAT, DAVE, "dave".to_string())
            .await
            .expect_err("duplicate");
        assert_eq!(duplicate.code, ErrorCode::AlreadyExists);

        let welfare = game.claim_welfare(CHAT, DAVE).await.expect_err("rich");
        assert_eq!(welfare.code, ErrorCode::WelfareNotEligible);

        game.sign_in(CHAT, DAVE).await.expect("sign in");
        let again = game.sign_in(CHAT, DAVE).await.expect_err("twice");
        assert_eq!(again.code, ErrorCode::AlreadySignedIn);
    }

    #[tokio::test]
    async fn zero_cycle_is_rejected() {
        let stores = LedgerStores::in_memory();
        let game = game(&stores, ScriptedDiceChannel::repeating(1));
        let err = game
            .start_schedule(CHAT, Some(0))
            .await
            .expect_err("zero");
        assert_eq!(err.code, ErrorCode::RequestInvalid);
    }

    #[tokio::test(start_paused = true)]
    async fn full_round_pays_out_and_shows_in_history() {
        let stores = LedgerStores::in_memory();
        let dice = ScriptedDiceChannel::new();
        dice.push_faces([4, 5, 6]);
        let game = game(&stores, dice);

        game.register(CHAT, DAVE, "dave".to_string())
            .await
            .expect("register");
        let view = game.start_schedule(CHAT, Some(1)).await.expect("start");
        assert!(view.running);

        let winning = game
            .place_bet(CHAT, DAVE, BetType::Big, Points(100))
            .await
            .expect("big");
        game.place_bet(CHAT, DAVE, BetType::Double, Points(20))
            .await
            .expect("double");
        assert_eq!(
            game.account(CHAT, DAVE).await.expect("account").balance,
            Points(880)
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        let stopped = game.stop_schedule(CHAT).await.expect("stop");
        assert!(!stopped.running);

        let draws = game.recent_draws(CHAT, 10).await.expect("draws");
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].outcome.total, 15);

        assert_eq!(
            game.account(CHAT, DAVE).await.expect("account").balance,
            Points(1080)
        );
        let history = game.user_bets(CHAT, DAVE, 10).await.expect("history");
        assert_eq!(history.len(), 2);
        assert!(
            history
                .iter()
                .all(|bet| bet.settle_status == SettleStatus::Settled)
        );
        let paid = history
            .iter()
            .find(|bet| bet.bet_id == winning.bet_id)
            .expect("winning bet");
        assert_eq!(paid.winnings().expect("winnings"), Points(200));
    }
}
