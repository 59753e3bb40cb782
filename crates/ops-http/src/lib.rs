use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use dice_domain::{
    Bet, BetCommand, BetType, ChatId, DrawResult, IssueId, Points, UserAccount, UserId,
};
use platform_core::{ErrorCode, ResponseEnvelope};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const MAX_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

impl CommandError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleView {
    pub chat_id: ChatId,
    pub running: bool,
    pub draw_cycle_minutes: u32,
    pub open_issue: Option<IssueId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetHistoryEntry {
    #[serde(flatten)]
    pub bet: Bet,
    pub win_amount: Points,
}

/// Commands and queries the HTTP surface forwards to the game.
#[async_trait]
pub trait GameCommandPort: Send + Sync {
    async fn start_schedule(
        &self,
        chat_id: ChatId,
        cycle_minutes: Option<u32>,
    ) -> Result<ScheduleView, CommandError>;

    async fn stop_schedule(&self, chat_id: ChatId) -> Result<ScheduleView, CommandError>;

    async fn place_bet(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        bet_type: BetType,
        amount: Points,
    ) -> Result<Bet, CommandError>;

    async fn register(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        username: String,
    ) -> Result<UserAccount, CommandError>;

    async fn sign_in(&self, chat_id: ChatId, user_id: UserId)
    -> Result<UserAccount, CommandError>;

    async fn claim_welfare(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<UserAccount, CommandError>;

    async fn account(&self, chat_id: ChatId, user_id: UserId)
    -> Result<UserAccount, CommandError>;

    async fn recent_draws(
        &self,
        chat_id: ChatId,
        limit: usize,
    ) -> Result<Vec<DrawResult>, CommandError>;

    async fn user_bets(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Bet>, CommandError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartScheduleRequest {
    pub cycle_minutes: Option<u32>,
}

/// Either a structured bet or a raw chat command such as `#big 20`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceBetRequest {
    pub user_id: i64,
    pub bet_type: Option<String>,
    pub amount: Option<u64>,
    pub command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

impl HistoryQuery {
    fn resolved_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

type ApiResponse<T> = (StatusCode, Json<ResponseEnvelope<T>>);

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::RequestInvalid => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyExists | ErrorCode::AlreadySignedIn => StatusCode::CONFLICT,
        ErrorCode::DrawsDisabled
        | ErrorCode::NoOpenIssue
        | ErrorCode::InsufficientFunds
        | ErrorCode::WelfareNotEligible => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::ScheduleFailed | ErrorCode::InternalError => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn respond<T>(route: &'static str, result: Result<T, CommandError>) -> ApiResponse<T> {
    match result {
        Ok(data) => (StatusCode::OK, Json(ResponseEnvelope::ok(data))),
        Err(err) => {
            warn!(route, code = err.code.as_str(), error = %err.message, "command rejected");
            (
                status_for(err.code),
                Json(ResponseEnvelope::err(err.code, err.message)),
            )
        }
    }
}

#[derive(Clone)]
pub struct OpsState {
    pub game: Arc<dyn GameCommandPort>,
}

impl std::fmt::Debug for OpsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsState").finish_non_exhaustive()
    }
}

pub fn build_router_with_state(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chats/{chat_id}/schedule/start", post(start_schedule))
        .route("/chats/{chat_id}/schedule/stop", post(stop_schedule))
        .route("/chats/{chat_id}/bets", post(place_bet))
        .route("/chats/{chat_id}/draws", get(recent_draws))
        .route("/chats/{chat_id}/accounts", post(register))
        .route("/chats/{chat_id}/accounts/{user_id}", get(account))
        .route("/chats/{chat_id}/accounts/{user_id}/sign-in", post(sign_in))
        .route(
            "/chats/{chat_id}/accounts/{user_id}/welfare",
            post(claim_welfare),
        )
        .route("/chats/{chat_id}/accounts/{user_id}/bets", get(user_bets))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    info!(route = "/health", "ops http request");
    Json(HealthResponse {
        ok: true,
        service: "ops-http",
    })
}

async fn start_schedule(
    State(state): State<OpsState>,
    Path(chat_id): Path<i64>,
    body: Bytes,
) -> ApiResponse<ScheduleView> {
    // The body is optional; an empty request uses the configured default cycle.
    let request = if body.is_empty() {
        StartScheduleRequest::default()
    } else {
        match serde_json::from_slice::<StartScheduleRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return respond(
                    "schedule/start",
                    Err(CommandError::new(ErrorCode::RequestInvalid, err.to_string())),
                );
            }
        }
    };
    let cycle_minutes = request.cycle_minutes;
    info!(
        route = "/chats/:chat_id/schedule/start",
        chat_id,
        cycle_minutes = ?cycle_minutes,
        "ops http request"
    );
    respond(
        "schedule/start",
        state
            .game
            .start_schedule(ChatId(chat_id), cycle_minutes)
            .await,
    )
}

async fn stop_schedule(
    State(state): State<OpsState>,
    Path(chat_id): Path<i64>,
) -> ApiResponse<ScheduleView> {
    info!(route = "/chats/:chat_id/schedule/stop", chat_id, "ops http request");
    respond(
        "schedule/stop",
        state.game.stop_schedule(ChatId(chat_id)).await,
    )
}

fn resolve_bet(body: &PlaceBetRequest) -> Result<BetCommand, CommandError> {
    if let Some(text) = body.command.as_deref() {
        return match BetCommand::parse(text) {
            Ok(Some(command)) => Ok(command),
            Ok(None) => Err(CommandError::new(
                ErrorCode::RequestInvalid,
                format!("not a bet command: {text}"),
            )),
            Err(err) => Err(CommandError::new(ErrorCode::RequestInvalid, err.to_string())),
        };
    }
    let (Some(raw_type), Some(amount)) = (body.bet_type.as_deref(), body.amount) else {
        return Err(CommandError::new(
            ErrorCode::RequestInvalid,
            "either command or bet_type and amount are required",
        ));
    };
    let bet_type = raw_type
        .parse::<BetType>()
        .map_err(|err| CommandError::new(ErrorCode::RequestInvalid, err.to_string()))?;
    if amount == 0 {
        return Err(CommandError::new(
            ErrorCode::RequestInvalid,
            "amount must be positive",
        ));
    }
    Ok(BetCommand {
        bet_type,
        amount: Points(amount),
    })
}

async fn place_bet(
    State(state): State<OpsState>,
    Path(chat_id): Path<i64>,
    Json(body): Json<PlaceBetRequest>,
) -> ApiResponse<Bet> {
    info!(
        route = "/chats/:chat_id/bets",
        chat_id,
        user_id = body.user_id,
        "ops http request"
    );
    let result = match resolve_bet(&body) {
        Ok(command) => {
            state
                .game
                .place_bet(
                    ChatId(chat_id),
                    UserId(body.user_id),
                    command.bet_type,
                    command.amount,
                )
                .await
        }
        Err(err) => Err(err),
    };
    respond("bets", result)
}

async fn register(
    State(state): State<OpsState>,
    Path(chat_id): Path<i64>,
    Json(body): Json<RegisterRequest>,
) -> ApiResponse<UserAccount> {
    info!(
        route = "/chats/:chat_id/accounts",
        chat_id,
        user_id = body.user_id,
        "ops http request"
    );
    respond(
        "accounts",
        state
            .game
            .register(ChatId(chat_id), UserId(body.user_id), body.username)
            .await,
    )
}

async fn account(
    State(state): State<OpsState>,
    Path((chat_id, user_id)): Path<(i64, i64)>,
) -> ApiResponse<UserAccount> {
    info!(
        route = "/chats/:chat_id/accounts/:user_id",
        chat_id, user_id, "ops http request"
    );
    respond(
        "accounts/get",
        state.game.account(ChatId(chat_id), UserId(user_id)).await,
    )
}

async fn sign_in(
    State(state): State<OpsState>,
    Path((chat_id, user_id)): Path<(i64, i64)>,
) -> ApiResponse<UserAccount> {
    info!(
        route = "/chats/:chat_id/accounts/:user_id/sign-in",
        chat_id, user_id, "ops http request"
    );
    respond(
        "accounts/sign-in",
        state.game.sign_in(ChatId(chat_id), UserId(user_id)).await,
    )
}

async fn claim_welfare(
    State(state): State<OpsState>,
    Path((chat_id, user_id)): Path<(i64, i64)>,
) -> ApiResponse<UserAccount> {
    info!(
        route = "/chats/:chat_id/accounts/:user_id/welfare",
        chat_id, user_id, "ops http request"
    );
    respond(
        "accounts/welfare",
        state
            .game
            .claim_welfare(ChatId(chat_id), UserId(user_id))
            .await,
    )
}

async fn recent_draws(
    State(state): State<OpsState>,
    Path(chat_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> ApiResponse<Vec<DrawResult>> {
    let limit = query.resolved_limit();
    info!(route = "/chats/:chat_id/draws", chat_id, limit, "ops http request");
    respond(
        "draws",
        state.game.recent_draws(ChatId(chat_id), limit).await,
    )
}

async fn user_bets(
    State(state): State<OpsState>,
    Path((chat_id, user_id)): Path<(i64, i64)>,
    Query(query): Query<HistoryQuery>,
) -> ApiResponse<Vec<BetHistoryEntry>> {
    let limit = query.resolved_limit();
    info!(
        route = "/chats/:chat_id/accounts/:user_id/bets",
        chat_id, user_id, limit, "ops http request"
    );
    let result = state
        .game
        .user_bets(ChatId(chat_id), UserId(user_id), limit)
        .await
        .and_then(|bets| {
            bets.into_iter()
                .map(|bet| {
                    let win_amount = bet
                        .winnings()
                        .map_err(|e| CommandError::new(ErrorCode::InternalError, e.to_string()))?;
                    Ok(BetHistoryEntry { bet, win_amount })
                })
                .collect::<Result<Vec<_>, CommandError>>()
        });
    respond("bets/history", result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::Utc;
    use dice_domain::{BetResult, DrawFaces, SettleStatus};
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakeGame {
        bets: Mutex<Vec<(ChatId, UserId, BetType, Points)>>,
        started: Mutex<Vec<(ChatId, Option<u32>)>>,
        history: Vec<Bet>,
    }

    fn account_for(chat_id: ChatId, user_id: UserId) -> UserAccount {
        UserAccount {
            user_id,
            chat_id,
            username: "alice".to_string(),
            balance: Points(1000),
            last_sign_in_at: None,
            created_at: Utc::now(),
        }
    }

    #[async_trait]
    impl GameCommandPort for FakeGame {
        async fn start_schedule(
            &self,
            chat_id: ChatId,
            cycle_minutes: Option<u32>,
        ) -> Result<ScheduleView, CommandError> {
            self.started
                .lock()
                .map_err(|_| CommandError::new(ErrorCode::InternalError, "lock"))?
                .push((chat_id, cycle_minutes));
            Ok(ScheduleView {
                chat_id,
                running: true,
                draw_cycle_minutes: cycle_minutes.unwrap_or(1),
                open_issue: Some(IssueId::parse("20240101120000").expect("issue")),
            })
        }

        async fn stop_schedule(&self, chat_id: ChatId) -> Result<ScheduleView, CommandError> {
            Ok(ScheduleView {
                chat_id,
                running: false,
                draw_cycle_minutes: 1,
                open_issue: None,
            })
        }

        async fn place_bet(
            &self,
            chat_id: ChatId,
            user_id: UserId,
            bet_type: BetType,
            amount: Points,
        ) -> Result<Bet, CommandError> {
            if amount > Points(1000) {
                return Err(CommandError::new(
                    ErrorCode::InsufficientFunds,
                    "balance 1000 cannot cover the stake",
                ));
            }
            self.bets
                .lock()
                .map_err(|_| CommandError::new(ErrorCode::InternalError, "lock"))?
                .push((chat_id, user_id, bet_type, amount));
            Ok(Bet::pending(
                user_id,
                chat_id,
                IssueId::parse("20240101120000").expect("issue"),
                bet_type,
                amount,
                Utc::now(),
            ))
        }

        async fn register(
            &self,
            chat_id: ChatId,
            user_id: UserId,
            _username: String,
        ) -> Result<UserAccount, CommandError> {
            Ok(account_for(chat_id, user_id))
        }

        async fn sign_in(
            &self,
            _chat_id: ChatId,
            _user_id: UserId,
        ) -> Result<UserAccount, CommandError> {
            Err(CommandError::new(
                ErrorCode::AlreadySignedIn,
                "already signed in today",
            ))
        }

        async fn claim_welfare(
            &self,
            chat_id: ChatId,
            user_id: UserId,
        ) -> Result<UserAccount, CommandError> {
            Ok(account_for(chat_id, user_id))
        }

        async fn account(
            &self,
            _chat_id: ChatId,
            user_id: UserId,
        ) -> Result<UserAccount, CommandError> {
            Err(CommandError::new(
                ErrorCode::NotFound,
                format!("user {user_id} is not registered"),
            ))
        }

        async fn recent_draws(
            &self,
            chat_id: ChatId,
            limit: usize,
        ) -> Result<Vec<DrawResult>, CommandError> {
            let draw = DrawResult::new(
                chat_id,
                IssueId::parse("20240101120000").expect("issue"),
                DrawFaces::from_values(1, 2, 4).expect("faces"),
                Utc::now(),
            );
            Ok(std::iter::repeat_n(draw, limit.min(2)).collect())
        }

        async fn user_bets(
            &self,
            _chat_id: ChatId,
            _user_id: UserId,
            limit: usize,
        ) -> Result<Vec<Bet>, CommandError> {
            Ok(self.history.iter().take(limit).cloned().collect())
        }
    }

    fn state_with(game: Arc<FakeGame>) -> OpsState {
        OpsState { game }
    }

    #[tokio::test]
    async fn bet_command_text_is_parsed_before_forwarding() {
        let game = Arc::new(FakeGame::default());
        let (status, Json(resp)) = place_bet(
            State(state_with(game.clone())),
            Path(-100),
            Json(PlaceBetRequest {
                user_id: 7,
                bet_type: None,
                amount: None,
                command: Some("#豹子 50".to_string()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(resp.ok);
        let recorded = game.bets.lock().expect("lock").clone();
        assert_eq!(
            recorded,
            vec![(ChatId(-100), UserId(7), BetType::Triplet, Points(50))]
        );
    }

    #[tokio::test]
    async fn malformed_bet_is_rejected_without_forwarding() {
        let game = Arc::new(FakeGame::default());
        let (status, Json(resp)) = place_bet(
            State(state_with(game.clone())),
            Path(-100),
            Json(PlaceBetRequest {
                user_id: 7,
                bet_type: Some("pair".to_string()),
                amount: Some(10),
                command: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.error.expect("error").code,
            ErrorCode::RequestInvalid
        );

        let (status, _) = place_bet(
            State(state_with(game.clone())),
            Path(-100),
            Json(PlaceBetRequest {
                user_id: 7,
                bet_type: Some("big".to_string()),
                amount: Some(0),
                command: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(game.bets.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn insufficient_funds_maps_to_unprocessable() {
        let game = Arc::new(FakeGame::default());
        let (status, Json(resp)) = place_bet(
            State(state_with(game)),
            Path(-100),
            Json(PlaceBetRequest {
                user_id: 7,
                bet_type: Some("big".to_string()),
                amount: Some(5000),
                command: None,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            resp.error.expect("error").code,
            ErrorCode::InsufficientFunds
        );
    }

    #[tokio::test]
    async fn bet_history_includes_win_amount() {
        let mut winning = Bet::pending(
            UserId(7),
            ChatId(-100),
            IssueId::parse("20240101120000").expect("issue"),
            BetType::Triplet,
            Points(50),
            Utc::now(),
        );
        winning.settle_status = SettleStatus::Settled;
        winning.result = Some(BetResult::Win);
        let game = Arc::new(FakeGame {
            history: vec![winning],
            ..FakeGame::default()
        });

        let (status, Json(resp)) = user_bets(
            State(state_with(game)),
            Path((-100, 7)),
            Query(HistoryQuery::default()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let entries = resp.data.expect("data");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].win_amount, Points(500));
    }

    #[test]
    fn history_limit_is_clamped() {
        assert_eq!(HistoryQuery::default().resolved_limit(), 10);
        assert_eq!(HistoryQuery { limit: Some(0) }.resolved_limit(), 1);
        assert_eq!(HistoryQuery { limit: Some(5000) }.resolved_limit(), 100);
    }

    #[tokio::test]
    async fn router_serves_schedule_start_and_errors() {
        let game = Arc::new(FakeGame::default());
        let app = build_router_with_state(state_with(game.clone()));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chats/-100/schedule/start")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"cycle_minutes":5}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["data"]["open_issue"], "20240101120000");
        assert_eq!(
            game.started.lock().expect("lock").clone(),
            vec![(ChatId(-100), Some(5))]
        );

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chats/-100/accounts/7/sign-in")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/chats/-100/draws?limit=1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["data"].as_array().expect("draws").len(), 1);
        assert_eq!(json["data"][0]["outcome"]["size"], "small");
    }

    #[tokio::test]
    async fn schedule_start_accepts_empty_body() {
        let game = Arc::new(FakeGame::default());
        let app = build_router_with_state(state_with(game.clone()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chats/-5/schedule/start")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            game.started.lock().expect("lock").clone(),
            vec![(ChatId(-5), None)]
        );
    }
}
