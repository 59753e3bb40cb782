pub mod bet;
pub mod draw;
pub mod errors;
pub mod ids;
pub mod issue;
pub mod money;
pub mod session;

pub use bet::{
    Bet, BetCommand, BetResult, BetType, EVEN_MONEY_MULTIPLIER, SettleStatus, TRIPLET_MULTIPLIER,
};
pub use draw::{DieFace, DrawFaces, DrawOutcome, DrawResult, Parity, SMALL_MAX_TOTAL, Size};
pub use errors::DomainError;
pub use ids::{BetId, ChatId, UserId};
pub use issue::IssueId;
pub use money::{MoneyError, Points};
pub use session::{ChatDrawSession, DEFAULT_DRAW_CYCLE_MINUTES, UserAccount};

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    #[test]
    fn draw_result_serializes_classification_as_snake_case() {
        let result = DrawResult::new(
            ChatId(-100),
            IssueId::parse("20240101120000").expect("issue"),
            DrawFaces::from_values(1, 2, 4).expect("faces"),
            Utc::now(),
        );
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["outcome"]["parity"], json!("single"));
        assert_eq!(value["outcome"]["size"], json!("small"));
        assert_eq!(value["outcome"]["faces"], json!([1, 2, 4]));
        assert_eq!(value["issue_id"], json!("20240101120000"));
    }

    #[test]
    fn settled_win_reports_winnings_by_bet_type() {
        let mut bet = Bet::pending(
            UserId(7),
            ChatId(1),
            IssueId::parse("20240101120000").expect("issue"),
            BetType::Triplet,
            Points(50),
            Utc::now(),
        );
        assert_eq!(bet.winnings().expect("pending"), Points::ZERO);
        bet.settle_status = SettleStatus::Settled;
        bet.result = Some(BetResult::Win);
        assert_eq!(bet.winnings().expect("win"), Points(500));
        bet.result = Some(BetResult::Loss);
        assert_eq!(bet.winnings().expect("loss"), Points::ZERO);
    }

    #[test]
    fn session_cycle_is_at_least_one_minute() {
        let session = ChatDrawSession::enabled(ChatId(1), 0, Utc::now());
        assert_eq!(session.draw_cycle_minutes, 1);
        assert!(session.enabled);
    }
}
