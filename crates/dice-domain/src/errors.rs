use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("die face {0} outside 1..=6")]
    InvalidDieFace(u8),
    #[error("unknown bet type: {0}")]
    InvalidBetType(String),
    #[error("invalid bet amount: {0}")]
    InvalidBetAmount(String),
    #[error("invalid issue id: {0}")]
    InvalidIssueId(String),
    #[error("invalid parity: {0}")]
    InvalidParity(String),
    #[error("invalid size: {0}")]
    InvalidSize(String),
    #[error("invalid settle status: {0}")]
    InvalidSettleStatus(String),
    #[error("invalid bet result: {0}")]
    InvalidBetResult(String),
}
