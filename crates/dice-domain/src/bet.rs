use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::draw::{DrawOutcome, Parity, Size};
use crate::errors::DomainError;
use crate::ids::{BetId, ChatId, UserId};
use crate::issue::IssueId;
use crate::money::{MoneyError, Points};

pub const EVEN_MONEY_MULTIPLIER: u64 = 2;
pub const TRIPLET_MULTIPLIER: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetType {
    Single,
    Double,
    Big,
    Small,
    Triplet,
}

impl BetType {
    pub const ALL: [Self; 5] = [
        Self::Single,
        Self::Double,
        Self::Big,
        Self::Small,
        Self::Triplet,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Double => "double",
            Self::Big => "big",
            Self::Small => "small",
            Self::Triplet => "triplet",
        }
    }

    /// Label used by chat players.
    #[must_use]
    pub fn chat_label(self) -> &'static str {
        match self {
            Self::Single => "单",
            Self::Double => "双",
            Self::Big => "大",
            Self::Small => "小",
            Self::Triplet => "豹子",
        }
    }

    /// Multiplier applied to the stake when settling against `outcome`.
    #[must_use]
    pub fn payout_multiplier(self, outcome: &DrawOutcome) -> u64 {
        let wins = match self {
            Self::Single => outcome.parity == Parity::Single,
            Self::Double => outcome.parity == Parity::Double,
            Self::Big => outcome.size == Size::Big,
            Self::Small => outcome.size == Size::Small,
            Self::Triplet => outcome.triplet,
        };
        match (wins, self) {
            (false, _) => 0,
            (true, Self::Triplet) => TRIPLET_MULTIPLIER,
            (true, _) => EVEN_MONEY_MULTIPLIER,
        }
    }
}

impl FromStr for BetType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(trimmed) || t.chat_label() == trimmed)
            .ok_or_else(|| DomainError::InvalidBetType(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleStatus {
    Pending,
    Settled,
}

impl SettleStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Settled => "settled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "pending" => Ok(Self::Pending),
            "settled" => Ok(Self::Settled),
            other => Err(DomainError::InvalidSettleStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetResult {
    Win,
    Loss,
}

impl BetResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Win => "win",
            Self::Loss => "loss",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "win" => Ok(Self::Win),
            "loss" => Ok(Self::Loss),
            other => Err(DomainError::InvalidBetResult(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub issue_id: IssueId,
    pub bet_type: BetType,
    pub amount: Points,
    pub settle_status: SettleStatus,
    /// `None` until settled.
    pub result: Option<BetResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bet {
    #[must_use]
    pub fn pending(
        user_id: UserId,
        chat_id: ChatId,
        issue_id: IssueId,
        bet_type: BetType,
        amount: Points,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            bet_id: BetId::new(),
            user_id,
            chat_id,
            issue_id,
            bet_type,
            amount,
            settle_status: SettleStatus::Pending,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settle_status == SettleStatus::Settled
    }

    /// Amount credited back for a win, or zero.
    pub fn winnings(&self) -> Result<Points, MoneyError> {
        match self.result {
            Some(BetResult::Win) => self.amount.checked_mul(match self.bet_type {
                BetType::Triplet => TRIPLET_MULTIPLIER,
                _ => EVEN_MONEY_MULTIPLIER,
            }),
            _ => Ok(Points::ZERO),
        }
    }
}

/// A chat message of the form `#<type> <amount>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BetCommand {
    pub bet_type: BetType,
    pub amount: Points,
}

impl BetCommand {
    /// Returns `Ok(None)` for text that is not a bet command at all.
    pub fn parse(text: &str) -> Result<Option<Self>, DomainError> {
        let parts: Vec<&str> = text.split_whitespace().collect();
        let [head, amount] = parts.as_slice() else {
            return Ok(None);
        };
        let Some(label) = head.strip_prefix('#') else {
            return Ok(None);
        };
        let bet_type: BetType = label.parse()?;
        let amount: u64 = amount
            .parse()
            .map_err(|_| DomainError::InvalidBetAmount(amount.to_string()))?;
        if amount == 0 {
            return Err(DomainError::InvalidBetAmount(amount.to_string()));
        }
        Ok(Some(Self {
            bet_type,
            amount: Points(amount),
        }))
    }
}
