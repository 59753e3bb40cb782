use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::ids::ChatId;
use crate::issue::IssueId;

/// Highest total that still counts as "small".
pub const SMALL_MAX_TOTAL: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DieFace(u8);

impl DieFace {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 6;

    pub fn new(value: u8) -> Result<Self, DomainError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(DomainError::InvalidDieFace(value))
        }
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for DieFace {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DieFace> for u8 {
    fn from(face: DieFace) -> Self {
        face.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    Single,
    Double,
}

impl Parity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Double => "double",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "single" => Ok(Self::Single),
            "double" => Ok(Self::Double),
            other => Err(DomainError::InvalidParity(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Size {
    Big,
    Small,
}

impl Size {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Big => "big",
            Self::Small => "small",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "big" => Ok(Self::Big),
            "small" => Ok(Self::Small),
            other => Err(DomainError::InvalidSize(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawFaces(pub [DieFace; 3]);

impl DrawFaces {
    pub fn from_values(a: u8, b: u8, c: u8) -> Result<Self, DomainError> {
        Ok(Self([DieFace::new(a)?, DieFace::new(b)?, DieFace::new(c)?]))
    }

    #[must_use]
    pub fn values(&self) -> [u8; 3] {
        self.0.map(DieFace::value)
    }
}

/// Classification of three faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawOutcome {
    pub faces: DrawFaces,
    pub total: u8,
    pub parity: Parity,
    pub size: Size,
    pub triplet: bool,
}

impl DrawOutcome {
    #[must_use]
    pub fn classify(faces: DrawFaces) -> Self {
        let [a, b, c] = faces.values();
        let total = a + b + c;
        let size = if total <= SMALL_MAX_TOTAL {
            Size::Small
        } else {
            Size::Big
        };
        let parity = if total % 2 == 1 {
            Parity::Single
        } else {
            Parity::Double
        };
        Self {
            faces,
            total,
            parity,
            size,
            triplet: a == b && b == c,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawResult {
    pub chat_id: ChatId,
    pub issue_id: IssueId,
    pub outcome: DrawOutcome,
    pub drawn_at: DateTime<Utc>,
}

impl DrawResult {
    #[must_use]
    pub fn new(chat_id: ChatId, issue_id: IssueId, faces: DrawFaces, drawn_at: DateTime<Utc>) -> Self {
        Self {
            chat_id,
            issue_id,
            outcome: DrawOutcome::classify(faces),
            drawn_at,
        }
    }
}
