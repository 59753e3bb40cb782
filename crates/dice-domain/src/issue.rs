use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

const ISSUE_FORMAT: &str = "%Y%m%d%H%M%S";

/// Token of one betting round, e.g. `20240101120000`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(String);

impl IssueId {
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        NaiveDateTime::parse_from_str(&value, ISSUE_FORMAT)
            .map_err(|_| DomainError::InvalidIssueId(value.clone()))?;
        Ok(Self(value))
    }

    #[must_use]
    pub fn mint(now: DateTime<Utc>) -> Self {
        Self(now.format(ISSUE_FORMAT).to_string())
    }

    /// Mints from `now`, but never at or before `previous`.
    #[must_use]
    pub fn mint_after(previous: Option<&IssueId>, now: DateTime<Utc>) -> Self {
        let candidate = Self::mint(now);
        let Some(previous) = previous else {
            return candidate;
        };
        if candidate > *previous {
            return candidate;
        }
        match previous.timestamp() {
            Some(ts) => Self((ts + Duration::seconds(1)).format(ISSUE_FORMAT).to_string()),
            None => candidate,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.0, ISSUE_FORMAT).ok()
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
