use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, UserId};
use crate::money::Points;

pub const DEFAULT_DRAW_CYCLE_MINUTES: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDrawSession {
    pub chat_id: ChatId,
    pub draw_cycle_minutes: u32,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl ChatDrawSession {
    #[must_use]
    pub fn enabled(chat_id: ChatId, draw_cycle_minutes: u32, now: DateTime<Utc>) -> Self {
        Self {
            chat_id,
            draw_cycle_minutes: draw_cycle_minutes.max(1),
            enabled: true,
            updated_at: now,
        }
    }
}

/// Balance of one user inside one chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub username: String,
    pub balance: Points,
    pub last_sign_in_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
