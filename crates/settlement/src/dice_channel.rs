use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dice_domain::{ChatId, DieFace, DrawFaces};
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiceChannelError {
    #[error("dice transport error: {0}")]
    Transport(String),
    /// The chat no longer accepts messages (bot blocked or removed).
    #[error("chat {0} is unreachable")]
    ChatUnreachable(ChatId),
}

/// External source of die faces, typically the chat transport's dice message.
#[async_trait]
pub trait DiceChannel: Send + Sync {
    async fn roll_once(&self, chat_id: ChatId) -> Result<DieFace, DiceChannelError>;
}

/// Rolls three independent faces for one draw.
pub async fn roll_draw(
    channel: &dyn DiceChannel,
    chat_id: ChatId,
) -> Result<DrawFaces, DiceChannelError> {
    let a = channel.roll_once(chat_id).await?;
    let b = channel.roll_once(chat_id).await?;
    let c = channel.roll_once(chat_id).await?;
    Ok(DrawFaces([a, b, c]))
}

/// Uniform faces from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandDiceChannel;

#[async_trait]
impl DiceChannel for RandDiceChannel {
    async fn roll_once(&self, _chat_id: ChatId) -> Result<DieFace, DiceChannelError> {
        let value: u8 = rand::thread_rng().gen_range(1..=6);
        DieFace::new(value).map_err(|e| DiceChannelError::Transport(e.to_string()))
    }
}

/// Replays queued faces or failures, then falls back to a fixed face if one is set.
#[derive(Debug, Default, Clone)]
pub struct ScriptedDiceChannel {
    script: Arc<Mutex<VecDeque<Result<u8, DiceChannelError>>>>,
    fallback: Option<u8>,
    rolls: Arc<AtomicUsize>,
}

impl ScriptedDiceChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn repeating(face: u8) -> Self {
        Self {
            fallback: Some(face),
            ..Self::default()
        }
    }

    pub fn push_faces(&self, faces: [u8; 3]) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(faces.into_iter().map(Ok));
        }
    }

    pub fn push_failure(&self, error: DiceChannelError) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
    }

    #[must_use]
    pub fn roll_count(&self) -> usize {
        self.rolls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiceChannel for ScriptedDiceChannel {
    async fn roll_once(&self, _chat_id: ChatId) -> Result<DieFace, DiceChannelError> {
        self.rolls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .map_err(|_| DiceChannelError::Transport("script lock poisoned".to_string()))?
            .pop_front();
        let value = match (next, self.fallback) {
            (Some(entry), _) => entry?,
            (None, Some(face)) => face,
            (None, None) => {
                return Err(DiceChannelError::Transport("dice script exhausted".to_string()));
            }
        };
        DieFace::new(value).map_err(|e| DiceChannelError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rand_channel_stays_in_range() {
        let channel = RandDiceChannel;
        for _ in 0..200 {
            let face = channel.roll_once(ChatId(1)).await.expect("roll");
            assert!((1..=6).contains(&face.value()));
        }
    }

    #[tokio::test]
    async fn scripted_channel_replays_then_fails() {
        let channel = ScriptedDiceChannel::new();
        channel.push_faces([3, 3, 3]);
        let faces = roll_draw(&channel, ChatId(1)).await.expect("draw");
        assert_eq!(faces.values(), [3, 3, 3]);
        assert!(roll_draw(&channel, ChatId(1)).await.is_err());
        assert_eq!(channel.roll_count(), 4);
    }

    #[tokio::test]
    async fn scripted_failure_aborts_draw() {
        let channel = ScriptedDiceChannel::repeating(2);
        channel.push_failure(DiceChannelError::ChatUnreachable(ChatId(1)));
        assert_eq!(
            roll_draw(&channel, ChatId(1)).await,
            Err(DiceChannelError::ChatUnreachable(ChatId(1)))
        );
        assert_eq!(
            roll_draw(&channel, ChatId(1)).await.expect("fallback").values(),
            [2, 2, 2]
        );
    }
}
