use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use dice_domain::{ChatId, UserId};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of a critical section; dropping it releases the lock.
pub type LockGuard = OwnedMutexGuard<()>;

#[derive(Debug)]
struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Copy> KeyedLocks<K> {
    fn handle(&self, key: K) -> Arc<AsyncMutex<()>> {
        // The map only ever gains entries, so a poisoned guard still holds a valid map.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key).or_default().clone()
    }

    async fn acquire(&self, key: K) -> LockGuard {
        self.handle(key).lock_owned().await
    }

    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One lazily created exclusive lock per user and per chat. Entries are never evicted.
///
/// Callers must not request a chat lock or another user's lock while holding a user lock.
#[derive(Debug, Default)]
pub struct LockRegistry {
    users: KeyedLocks<UserId>,
    chats: KeyedLocks<ChatId>,
}

impl LockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire_user_lock(&self, user_id: UserId) -> LockGuard {
        self.users.acquire(user_id).await
    }

    pub async fn acquire_chat_lock(&self, chat_id: ChatId) -> LockGuard {
        self.chats.acquire(chat_id).await
    }

    #[must_use]
    pub fn user_lock_count(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn chat_lock_count(&self) -> usize {
        self.chats.len()
    }
}
