use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::models::Exchange;
use crate::services::subscription::{Messenger, SubscriptionEngine};
use crate::services::telegram::TelegramBot;

pub type UserId = i64;

/// What the bot is waiting for in a user's private chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    AwaitingExchange,
    AwaitingApiKey { exchange: Exchange },
}

#[derive(Default)]
pub struct Sessions {
    inner: Mutex<HashMap<UserId, Session>>,
}

impl Sessions {
    pub async fn get(&self, user_id: UserId) -> Option<Session> {
        self.inner.lock().await.get(&user_id).copied()
    }

    pub async fn set(&self, user_id: UserId, session: Session) {
        self.inner.lock().await.insert(user_id, session);
    }

    pub async fn clear(&self, user_id: UserId) {
        self.inner.lock().await.remove(&user_id);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SubscriptionEngine>,
    pub telegram: Arc<TelegramBot>,
    /// Plain notifications; the Telegram client itself outside of tests.
    pub messenger: Arc<dyn Messenger>,
    pub config: Arc<Config>,
    pub sessions: Arc<Sessions>,
}

impl AppState {
    pub fn new(engine: Arc<SubscriptionEngine>, telegram: Arc<TelegramBot>, config: Arc<Config>) -> Self {
        Self {
            engine,
            messenger: telegram.clone(),
            telegram,
            config,
            sessions: Arc::new(Sessions::default()),
        }
    }

    #[cfg(test)]
    pub fn with_messenger(mut self, messenger: Arc<dyn Messenger>) -> Self {
        self.messenger = messenger;
        self
    }
}
