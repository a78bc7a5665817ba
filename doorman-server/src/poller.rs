//! Long-polling loop for Telegram updates.
//!
//! Each update is handled on its own task under a timeout. The cursor is
//! advanced as soon as an update is handed to a task, so a crash never
//! replays an update that was already dispatched.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use doorman_core::telegram::{TelegramClient, Update};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::state_machine::repository::IdentityStore;

pub const ALLOWED_UPDATES: &[&str] = &["message", "chat_member", "my_chat_member", "callback_query"];

/// Where updates come from.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn fetch(&self, offset: Option<i64>, timeout: Duration) -> Result<Vec<Update>>;
}

#[async_trait]
impl UpdateSource for TelegramClient {
    async fn fetch(&self, offset: Option<i64>, timeout: Duration) -> Result<Vec<Update>> {
        Ok(self.get_updates(offset, timeout, ALLOWED_UPDATES).await?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    /// Server-side long-poll timeout.
    pub poll_timeout: Duration,
    /// Upper bound for handling one update.
    pub handler_timeout: Duration,
    /// Pause after a failed fetch.
    pub retry_delay: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
        }
    }
}

pub struct Poller {
    source: Arc<dyn UpdateSource>,
    store: Arc<dyn IdentityStore>,
    dispatcher: Arc<Dispatcher>,
    config: PollerConfig,
}

impl Poller {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        store: Arc<dyn IdentityStore>,
        dispatcher: Arc<Dispatcher>,
        config: PollerConfig,
    ) -> Self {
        Self {
            source,
            store,
            dispatcher,
            config,
        }
    }

    /// Poll until `shutdown` is cancelled, then wait for in-flight handlers.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut offset = self.store.load_cursor().await?.map(|cursor| cursor + 1);
        let mut tasks = JoinSet::new();
        info!(?offset, "Starting update poller");

        loop {
            let fetched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                fetched = self.source.fetch(offset, self.config.poll_timeout) => fetched,
            };

            let updates = match fetched {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "Failed to fetch updates, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_delay) => continue,
                    }
                }
            };

            for update in updates {
                let update_id = update.update_id;
                offset = Some(offset.map_or(update_id + 1, |o| o.max(update_id + 1)));
                self.spawn_handler(&mut tasks, update);

                if let Err(e) = self.store.save_cursor(update_id).await {
                    error!(update_id, error = %e, "Failed to save update cursor");
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Update handler task panicked");
                }
            }
        }

        info!(in_flight = tasks.len(), "Poller stopping, waiting for handlers");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Update handler task panicked");
            }
        }
        Ok(())
    }

    fn spawn_handler(&self, tasks: &mut JoinSet<()>, update: Update) {
        let dispatcher = self.dispatcher.clone();
        let timeout = self.config.handler_timeout;
        tasks.spawn(async move {
            let update_id = update.update_id;
            debug!(update_id, "Handling update");
            if tokio::time::timeout(timeout, dispatcher.handle_update(&update))
                .await
                .is_err()
            {
                warn!(update_id, timeout_secs = timeout.as_secs(), "Update handler timed out");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::repository::InMemoryRepository;
    use crate::state_machine::{Engine, MemberKey, MemberStatus};
    use crate::testing::{test_services, FakeMessenger, FakeProvider};
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves one batch, then cancels the token on the next fetch.
    struct OneBatch {
        batch: Mutex<Option<Vec<Update>>>,
        offsets: Mutex<Vec<Option<i64>>>,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl UpdateSource for OneBatch {
        async fn fetch(&self, offset: Option<i64>, _timeout: Duration) -> Result<Vec<Update>> {
            self.offsets.lock().unwrap().push(offset);
            match self.batch.lock().unwrap().take() {
                Some(batch) => Ok(batch),
                None => {
                    self.shutdown.cancel();
                    Ok(vec![])
                }
            }
        }
    }

    fn join(update_id: i64, user_id: i64) -> Update {
        serde_json::from_value(json!({
            "update_id": update_id,
            "message": {
                "message_id": update_id,
                "chat": {"id": -100, "type": "group"},
                "from": {"id": user_id, "first_name": "u"},
                "new_chat_members": [{"id": user_id, "first_name": "u"}]
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_poller_handles_batch_and_advances_cursor() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.save_cursor(9).await.unwrap();
        let messenger = Arc::new(FakeMessenger::default());
        let engine = Arc::new(Engine::new(test_services(
            repo.clone(),
            messenger.clone(),
            Some(FakeProvider::succeeding(1)),
        )));
        let dispatcher = Arc::new(Dispatcher::new(engine, 999, Duration::from_secs(900)));

        let shutdown = CancellationToken::new();
        let source = Arc::new(OneBatch {
            batch: Mutex::new(Some(vec![join(10, 1), join(11, 2)])),
            offsets: Mutex::new(vec![]),
            shutdown: shutdown.clone(),
        });
        let poller = Poller::new(source.clone(), repo.clone(), dispatcher, PollerConfig::default());

        poller.run(shutdown).await.unwrap();

        assert_eq!(*source.offsets.lock().unwrap(), vec![Some(10), Some(12)]);
        assert_eq!(repo.load_cursor().await.unwrap(), Some(11));
        for user_id in [1, 2] {
            let member = repo.get_member(MemberKey::new(-100, user_id)).await.unwrap();
            assert_eq!(member.status, MemberStatus::JustJoined);
        }
        assert_eq!(messenger.sent().len(), 2);
    }
}
