//! Recording fakes for the platform traits, shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use doorman_core::telegram::{ChatRole, InlineKeyboardMarkup, ParseMode, User};
use doorman_core::OAuthSettings;

use crate::platform::{ChatDirectory, IdentityProvider, Messenger};
use crate::state_machine::interpreter::Services;
use crate::state_machine::repository::InMemoryRepository;
use crate::state_machine::{MessageRef, Policy};

pub const BOT_USERNAME: &str = "doorman_test_bot";

pub fn user(id: i64, first_name: &str) -> User {
    User {
        id,
        is_bot: false,
        first_name: first_name.to_string(),
        last_name: None,
        username: None,
    }
}

pub fn oauth_settings() -> OAuthSettings {
    OAuthSettings {
        host: "oauth.ctftime.org".to_string(),
        client_id: "42".to_string(),
        redirect_url: "http://localhost:8080/oauth_callback".to_string(),
    }
}

pub fn test_services(
    repo: Arc<InMemoryRepository>,
    messenger: Arc<FakeMessenger>,
    provider: Option<FakeProvider>,
) -> Services {
    Services {
        store: repo.clone(),
        ledger: repo,
        messenger,
        provider: provider.map(|p| Arc::new(p) as Arc<dyn IdentityProvider>),
        oauth: oauth_settings(),
        policy: Policy::default(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
    pub markup: Option<InlineKeyboardMarkup>,
    pub parse_mode: Option<ParseMode>,
}

#[derive(Default)]
pub struct FakeMessenger {
    next_id: AtomicI64,
    sent: Mutex<Vec<SentMessage>>,
    deleted: Mutex<Vec<MessageRef>>,
    removed: Mutex<Vec<(i64, i64)>>,
    answers: Mutex<Vec<(String, String)>>,
    failing_deletes: Mutex<HashSet<MessageRef>>,
}

impl FakeMessenger {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<MessageRef> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<(i64, i64)> {
        self.removed.lock().unwrap().clone()
    }

    pub fn answers(&self) -> Vec<(String, String)> {
        self.answers.lock().unwrap().clone()
    }

    /// Make deleting `message` fail with a transport-style error.
    pub fn fail_delete(&self, message: MessageRef) {
        self.failing_deletes.lock().unwrap().insert(message);
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    fn bot_username(&self) -> &str {
        BOT_USERNAME
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<&InlineKeyboardMarkup>,
        parse_mode: Option<ParseMode>,
    ) -> Result<i64> {
        let message_id = 1000 + self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(SentMessage {
            chat_id,
            message_id,
            text: text.to_string(),
            markup: markup.cloned(),
            parse_mode,
        });
        Ok(message_id)
    }

    async fn delete_message(&self, message: MessageRef) -> Result<()> {
        if self.failing_deletes.lock().unwrap().contains(&message) {
            return Err(anyhow!("connection reset"));
        }
        self.deleted.lock().unwrap().push(message);
        Ok(())
    }

    async fn remove_member(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.removed.lock().unwrap().push((chat_id, user_id));
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        self.answers
            .lock()
            .unwrap()
            .push((callback_id.to_string(), text.to_string()));
        Ok(())
    }
}

pub struct FakeProvider {
    result: Result<i64, String>,
}

impl FakeProvider {
    pub fn succeeding(provider_id: i64) -> Self {
        Self {
            result: Ok(provider_id),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            result: Err(error.to_string()),
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn resolve(&self, _code: &str) -> Result<i64> {
        self.result.clone().map_err(|e| anyhow!(e))
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    pub roles: HashMap<i64, ChatRole>,
    pub admins: HashMap<i64, Vec<i64>>,
}

#[async_trait]
impl ChatDirectory for FakeDirectory {
    async fn bot_role(&self, chat_id: i64) -> Result<ChatRole> {
        self.roles
            .get(&chat_id)
            .copied()
            .ok_or_else(|| anyhow!("chat {} not found", chat_id))
    }

    async fn admin_ids(&self, chat_id: i64) -> Result<Vec<i64>> {
        self.admins
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| anyhow!("chat {} not found", chat_id))
    }
}
