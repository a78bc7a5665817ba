//! Seams between the state machine and the outside services.
//!
//! The interpreter and the background loops only see these traits. The
//! production implementations wrap the Telegram and CTFtime clients from
//! `doorman-core`; tests swap in the recording fakes from `crate::testing`.

use anyhow::Result;
use async_trait::async_trait;
use doorman_core::telegram::{
    ChatRole, DeleteOutcome, InlineKeyboardMarkup, ParseMode, TelegramClient, User,
};
use doorman_core::CtfTimeClient;
use tracing::debug;

use crate::state_machine::MessageRef;

/// Outgoing chat operations.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Username of the bot, used to build `t.me` deep links.
    fn bot_username(&self) -> &str;

    /// Send a message and return its id.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<&InlineKeyboardMarkup>,
        parse_mode: Option<ParseMode>,
    ) -> Result<i64>;

    /// Delete a message. Succeeds if the message is already gone.
    async fn delete_message(&self, message: MessageRef) -> Result<()>;

    /// Remove a user from a group without banning them.
    async fn remove_member(&self, chat_id: i64, user_id: i64) -> Result<()>;

    /// Show a toast to the user who pressed an inline button.
    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()>;
}

/// Resolves an OAuth authorization code to the provider's user id.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, code: &str) -> Result<i64>;
}

/// Read-only view of chat membership, used by the admin sync loop.
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    async fn bot_role(&self, chat_id: i64) -> Result<ChatRole>;

    /// User ids of everyone who can moderate the chat.
    async fn admin_ids(&self, chat_id: i64) -> Result<Vec<i64>>;
}

/// [`Messenger`] and [`ChatDirectory`] backed by the Bot API.
#[derive(Clone)]
pub struct TelegramPlatform {
    client: TelegramClient,
    bot: User,
    bot_username: String,
}

impl TelegramPlatform {
    /// `bot` is the result of `getMe` for the token `client` uses.
    pub fn new(client: TelegramClient, bot: User) -> Self {
        let bot_username = bot.username.clone().unwrap_or_default();
        Self {
            client,
            bot,
            bot_username,
        }
    }
}

#[async_trait]
impl Messenger for TelegramPlatform {
    fn bot_username(&self) -> &str {
        &self.bot_username
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<&InlineKeyboardMarkup>,
        parse_mode: Option<ParseMode>,
    ) -> Result<i64> {
        let message = self
            .client
            .send_message(chat_id, text, markup, parse_mode)
            .await?;
        Ok(message.message_id)
    }

    async fn delete_message(&self, message: MessageRef) -> Result<()> {
        let outcome = self
            .client
            .delete_message(message.chat_id, message.message_id)
            .await?;
        if outcome == DeleteOutcome::AlreadyGone {
            debug!(%message, "message already gone");
        }
        Ok(())
    }

    async fn remove_member(&self, chat_id: i64, user_id: i64) -> Result<()> {
        self.client.unban_chat_member(chat_id, user_id).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        self.client.answer_callback_query(callback_id, text).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatDirectory for TelegramPlatform {
    async fn bot_role(&self, chat_id: i64) -> Result<ChatRole> {
        let member = self.client.get_chat_member(chat_id, self.bot.id).await?;
        Ok(member.status)
    }

    async fn admin_ids(&self, chat_id: i64) -> Result<Vec<i64>> {
        let admins = self.client.get_chat_administrators(chat_id).await?;
        Ok(admins
            .into_iter()
            .filter(|admin| admin.status.can_moderate() && !admin.user.is_bot)
            .map(|admin| admin.user.id)
            .collect())
    }
}

#[async_trait]
impl IdentityProvider for CtfTimeClient {
    async fn resolve(&self, code: &str) -> Result<i64> {
        CtfTimeClient::resolve(self, code).await
    }
}
