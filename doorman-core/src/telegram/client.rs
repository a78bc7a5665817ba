use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::types::{
    ApiResponse, ChatMember, InlineKeyboardMarkup, Message, ParseMode, Update, User,
};
use crate::http_log::RequestLogMiddleware;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Extra time on top of the long-poll timeout before the HTTP request itself gives up.
const LONG_POLL_GRACE: Duration = Duration::from_secs(15);

/// Errors returned by the Bot API client.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram request failed: {0}")]
    Transport(#[from] reqwest_middleware::Error),

    #[error("telegram returned an unreadable response: {0}")]
    Decode(#[from] reqwest::Error),

    #[error("telegram API error {code}: {description}")]
    Api { code: i64, description: String },
}

impl TelegramError {
    /// Whether this error means the message is already gone (deleted by someone
    /// else or never existed). Deleting such a message counts as success.
    ///
    /// "message can't be deleted" is not included: Telegram sends it when the
    /// bot lacks delete rights, and that has to surface as a failure.
    pub fn is_message_gone(&self) -> bool {
        match self {
            Self::Api { code: 400, description } => {
                let description = description.to_lowercase();
                description.contains("message to delete not found")
                    || description.contains("message_id_invalid")
            }
            _ => false,
        }
    }
}

/// Outcome of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

/// Thin async client for the Telegram Bot API.
#[derive(Clone)]
pub struct TelegramClient {
    client: ClientWithMiddleware,
    base_url: String,
    token: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, DEFAULT_API_BASE)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: create_telegram_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn call<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<R, TelegramError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(self.method_url(method)).json(params);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        // Errors from reqwest embed the request URL, which contains the token.
        let response = request.send().await.map_err(strip_url)?;
        let envelope: ApiResponse<R> = response.json().await.map_err(|e| e.without_url())?;

        match (envelope.ok, envelope.result) {
            (true, Some(result)) => Ok(result),
            (_, _) => Err(TelegramError::Api {
                code: envelope.error_code.unwrap_or(0),
                description: envelope
                    .description
                    .unwrap_or_else(|| format!("{} returned no result", method)),
            }),
        }
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &json!({}), None).await
    }

    /// Long-poll for updates starting at `offset`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
        allowed_updates: &[&str],
    ) -> Result<Vec<Update>, TelegramError> {
        let params = json!({
            "offset": offset,
            "timeout": timeout.as_secs(),
            "allowed_updates": allowed_updates,
        });
        self.call("getUpdates", &params, Some(timeout + LONG_POLL_GRACE))
            .await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<&InlineKeyboardMarkup>,
        parse_mode: Option<ParseMode>,
    ) -> Result<Message, TelegramError> {
        let params = json!({
            "chat_id": chat_id,
            "text": text,
            "reply_markup": markup,
            "parse_mode": parse_mode,
            "link_preview_options": {"is_disabled": true},
        });
        let message: Message = self.call("sendMessage", &params, None).await?;
        debug!(chat_id, message_id = message.message_id, "sent message");
        Ok(message)
    }

    /// Delete a message. A message that is already gone is reported as
    /// [`DeleteOutcome::AlreadyGone`] rather than an error.
    pub async fn delete_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<DeleteOutcome, TelegramError> {
        let params = json!({"chat_id": chat_id, "message_id": message_id});
        match self.call::<_, bool>("deleteMessage", &params, None).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.is_message_gone() => {
                debug!(chat_id, message_id, "message was already deleted");
                Ok(DeleteOutcome::AlreadyGone)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a user from a chat while still allowing them to join again.
    ///
    /// `unbanChatMember` without `only_if_banned` removes current members,
    /// which is exactly a "kick".
    pub async fn unban_chat_member(&self, chat_id: i64, user_id: i64) -> Result<(), TelegramError> {
        let params = json!({"chat_id": chat_id, "user_id": user_id});
        self.call::<_, bool>("unbanChatMember", &params, None)
            .await?;
        info!(chat_id, user_id, "removed user from chat");
        Ok(())
    }

    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: &str,
    ) -> Result<(), TelegramError> {
        let params = json!({"callback_query_id": callback_query_id, "text": text});
        self.call::<_, bool>("answerCallbackQuery", &params, None)
            .await?;
        Ok(())
    }

    pub async fn get_chat_member(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<ChatMember, TelegramError> {
        let params = json!({"chat_id": chat_id, "user_id": user_id});
        self.call("getChatMember", &params, None).await
    }

    pub async fn get_chat_administrators(
        &self,
        chat_id: i64,
    ) -> Result<Vec<ChatMember>, TelegramError> {
        let params = json!({"chat_id": chat_id});
        self.call("getChatAdministrators", &params, None).await
    }
}

fn strip_url(err: reqwest_middleware::Error) -> reqwest_middleware::Error {
    match err {
        reqwest_middleware::Error::Reqwest(inner) => {
            reqwest_middleware::Error::Reqwest(inner.without_url())
        }
        other => other,
    }
}

fn create_telegram_client() -> ClientWithMiddleware {
    let client = Client::builder()
        .user_agent(concat!("doorman/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new());

    ClientBuilder::new(client)
        .with(RequestLogMiddleware::new("telegram"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: i64, description: &str) -> TelegramError {
        TelegramError::Api {
            code,
            description: description.to_string(),
        }
    }

    #[test]
    fn test_message_gone_errors_are_recognized() {
        assert!(api_error(400, "Bad Request: message to delete not found").is_message_gone());
        assert!(api_error(400, "Bad Request: MESSAGE_ID_INVALID").is_message_gone());
    }

    #[test]
    fn test_other_errors_are_not_message_gone() {
        assert!(!api_error(400, "Bad Request: message can't be deleted").is_message_gone());
        assert!(
            !api_error(400, "Bad Request: message can't be deleted for everyone").is_message_gone()
        );
        assert!(!api_error(400, "Bad Request: chat not found").is_message_gone());
        assert!(!api_error(403, "Forbidden: bot was kicked").is_message_gone());
        assert!(!api_error(429, "Too Many Requests: retry after 5").is_message_gone());
    }

    #[test]
    fn test_method_url_strips_trailing_slash() {
        let client = TelegramClient::with_base_url("123:abc", "http://localhost:8081/");
        assert_eq!(
            client.method_url("getMe"),
            "http://localhost:8081/bot123:abc/getMe"
        );
    }
}
