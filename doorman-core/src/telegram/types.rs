//! Subset of the Telegram Bot API object model that doorman reads and writes.
//!
//! Only the fields the dispatcher and the clients actually touch are modelled.
//! Unknown fields are ignored by serde, so new Bot API releases don't break
//! deserialization.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope returned by every Bot API method.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
}

/// One entry from `getUpdates`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub chat_member: Option<ChatMemberUpdated>,
    pub my_chat_member: Option<ChatMemberUpdated>,
    pub callback_query: Option<CallbackQuery>,
}

impl Update {
    /// The chat this update belongs to, if any.
    pub fn chat(&self) -> Option<&Chat> {
        if let Some(message) = &self.message {
            return Some(&message.chat);
        }
        if let Some(member) = self.chat_member.as_ref().or(self.my_chat_member.as_ref()) {
            return Some(&member.chat);
        }
        self.callback_query
            .as_ref()
            .and_then(|query| query.message.as_ref())
            .map(|message| &message.chat)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub new_chat_members: Option<Vec<User>>,
    pub left_chat_member: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
}

/// Telegram chat type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
    #[serde(other)]
    Other,
}

impl ChatKind {
    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group | Self::Supergroup)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Supergroup => "supergroup",
            Self::Channel => "channel",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "private" => Self::Private,
            "group" => Self::Group,
            "supergroup" => Self::Supergroup,
            "channel" => Self::Channel,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ChatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

impl User {
    /// Human-readable name used in greetings: full name if known, else the username.
    pub fn display_name(&self) -> String {
        let full = match &self.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        };
        if !full.trim().is_empty() {
            return full;
        }
        self.username
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// `chat_member` / `my_chat_member` payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMemberUpdated {
    pub chat: Chat,
    pub from: User,
    pub old_chat_member: ChatMember,
    pub new_chat_member: ChatMember,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChatMember {
    pub status: ChatRole,
    pub user: User,
    /// Only present for `restricted` members.
    pub is_member: Option<bool>,
}

impl ChatMember {
    /// Whether this membership snapshot means "currently in the chat as a regular member".
    pub fn is_present(&self) -> bool {
        match self.status {
            ChatRole::Member => true,
            ChatRole::Restricted => self.is_member.unwrap_or(false),
            _ => false,
        }
    }

    /// Whether this snapshot means "not in the chat".
    pub fn is_gone(&self) -> bool {
        match self.status {
            ChatRole::Left | ChatRole::Kicked => true,
            ChatRole::Restricted => !self.is_member.unwrap_or(false),
            _ => false,
        }
    }
}

/// Membership role as reported by Telegram (`ChatMember.status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl ChatRole {
    pub fn can_moderate(&self) -> bool {
        matches!(self, Self::Creator | Self::Administrator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creator => "creator",
            Self::Administrator => "administrator",
            Self::Member => "member",
            Self::Restricted => "restricted",
            Self::Left => "left",
            Self::Kicked => "kicked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "creator" => Some(Self::Creator),
            "administrator" => Some(Self::Administrator),
            "member" => Some(Self::Member),
            "restricted" => Some(Self::Restricted),
            "left" => Some(Self::Left),
            "kicked" => Some(Self::Kicked),
            _ => None,
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
}

impl InlineKeyboardButton {
    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: Some(url.into()),
            callback_data: None,
        }
    }

    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: None,
            callback_data: Some(data.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseMode {
    MarkdownV2,
    #[serde(rename = "HTML")]
    Html,
}

/// Escape text for Telegram's MarkdownV2 parse mode.
pub fn escape_markdown_v2(text: &str) -> String {
    const SPECIAL: &[char] = &[
        '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
        '\\',
    ];

    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_with_new_members_deserializes() {
        let raw = json!({
            "update_id": 10,
            "message": {
                "message_id": 5,
                "chat": {"id": -100, "type": "supergroup", "title": "ctf"},
                "from": {"id": 42, "is_bot": false, "first_name": "Ann"},
                "new_chat_members": [{"id": 42, "is_bot": false, "first_name": "Ann"}]
            }
        });

        let update: Update = serde_json::from_value(raw).unwrap();
        assert_eq!(update.update_id, 10);
        assert_eq!(update.chat().unwrap().kind, ChatKind::Supergroup);
        let message = update.message.unwrap();
        assert_eq!(message.from.unwrap().id, 42);
        assert_eq!(message.new_chat_members.unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_chat_kind_maps_to_other() {
        let chat: Chat = serde_json::from_value(json!({"id": 1, "type": "forum"})).unwrap();
        assert_eq!(chat.kind, ChatKind::Other);
    }

    #[test]
    fn test_restricted_member_presence_depends_on_is_member() {
        let user = User {
            id: 1,
            is_bot: false,
            first_name: "A".to_string(),
            last_name: None,
            username: None,
        };
        let inside = ChatMember {
            status: ChatRole::Restricted,
            user: user.clone(),
            is_member: Some(true),
        };
        let outside = ChatMember {
            status: ChatRole::Restricted,
            user,
            is_member: Some(false),
        };
        assert!(inside.is_present());
        assert!(!inside.is_gone());
        assert!(!outside.is_present());
        assert!(outside.is_gone());
    }

    #[test]
    fn test_display_name_falls_back_to_username() {
        let user = User {
            id: 7,
            is_bot: false,
            first_name: "".to_string(),
            last_name: None,
            username: Some("ghost".to_string()),
        };
        assert_eq!(user.display_name(), "ghost");
    }

    #[test]
    fn test_escape_markdown_v2() {
        insta::assert_snapshot!(escape_markdown_v2("a_b*c [x](y) 1.5!"), @r"a\_b\*c \[x\]\(y\) 1\.5\!");
    }

    #[test]
    fn test_callback_button_skips_url() {
        let button = InlineKeyboardButton::callback("Accept", "data");
        let value = serde_json::to_value(&button).unwrap();
        assert_eq!(value, json!({"text": "Accept", "callback_data": "data"}));
    }
}
