//! User-facing chat text and inline keyboards.
//!
//! Greetings are sent with MarkdownV2, so every piece of user-controlled text
//! goes through [`escape_markdown_v2`] before it is spliced in.

use std::fmt;
use std::time::Duration;

use doorman_core::telegram::{escape_markdown_v2, InlineKeyboardButton, InlineKeyboardMarkup};

pub const LOGIN_BUTTON: &str = "Log in with CTFTime";
pub const LOGIN_LINK_TEXT: &str = "Follow the link below to log in with CTFTime";
pub const INVALID_CHAT_ID_TEXT: &str = "Invalid chat id";
pub const NOT_A_MEMBER_TEXT: &str = "You are not a member of this chat";

/// Admin decision carried in a greeting's callback button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Accept,
    Kick,
}

impl CallbackAction {
    const ALL: [CallbackAction; 2] = [CallbackAction::Accept, CallbackAction::Kick];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "new_member_accept",
            Self::Kick => "new_member_kick",
        }
    }

    /// Callback data for this action on `target`, in the `\f<action>|<id>`
    /// form Telegram bot frameworks use for unique button ids.
    pub fn data(&self, target: i64) -> String {
        format!("\u{c}{}|{}", self.as_str(), target)
    }
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why callback data could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDataError {
    /// Not one of our buttons.
    UnknownAction,
    /// Our button, but the target is missing or not a number.
    BadUserId,
}

impl CallbackDataError {
    /// Toast shown to the user who pressed the button.
    pub fn toast(&self) -> &'static str {
        match self {
            Self::UnknownAction => "bad callback data",
            Self::BadUserId => "bad user id",
        }
    }
}

/// Parse callback data produced by [`CallbackAction::data`].
pub fn parse_callback_data(data: &str) -> Result<(CallbackAction, i64), CallbackDataError> {
    let unprefixed = data.strip_prefix('\u{c}').unwrap_or(data);
    let (name, target) = match unprefixed.split_once('|') {
        Some((name, target)) => (name, Some(target)),
        None => (unprefixed, None),
    };

    let action = CallbackAction::ALL
        .into_iter()
        .find(|action| action.as_str() == name)
        .ok_or(CallbackDataError::UnknownAction)?;
    let target = target
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .ok_or(CallbackDataError::BadUserId)?;
    Ok((action, target))
}

/// Deep link that opens a private chat with the bot and sends `/start <group_id>`.
pub fn start_link(bot_username: &str, group_id: i64) -> String {
    format!("https://t.me/{}?start={}", bot_username, group_id)
}

fn mention(display_name: &str, user_id: i64) -> String {
    format!(
        "[{}](tg://user?id={})",
        escape_markdown_v2(display_name),
        user_id
    )
}

fn describe_timeout(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    if secs >= 60 {
        let minutes = secs / 60;
        format!("{} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        format!("{} second{}", secs, if secs == 1 { "" } else { "s" })
    }
}

/// MarkdownV2 greeting for a member who has to log in.
pub fn greeting_text(display_name: &str, user_id: i64, timeout: Duration) -> String {
    format!(
        "Welcome to the chat, {}\\! Please, press the button below, start the bot and follow \
         the instructions to log in with [CTFTime](https://ctftime.org)\\. You won't be able to \
         send messages until you do so\\. The bot will kick you in {} if you don't login\\.",
        mention(display_name, user_id),
        describe_timeout(timeout)
    )
}

/// MarkdownV2 greeting for a previously kicked member waiting for an admin.
pub fn approval_text(display_name: &str, user_id: i64) -> String {
    format!(
        "Welcome back, {}\\! You were removed from this chat earlier\\. \
         An admin has to accept you before you can send messages\\.",
        mention(display_name, user_id)
    )
}

/// Keyboard under a greeting. Returns `None` when there are no buttons.
pub fn greeting_markup(
    bot_username: &str,
    group_id: i64,
    user_id: i64,
    login_link: bool,
    admin_buttons: bool,
) -> Option<InlineKeyboardMarkup> {
    let mut rows = Vec::new();
    if login_link {
        rows.push(vec![InlineKeyboardButton::url(
            LOGIN_BUTTON,
            start_link(bot_username, group_id),
        )]);
    }
    if admin_buttons {
        rows.push(vec![
            InlineKeyboardButton::callback(
                "✅ Accept (admin only)",
                CallbackAction::Accept.data(user_id),
            ),
            InlineKeyboardButton::callback(
                "❌ Kick (admin only)",
                CallbackAction::Kick.data(user_id),
            ),
        ]);
    }

    if rows.is_empty() {
        None
    } else {
        Some(InlineKeyboardMarkup {
            inline_keyboard: rows,
        })
    }
}

/// Single-button keyboard pointing at the provider's authorize URL.
pub fn login_link_markup(authorize_url: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup {
        inline_keyboard: vec![vec![InlineKeyboardButton::url(LOGIN_BUTTON, authorize_url)]],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_text() {
        insta::assert_snapshot!(
            greeting_text("Ann B.", 42, Duration::from_secs(600)),
            @r"Welcome to the chat, [Ann B\.](tg://user?id=42)\! Please, press the button below, start the bot and follow the instructions to log in with [CTFTime](https://ctftime.org)\. You won't be able to send messages until you do so\. The bot will kick you in 10 minutes if you don't login\."
        );
    }

    #[test]
    fn test_approval_text_escapes_name() {
        insta::assert_snapshot!(
            approval_text("[evil](x)", 7),
            @r"Welcome back, [\[evil\]\(x\)](tg://user?id=7)\! You were removed from this chat earlier\. An admin has to accept you before you can send messages\."
        );
    }

    #[test]
    fn test_describe_timeout() {
        assert_eq!(describe_timeout(Duration::from_secs(60)), "1 minute");
        assert_eq!(describe_timeout(Duration::from_secs(150)), "2 minutes");
        assert_eq!(describe_timeout(Duration::from_secs(45)), "45 seconds");
    }

    #[test]
    fn test_callback_data_parses_back() {
        let data = CallbackAction::Kick.data(-12345);
        assert_eq!(data, "\u{c}new_member_kick|-12345");
        assert_eq!(parse_callback_data(&data), Ok((CallbackAction::Kick, -12345)));
    }

    #[test]
    fn test_callback_data_errors() {
        assert_eq!(
            parse_callback_data("\u{c}something_else|1"),
            Err(CallbackDataError::UnknownAction)
        );
        assert_eq!(
            parse_callback_data("\u{c}new_member_accept"),
            Err(CallbackDataError::BadUserId)
        );
        assert_eq!(
            parse_callback_data("\u{c}new_member_accept|abc"),
            Err(CallbackDataError::BadUserId)
        );
    }

    #[test]
    fn test_greeting_markup_layout() {
        let markup = greeting_markup("doorman_bot", -100, 42, true, true).unwrap();
        assert_eq!(markup.inline_keyboard.len(), 2);
        assert_eq!(
            markup.inline_keyboard[0][0].url.as_deref(),
            Some("https://t.me/doorman_bot?start=-100")
        );
        assert_eq!(
            markup.inline_keyboard[1][1].callback_data.as_deref(),
            Some("\u{c}new_member_kick|42")
        );

        assert!(greeting_markup("doorman_bot", -100, 42, false, false).is_none());
        let approval = greeting_markup("doorman_bot", -100, 42, false, true).unwrap();
        assert_eq!(approval.inline_keyboard.len(), 1);
    }
}
