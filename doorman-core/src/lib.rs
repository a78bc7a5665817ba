pub mod http_log;
pub mod oauth;
pub mod telegram;

pub use http_log::{RequestLogMiddleware, Sanitizer};
pub use oauth::{CtfTimeClient, OAuthSettings, StateDecodeError, VerificationState};
pub use telegram::{TelegramClient, TelegramError};
