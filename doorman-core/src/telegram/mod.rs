//! Telegram Bot API client and object model.

mod client;
mod types;

pub use client::{DeleteOutcome, TelegramClient, TelegramError};
pub use types::*;
