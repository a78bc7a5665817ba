//! State types for the member verification state machine.
//!
//! A member's lifecycle is captured by [`MemberStatus`]. Everything the
//! transition function needs besides the status travels either in the event
//! or in the [`Policy`], so the machine itself never reads a clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Opaque, stable identifier of a member row.
///
/// This is what the OAuth `state` carries, never the Telegram user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(pub Uuid);

impl MemberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemberId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Natural key of a member: a Telegram user inside one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberKey {
    pub group_id: i64,
    pub external_id: i64,
}

impl MemberKey {
    pub fn new(group_id: i64, external_id: i64) -> Self {
        Self {
            group_id,
            external_id,
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.external_id, self.group_id)
    }
}

/// Verification status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Joined and has not verified yet. Messages are deleted.
    JustJoined,
    /// Verified, or was already speaking before the bot arrived.
    Active,
    /// Set by operators only. Messages are deleted, joins are not greeted.
    Banned,
    /// Removed for not verifying (or by an admin). May join again.
    Kicked,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JustJoined => "just_joined",
            Self::Active => "active",
            Self::Banned => "banned",
            Self::Kicked => "kicked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "just_joined" => Some(Self::JustJoined),
            "active" => Some(Self::Active),
            "banned" => Some(Self::Banned),
            "kicked" => Some(Self::Kicked),
            _ => None,
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in a chat, addressed the way the Bot API addresses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

impl MessageRef {
    pub fn new(chat_id: i64, message_id: i64) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat_id, self.message_id)
    }
}

/// What happens when a previously kicked member joins again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejoinPolicy {
    /// Start over: greet with a fresh login link and a fresh deadline.
    #[default]
    Reverify,
    /// Stay kicked until an admin accepts them from the greeting.
    AdminApproval,
}

impl FromStr for RejoinPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reverify" => Ok(Self::Reverify),
            "admin_approval" => Ok(Self::AdminApproval),
            other => Err(format!(
                "unknown rejoin policy '{}', expected 'reverify' or 'admin_approval'",
                other
            )),
        }
    }
}

/// Static knobs consulted by the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub join_timeout: Duration,
    pub rejoin: RejoinPolicy,
    /// Attach admin Accept/Kick buttons to greetings.
    pub admin_buttons: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10 * 60),
            rejoin: RejoinPolicy::default(),
            admin_buttons: true,
        }
    }
}

/// Whether a greeting created at `created_at` has outlived `timeout` at `now`.
///
/// Monotone in `now`: once true, it stays true for every later instant.
pub fn deadline_passed(created_at: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
    match created_at.checked_add_signed(timeout) {
        Some(deadline) => now >= deadline,
        None => false,
    }
}
