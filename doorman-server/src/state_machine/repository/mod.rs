//! Persistence for members, groups, the update cursor and bot-authored messages.
//!
//! Two traits split the storage by owner: [`IdentityStore`] owns members,
//! group state and the global cursor; [`PendingLedger`] owns the greetings
//! that are waiting for cleanup or for their deadline. Both are implemented
//! by [`SqliteRepository`] for production and [`InMemoryRepository`] for tests.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use doorman_core::telegram::{ChatKind, ChatRole};
use thiserror::Error;

use super::state::{MemberId, MemberKey, MemberStatus, MessageRef};

/// Page size for ledger listings.
pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("corrupt data in store: {what}")]
    Corruption { what: String },
}

impl RepositoryError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A Telegram user inside one moderated group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub key: MemberKey,
    /// CTFtime user id, set on verification.
    pub provider_id: Option<i64>,
    pub status: MemberStatus,
    /// Whether the member is currently counted as being in the group.
    /// Flipped false→true by exactly one observer per arrival.
    pub present: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cached facts about a chat. Advisory: staleness only affects admin checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupState {
    pub group_id: i64,
    pub kind: ChatKind,
    pub bot_role: Option<ChatRole>,
    pub admin_ids: Vec<i64>,
    pub admins_synced_at: Option<DateTime<Utc>>,
}

impl GroupState {
    pub fn new(group_id: i64, kind: ChatKind) -> Self {
        Self {
            group_id,
            kind,
            bot_role: None,
            admin_ids: Vec::new(),
            admins_synced_at: None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind.is_group()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Greeting,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "greeting" => Some(Self::Greeting),
            _ => None,
        }
    }
}

/// A bot-authored message tied to a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub group_id: i64,
    pub message_id: i64,
    pub kind: MessageKind,
    pub member_id: MemberId,
    pub created_at: DateTime<Utc>,
}

impl PendingMessage {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef::new(self.group_id, self.message_id)
    }
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Return the member, creating it with `default_status` if missing.
    ///
    /// The flag is true only for the caller whose insert created the row.
    /// Concurrent callers for the same key all see the same member.
    async fn get_or_create_member(
        &self,
        key: MemberKey,
        default_status: MemberStatus,
    ) -> Result<(Member, bool), RepositoryError>;

    async fn get_member(&self, key: MemberKey) -> Result<Member, RepositoryError>;

    async fn get_member_by_id(&self, id: MemberId) -> Result<Member, RepositoryError>;

    async fn set_status(&self, id: MemberId, status: MemberStatus) -> Result<(), RepositoryError>;

    /// Store the provider id and set the status to Active in one write.
    async fn record_verification(
        &self,
        id: MemberId,
        provider_id: i64,
    ) -> Result<(), RepositoryError>;

    /// Conditionally flip `present` from false to true. Returns whether this
    /// call did the flip.
    async fn claim_presence(&self, id: MemberId) -> Result<bool, RepositoryError>;

    async fn mark_absent(&self, id: MemberId) -> Result<(), RepositoryError>;

    async fn get_or_create_group(
        &self,
        group_id: i64,
        kind: ChatKind,
    ) -> Result<GroupState, RepositoryError>;

    async fn update_group(&self, state: &GroupState) -> Result<(), RepositoryError>;

    async fn list_groups(&self) -> Result<Vec<GroupState>, RepositoryError>;

    async fn load_cursor(&self) -> Result<Option<i64>, RepositoryError>;

    /// Advance the cursor. Never moves it backwards.
    async fn save_cursor(&self, update_id: i64) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait PendingLedger: Send + Sync {
    /// Record a message. Adding the same `(group_id, message_id)` twice is a no-op.
    async fn add(&self, message: &PendingMessage) -> Result<(), RepositoryError>;

    /// Up to [`PAGE_SIZE`] messages of `kind` for a member in a group.
    async fn list_for_member(
        &self,
        member_id: MemberId,
        group_id: i64,
        kind: MessageKind,
    ) -> Result<Vec<PendingMessage>, RepositoryError>;

    /// Up to [`PAGE_SIZE`] messages with `created_at <= cutoff`, oldest first.
    ///
    /// Listings drop rows that cannot be decoded instead of returning them.
    async fn list_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingMessage>, RepositoryError>;

    async fn delete_batch(&self, messages: &[PendingMessage]) -> Result<(), RepositoryError>;
}
