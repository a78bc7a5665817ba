//! SQLite implementation of `IdentityStore` and `PendingLedger`.
//!
//! The bot and the OAuth callback API run as separate processes sharing one
//! database file, so every multi-step operation runs inside an IMMEDIATE
//! transaction or is a single conditional statement.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.

mod ledger;
mod members;


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use doorman_core::telegram::ChatKind;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{
    GroupState, IdentityStore, Member, MessageKind, PendingLedger, PendingMessage,
    RepositoryError,
};
use crate::state_machine::state::{MemberId, MemberKey, MemberStatus};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
#[derive(Clone)]
pub struct SqliteRepository {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` so the bot and API processes can share the file
    /// - `synchronous = FULL` for maximum durability
    /// - `busy_timeout = 5000ms` to wait out the other process's write lock
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();

        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";
        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;

                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let dir_permissions = std::fs::Permissions::from_mode(0o700);
                        if let Err(e) = std::fs::set_permissions(parent, dir_permissions) {
                            warn!(
                                "Failed to set restrictive permissions on state directory: {}",
                                e
                            );
                        }
                    }
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // Members' provider ids are personal data.
        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite silently keeps DELETE mode on filesystems without shared
        // memory support; two processes on such a file would corrupt it.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'. \
                     The database must live on a filesystem that supports shared memory.",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS members (
                    id TEXT PRIMARY KEY,
                    group_id INTEGER NOT NULL,
                    external_id INTEGER NOT NULL,
                    provider_id INTEGER,
                    status TEXT NOT NULL,
                    present INTEGER NOT NULL DEFAULT 1,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    UNIQUE (group_id, external_id)
                );

                CREATE TABLE IF NOT EXISTS chat_groups (
                    group_id INTEGER PRIMARY KEY,
                    kind TEXT NOT NULL,
                    bot_role TEXT,
                    admin_ids TEXT NOT NULL DEFAULT '[]',
                    admins_synced_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS pending_messages (
                    group_id INTEGER NOT NULL,
                    message_id INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    member_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (group_id, message_id)
                );

                CREATE INDEX IF NOT EXISTS idx_pending_member
                    ON pending_messages(member_id, group_id, kind);
                CREATE INDEX IF NOT EXISTS idx_pending_created
                    ON pending_messages(created_at);

                CREATE TABLE IF NOT EXISTS global_cursor (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    last_update_id INTEGER NOT NULL
                );
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection lock poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

// =============================================================================
// Conversion helpers
// =============================================================================

pub(super) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(super) fn from_millis(millis: i64, what: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| RepositoryError::corruption(format!("{} timestamp {}", what, millis)))
}

pub(super) fn parse_member_id(raw: &str) -> Result<MemberId, RepositoryError> {
    raw.parse()
        .map_err(|_| RepositoryError::corruption(format!("member id '{}'", raw)))
}

/// Map a rusqlite error for `operation`.
pub(super) fn storage(operation: &'static str) -> impl Fn(rusqlite::Error) -> RepositoryError {
    move |e| RepositoryError::storage(operation, e.to_string())
}

// =============================================================================
// Trait implementations
// =============================================================================

#[async_trait]
impl IdentityStore for SqliteRepository {
    async fn get_or_create_member(
        &self,
        key: MemberKey,
        default_status: MemberStatus,
    ) -> Result<(Member, bool), RepositoryError> {
        self.run("get_or_create_member", move |conn| {
            members::get_or_create_member_sync(conn, key, default_status, Utc::now())
        })
        .await
    }

    async fn get_member(&self, key: MemberKey) -> Result<Member, RepositoryError> {
        self.run("get_member", move |conn| {
            members::get_member_sync(conn, key)?
                .ok_or_else(|| RepositoryError::not_found(format!("member {}", key)))
        })
        .await
    }

    async fn get_member_by_id(&self, id: MemberId) -> Result<Member, RepositoryError> {
        self.run("get_member_by_id", move |conn| {
            members::get_member_by_id_sync(conn, id)?
                .ok_or_else(|| RepositoryError::not_found(format!("member {}", id)))
        })
        .await
    }

    async fn set_status(&self, id: MemberId, status: MemberStatus) -> Result<(), RepositoryError> {
        self.run("set_status", move |conn| {
            members::set_status_sync(conn, id, status, Utc::now())
        })
        .await
    }

    async fn record_verification(
        &self,
        id: MemberId,
        provider_id: i64,
    ) -> Result<(), RepositoryError> {
        self.run("record_verification", move |conn| {
            members::record_verification_sync(conn, id, provider_id, Utc::now())
        })
        .await
    }

    async fn claim_presence(&self, id: MemberId) -> Result<bool, RepositoryError> {
        self.run("claim_presence", move |conn| {
            members::set_presence_sync(conn, id, true, Utc::now())
        })
        .await
    }

    async fn mark_absent(&self, id: MemberId) -> Result<(), RepositoryError> {
        self.run("mark_absent", move |conn| {
            members::set_presence_sync(conn, id, false, Utc::now()).map(|_| ())
        })
        .await
    }

    async fn get_or_create_group(
        &self,
        group_id: i64,
        kind: ChatKind,
    ) -> Result<GroupState, RepositoryError> {
        self.run("get_or_create_group", move |conn| {
            members::get_or_create_group_sync(conn, group_id, kind)
        })
        .await
    }

    async fn update_group(&self, state: &GroupState) -> Result<(), RepositoryError> {
        let state = state.clone();
        self.run("update_group", move |conn| {
            members::update_group_sync(conn, &state)
        })
        .await
    }

    async fn list_groups(&self) -> Result<Vec<GroupState>, RepositoryError> {
        self.run("list_groups", members::list_groups_sync).await
    }

    async fn load_cursor(&self) -> Result<Option<i64>, RepositoryError> {
        self.run("load_cursor", |conn| {
            conn.query_row(
                "SELECT last_update_id FROM global_cursor WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage("load_cursor"))
        })
        .await
    }

    async fn save_cursor(&self, update_id: i64) -> Result<(), RepositoryError> {
        self.run("save_cursor", move |conn| {
            conn.execute(
                "INSERT INTO global_cursor (id, last_update_id) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET last_update_id = excluded.last_update_id
                 WHERE excluded.last_update_id > global_cursor.last_update_id",
                params![update_id],
            )
            .map_err(storage("save_cursor"))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl PendingLedger for SqliteRepository {
    async fn add(&self, message: &PendingMessage) -> Result<(), RepositoryError> {
        let message = message.clone();
        self.run("add_pending", move |conn| ledger::add_sync(conn, &message))
            .await
    }

    async fn list_for_member(
        &self,
        member_id: MemberId,
        group_id: i64,
        kind: MessageKind,
    ) -> Result<Vec<PendingMessage>, RepositoryError> {
        self.run("list_for_member", move |conn| {
            ledger::list_for_member_sync(conn, member_id, group_id, kind)
        })
        .await
    }

    async fn list_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingMessage>, RepositoryError> {
        self.run("list_older_than", move |conn| {
            ledger::list_older_than_sync(conn, cutoff)
        })
        .await
    }

    async fn delete_batch(&self, messages: &[PendingMessage]) -> Result<(), RepositoryError> {
        if messages.is_empty() {
            return Ok(());
        }
        let keys: Vec<(i64, i64)> = messages
            .iter()
            .map(|m| (m.group_id, m.message_id))
            .collect();
        self.run("delete_batch", move |conn| {
            ledger::delete_batch_sync(conn, &keys)
        })
        .await
    }
}
