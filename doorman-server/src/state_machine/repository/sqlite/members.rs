//! Member, group and cursor operations for the SQLite repository.

use chrono::{DateTime, Utc};
use doorman_core::telegram::{ChatKind, ChatRole};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::super::{GroupState, Member, RepositoryError};
use super::{from_millis, parse_member_id, storage, to_millis};
use crate::state_machine::state::{MemberId, MemberKey, MemberStatus};

const MEMBER_COLUMNS: &str =
    "id, group_id, external_id, provider_id, status, present, created_at, updated_at";

/// Raw column values, converted outside the rusqlite row closure so that
/// corrupt values surface as `RepositoryError::Corruption`.
struct MemberRow {
    id: String,
    group_id: i64,
    external_id: i64,
    provider_id: Option<i64>,
    status: String,
    present: bool,
    created_at: i64,
    updated_at: i64,
}

impl MemberRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            external_id: row.get(2)?,
            provider_id: row.get(3)?,
            status: row.get(4)?,
            present: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_member(self) -> Result<Member, RepositoryError> {
        let status = MemberStatus::parse(&self.status).ok_or_else(|| {
            RepositoryError::corruption(format!("member status '{}'", self.status))
        })?;
        Ok(Member {
            id: parse_member_id(&self.id)?,
            key: MemberKey::new(self.group_id, self.external_id),
            provider_id: self.provider_id,
            status,
            present: self.present,
            created_at: from_millis(self.created_at, "member created_at")?,
            updated_at: from_millis(self.updated_at, "member updated_at")?,
        })
    }
}

fn select_by_key(conn: &Connection, key: MemberKey) -> Result<Option<Member>, RepositoryError> {
    let sql = format!(
        "SELECT {} FROM members WHERE group_id = ?1 AND external_id = ?2",
        MEMBER_COLUMNS
    );
    conn.query_row(&sql, params![key.group_id, key.external_id], MemberRow::read)
        .optional()
        .map_err(storage("get_member"))?
        .map(MemberRow::into_member)
        .transpose()
}

/// Read, insert-if-missing, re-read, all inside one IMMEDIATE transaction.
///
/// `INSERT ... ON CONFLICT DO NOTHING` plus `changes()` decides who created
/// the row, so concurrent callers (even from another process) agree on a
/// single member and exactly one of them sees `created = true`.
pub(super) fn get_or_create_member_sync(
    conn: &mut Connection,
    key: MemberKey,
    default_status: MemberStatus,
    now: DateTime<Utc>,
) -> Result<(Member, bool), RepositoryError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(storage("begin get_or_create_member"))?;

    if let Some(member) = select_by_key(&tx, key)? {
        tx.commit().map_err(storage("commit get_or_create_member"))?;
        return Ok((member, false));
    }

    let now = to_millis(now);
    tx.execute(
        "INSERT INTO members (id, group_id, external_id, provider_id, status, present, created_at, updated_at)
         VALUES (?1, ?2, ?3, NULL, ?4, 1, ?5, ?5)
         ON CONFLICT(group_id, external_id) DO NOTHING",
        params![
            MemberId::new().to_string(),
            key.group_id,
            key.external_id,
            default_status.as_str(),
            now
        ],
    )
    .map_err(storage("insert member"))?;
    let created = tx.changes() > 0;

    let member = select_by_key(&tx, key)?
        .ok_or_else(|| RepositoryError::storage("get_or_create_member", "row vanished"))?;
    tx.commit().map_err(storage("commit get_or_create_member"))?;

    Ok((member, created))
}

pub(super) fn get_member_sync(
    conn: &mut Connection,
    key: MemberKey,
) -> Result<Option<Member>, RepositoryError> {
    select_by_key(conn, key)
}

pub(super) fn get_member_by_id_sync(
    conn: &mut Connection,
    id: MemberId,
) -> Result<Option<Member>, RepositoryError> {
    let sql = format!("SELECT {} FROM members WHERE id = ?1", MEMBER_COLUMNS);
    conn.query_row(&sql, params![id.to_string()], MemberRow::read)
        .optional()
        .map_err(storage("get_member_by_id"))?
        .map(MemberRow::into_member)
        .transpose()
}

fn ensure_updated(changed: usize, id: MemberId) -> Result<(), RepositoryError> {
    if changed == 0 {
        Err(RepositoryError::not_found(format!("member {}", id)))
    } else {
        Ok(())
    }
}

pub(super) fn set_status_sync(
    conn: &mut Connection,
    id: MemberId,
    status: MemberStatus,
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    let changed = conn
        .execute(
            "UPDATE members SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), to_millis(now), id.to_string()],
        )
        .map_err(storage("set_status"))?;
    ensure_updated(changed, id)
}

pub(super) fn record_verification_sync(
    conn: &mut Connection,
    id: MemberId,
    provider_id: i64,
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    let changed = conn
        .execute(
            "UPDATE members SET provider_id = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                provider_id,
                MemberStatus::Active.as_str(),
                to_millis(now),
                id.to_string()
            ],
        )
        .map_err(storage("record_verification"))?;
    ensure_updated(changed, id)
}

/// Set `present` to `value` if it differs. Returns whether this call changed it.
pub(super) fn set_presence_sync(
    conn: &mut Connection,
    id: MemberId,
    value: bool,
    now: DateTime<Utc>,
) -> Result<bool, RepositoryError> {
    let changed = conn
        .execute(
            "UPDATE members SET present = ?1, updated_at = ?2 WHERE id = ?3 AND present <> ?1",
            params![value, to_millis(now), id.to_string()],
        )
        .map_err(storage("set_presence"))?;
    if changed > 0 {
        return Ok(true);
    }

    let exists: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM members WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get(0),
        )
        .map_err(storage("set_presence"))?;
    if exists {
        Ok(false)
    } else {
        Err(RepositoryError::not_found(format!("member {}", id)))
    }
}

// =============================================================================
// Groups
// =============================================================================

struct GroupRow {
    group_id: i64,
    kind: String,
    bot_role: Option<String>,
    admin_ids: String,
    admins_synced_at: Option<i64>,
}

impl GroupRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            group_id: row.get(0)?,
            kind: row.get(1)?,
            bot_role: row.get(2)?,
            admin_ids: row.get(3)?,
            admins_synced_at: row.get(4)?,
        })
    }

    fn into_group(self) -> Result<GroupState, RepositoryError> {
        let bot_role = match self.bot_role {
            Some(raw) => Some(
                ChatRole::parse(&raw)
                    .ok_or_else(|| RepositoryError::corruption(format!("bot role '{}'", raw)))?,
            ),
            None => None,
        };
        let admin_ids: Vec<i64> = serde_json::from_str(&self.admin_ids)
            .map_err(|_| RepositoryError::corruption("group admin list JSON"))?;
        let admins_synced_at = self
            .admins_synced_at
            .map(|millis| from_millis(millis, "admins_synced_at"))
            .transpose()?;

        Ok(GroupState {
            group_id: self.group_id,
            kind: ChatKind::parse(&self.kind),
            bot_role,
            admin_ids,
            admins_synced_at,
        })
    }
}

const GROUP_COLUMNS: &str = "group_id, kind, bot_role, admin_ids, admins_synced_at";

pub(super) fn get_or_create_group_sync(
    conn: &mut Connection,
    group_id: i64,
    kind: ChatKind,
) -> Result<GroupState, RepositoryError> {
    conn.execute(
        "INSERT INTO chat_groups (group_id, kind) VALUES (?1, ?2)
         ON CONFLICT(group_id) DO NOTHING",
        params![group_id, kind.as_str()],
    )
    .map_err(storage("insert group"))?;

    let sql = format!("SELECT {} FROM chat_groups WHERE group_id = ?1", GROUP_COLUMNS);
    conn.query_row(&sql, params![group_id], GroupRow::read)
        .map_err(storage("get_or_create_group"))?
        .into_group()
}

pub(super) fn update_group_sync(
    conn: &mut Connection,
    state: &GroupState,
) -> Result<(), RepositoryError> {
    let admin_ids = serde_json::to_string(&state.admin_ids)
        .map_err(|e| RepositoryError::storage("serialize admin list", e.to_string()))?;
    conn.execute(
        "INSERT INTO chat_groups (group_id, kind, bot_role, admin_ids, admins_synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(group_id) DO UPDATE SET
             kind = excluded.kind,
             bot_role = excluded.bot_role,
             admin_ids = excluded.admin_ids,
             admins_synced_at = excluded.admins_synced_at",
        params![
            state.group_id,
            state.kind.as_str(),
            state.bot_role.map(|role| role.as_str()),
            admin_ids,
            state.admins_synced_at.map(to_millis),
        ],
    )
    .map_err(storage("update_group"))?;
    Ok(())
}

pub(super) fn list_groups_sync(conn: &mut Connection) -> Result<Vec<GroupState>, RepositoryError> {
    let sql = format!("SELECT {} FROM chat_groups ORDER BY group_id", GROUP_COLUMNS);
    let mut stmt = conn.prepare(&sql).map_err(storage("list_groups"))?;
    let rows = stmt
        .query_map([], GroupRow::read)
        .map_err(storage("list_groups"))?;

    let mut groups = Vec::new();
    for row in rows {
        let row = row.map_err(storage("list_groups"))?;
        let group_id = row.group_id;
        match row.into_group() {
            Ok(group) => groups.push(group),
            Err(e) => tracing::warn!(group_id, error = %e, "skipping corrupt group row"),
        }
    }
    Ok(groups)
}
