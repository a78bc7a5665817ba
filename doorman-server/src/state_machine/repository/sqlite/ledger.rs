//! Pending-message ledger operations for the SQLite repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, ToSql};
use tracing::warn;

use super::super::{MessageKind, PendingMessage, RepositoryError, PAGE_SIZE};
use super::{from_millis, parse_member_id, storage, to_millis};
use crate::state_machine::state::MemberId;

const PENDING_COLUMNS: &str = "group_id, message_id, kind, member_id, created_at";

struct PendingRow {
    group_id: i64,
    message_id: i64,
    kind: String,
    member_id: String,
    created_at: i64,
}

impl PendingRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            group_id: row.get(0)?,
            message_id: row.get(1)?,
            kind: row.get(2)?,
            member_id: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_pending(self) -> Result<PendingMessage, RepositoryError> {
        let kind = MessageKind::parse(&self.kind)
            .ok_or_else(|| RepositoryError::corruption(format!("message kind '{}'", self.kind)))?;
        Ok(PendingMessage {
            group_id: self.group_id,
            message_id: self.message_id,
            kind,
            member_id: parse_member_id(&self.member_id)?,
            created_at: from_millis(self.created_at, "pending created_at")?,
        })
    }
}

fn page_limit() -> i64 {
    i64::try_from(PAGE_SIZE).unwrap_or(i64::MAX)
}

/// Decode rows, returning the keys of any that fail to decode.
fn collect_rows<I>(
    rows: I,
    operation: &'static str,
) -> Result<(Vec<PendingMessage>, Vec<(i64, i64)>), RepositoryError>
where
    I: Iterator<Item = rusqlite::Result<PendingRow>>,
{
    let mut messages = Vec::new();
    let mut corrupt = Vec::new();
    for row in rows {
        let row = row.map_err(storage(operation))?;
        let (group_id, message_id) = (row.group_id, row.message_id);
        match row.into_pending() {
            Ok(message) => messages.push(message),
            Err(e) => {
                warn!(group_id, message_id, error = %e, "dropping corrupt ledger row");
                corrupt.push((group_id, message_id));
            }
        }
    }
    Ok((messages, corrupt))
}

/// Run a page query, purging undecodable rows and re-reading until the page
/// decodes cleanly. Corrupt rows would otherwise hold their place at the head
/// of every page.
fn read_page(
    conn: &mut Connection,
    sql: &str,
    args: &[&dyn ToSql],
    operation: &'static str,
) -> Result<Vec<PendingMessage>, RepositoryError> {
    let tx = conn.transaction().map_err(storage(operation))?;
    let messages = loop {
        let (messages, corrupt) = {
            let mut stmt = tx.prepare_cached(sql).map_err(storage(operation))?;
            let rows = stmt
                .query_map(args, PendingRow::read)
                .map_err(storage(operation))?;
            collect_rows(rows, operation)?
        };
        if corrupt.is_empty() {
            break messages;
        }
        delete_keys(&tx, &corrupt, operation)?;
    };
    tx.commit().map_err(storage(operation))?;
    Ok(messages)
}

fn delete_keys(
    conn: &Connection,
    keys: &[(i64, i64)],
    operation: &'static str,
) -> Result<(), RepositoryError> {
    let mut stmt = conn
        .prepare_cached("DELETE FROM pending_messages WHERE group_id = ?1 AND message_id = ?2")
        .map_err(storage(operation))?;
    for (group_id, message_id) in keys {
        stmt.execute(params![group_id, message_id])
            .map_err(storage(operation))?;
    }
    Ok(())
}

pub(super) fn add_sync(conn: &mut Connection, message: &PendingMessage) -> Result<(), RepositoryError> {
    conn.execute(
        "INSERT OR IGNORE INTO pending_messages (group_id, message_id, kind, member_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.group_id,
            message.message_id,
            message.kind.as_str(),
            message.member_id.to_string(),
            to_millis(message.created_at),
        ],
    )
    .map_err(storage("add_pending"))?;
    Ok(())
}

pub(super) fn list_for_member_sync(
    conn: &mut Connection,
    member_id: MemberId,
    group_id: i64,
    kind: MessageKind,
) -> Result<Vec<PendingMessage>, RepositoryError> {
    let sql = format!(
        "SELECT {} FROM pending_messages
         WHERE member_id = ?1 AND group_id = ?2 AND kind = ?3
         ORDER BY created_at, message_id
         LIMIT ?4",
        PENDING_COLUMNS
    );
    read_page(
        conn,
        &sql,
        params![member_id.to_string(), group_id, kind.as_str(), page_limit()],
        "list_for_member",
    )
}

pub(super) fn list_older_than_sync(
    conn: &mut Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<PendingMessage>, RepositoryError> {
    let sql = format!(
        "SELECT {} FROM pending_messages
         WHERE created_at <= ?1
         ORDER BY created_at, group_id, message_id
         LIMIT ?2",
        PENDING_COLUMNS
    );
    read_page(
        conn,
        &sql,
        params![to_millis(cutoff), page_limit()],
        "list_older_than",
    )
}

pub(super) fn delete_batch_sync(
    conn: &mut Connection,
    keys: &[(i64, i64)],
) -> Result<(), RepositoryError> {
    let tx = conn.transaction().map_err(storage("begin delete_batch"))?;
    delete_keys(&tx, keys, "delete_batch")?;
    tx.commit().map_err(storage("commit delete_batch"))?;
    Ok(())
}
