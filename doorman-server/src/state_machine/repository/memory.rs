//! In-memory implementation of the repository traits.
//!
//! All state is held in `HashMap`s behind `RwLock`s and lost on restart.
//! Each operation takes the relevant write lock once, so the same atomicity
//! guarantees as the SQLite backend hold within one process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use doorman_core::telegram::ChatKind;
use tokio::sync::RwLock;

use super::{
    GroupState, IdentityStore, Member, MessageKind, PendingLedger, PendingMessage,
    RepositoryError, PAGE_SIZE,
};
use crate::state_machine::state::{MemberId, MemberKey, MemberStatus};

#[derive(Default)]
struct Members {
    by_id: HashMap<MemberId, Member>,
    by_key: HashMap<MemberKey, MemberId>,
}

pub struct InMemoryRepository {
    members: RwLock<Members>,
    groups: RwLock<HashMap<i64, GroupState>>,
    cursor: RwLock<Option<i64>>,
    pending: RwLock<HashMap<(i64, i64), PendingMessage>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(Members::default()),
            groups: RwLock::new(HashMap::new()),
            cursor: RwLock::new(None),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Number of member rows, for assertions in tests.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.by_id.len()
    }

    /// Number of ledger rows, for assertions in tests.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    async fn update_member<F>(&self, id: MemberId, f: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut Member) + Send,
    {
        let mut members = self.members.write().await;
        let member = members
            .by_id
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::not_found(format!("member {}", id)))?;
        f(member);
        member.updated_at = Utc::now();
        Ok(())
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityStore for InMemoryRepository {
    async fn get_or_create_member(
        &self,
        key: MemberKey,
        default_status: MemberStatus,
    ) -> Result<(Member, bool), RepositoryError> {
        let mut members = self.members.write().await;
        if let Some(id) = members.by_key.get(&key) {
            let member = members
                .by_id
                .get(id)
                .cloned()
                .ok_or_else(|| RepositoryError::corruption(format!("dangling key {}", key)))?;
            return Ok((member, false));
        }

        let now = Utc::now();
        let member = Member {
            id: MemberId::new(),
            key,
            provider_id: None,
            status: default_status,
            present: true,
            created_at: now,
            updated_at: now,
        };
        members.by_key.insert(key, member.id);
        members.by_id.insert(member.id, member.clone());
        Ok((member, true))
    }

    async fn get_member(&self, key: MemberKey) -> Result<Member, RepositoryError> {
        let members = self.members.read().await;
        members
            .by_key
            .get(&key)
            .and_then(|id| members.by_id.get(id))
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(format!("member {}", key)))
    }

    async fn get_member_by_id(&self, id: MemberId) -> Result<Member, RepositoryError> {
        let members = self.members.read().await;
        members
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(format!("member {}", id)))
    }

    async fn set_status(&self, id: MemberId, status: MemberStatus) -> Result<(), RepositoryError> {
        self.update_member(id, |m| m.status = status).await
    }

    async fn record_verification(
        &self,
        id: MemberId,
        provider_id: i64,
    ) -> Result<(), RepositoryError> {
        self.update_member(id, |m| {
            m.provider_id = Some(provider_id);
            m.status = MemberStatus::Active;
        })
        .await
    }

    async fn claim_presence(&self, id: MemberId) -> Result<bool, RepositoryError> {
        let mut members = self.members.write().await;
        let member = members
            .by_id
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::not_found(format!("member {}", id)))?;
        if member.present {
            return Ok(false);
        }
        member.present = true;
        member.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_absent(&self, id: MemberId) -> Result<(), RepositoryError> {
        self.update_member(id, |m| m.present = false).await
    }

    async fn get_or_create_group(
        &self,
        group_id: i64,
        kind: ChatKind,
    ) -> Result<GroupState, RepositoryError> {
        let mut groups = self.groups.write().await;
        Ok(groups
            .entry(group_id)
            .or_insert_with(|| GroupState::new(group_id, kind))
            .clone())
    }

    async fn update_group(&self, state: &GroupState) -> Result<(), RepositoryError> {
        let mut groups = self.groups.write().await;
        groups.insert(state.group_id, state.clone());
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<GroupState>, RepositoryError> {
        let groups = self.groups.read().await;
        let mut all: Vec<GroupState> = groups.values().cloned().collect();
        all.sort_by_key(|g| g.group_id);
        Ok(all)
    }

    async fn load_cursor(&self) -> Result<Option<i64>, RepositoryError> {
        Ok(*self.cursor.read().await)
    }

    async fn save_cursor(&self, update_id: i64) -> Result<(), RepositoryError> {
        let mut cursor = self.cursor.write().await;
        if cursor.map_or(true, |current| update_id > current) {
            *cursor = Some(update_id);
        }
        Ok(())
    }
}

#[async_trait]
impl PendingLedger for InMemoryRepository {
    async fn add(&self, message: &PendingMessage) -> Result<(), RepositoryError> {
        let mut pending = self.pending.write().await;
        pending
            .entry((message.group_id, message.message_id))
            .or_insert_with(|| message.clone());
        Ok(())
    }

    async fn list_for_member(
        &self,
        member_id: MemberId,
        group_id: i64,
        kind: MessageKind,
    ) -> Result<Vec<PendingMessage>, RepositoryError> {
        let pending = self.pending.read().await;
        let mut found: Vec<PendingMessage> = pending
            .values()
            .filter(|m| m.member_id == member_id && m.group_id == group_id && m.kind == kind)
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.created_at, m.message_id));
        found.truncate(PAGE_SIZE);
        Ok(found)
    }

    async fn list_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingMessage>, RepositoryError> {
        let pending = self.pending.read().await;
        let mut found: Vec<PendingMessage> = pending
            .values()
            .filter(|m| m.created_at <= cutoff)
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.created_at, m.group_id, m.message_id));
        found.truncate(PAGE_SIZE);
        Ok(found)
    }

    async fn delete_batch(&self, messages: &[PendingMessage]) -> Result<(), RepositoryError> {
        let mut pending = self.pending.write().await;
        for message in messages {
            pending.remove(&(message.group_id, message.message_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key() -> MemberKey {
        MemberKey::new(-100, 42)
    }

    #[tokio::test]
    async fn test_get_or_create_reports_creation_once() {
        let repo = InMemoryRepository::new();
        let (first, created) = repo
            .get_or_create_member(key(), MemberStatus::JustJoined)
            .await
            .unwrap();
        let (second, created_again) = repo
            .get_or_create_member(key(), MemberStatus::Active)
            .await
            .unwrap();

        assert!(created);
        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, MemberStatus::JustJoined);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_member() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.get_or_create_member(key(), MemberStatus::JustJoined)
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let (member, was_created) = handle.await.unwrap();
            ids.push(member.id);
            created += usize::from(was_created);
        }

        assert_eq!(created, 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(repo.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_presence_claim_is_exclusive() {
        let repo = InMemoryRepository::new();
        let (member, _) = repo
            .get_or_create_member(key(), MemberStatus::JustJoined)
            .await
            .unwrap();

        // Born present: nobody else can claim this arrival.
        assert!(!repo.claim_presence(member.id).await.unwrap());

        repo.mark_absent(member.id).await.unwrap();
        assert!(repo.claim_presence(member.id).await.unwrap());
        assert!(!repo.claim_presence(member.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_verification_sets_active() {
        let repo = InMemoryRepository::new();
        let (member, _) = repo
            .get_or_create_member(key(), MemberStatus::JustJoined)
            .await
            .unwrap();

        repo.record_verification(member.id, 1337).await.unwrap();

        let member = repo.get_member_by_id(member.id).await.unwrap();
        assert_eq!(member.status, MemberStatus::Active);
        assert_eq!(member.provider_id, Some(1337));
    }

    #[tokio::test]
    async fn test_missing_member_is_not_found() {
        let repo = InMemoryRepository::new();
        let err = repo.get_member(key()).await.unwrap_err();
        assert!(err.is_not_found());
        let err = repo
            .set_status(MemberId::new(), MemberStatus::Active)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let repo = InMemoryRepository::new();
        assert_eq!(repo.load_cursor().await.unwrap(), None);
        repo.save_cursor(10).await.unwrap();
        repo.save_cursor(7).await.unwrap();
        assert_eq!(repo.load_cursor().await.unwrap(), Some(10));
        repo.save_cursor(11).await.unwrap();
        assert_eq!(repo.load_cursor().await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn test_ledger_lists_oldest_first_up_to_cutoff() {
        let repo = InMemoryRepository::new();
        let member_id = MemberId::new();
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for (message_id, offset) in [(3, 30), (1, 10), (2, 20), (4, 40)] {
            repo.add(&PendingMessage {
                group_id: -100,
                message_id,
                kind: MessageKind::Greeting,
                member_id,
                created_at: base + chrono::Duration::seconds(offset),
            })
            .await
            .unwrap();
        }

        let old = repo
            .list_older_than(base + chrono::Duration::seconds(30))
            .await
            .unwrap();
        let ids: Vec<i64> = old.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        repo.delete_batch(&old).await.unwrap();
        assert_eq!(repo.pending_count().await, 1);
    }
}
