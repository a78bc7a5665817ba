//! Periodic refresh of the cached bot role and admin list per group.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::platform::ChatDirectory;
use crate::state_machine::repository::{GroupState, IdentityStore};

/// Refresh every known group. Returns how many groups were synced.
pub async fn sync_admins_once(
    store: &dyn IdentityStore,
    directory: &dyn ChatDirectory,
    now: DateTime<Utc>,
) -> usize {
    let groups = match store.list_groups().await {
        Ok(groups) => groups,
        Err(e) => {
            error!(error = %e, "Failed to list groups for admin sync");
            return 0;
        }
    };

    let mut synced = 0;
    for group in groups.into_iter().filter(GroupState::is_group) {
        let group_id = group.group_id;
        match sync_group(store, directory, group, now).await {
            Ok(()) => synced += 1,
            Err(e) => warn!(group_id, error = %e, "Failed to sync admins"),
        }
    }

    debug!(synced, "Admin sync finished");
    synced
}

async fn sync_group(
    store: &dyn IdentityStore,
    directory: &dyn ChatDirectory,
    mut group: GroupState,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let role = directory.bot_role(group.group_id).await?;
    let admins = directory.admin_ids(group.group_id).await?;

    if group.bot_role != Some(role) {
        info!(group_id = group.group_id, %role, "bot role changed");
    }
    group.bot_role = Some(role);
    group.admin_ids = admins;
    group.admins_synced_at = Some(now);
    store.update_group(&group).await?;
    Ok(())
}

/// Run [`sync_admins_once`] immediately and then every `period` until cancelled.
pub async fn admin_sync_loop(
    store: Arc<dyn IdentityStore>,
    directory: Arc<dyn ChatDirectory>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                sync_admins_once(store.as_ref(), directory.as_ref(), Utc::now()).await;
            }
        }
    }
    info!("Admin sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::repository::InMemoryRepository;
    use crate::testing::FakeDirectory;
    use doorman_core::telegram::{ChatKind, ChatRole};

    #[tokio::test]
    async fn test_sync_updates_groups_and_skips_failures() {
        let repo = InMemoryRepository::new();
        repo.get_or_create_group(-1, ChatKind::Supergroup).await.unwrap();
        repo.get_or_create_group(-2, ChatKind::Group).await.unwrap();
        repo.get_or_create_group(42, ChatKind::Private).await.unwrap();

        let mut directory = FakeDirectory::default();
        directory.roles.insert(-1, ChatRole::Administrator);
        directory.admins.insert(-1, vec![7, 8]);
        // -2 is unknown to the directory and fails.

        let now = Utc::now();
        let synced = sync_admins_once(&repo, &directory, now).await;
        assert_eq!(synced, 1);

        let groups = repo.list_groups().await.unwrap();
        let first = groups.iter().find(|g| g.group_id == -1).unwrap();
        assert_eq!(first.bot_role, Some(ChatRole::Administrator));
        assert_eq!(first.admin_ids, vec![7, 8]);
        assert_eq!(first.admins_synced_at, Some(now));

        let second = groups.iter().find(|g| g.group_id == -2).unwrap();
        assert_eq!(second.admins_synced_at, None);
    }
}
