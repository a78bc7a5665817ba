//! Deadline enforcement for greetings in the pending-message ledger.
//!
//! Each tick reads one page of greetings old enough for their deadline,
//! runs every row through the engine (kick if still unverified, otherwise
//! just remove the stale greeting), then deletes the whole page from the
//! ledger. Rows that fail are logged and still deleted; the greeting left
//! behind is only cosmetic. Rows that cannot be decoded are purged by the
//! ledger listing itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::state_machine::repository::PendingLedger;
use crate::state_machine::{Engine, MemberStatus};

/// Counters for one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub processed: usize,
    pub kicked: usize,
    pub failed: usize,
}

/// Handle one page of expired greetings.
pub async fn reconcile_once(
    engine: &Engine,
    ledger: &dyn PendingLedger,
    now: DateTime<Utc>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let timeout = chrono::Duration::from_std(engine.services().policy.join_timeout)
        .unwrap_or(chrono::Duration::MAX);
    let Some(cutoff) = now.checked_sub_signed(timeout) else {
        return report;
    };

    let page = match ledger.list_older_than(cutoff).await {
        Ok(page) => page,
        Err(e) => {
            error!(error = %e, "Failed to list expired greetings");
            return report;
        }
    };
    if page.is_empty() {
        return report;
    }

    info!(count = page.len(), "Enforcing greeting deadlines");
    for pending in &page {
        report.processed += 1;
        match engine.handle_deadline(pending, now).await {
            Ok(Some(outcome)) => {
                if outcome.previous == MemberStatus::JustJoined
                    && outcome.status == MemberStatus::Kicked
                {
                    report.kicked += 1;
                }
            }
            Ok(None) => {}
            Err(e) => {
                report.failed += 1;
                warn!(
                    group_id = pending.group_id,
                    message_id = pending.message_id,
                    member_id = %pending.member_id,
                    error = %e,
                    "Failed to enforce greeting deadline"
                );
            }
        }
    }

    if let Err(e) = ledger.delete_batch(&page).await {
        error!(error = %e, "Failed to delete processed greetings from ledger");
    }

    info!(
        processed = report.processed,
        kicked = report.kicked,
        failed = report.failed,
        "Deadline sweep finished"
    );
    report
}

/// Run [`reconcile_once`] immediately and then every `period` until cancelled.
/// Cancellation is observed between ticks, never in the middle of one.
pub async fn reconciliation_loop(
    engine: Arc<Engine>,
    ledger: Arc<dyn PendingLedger>,
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
                reconcile_once(&engine, ledger.as_ref(), Utc::now()).await;
            }
        }
    }
    info!("Reconciliation loop stopped");
}
