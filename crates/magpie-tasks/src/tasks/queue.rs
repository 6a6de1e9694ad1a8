//! Queue consumer and queue janitor.
//!
//! `consume_queue` claims pending send intents and drives their transfers;
//! `check_consumed_queue` reverts expired claims and settles items whose
//! transfers were resolved behind the consumer's back.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use magpie_core::{QueueItemStatus, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Task, TaskContext, TaskReport};

const CLAIM_BATCH: i64 = 8;
/// Claims outlive the soft timeout by this much so a consumer finishing its
/// last work unit does not lose the claim mid-completion.
const CLAIM_GRACE: Duration = Duration::from_secs(60);

pub struct ConsumeQueueTask;

#[async_trait]
impl Task for ConsumeQueueTask {
    fn name(&self) -> &str {
        "consume_queue"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport> {
        let mut report = TaskReport::default();
        let claim_id = Uuid::new_v4();
        // Items released back as parked would be claimable again right away;
        // remember them so one tick never spins on the same intent.
        let mut seen: HashSet<i64> = HashSet::new();

        loop {
            if ctx.deadline_passed() {
                break;
            }

            let ttl = ctx
                .deadline
                .saturating_duration_since(Instant::now())
                + CLAIM_GRACE;
            let items = ctx.catalog.claim_queue_items(CLAIM_BATCH, claim_id, ttl).await?;
            if items.is_empty() {
                break;
            }

            let mut progressed = false;
            for item in items {
                if !seen.insert(item.id) {
                    ctx.catalog.release_queue_item(item.id, claim_id).await?;
                    continue;
                }
                progressed = true;

                if ctx.deadline_passed() {
                    ctx.catalog.release_queue_item(item.id, claim_id).await?;
                    report.skipped += 1;
                    continue;
                }

                match ctx.transfers.drive_outgoing(item.transfer_id, ctx.deadline).await {
                    Ok(status) if status == magpie_core::OutgoingStatus::Completed => {
                        finish(ctx, item.id, claim_id, QueueItemStatus::Done).await;
                        report.processed += 1;
                    }
                    Ok(status) if status.is_terminal() => {
                        finish(ctx, item.id, claim_id, QueueItemStatus::Failed).await;
                        report.failed += 1;
                    }
                    // Parked mid-machine: release so another consumer (or the
                    // hypervisor) picks it up.
                    Ok(status) => {
                        debug!(item = item.id, transfer = item.transfer_id, %status, "transfer parked");
                        ctx.catalog.release_queue_item(item.id, claim_id).await?;
                        report.skipped += 1;
                    }
                    Err(e) => {
                        warn!(item = item.id, transfer = item.transfer_id, error = %e, "queue item errored");
                        ctx.catalog.release_queue_item(item.id, claim_id).await?;
                        report.failed += 1;
                    }
                }
            }

            if !progressed {
                break;
            }
        }

        Ok(report)
    }
}

async fn finish(ctx: &TaskContext, item_id: i64, claim_id: Uuid, status: QueueItemStatus) {
    if let Err(e) = ctx.catalog.complete_queue_item(item_id, claim_id, status).await {
        // Claim expired mid-run; the janitor owns the item now.
        warn!(item = item_id, error = %e, "lost claim before completion");
    }
}

pub struct CheckConsumedQueueTask;

#[async_trait]
impl Task for CheckConsumedQueueTask {
    fn name(&self) -> &str {
        "check_consumed_queue"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport> {
        let mut report = TaskReport::default();

        let released = ctx.catalog.release_expired_claims().await?;
        if released > 0 {
            debug!(released, "reverted expired queue claims to pending");
        }

        let (done, failed) = ctx.catalog.settle_queue_items().await?;
        report.processed = released + done + failed;
        report.failed = failed;

        Ok(report)
    }
}
