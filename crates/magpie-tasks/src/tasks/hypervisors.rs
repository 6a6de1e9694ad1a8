//! Reconciliation sweeps for transfers that aged out mid-machine, plus the
//! duplicate remote-instance collapse.

use async_trait::async_trait;
use magpie_core::config::HypervisorOptions;
use magpie_core::{
    IncomingTransfer, MagpieError, OutgoingStatus, OutgoingTransfer, RemoteInstance, Result,
};
use magpie_transfer::wire::{StatusDirection, WireStatus};
use tracing::{info, warn};

use crate::tasks::SCAN_LIMIT;
use crate::{Task, TaskContext, TaskReport};

pub struct IncomingTransferHypervisor {
    options: HypervisorOptions,
}

impl IncomingTransferHypervisor {
    pub fn new(options: HypervisorOptions) -> Self {
        Self { options }
    }

    /// Resolve one stale incoming transfer against its origin's view.
    /// Returns false when the origin is unreachable and we should wait.
    async fn reconcile(&self, ctx: &TaskContext, transfer: &IncomingTransfer) -> Result<bool> {
        let Some(source_id) = transfer.source_id else {
            // Direct ingest with no origin to consult: the uploader is gone.
            ctx.transfers.fail_incoming(transfer.id).await?;
            return Ok(true);
        };

        let peer = match ctx.transfers.peer(&transfer.source_librarian).await {
            Ok(peer) => peer,
            Err(MagpieError::LibrarianNotFound(_)) => {
                ctx.transfers.fail_incoming(transfer.id).await?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        match peer.transfer_status(StatusDirection::Outgoing, source_id).await {
            Ok(response) => match response.status {
                WireStatus::Completed if transfer.status == magpie_core::IncomingStatus::Staged => {
                    // Origin thinks it finished; our commit never ran.
                    match ctx.transfers.commit_incoming(transfer.id).await {
                        Ok(_) => info!(transfer = transfer.id, "hypervisor committed staged transfer"),
                        Err(e) => {
                            warn!(transfer = transfer.id, error = %e, "late commit failed");
                            ctx.transfers.fail_incoming(transfer.id).await?;
                        }
                    }
                    Ok(true)
                }
                // Origin gave up, or the machines disagree beyond repair.
                _ => {
                    ctx.transfers.fail_incoming(transfer.id).await?;
                    Ok(true)
                }
            },
            Err(e) if e.is_transient() => {
                warn!(
                    transfer = transfer.id,
                    source = %transfer.source_librarian,
                    error = %e,
                    "origin unreachable; retrying next sweep"
                );
                Ok(false)
            }
            Err(_) => {
                ctx.transfers.fail_incoming(transfer.id).await?;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl Task for IncomingTransferHypervisor {
    fn name(&self) -> &str {
        "incoming_transfer_hypervisor"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport> {
        let mut report = TaskReport::default();

        let stale = ctx
            .catalog
            .stale_incoming_transfers(self.options.age_in_days as i32, SCAN_LIMIT)
            .await?;

        for transfer in stale {
            if ctx.deadline_passed() {
                break;
            }
            match self.reconcile(ctx, &transfer).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(transfer = transfer.id, error = %e, "incoming reconciliation failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

pub struct OutgoingTransferHypervisor {
    options: HypervisorOptions,
}

impl OutgoingTransferHypervisor {
    pub fn new(options: HypervisorOptions) -> Self {
        Self { options }
    }

    async fn mark_failed(&self, ctx: &TaskContext, transfer: &OutgoingTransfer) -> Result<()> {
        match ctx
            .catalog
            .transition_outgoing(transfer.id, transfer.status, OutgoingStatus::Failed, None)
            .await
        {
            Ok(()) | Err(MagpieError::StaleState(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Walk a transfer the rest of the way to COMPLETED after the peer
    /// reports (or performs) a successful commit.
    async fn finish(
        &self,
        ctx: &TaskContext,
        transfer: &OutgoingTransfer,
        remote_id: i64,
    ) -> Result<()> {
        let peer = ctx.transfers.peer(&transfer.destination).await?;
        let response = peer.commit_transfer(remote_id).await?;
        let claim = response.remote_instance.ok_or_else(|| {
            MagpieError::Protocol(format!(
                "{} confirmed commit without a remote instance claim",
                transfer.destination
            ))
        })?;

        let mut current = transfer.status;
        while current != OutgoingStatus::Completed {
            let next = match current {
                OutgoingStatus::Initiated => OutgoingStatus::Ongoing,
                OutgoingStatus::Ongoing => OutgoingStatus::Staged,
                OutgoingStatus::Staged => OutgoingStatus::Completed,
                other => {
                    return Err(MagpieError::StaleState(format!(
                        "outgoing {} became {other} during reconciliation",
                        transfer.id
                    )));
                }
            };
            ctx.catalog
                .transition_outgoing(transfer.id, current, next, Some(remote_id))
                .await?;
            current = next;
        }

        ctx.catalog
            .register_remote_instance(
                &transfer.file_name,
                &transfer.destination,
                &claim.checksum,
                claim.copy_time,
            )
            .await?;

        info!(
            transfer = transfer.id,
            file = %transfer.file_name,
            peer = %transfer.destination,
            "hypervisor completed stalled outgoing transfer"
        );
        Ok(())
    }

    async fn reconcile(&self, ctx: &TaskContext, transfer: &OutgoingTransfer) -> Result<()> {
        let Some(remote_id) = transfer.remote_id else {
            // Never prepared and already past the age threshold.
            return self.mark_failed(ctx, transfer).await;
        };

        let peer = match ctx.transfers.peer(&transfer.destination).await {
            Ok(peer) => peer,
            Err(MagpieError::LibrarianNotFound(_)) => return self.mark_failed(ctx, transfer).await,
            Err(e) => return Err(e),
        };

        match peer.transfer_status(StatusDirection::Incoming, remote_id).await {
            Ok(response) => match response.status {
                WireStatus::Committed | WireStatus::Completed | WireStatus::Staged => {
                    match self.finish(ctx, transfer, remote_id).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            warn!(transfer = transfer.id, error = %e, "late completion failed");
                            self.mark_failed(ctx, transfer).await
                        }
                    }
                }
                // Still mid-flight on the other side after the age threshold:
                // tear both halves down.
                WireStatus::Initiated | WireStatus::Ongoing => {
                    peer.cancel_transfer(remote_id).await.ok();
                    self.mark_failed(ctx, transfer).await
                }
                WireStatus::Failed | WireStatus::Cancelled => self.mark_failed(ctx, transfer).await,
            },
            // An unreachable destination after the age threshold fails the
            // transfer; a later send_clone will try a fresh one.
            Err(e) => {
                warn!(
                    transfer = transfer.id,
                    peer = %transfer.destination,
                    error = %e,
                    "destination unresponsive; failing stalled transfer"
                );
                self.mark_failed(ctx, transfer).await
            }
        }
    }
}

#[async_trait]
impl Task for OutgoingTransferHypervisor {
    fn name(&self) -> &str {
        "outgoing_transfer_hypervisor"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport> {
        let mut report = TaskReport::default();

        let stale = ctx
            .catalog
            .stale_outgoing_transfers(self.options.age_in_days as i32, SCAN_LIMIT)
            .await?;

        for transfer in stale {
            if ctx.deadline_passed() {
                break;
            }
            match self.reconcile(ctx, &transfer).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    warn!(transfer = transfer.id, error = %e, "outgoing reconciliation failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

pub struct DuplicateRemoteInstanceHypervisor;

/// The row to keep out of a duplicate set: most recently verified first,
/// then most recent copy time, then highest id.
fn pick_keeper(rows: &[RemoteInstance]) -> Option<&RemoteInstance> {
    rows.iter().max_by(|a, b| {
        a.last_verified_at
            .cmp(&b.last_verified_at)
            .then(a.copy_time.cmp(&b.copy_time))
            .then(a.id.cmp(&b.id))
    })
}

#[async_trait]
impl Task for DuplicateRemoteInstanceHypervisor {
    fn name(&self) -> &str {
        "duplicate_remote_instance_hypervisor"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport> {
        let mut report = TaskReport::default();

        let pairs = ctx.catalog.duplicate_remote_instance_pairs().await?;
        for (file_name, librarian) in pairs {
            if ctx.deadline_passed() {
                break;
            }

            let rows = ctx
                .catalog
                .remote_instances_for_pair(&file_name, &librarian)
                .await?;
            let Some(keeper) = pick_keeper(&rows) else {
                continue;
            };
            let keeper_id = keeper.id;

            for row in &rows {
                if row.id == keeper_id {
                    continue;
                }
                ctx.catalog.delete_remote_instance(row.id).await?;
                report.processed += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn row(id: i64, copy_ts: i64, verified_ts: Option<i64>) -> RemoteInstance {
        RemoteInstance {
            id,
            file_name: "f1".to_string(),
            librarian: "north-site".to_string(),
            copy_time: Utc.timestamp_opt(copy_ts, 0).unwrap(),
            last_verified_at: verified_ts.map(|t| Utc.timestamp_opt(t, 0).unwrap()),
            verified_checksum: verified_ts.map(|_| "abc".to_string()),
        }
    }

    #[test]
    fn keeper_prefers_latest_verification() {
        let rows = vec![row(1, 100, Some(50)), row(2, 90, Some(60)), row(3, 200, None)];
        assert_eq!(pick_keeper(&rows).unwrap().id, 2);
    }

    #[test]
    fn keeper_falls_back_to_copy_time() {
        let rows = vec![row(1, 100, None), row(2, 300, None), row(3, 200, None)];
        assert_eq!(pick_keeper(&rows).unwrap().id, 2);
    }

    #[test]
    fn keeper_of_empty_set_is_none() {
        assert!(pick_keeper(&[]).is_none());
    }
}
