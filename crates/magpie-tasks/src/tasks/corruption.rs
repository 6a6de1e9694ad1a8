//! Corruption fixer: replace flagged local copies with fresh bytes from a
//! peer, via the normal transfer protocol.

use async_trait::async_trait;
use magpie_core::{CorruptFile, FileRecord, RemediationStatus, Result};
use tracing::{debug, info, warn};

use crate::{Task, TaskContext, TaskReport};

const FIX_BATCH: i64 = 100;

pub struct CorruptionFixerTask;

impl CorruptionFixerTask {
    /// Find a peer whose copy re-verifies against the catalog checksum.
    async fn find_good_holder(
        &self,
        ctx: &TaskContext,
        file: &FileRecord,
    ) -> Result<Option<String>> {
        let mut remotes = ctx.catalog.remote_instances_for_file(&file.name).await?;
        // Try already-verified holders first.
        remotes.sort_by_key(|r| r.verified_checksum.as_deref() != Some(file.checksum.as_str()));

        for remote in remotes {
            let peer = match ctx.transfers.peer(&remote.librarian).await {
                Ok(peer) => peer,
                Err(_) => continue,
            };
            match peer.verify_checksum(&file.name).await {
                Ok(response) if response.digest == file.checksum => {
                    ctx.catalog
                        .update_remote_verification(remote.id, &response.digest, chrono::Utc::now())
                        .await?;
                    return Ok(Some(remote.librarian));
                }
                Ok(response) => {
                    warn!(
                        file = %file.name,
                        librarian = %remote.librarian,
                        digest = %response.digest,
                        "remote holder has mismatched bytes"
                    );
                }
                Err(e) => {
                    debug!(file = %file.name, librarian = %remote.librarian, error = %e, "holder unreachable");
                }
            }
        }

        Ok(None)
    }

    /// Drop the corrupt local bytes, then ask a good holder to send a fresh
    /// copy through the transfer protocol.
    async fn request_repair(&self, ctx: &TaskContext, corrupt: &CorruptFile) -> Result<bool> {
        let Some(file) = ctx.catalog.get_file(&corrupt.file_name).await? else {
            // The file row is gone; nothing left to repair.
            ctx.catalog
                .set_corrupt_remediation(corrupt.id, RemediationStatus::Resolved)
                .await?;
            return Ok(true);
        };

        let Some(holder) = self.find_good_holder(ctx, &file).await? else {
            debug!(file = %file.name, "no verified remote holder yet; will retry");
            return Ok(false);
        };

        // The corrupt instance was marked unavailable at detection. Clear its
        // bytes and row so the repair copy can land at the same path. The
        // holder's verified copy keeps the federation-wide count positive.
        for instance in ctx.catalog.instances_for_file(&file.name).await? {
            if instance.available {
                continue;
            }
            if let Some(store_name) = &corrupt.store_name {
                if &instance.store_name != store_name {
                    continue;
                }
            }
            if let Ok(store) = ctx.stores.get(&instance.store_name) {
                store.delete(&instance.path).await?;
            }
            ctx.catalog.delete_instance(instance.id).await?;
        }

        let peer = ctx.transfers.peer(&holder).await?;
        let response = peer.request_copy(&file.name).await?;
        if !response.accepted {
            warn!(file = %file.name, librarian = %holder, "holder refused to send a repair copy");
            return Ok(false);
        }

        info!(
            file = %file.name,
            librarian = %holder,
            "requested repair copy"
        );
        ctx.catalog
            .set_corrupt_remediation(corrupt.id, RemediationStatus::Requested)
            .await?;
        Ok(true)
    }

    /// See whether a requested repair has landed; re-request if it died.
    async fn check_repair(&self, ctx: &TaskContext, corrupt: &CorruptFile) -> Result<bool> {
        let Some(file) = ctx.catalog.get_file(&corrupt.file_name).await? else {
            ctx.catalog
                .set_corrupt_remediation(corrupt.id, RemediationStatus::Resolved)
                .await?;
            return Ok(true);
        };

        if ctx.catalog.any_available_instance(&file.name).await?.is_some() {
            ctx.catalog
                .set_corrupt_remediation(corrupt.id, RemediationStatus::Resolved)
                .await?;
            info!(file = %file.name, "corrupt file replaced and cleared");
            return Ok(true);
        }

        if !ctx.catalog.live_incoming_for_file(&file.name).await?.is_empty() {
            // Repair copy is still in flight.
            return Ok(false);
        }

        debug!(file = %file.name, "requested repair never arrived; re-requesting");
        ctx.catalog
            .set_corrupt_remediation(corrupt.id, RemediationStatus::Pending)
            .await?;
        Ok(false)
    }
}

#[async_trait]
impl Task for CorruptionFixerTask {
    fn name(&self) -> &str {
        "corruption_fixer"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport> {
        let mut report = TaskReport::default();

        let pending = ctx.catalog.corrupt_files_needing_remediation(FIX_BATCH).await?;

        for corrupt in pending {
            if ctx.deadline_passed() {
                break;
            }
            let outcome = match corrupt.remediation {
                RemediationStatus::Pending => self.request_repair(ctx, &corrupt).await,
                RemediationStatus::Requested => self.check_repair(ctx, &corrupt).await,
                RemediationStatus::Resolved => Ok(true),
            };
            match outcome {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(file = %corrupt.file_name, error = %e, "remediation step failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
