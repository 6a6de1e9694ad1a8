//! Rolling deletion: remove local instances once enough peers hold
//! verified copies. Never deletes the last copy in the federation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use magpie_core::config::RollingDeletionOptions;
use magpie_core::{CorruptionDetector, DeletionPolicy, Instance, MagpieError, RemoteInstance, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::tasks::SCAN_LIMIT;
use crate::{Event, Task, TaskContext, TaskReport};

/// How long a candidate may stay blocked on missing copies before the
/// notification sink hears about it.
const BLOCKED_NOTIFY_AFTER_HOURS: i64 = 24;

pub struct RollingDeletionTask {
    options: RollingDeletionOptions,
    /// When each file first failed the remote-copy requirement, for the
    /// blocked-too-long notification.
    blocked_since: Mutex<HashMap<String, DateTime<Utc>>>,
}

enum Verdict {
    Deleted,
    Skipped,
}

/// Distinct librarians whose verified checksum matches the file's.
fn count_verified(remotes: &[RemoteInstance], checksum: &str) -> usize {
    let mut librarians: Vec<&str> = remotes
        .iter()
        .filter(|r| r.verified_checksum.as_deref() == Some(checksum))
        .map(|r| r.librarian.as_str())
        .collect();
    librarians.sort_unstable();
    librarians.dedup();
    librarians.len()
}

impl RollingDeletionTask {
    pub fn new(options: RollingDeletionOptions) -> Self {
        Self {
            options,
            blocked_since: Mutex::new(HashMap::new()),
        }
    }

    async fn note_blocked(&self, ctx: &TaskContext, instance: &Instance, verified: usize) {
        let mut blocked = self.blocked_since.lock().await;
        let first = blocked
            .entry(instance.file_name.clone())
            .or_insert_with(Utc::now);

        if (Utc::now() - *first).num_hours() >= BLOCKED_NOTIFY_AFTER_HOURS {
            ctx.notifier
                .notify(Event::DeletionBlocked {
                    file: instance.file_name.clone(),
                    store: instance.store_name.clone(),
                    verified_copies: verified,
                    required_copies: self.options.number_of_remote_copies as usize,
                })
                .await;
            *first = Utc::now();
        }
    }

    async fn consider(&self, ctx: &TaskContext, instance: &Instance) -> Result<Verdict> {
        // Policy gate and the force override are independent of copy proof.
        if !self.options.force_deletion && instance.deletion_policy == DeletionPolicy::Disallowed {
            debug!(
                file = %instance.file_name,
                store = %instance.store_name,
                "deletion disallowed by instance policy"
            );
            return Ok(Verdict::Skipped);
        }

        let file = ctx
            .catalog
            .get_file(&instance.file_name)
            .await?
            .ok_or_else(|| MagpieError::FileNotFound(instance.file_name.clone()))?;

        if self.options.verify_downstream_checksums {
            let remotes = ctx.catalog.remote_instances_for_file(&file.name).await?;
            for remote in &remotes {
                let peer = match ctx.transfers.peer(&remote.librarian).await {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!(librarian = %remote.librarian, error = %e, "cannot verify remote copy");
                        continue;
                    }
                };
                match peer.verify_checksum(&file.name).await {
                    Ok(response) => {
                        ctx.catalog
                            .update_remote_verification(remote.id, &response.digest, Utc::now())
                            .await?;
                        ctx.catalog.touch_librarian(&remote.librarian).await.ok();
                    }
                    Err(e) => {
                        warn!(
                            file = %file.name,
                            librarian = %remote.librarian,
                            error = %e,
                            "downstream verification failed"
                        );
                    }
                }
            }
        }

        let remotes = ctx.catalog.remote_instances_for_file(&file.name).await?;
        let verified = count_verified(&remotes, &file.checksum);
        let required = self.options.number_of_remote_copies as usize;

        let local_copies = ctx.catalog.count_available_instances(&file.name).await?;
        let is_last_local = local_copies <= 1;

        // Even with a zero-copy requirement, the last copy in the federation
        // stays put.
        if verified < required || (is_last_local && verified == 0) {
            self.note_blocked(ctx, instance, verified).await;
            warn!(
                file = %file.name,
                store = %instance.store_name,
                verified,
                required,
                "insufficient verified remote copies; deletion blocked"
            );
            return Ok(Verdict::Skipped);
        }
        self.blocked_since.lock().await.remove(&instance.file_name);

        // Pre-deletion audit: a corrupt local copy is flagged, not deleted.
        let store = ctx.stores.get(&instance.store_name)?;
        let measured = store.checksum(&instance.path).await?;
        if measured != file.checksum {
            warn!(
                file = %file.name,
                store = %instance.store_name,
                "pre-deletion audit found corrupt bytes"
            );
            ctx.catalog.mark_instance_unavailable(instance.id).await?;
            ctx.catalog
                .record_corrupt_file(
                    &file.name,
                    Some(&instance.store_name),
                    CorruptionDetector::PredeletionAudit,
                )
                .await?;
            ctx.notifier
                .notify(Event::FileCorrupt {
                    file: file.name.clone(),
                    store: Some(instance.store_name.clone()),
                })
                .await;
            return Ok(Verdict::Skipped);
        }

        if self.options.mark_unavailable {
            ctx.catalog.mark_instance_unavailable(instance.id).await?;
            info!(
                file = %file.name,
                store = %instance.store_name,
                verified,
                "instance marked unavailable by rolling deletion"
            );
        } else {
            store.delete(&instance.path).await?;
            ctx.catalog.delete_instance(instance.id).await?;
            info!(
                file = %file.name,
                store = %instance.store_name,
                verified,
                "instance removed by rolling deletion"
            );
        }

        Ok(Verdict::Deleted)
    }
}

#[async_trait]
impl Task for RollingDeletionTask {
    fn name(&self) -> &str {
        "rolling_deletion"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport> {
        let mut report = TaskReport::default();

        let candidates = ctx
            .catalog
            .deletion_candidates(
                &self.options.store_name,
                self.options.age_in_days as i32,
                SCAN_LIMIT,
            )
            .await?;

        for instance in candidates {
            if ctx.deadline_passed() {
                break;
            }
            match self.consider(ctx, &instance).await {
                Ok(Verdict::Deleted) => report.processed += 1,
                Ok(Verdict::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(
                        file = %instance.file_name,
                        store = %instance.store_name,
                        error = %e,
                        "deletion candidate errored"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn remote(librarian: &str, verified: Option<&str>) -> RemoteInstance {
        RemoteInstance {
            id: 1,
            file_name: "f1".to_string(),
            librarian: librarian.to_string(),
            copy_time: Utc.timestamp_opt(1000, 0).unwrap(),
            last_verified_at: verified.map(|_| Utc.timestamp_opt(2000, 0).unwrap()),
            verified_checksum: verified.map(str::to_string),
        }
    }

    #[test]
    fn counts_only_matching_verified_copies() {
        let remotes = vec![
            remote("a", Some("good")),
            remote("b", Some("bad")),
            remote("c", None),
            remote("d", Some("good")),
        ];
        assert_eq!(count_verified(&remotes, "good"), 2);
    }

    #[test]
    fn duplicate_librarians_count_once() {
        let remotes = vec![remote("a", Some("good")), remote("a", Some("good"))];
        assert_eq!(count_verified(&remotes, "good"), 1);
    }

    #[test]
    fn no_remotes_means_zero() {
        assert_eq!(count_verified(&[], "good"), 0);
    }
}
