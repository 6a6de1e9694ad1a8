//! Send clone: pick files missing at a destination librarian and enqueue
//! outbound transfer intents for them.

use async_trait::async_trait;
use chrono::Utc;
use magpie_core::config::SendCloneOptions;
use magpie_core::{MagpieError, Result};
use tracing::{debug, warn};

use crate::{Event, Task, TaskContext, TaskReport};

pub struct SendCloneTask {
    options: SendCloneOptions,
}

impl SendCloneTask {
    pub fn new(options: SendCloneOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Task for SendCloneTask {
    fn name(&self) -> &str {
        "send_clone"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport> {
        let mut report = TaskReport::default();
        let destination = &self.options.destination_librarian;

        let librarian = ctx
            .catalog
            .get_librarian(destination)
            .await?
            .ok_or_else(|| MagpieError::LibrarianNotFound(destination.clone()))?;

        if !librarian.enabled {
            if let Some(since) = librarian.disabled_since {
                let disabled_days = (Utc::now() - since).num_days();
                if disabled_days >= self.options.warn_disabled_timer as i64 {
                    ctx.notifier
                        .notify(Event::PeerDisabled {
                            librarian: destination.clone(),
                            disabled_days,
                        })
                        .await;
                }
            }
            return Ok(report);
        }

        let files = ctx
            .catalog
            .files_lacking_remote_copy(
                destination,
                self.options.age_in_days as i32,
                self.options.send_batch_size as i64,
            )
            .await?;

        for file in files {
            if ctx.deadline_passed() {
                break;
            }
            match ctx
                .transfers
                .enqueue_send_to(
                    &file.name,
                    destination,
                    self.options.store_preference.as_deref(),
                )
                .await
            {
                Ok((transfer, _item)) => {
                    debug!(
                        file = %file.name,
                        destination = %destination,
                        transfer = transfer.id,
                        "queued outbound clone"
                    );
                    report.processed += 1;
                }
                // Someone else queued this file since the candidate scan.
                Err(MagpieError::Conflict(_)) => report.skipped += 1,
                Err(e) => {
                    warn!(file = %file.name, destination = %destination, error = %e, "could not queue clone");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
