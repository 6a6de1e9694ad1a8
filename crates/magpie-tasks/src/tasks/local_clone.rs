//! Local clone: copy single-copy files from one store onto the first
//! destination store with room. At most one new instance per source file.

use async_trait::async_trait;
use magpie_core::config::CreateLocalCloneOptions;
use magpie_core::{FileRecord, MagpieError, Result};
use magpie_store::copy_between;
use tracing::{debug, warn};

use crate::{Event, Task, TaskContext, TaskReport};

pub struct CreateLocalCloneTask {
    options: CreateLocalCloneOptions,
}

enum CloneOutcome {
    Cloned,
    NoRoom,
}

impl CreateLocalCloneTask {
    pub fn new(options: CreateLocalCloneOptions) -> Self {
        Self { options }
    }

    async fn clone_one(&self, ctx: &TaskContext, file: &FileRecord) -> Result<CloneOutcome> {
        let source_instance = ctx
            .catalog
            .available_instance_on(&file.name, &self.options.clone_from)
            .await?
            .ok_or_else(|| MagpieError::InstanceNotFound(file.name.clone()))?;
        let source = ctx.stores.get(&self.options.clone_from)?;

        for destination_name in &self.options.clone_to {
            let Some(record) = ctx.catalog.get_store(destination_name).await? else {
                warn!(store = %destination_name, "clone destination not in catalog");
                continue;
            };
            if !record.enabled {
                continue;
            }
            let destination = ctx.stores.get(destination_name)?;

            match copy_between(
                &source,
                &source_instance.path,
                &destination,
                &file.name,
                file.size_bytes.max(0) as u64,
                &file.checksum,
            )
            .await
            {
                Ok((path, _digest)) => {
                    ctx.catalog
                        .create_instance(
                            &file.name,
                            destination_name,
                            &path,
                            source_instance.deletion_policy,
                        )
                        .await?;
                    debug!(
                        file = %file.name,
                        from = %self.options.clone_from,
                        to = %destination_name,
                        "cloned locally"
                    );
                    return Ok(CloneOutcome::Cloned);
                }
                Err(MagpieError::CapacityExceeded { store, needed, available }) => {
                    if self.options.disable_store_on_full {
                        ctx.catalog.set_store_enabled(destination_name, false).await?;
                        ctx.notifier
                            .notify(Event::StoreDisabled {
                                store: store.clone(),
                                reason: format!(
                                    "full during local clone: needed {needed}, {available} free"
                                ),
                            })
                            .await;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(CloneOutcome::NoRoom)
    }
}

#[async_trait]
impl Task for CreateLocalCloneTask {
    fn name(&self) -> &str {
        "create_local_clone"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport> {
        let mut report = TaskReport::default();

        let files = ctx
            .catalog
            .files_single_copy_on(
                &self.options.clone_from,
                self.options.age_in_days as i32,
                self.options.files_per_run as i64,
            )
            .await?;

        for file in files {
            if ctx.deadline_passed() {
                break;
            }
            match self.clone_one(ctx, &file).await {
                Ok(CloneOutcome::Cloned) => report.processed += 1,
                Ok(CloneOutcome::NoRoom) => report.skipped += 1,
                Err(e) => {
                    warn!(file = %file.name, error = %e, "local clone failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
