//! Integrity sweep: recompute on-disk digests for recent instances on one
//! store and flag mismatches.

use async_trait::async_trait;
use magpie_core::config::CheckIntegrityOptions;
use magpie_core::{CorruptionDetector, Instance, MagpieError, Result};
use tracing::warn;

use crate::tasks::SCAN_LIMIT;
use crate::{Event, Task, TaskContext, TaskReport};

pub struct CheckIntegrityTask {
    options: CheckIntegrityOptions,
}

impl CheckIntegrityTask {
    pub fn new(options: CheckIntegrityOptions) -> Self {
        Self { options }
    }

    /// Returns true when the instance verified clean.
    async fn check_one(&self, ctx: &TaskContext, instance: &Instance) -> Result<bool> {
        let file = ctx
            .catalog
            .get_file(&instance.file_name)
            .await?
            .ok_or_else(|| MagpieError::FileNotFound(instance.file_name.clone()))?;

        let store = ctx.stores.get(&instance.store_name)?;
        let measured = store.checksum(&instance.path).await?;

        if measured == file.checksum {
            return Ok(true);
        }

        warn!(
            file = %file.name,
            store = %instance.store_name,
            expected = %file.checksum,
            measured = %measured,
            "instance failed integrity check"
        );

        ctx.catalog.mark_instance_unavailable(instance.id).await?;
        ctx.catalog
            .record_corrupt_file(
                &file.name,
                Some(&instance.store_name),
                CorruptionDetector::IntegrityCheck,
            )
            .await?;
        ctx.notifier
            .notify(Event::FileCorrupt {
                file: file.name.clone(),
                store: Some(instance.store_name.clone()),
            })
            .await;

        Ok(false)
    }
}

#[async_trait]
impl Task for CheckIntegrityTask {
    fn name(&self) -> &str {
        "check_integrity"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport> {
        let mut report = TaskReport::default();

        let instances = ctx
            .catalog
            .instances_on_store_within(
                &self.options.store_name,
                self.options.age_in_days as i32,
                SCAN_LIMIT,
            )
            .await?;

        for instance in instances {
            if ctx.deadline_passed() {
                break;
            }
            match self.check_one(ctx, &instance).await {
                Ok(true) => report.processed += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    warn!(
                        file = %instance.file_name,
                        store = %instance.store_name,
                        error = %e,
                        "could not verify instance"
                    );
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }
}
