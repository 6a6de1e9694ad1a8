//! Cooperative scheduler: one loop per configured task instance.
//!
//! A task runs to completion (or its soft timeout) before its next tick;
//! independent instances interleave freely on the runtime. Missed ticks are
//! delayed rather than bursted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use magpie_db::Catalog;
use magpie_store::StoreManager;
use magpie_transfer::TransferManager;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, error, info, info_span};

use crate::{Notifier, Task, TaskContext};

pub struct ScheduledTask {
    pub task: Arc<dyn Task>,
    pub every: Duration,
    pub soft_timeout: Duration,
}

pub struct Scheduler {
    catalog: Arc<Catalog>,
    stores: Arc<StoreManager>,
    transfers: Arc<TransferManager>,
    notifier: Arc<dyn Notifier>,
    tasks: Vec<ScheduledTask>,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<Catalog>,
        stores: Arc<StoreManager>,
        transfers: Arc<TransferManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            catalog,
            stores,
            transfers,
            notifier,
            tasks: Vec::new(),
        }
    }

    pub fn register(&mut self, scheduled: ScheduledTask) {
        self.tasks.push(scheduled);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Run every registered task loop until the process ends.
    pub async fn run(self) {
        let mut loops = JoinSet::new();

        for scheduled in self.tasks {
            let catalog = self.catalog.clone();
            let stores = self.stores.clone();
            let transfers = self.transfers.clone();
            let notifier = self.notifier.clone();

            loops.spawn(async move {
                let name = scheduled.task.name().to_string();
                info!(
                    task = %name,
                    every = ?scheduled.every,
                    soft_timeout = ?scheduled.soft_timeout,
                    "task loop started"
                );

                let mut interval = tokio::time::interval(scheduled.every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    interval.tick().await;

                    let ctx = TaskContext {
                        catalog: catalog.clone(),
                        stores: stores.clone(),
                        transfers: transfers.clone(),
                        notifier: notifier.clone(),
                        deadline: Instant::now() + scheduled.soft_timeout,
                    };

                    let started = Instant::now();
                    let span = info_span!("task", task = %name);
                    match scheduled.task.run(&ctx).instrument(span).await {
                        Ok(report) => info!(
                            task = %name,
                            processed = report.processed,
                            failed = report.failed,
                            skipped = report.skipped,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "task tick finished"
                        ),
                        // Fatal within one tick only; the loop retries at the
                        // next period.
                        Err(e) => error!(task = %name, error = %e, "task tick aborted"),
                    }
                }
            });
        }

        while loops.join_next().await.is_some() {}
    }
}
