//! Background tasks: the scheduler and the task catalog it hosts.
//!
//! Each configured task instance runs in its own cooperative loop with a
//! period and a soft timeout. Tasks are pure functions over the catalog,
//! store, transfer, and queue interfaces; they check their deadline between
//! work units and catch per-unit errors so one bad file never stops a sweep.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use magpie_core::Result;
use magpie_core::config::TaskSpec;
use magpie_db::Catalog;
use magpie_store::StoreManager;
use magpie_transfer::TransferManager;

pub mod notify;
mod scheduler;
mod tasks;

pub use notify::{Event, LogNotifier, Notifier};
pub use scheduler::{ScheduledTask, Scheduler};

/// Everything a task tick may touch, threaded from the process entry point.
pub struct TaskContext {
    pub catalog: Arc<Catalog>,
    pub stores: Arc<StoreManager>,
    pub transfers: Arc<TransferManager>,
    pub notifier: Arc<dyn Notifier>,
    pub deadline: Instant,
}

impl TaskContext {
    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Outcome counters for one tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskReport {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// A named background task. The scheduler sees nothing beyond this.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &TaskContext) -> Result<TaskReport>;
}

/// Turn a configured task descriptor into a runnable instance.
pub fn build_task(spec: &TaskSpec) -> ScheduledTask {
    let every = spec.every();
    let soft_timeout = spec.soft_timeout();

    let task: Arc<dyn Task> = match spec.clone() {
        TaskSpec::CheckIntegrity(options) => Arc::new(tasks::integrity::CheckIntegrityTask::new(options)),
        TaskSpec::CreateLocalClone(options) => {
            Arc::new(tasks::local_clone::CreateLocalCloneTask::new(options))
        }
        TaskSpec::SendClone(options) => Arc::new(tasks::send_clone::SendCloneTask::new(options)),
        TaskSpec::ConsumeQueue(_) => Arc::new(tasks::queue::ConsumeQueueTask),
        TaskSpec::CheckConsumedQueue(_) => Arc::new(tasks::queue::CheckConsumedQueueTask),
        TaskSpec::IncomingTransferHypervisor(options) => {
            Arc::new(tasks::hypervisors::IncomingTransferHypervisor::new(options))
        }
        TaskSpec::OutgoingTransferHypervisor(options) => {
            Arc::new(tasks::hypervisors::OutgoingTransferHypervisor::new(options))
        }
        TaskSpec::DuplicateRemoteInstanceHypervisor(_) => {
            Arc::new(tasks::hypervisors::DuplicateRemoteInstanceHypervisor)
        }
        TaskSpec::RollingDeletion(options) => {
            Arc::new(tasks::rolling_deletion::RollingDeletionTask::new(options))
        }
        TaskSpec::CorruptionFixer(_) => Arc::new(tasks::corruption::CorruptionFixerTask),
    };

    ScheduledTask {
        task,
        every,
        soft_timeout,
    }
}
