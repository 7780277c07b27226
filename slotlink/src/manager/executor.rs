//! Bounded executor for channel operations.
//!
//! ```text
//!   submit(op) ──► task ──permit──► deadline passed? ──yes──► DEADLINE_EXCEEDED
//!                                        │ no
//!                                        ▼
//!                            spawn action, timeout(remaining)
//!                              ├─ Ok                 → done
//!                              ├─ Err(status)        → fail operation
//!                              ├─ panic              → INTERNAL
//!                              └─ deadline breached  → abort, DEADLINE_EXCEEDED
//! ```
//!
//! Each action runs in its own task so a panic is contained and reported
//! instead of taking the executor down.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::actions;
use super::shared::ManagerCore;
use crate::model::ChannelOperation;
use crate::status::{Code, Status};

pub(crate) struct ChannelOperationExecutor {
    core: Arc<ManagerCore>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl ChannelOperationExecutor {
    pub(crate) fn new(core: Arc<ManagerCore>, workers: usize) -> Self {
        Self {
            core,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Queues an operation; it runs once a worker permit is free.
    pub(crate) fn submit(&self, operation: ChannelOperation) {
        let action = actions::run(self.core.clone(), operation.clone());
        self.submit_action(operation, action);
    }

    fn submit_action<F>(&self, operation: ChannelOperation, action: F)
    where
        F: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let core = self.core.clone();
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(operation_id = %operation.operation_id, "Executor closed, dropping operation");
                    return;
                }
            };
            execute(core, operation, action).await;
        });
    }

    /// Closes the executor and waits for queued and running operations.
    pub(crate) async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn execute<F>(core: Arc<ManagerCore>, operation: ChannelOperation, action: F)
where
    F: Future<Output = Result<(), Status>> + Send + 'static,
{
    let now = Utc::now();
    if operation.is_expired(now) {
        warn!(
            operation_id = %operation.operation_id,
            kind = %operation.kind,
            "Channel operation expired before execution"
        );
        let status = deadline_exceeded(&operation);
        core.fail_operation(&operation, status).await;
        return;
    }

    debug!(
        operation_id = %operation.operation_id,
        kind = %operation.kind,
        "Executing channel operation"
    );
    let mut action = tokio::spawn(action);
    let failure = match tokio::time::timeout(operation.remaining(now), &mut action).await {
        Ok(Ok(Ok(()))) => None,
        Ok(Ok(Err(status))) => Some(match status.code() {
            Code::Cancelled | Code::DeadlineExceeded => status,
            _ => Status::internal(status.message()),
        }),
        Ok(Err(join_error)) => {
            let reason = if join_error.is_panic() {
                "panicked"
            } else {
                "was aborted"
            };
            Some(Status::internal(format!(
                "Channel operation {} {}",
                operation.operation_id, reason
            )))
        }
        Err(_) => {
            action.abort();
            Some(deadline_exceeded(&operation))
        }
    };

    if let Some(status) = failure {
        error!(
            operation_id = %operation.operation_id,
            kind = %operation.kind,
            error = %status,
            "Channel operation failed"
        );
        core.fail_operation(&operation, status).await;
    }
}

fn deadline_exceeded(operation: &ChannelOperation) -> Status {
    Status::deadline_exceeded(format!(
        "Channel operation {} missed its deadline",
        operation.operation_id
    ))
}
