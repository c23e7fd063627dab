//! Transaction controller - per-operation commit/rollback coordination
//!
//! Every queue operation runs inside a transaction scope. Side effects
//! (container mutations, body saves, fault-queue enqueues) enroll hooks on
//! the controller; `complete` runs the enrolled work for the decided
//! outcome. A controller belongs to exactly one operation scope and is
//! never shared across scopes.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;

/// Work enrolled on a transaction, run on commit or rollback.
pub type TxHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Final outcome of a completed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    RolledBack { detail: Option<String> },
}

/// Per-operation coordinator for commit/rollback of side effects.
#[async_trait]
pub trait TransactionController: Send + Sync {
    fn transaction_id(&self) -> Uuid;

    /// Mark the transaction for commit. Rollback wins if both are scheduled.
    fn schedule_commit(&self);

    /// Mark the transaction for rollback, optionally with a diagnostic detail.
    fn schedule_rollback(&self, detail: Option<String>);

    fn is_rollback_scheduled(&self) -> bool;

    /// Enroll work to run when the transaction commits.
    fn on_commit(&self, hook: TxHook);

    /// Enroll work to run when the transaction rolls back.
    fn on_rollback(&self, hook: TxHook);

    /// Execute the enrolled work for the decided outcome.
    ///
    /// An unscheduled transaction commits. Completing twice is an error and
    /// runs nothing.
    async fn complete(&self) -> Result<TxOutcome, QueueError>;
}

/// Creates a fresh controller per operation scope.
pub trait TransactionControllerFactory: Send + Sync {
    fn begin(&self) -> Arc<dyn TransactionController>;
}

#[derive(Default)]
struct TxState {
    rollback: bool,
    rollback_detail: Option<String>,
    commit_hooks: Vec<TxHook>,
    rollback_hooks: Vec<TxHook>,
    completed: bool,
}

/// In-memory transaction controller. Hooks run in enrollment order on
/// commit and in reverse enrollment order on rollback, so compensations
/// undo the most recent mutation first.
pub struct InMemoryTransactionController {
    id: Uuid,
    state: Mutex<TxState>,
}

impl InMemoryTransactionController {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(TxState::default()),
        }
    }
}

impl Default for InMemoryTransactionController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionController for InMemoryTransactionController {
    fn transaction_id(&self) -> Uuid {
        self.id
    }

    fn schedule_commit(&self) {
        // Commit is the default; nothing to record unless rollback already won
        let state = self.state.lock();
        if state.rollback {
            debug!(transaction_id = %self.id, "Commit scheduled after rollback - rollback wins");
        }
    }

    fn schedule_rollback(&self, detail: Option<String>) {
        let mut state = self.state.lock();
        if !state.rollback {
            state.rollback = true;
            state.rollback_detail = detail;
        }
    }

    fn is_rollback_scheduled(&self) -> bool {
        self.state.lock().rollback
    }

    fn on_commit(&self, hook: TxHook) {
        self.state.lock().commit_hooks.push(hook);
    }

    fn on_rollback(&self, hook: TxHook) {
        self.state.lock().rollback_hooks.push(hook);
    }

    async fn complete(&self) -> Result<TxOutcome, QueueError> {
        let (outcome, hooks) = {
            let mut state = self.state.lock();
            if state.completed {
                return Err(QueueError::TransactionCompleted);
            }
            state.completed = true;

            if state.rollback {
                let mut hooks = std::mem::take(&mut state.rollback_hooks);
                hooks.reverse();
                state.commit_hooks.clear();
                (
                    TxOutcome::RolledBack {
                        detail: state.rollback_detail.take(),
                    },
                    hooks,
                )
            } else {
                state.rollback_hooks.clear();
                (TxOutcome::Committed, std::mem::take(&mut state.commit_hooks))
            }
        };

        if let TxOutcome::RolledBack { ref detail } = outcome {
            warn!(transaction_id = %self.id, detail = ?detail, "Rolling back transaction");
        }

        for hook in hooks {
            hook().await;
        }

        Ok(outcome)
    }
}

/// Factory handing out in-memory controllers.
#[derive(Default)]
pub struct InMemoryTransactionFactory;

impl TransactionControllerFactory for InMemoryTransactionFactory {
    fn begin(&self) -> Arc<dyn TransactionController> {
        Arc::new(InMemoryTransactionController::new())
    }
}

/// Wrap `work` with commit/rollback scheduling and completion.
///
/// Success schedules a commit unless the work itself asked for rollback;
/// failure schedules a rollback and invokes `report_error` before the
/// transaction completes. The transaction always completes exactly once.
pub async fn execute_in_transaction<T, E, F, Fut, R>(
    tx: Arc<dyn TransactionController>,
    work: F,
    report_error: R,
) -> Result<T, E>
where
    E: std::fmt::Display + From<QueueError>,
    F: FnOnce(Arc<dyn TransactionController>) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    R: FnOnce(&E),
{
    let result = work(tx.clone()).await;

    match &result {
        Ok(_) => {
            if !tx.is_rollback_scheduled() {
                tx.schedule_commit();
            }
        }
        Err(e) => {
            report_error(e);
            tx.schedule_rollback(Some(e.to_string()));
        }
    }

    tx.complete().await.map_err(E::from)?;
    result
}
