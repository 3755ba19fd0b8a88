use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a run's background task.
#[derive(Debug, Clone)]
pub struct RunHandle {
    abort: Option<AbortHandle>,
    settled: CancellationToken,
}

impl RunHandle {
    /// Resolves once the executor finished its cleanup, however it exited.
    pub async fn settled(&self) {
        self.settled.cancelled().await;
    }

    pub fn is_settled(&self) -> bool {
        self.settled.is_cancelled()
    }

    /// Hard-stop the task. Cleanup still runs through the executor's guard.
    pub fn abort(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

/// Process-wide map of run id to in-flight task. A cache, not a source of
/// truth: it starts empty on every boot.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, RunHandle>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a run before its task is spawned. The returned token must be
    /// cancelled by the task when it settles.
    pub fn register(&self, run_id: &str) -> CancellationToken {
        let settled = CancellationToken::new();
        self.lock().insert(
            run_id.to_string(),
            RunHandle {
                abort: None,
                settled: settled.clone(),
            },
        );
        settled
    }

    /// Attach the spawned task's abort handle. Ignored if the run already
    /// settled and was popped.
    pub fn attach_abort(&self, run_id: &str, abort: AbortHandle) {
        if let Some(handle) = self.lock().get_mut(run_id) {
            handle.abort = Some(abort);
        }
    }

    pub fn get(&self, run_id: &str) -> Option<RunHandle> {
        self.lock().get(run_id).cloned()
    }

    pub fn pop(&self, run_id: &str) -> Option<RunHandle> {
        self.lock().remove(run_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
