//! Runs a list of tasks with bounded parallelism, with support for cooperative cancellation.
use crate::{CosTaskError, Result};
use futures::{Future, StreamExt};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Running count of settled tasks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TaskTally {
    pub success: u64,
    pub fail: u64,
}

impl TaskTally {
    pub fn total(&self) -> u64 {
        self.success + self.fail
    }
}

pub struct TaskQueue<T> {
    tasks: Vec<T>,
    parallel_limit: usize,
    control: Arc<QueueControl>,
}

struct QueueControl {
    token: CancellationToken,
    reason: Mutex<Option<CosTaskError>>,
    finished: AtomicBool,
}

/// Lets code outside of the queue stop it.  Cheap to clone.
#[derive(Clone)]
pub struct TaskQueueHandle {
    control: Arc<QueueControl>,
}

impl<T> TaskQueue<T> {
    pub fn new(tasks: Vec<T>, parallel_limit: usize) -> Self {
        Self {
            tasks,
            parallel_limit: parallel_limit.max(1),
            control: Arc::new(QueueControl {
                token: CancellationToken::new(),
                reason: Mutex::new(None),
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn handle(&self) -> TaskQueueHandle {
        TaskQueueHandle {
            control: self.control.clone(),
        }
    }

    /// Run every task through `process`, with at most `parallel_limit` in flight.
    ///
    /// `on_result` is called once for each settled task, with the task's result and the tally
    /// that includes it.  If the queue is cancelled no further tasks are started, tasks already
    /// in flight are allowed to settle, and the error the queue was cancelled with is returned.
    #[instrument(skip_all, fields(tasks = self.tasks.len(), parallel_limit = self.parallel_limit))]
    pub async fn start_tasks<R, P, Fut, O>(self, process: P, mut on_result: O) -> Result<TaskTally>
    where
        P: FnMut(T) -> Fut,
        Fut: Future<Output = Result<R>>,
        O: FnMut(&Result<R>, TaskTally),
    {
        let token = self.control.token.clone();

        let mut results = futures::stream::iter(self.tasks)
            .take_while(move |_| futures::future::ready(!token.is_cancelled()))
            .map(process)
            .buffer_unordered(self.parallel_limit);

        let mut tally = TaskTally::default();

        while let Some(result) = results.next().await {
            match &result {
                Ok(_) => tally.success += 1,
                Err(_) => tally.fail += 1,
            }

            on_result(&result, tally);
        }

        self.control.finished.store(true, Ordering::SeqCst);

        let reason = self
            .control
            .reason
            .lock()
            .expect("BUG: task queue lock poisoned")
            .take();

        match reason {
            Some(reason) => {
                debug!(?tally, "Task queue stopped after cancellation");
                Err(reason)
            }
            None => {
                debug!(?tally, "Task queue finished");
                Ok(tally)
            }
        }
    }
}

impl TaskQueueHandle {
    /// Stop scheduling tasks.  The first error a queue is cancelled with is the one it reports.
    ///
    /// Fails if the queue already finished.
    pub fn cancel_tasks(&self, reason: CosTaskError) -> Result<()> {
        if self.control.finished.load(Ordering::SeqCst) {
            return crate::error::TaskQueueNotRunningSnafu.fail();
        }

        let mut stored = self
            .control
            .reason
            .lock()
            .expect("BUG: task queue lock poisoned");

        if stored.is_none() {
            debug!(%reason, "Cancelling task queue");
            *stored = Some(reason);
        }

        self.control.token.cancel();

        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.token.is_cancelled()
    }
}

impl std::fmt::Debug for TaskQueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueueHandle")
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.control.finished.load(Ordering::SeqCst))
            .finish()
    }
}
