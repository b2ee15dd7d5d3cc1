//! Deletion of many objects through batched bulk delete calls.
use crate::{
    envelope::TaskOutcome,
    objstore::{ObjectLocation, ObjectStorage},
    task_queue::{TaskQueue, TaskQueueHandle, TaskTally},
    trigger::{TriggerEvent, TriggerType},
    Config, CosTaskError,
};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};
use tracing::{debug, error, info, instrument, warn};

mod batcher;

pub use batcher::{DeleteBatcher, DeleteResult};

/// What to delete, and how the deletion was triggered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteParams {
    pub source_list: Vec<ObjectLocation>,
    pub trigger_type: Option<TriggerType>,
    pub avoid_loop_risk: Option<bool>,
}

impl DeleteParams {
    pub fn new(source_list: Vec<ObjectLocation>) -> Self {
        Self {
            source_list,
            trigger_type: None,
            avoid_loop_risk: None,
        }
    }
}

impl From<TriggerEvent> for DeleteParams {
    fn from(event: TriggerEvent) -> Self {
        Self {
            source_list: event.source_list,
            trigger_type: Some(event.trigger_type),
            avoid_loop_risk: Some(event.avoid_loop_risk),
        }
    }
}

/// The parameters reported in a delete task's outcome
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteParamsSummary {
    pub source_list_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<TriggerType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avoid_loop_risk: Option<bool>,
}

impl From<&DeleteParams> for DeleteParamsSummary {
    fn from(params: &DeleteParams) -> Self {
        Self {
            source_list_length: params.source_list.len(),
            trigger_type: params.trigger_type,
            avoid_loop_risk: params.avoid_loop_risk,
        }
    }
}

/// Deletes every object in a source list, with up to `delete_parallel_limit` deletes pending at
/// once, all of them funneled through one [`DeleteBatcher`].
///
/// If `max_fail_limit` is set, the task stops scheduling deletes once more objects than that
/// have failed to delete.
#[derive(Debug)]
pub struct DeleteFileTask {
    params: DeleteParams,
    config: Config,
    storage: Box<dyn ObjectStorage>,
    queue: Mutex<Option<TaskQueueHandle>>,
}

impl DeleteFileTask {
    pub fn new(params: DeleteParams, config: Config, storage: Box<dyn ObjectStorage>) -> Self {
        Self {
            params,
            config,
            storage,
            queue: Mutex::new(None),
        }
    }

    pub fn params(&self) -> &DeleteParams {
        &self.params
    }

    /// Delete every object.  Never fails; the outcome holds either the tally of deleted and
    /// failed objects, or the error that stopped the task.
    #[instrument(skip(self), fields(sources = self.params.source_list.len()))]
    pub async fn run_task(&self) -> TaskOutcome<DeleteParamsSummary, TaskTally> {
        let batcher = DeleteBatcher::new(self.storage.clone(), &self.config);
        let queue = TaskQueue::new(
            self.params.source_list.clone(),
            self.config.delete_parallel_limit(),
        );
        let handle = queue.handle();
        self.set_queue(Some(handle.clone()));

        let max_fail_limit = self.config.max_fail_limit();
        let breaker_tripped = AtomicBool::new(false);

        let result = queue
            .start_tasks(
                |location| {
                    let batcher = batcher.clone();
                    async move { batcher.delete_file(location).await }
                },
                |result, tally| {
                    if let Err(e) = result {
                        warn!(error = %crate::envelope::error_chain(e), "Object not deleted");
                    }

                    let Some(max_fail_limit) = max_fail_limit else {
                        return;
                    };

                    if tally.fail > max_fail_limit && !breaker_tripped.swap(true, Ordering::SeqCst)
                    {
                        warn!(
                            fail = tally.fail,
                            max_fail_limit, "Too many failures; cancelling remaining deletes"
                        );

                        // Must take effect before the queue pulls its next task.  This only
                        // flags the queue; it never touches the tasks in flight.
                        let reason = CosTaskError::FailLimitExceeded {
                            fail: tally.fail,
                            max_fail_limit,
                        };
                        if let Err(e) = handle.cancel_tasks(reason) {
                            debug!(error = %e, "Queue finished before it could be cancelled");
                        }
                    }
                },
            )
            .await;

        self.set_queue(None);

        match &result {
            Ok(tally) => info!(success = tally.success, fail = tally.fail, "Delete task finished"),
            Err(e) => error!(error = %crate::envelope::error_chain(e), "Delete task stopped"),
        }

        TaskOutcome::new(DeleteParamsSummary::from(&self.params), result)
    }

    /// Stop scheduling further deletes.  Deletes already pending are allowed to finish.
    ///
    /// Does nothing if the task isn't running.
    pub fn cancel_task(&self, reason: CosTaskError) {
        let handle = self
            .queue
            .lock()
            .expect("BUG: delete task lock poisoned")
            .clone();

        if let Some(handle) = handle {
            if let Err(e) = handle.cancel_tasks(reason) {
                debug!(error = %e, "Ignoring error cancelling delete task");
            }
        }
    }

    fn set_queue(&self, handle: Option<TaskQueueHandle>) {
        *self.queue.lock().expect("BUG: delete task lock poisoned") = handle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::MemoryStorage;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use more_asserts::assert_lt;
    use std::{sync::Arc, time::Duration};

    fn location(key: &str) -> ObjectLocation {
        ObjectLocation::new("b-1250000000", "ap-guangzhou", key)
    }

    fn populated_storage(count: usize) -> (MemoryStorage, Vec<ObjectLocation>) {
        let storage = MemoryStorage::new();
        let locations = (0..count)
            .map(|i| {
                let location = location(&format!("k{i}"));
                storage.put_object(location.clone(), Bytes::from_static(b"x"));
                location
            })
            .collect();

        (storage, locations)
    }

    fn config(parallel_limit: usize) -> Config {
        Config::default().with_delete_batching(500, Duration::from_millis(50), parallel_limit)
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_everything() {
        let (storage, locations) = populated_storage(250);
        let task = DeleteFileTask::new(
            DeleteParams::new(locations.clone()),
            config(100),
            Box::new(storage.clone()),
        );

        let outcome = task.run_task().await;

        assert_eq!(
            &TaskTally {
                success: 250,
                fail: 0
            },
            outcome.result().unwrap()
        );
        assert!(locations.iter().all(|location| !storage.contains(location)));

        // Parallelism bounds the window, so no call exceeds it
        assert!(storage
            .delete_calls()
            .iter()
            .all(|call| call.keys.len() <= 100));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failures_are_counted() {
        let (storage, locations) = populated_storage(10);
        storage.reject_key("k3", "AccessDenied", "denied");
        storage.reject_key("k7", "AccessDenied", "denied");

        let task = DeleteFileTask::new(
            DeleteParams::new(locations),
            config(100),
            Box::new(storage.clone()),
        );

        let outcome = task.run_task().await;

        assert_eq!(
            &TaskTally {
                success: 8,
                fail: 2
            },
            outcome.result().unwrap()
        );
        assert!(storage.contains(&location("k3")));
        assert!(!storage.contains(&location("k4")));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_limit_cancels_the_queue() {
        let (storage, locations) = populated_storage(10);
        let storage = storage.with_delete_latency(Duration::from_millis(10));
        for location in &locations {
            storage.reject_key(location.key.clone(), "AccessDenied", "denied");
        }

        let task = DeleteFileTask::new(
            DeleteParams::new(locations),
            config(1).with_max_fail_limit(2),
            Box::new(storage.clone()),
        );

        let outcome = task.run_task().await;

        assert_matches!(
            outcome.error(),
            Some(CosTaskError::FailLimitExceeded {
                fail: 3,
                max_fail_limit: 2
            })
        );
        // One key per call with a parallel limit of 1; nothing is scheduled after the 3rd failure
        assert_eq!(3, storage.delete_calls().len());

        // The task isn't running anymore, so this is a no-op
        task.cancel_task(CosTaskError::TaskQueueCancelled {
            reason: "too late".to_string(),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_task_stops_a_running_task() {
        let (storage, locations) = populated_storage(50);
        let storage = storage.with_delete_latency(Duration::from_millis(10));

        let task = Arc::new(DeleteFileTask::new(
            DeleteParams::new(locations),
            config(1),
            Box::new(storage.clone()),
        ));

        let running = {
            let task = task.clone();
            tokio::spawn(async move { task.run_task().await })
        };

        tokio::time::sleep(Duration::from_millis(25)).await;
        task.cancel_task(CosTaskError::TaskQueueCancelled {
            reason: "interrupted".to_string(),
        });

        let outcome = running.await.unwrap();
        assert_matches!(
            outcome.error(),
            Some(CosTaskError::TaskQueueCancelled { reason }) if reason == "interrupted"
        );
        assert_lt!(storage.delete_calls().len(), 50);
    }

    #[test]
    fn params_summary_omits_missing_values() {
        let summary = DeleteParamsSummary::from(&DeleteParams::new(vec![location("a")]));
        assert_eq!(
            serde_json::json!({ "sourceListLength": 1 }),
            serde_json::to_value(summary).unwrap()
        );

        let summary = DeleteParamsSummary::from(&DeleteParams {
            source_list: vec![],
            trigger_type: Some(TriggerType::CosTrigger),
            avoid_loop_risk: Some(true),
        });
        assert_eq!(
            serde_json::json!({
                "sourceListLength": 0,
                "triggerType": "cosTrigger",
                "avoidLoopRisk": true
            }),
            serde_json::to_value(summary).unwrap()
        );
    }
}
