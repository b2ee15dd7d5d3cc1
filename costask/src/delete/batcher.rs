use crate::{
    objstore::{BatchDeleteOutput, ObjectLocation, ObjectStorage},
    Config, Result,
};
use itertools::Itertools;
use snafu::IntoError;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, instrument, warn};

/// What each caller of [`DeleteBatcher::delete_file`] eventually receives: the response to the
/// bulk delete call that included its key.  The response is shared by every key in that call.
pub type DeleteResult = Result<Arc<BatchDeleteOutput>>;

enum BatcherMessage {
    Delete(DeleteRequest),

    /// Flush the current window right away, and acknowledge once the bulk delete calls are
    /// dispatched
    Flush(oneshot::Sender<()>),
}

struct DeleteRequest {
    location: ObjectLocation,
    reply: oneshot::Sender<DeleteResult>,
}

/// Coalesces individual object deletes into bulk delete calls.
///
/// Requests accumulate in a window, which is flushed when it holds as many requests as the
/// configured flush threshold, or when the flush interval has passed since the first request
/// entered it, whichever comes first.  A flush groups the window by bucket and region and issues
/// one quiet-mode bulk delete per group; groups proceed independently of one another.
///
/// The window is owned by a background task; this handle only sends it requests.  Clones share
/// the same window.  Once every clone is dropped, whatever is left in the window is flushed and
/// the background task exits.
#[derive(Clone, Debug)]
pub struct DeleteBatcher {
    sender: mpsc::UnboundedSender<BatcherMessage>,
}

impl DeleteBatcher {
    /// Start a batcher that sends its bulk deletes to `storage`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(storage: Box<dyn ObjectStorage>, config: &Config) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let window = DeleteWindow {
            storage,
            flush_threshold: config.delete_flush_threshold(),
            flush_interval: config.delete_flush_interval(),
            pending: Vec::new(),
            deadline: None,
        };

        tokio::spawn(window.run(receiver));

        Self { sender }
    }

    /// Delete one object as part of some upcoming bulk delete.
    ///
    /// Resolves with the response to the bulk delete call once it completes.  Fails if COS
    /// reported an error for this particular key, or if the bulk delete call itself failed.
    pub async fn delete_file(&self, location: ObjectLocation) -> DeleteResult {
        let (reply, receiver) = oneshot::channel();
        let key = location.key.clone();

        self.sender
            .send(BatcherMessage::Delete(DeleteRequest { location, reply }))
            .map_err(|_| crate::error::DeleteBatcherGoneSnafu { key: key.clone() }.build())?;

        receiver
            .await
            .map_err(|_| crate::error::DeleteBatcherGoneSnafu { key }.build())?
    }

    /// Flush whatever is in the current window without waiting for the timer.
    pub async fn flush(&self) {
        let (done, receiver) = oneshot::channel();

        if self.sender.send(BatcherMessage::Flush(done)).is_ok() {
            let _ = receiver.await;
        }
    }
}

struct DeleteWindow {
    storage: Box<dyn ObjectStorage>,
    flush_threshold: usize,
    flush_interval: Duration,
    pending: Vec<DeleteRequest>,

    /// When the window must be flushed, if it isn't flushed earlier for being full.  Only set
    /// while the window holds requests.
    deadline: Option<Instant>,
}

impl DeleteWindow {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<BatcherMessage>) {
        debug!(
            flush_threshold = self.flush_threshold,
            flush_interval = ?self.flush_interval,
            "Delete batcher started"
        );

        loop {
            let deadline = self.deadline;

            tokio::select! {
                message = receiver.recv() => match message {
                    Some(BatcherMessage::Delete(request)) => self.enqueue(request),
                    Some(BatcherMessage::Flush(done)) => {
                        self.flush();
                        let _ = done.send(());
                    }
                    None => {
                        self.flush();
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debug!(pending = self.pending.len(), "Flush interval elapsed");
                    self.flush();
                }
            }
        }

        debug!("Delete batcher stopped");
    }

    fn enqueue(&mut self, request: DeleteRequest) {
        self.pending.push(request);

        if self.pending.len() >= self.flush_threshold {
            debug!(pending = self.pending.len(), "Window full");
            self.flush();
        } else if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.flush_interval);
        }
    }

    /// Dispatch one bulk delete per bucket and region in the window, and start a new window
    fn flush(&mut self) {
        self.deadline = None;

        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return;
        }

        let groups = pending.into_iter().into_group_map_by(|request| {
            (
                request.location.bucket.clone(),
                request.location.region.clone(),
            )
        });

        for ((bucket, region), requests) in groups {
            tokio::spawn(delete_group(self.storage.clone(), bucket, region, requests));
        }
    }
}

#[instrument(skip(storage, requests), fields(keys = requests.len()))]
async fn delete_group(
    storage: Box<dyn ObjectStorage>,
    bucket: String,
    region: String,
    requests: Vec<DeleteRequest>,
) {
    let keys = requests
        .iter()
        .map(|request| request.location.key.clone())
        .collect::<Vec<_>>();

    match storage.delete_objects(&bucket, &region, keys).await {
        Ok(output) => {
            let output = Arc::new(output);

            for request in requests {
                let result = match output.error_for(&request.location.key) {
                    Some(error) => crate::error::DeleteObjectRejectedSnafu {
                        bucket: bucket.clone(),
                        key: error.key.clone(),
                        code: error.code.clone(),
                        message: error.message.clone(),
                    }
                    .fail(),
                    None => Ok(output.clone()),
                };

                // The caller may have gone away; that's its business
                let _ = request.reply.send(result);
            }
        }
        Err(e) => {
            warn!(error = %e, "Bulk delete call failed; failing every key in it");
            let e = Arc::new(e);

            for request in requests {
                let _ = request.reply.send(Err(crate::error::BatchDeleteFailedSnafu {
                    bucket: bucket.clone(),
                    region: region.clone(),
                }
                .into_error(e.clone())));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::MemoryStorage;
    use assert_matches::assert_matches;
    use futures::future::join_all;

    const INTERVAL: Duration = Duration::from_millis(5000);

    fn location(key: &str) -> ObjectLocation {
        ObjectLocation::new("b-1250000000", "ap-guangzhou", key)
    }

    fn batcher(storage: &MemoryStorage, batch_size: usize) -> DeleteBatcher {
        let config = Config::default().with_delete_batching(batch_size, INTERVAL, 1000);
        DeleteBatcher::new(Box::new(storage.clone()), &config)
    }

    fn spawn_delete(batcher: &DeleteBatcher, key: &str) -> tokio::task::JoinHandle<DeleteResult> {
        let batcher = batcher.clone();
        let location = location(key);
        tokio::spawn(async move { batcher.delete_file(location).await })
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_window_is_full() {
        let storage = MemoryStorage::new();
        let batcher = batcher(&storage, 500);

        let handles = (0..501)
            .map(|i| spawn_delete(&batcher, &format!("k{i}")))
            .collect::<Vec<_>>();

        // Well short of the flush interval
        tokio::time::sleep(Duration::from_millis(1)).await;

        let calls = storage.delete_calls();
        assert_eq!(1, calls.len());
        assert_eq!(500, calls[0].keys.len());

        for result in join_all(handles).await {
            result.unwrap().unwrap();
        }

        let calls = storage.delete_calls();
        assert_eq!(2, calls.len());
        assert_eq!(vec!["k500".to_string()], calls[1].keys);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_timer_fires() {
        let storage = MemoryStorage::new();
        let batcher = batcher(&storage, 500);

        let handles = ["a", "b", "c"]
            .into_iter()
            .map(|key| spawn_delete(&batcher, key))
            .collect::<Vec<_>>();

        tokio::time::sleep(INTERVAL - Duration::from_millis(1)).await;
        assert!(storage.delete_calls().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let calls = storage.delete_calls();
        assert_eq!(1, calls.len());
        assert_eq!(3, calls[0].keys.len());

        for result in join_all(handles).await {
            result.unwrap().unwrap();
        }

        // The timer was cleared by the flush; nothing fires again
        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(1, storage.delete_calls().len());
    }

    #[tokio::test(start_paused = true)]
    async fn demuxes_per_key_errors() {
        let storage = MemoryStorage::new();
        storage.reject_key("b", "AccessDenied", "denied");
        let batcher = batcher(&storage, 500);

        let (a, b, c) = tokio::join!(
            batcher.delete_file(location("a")),
            batcher.delete_file(location("b")),
            batcher.delete_file(location("c")),
        );

        let a = a.unwrap();
        let c = c.unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(1, a.errors.len());

        assert_matches!(
            b,
            Err(crate::CosTaskError::DeleteObjectRejected { key, code, message, .. })
                if key == "b" && code == "AccessDenied" && message == "denied"
        );

        assert_eq!(1, storage.delete_calls().len());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_call_fails_every_key_in_group() {
        let storage = MemoryStorage::new();
        storage.fail_next_delete_calls(1);
        let batcher = batcher(&storage, 2);

        let (a, b) = tokio::join!(
            batcher.delete_file(location("a")),
            batcher.delete_file(location("b")),
        );

        for result in [a, b] {
            assert_matches!(
                result,
                Err(crate::CosTaskError::BatchDeleteFailed { source, .. })
                    if matches!(*source, crate::CosTaskError::InjectedDeleteFailure { .. })
            );
        }

        // The next window is unaffected
        batcher.delete_file(location("c")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn groups_by_bucket_and_region() {
        let storage = MemoryStorage::new();
        let batcher = batcher(&storage, 500);

        let (a, b, c) = tokio::join!(
            batcher.delete_file(ObjectLocation::new("one-1250000000", "ap-guangzhou", "a")),
            batcher.delete_file(ObjectLocation::new("two-1250000000", "ap-guangzhou", "b")),
            batcher.delete_file(ObjectLocation::new("one-1250000000", "ap-beijing", "c")),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let mut calls = storage
            .delete_calls()
            .into_iter()
            .map(|call| (call.bucket, call.region, call.keys))
            .collect::<Vec<_>>();
        calls.sort();

        assert_eq!(
            vec![
                (
                    "one-1250000000".to_string(),
                    "ap-beijing".to_string(),
                    vec!["c".to_string()]
                ),
                (
                    "one-1250000000".to_string(),
                    "ap-guangzhou".to_string(),
                    vec!["a".to_string()]
                ),
                (
                    "two-1250000000".to_string(),
                    "ap-guangzhou".to_string(),
                    vec!["b".to_string()]
                ),
            ],
            calls
        );
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_skips_the_timer() {
        let storage = MemoryStorage::new();
        let batcher = batcher(&storage, 500);

        let handle = spawn_delete(&batcher, "a");
        tokio::task::yield_now().await;

        batcher.flush().await;
        let start = Instant::now();
        handle.await.unwrap().unwrap();

        assert!(start.elapsed() < INTERVAL);
        assert_eq!(1, storage.delete_calls().len());

        // Flushing an empty window is a no-op
        batcher.flush().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(1, storage.delete_calls().len());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_flushes() {
        let storage = MemoryStorage::new();
        let batcher = batcher(&storage, 500);

        let (reply, receiver) = oneshot::channel();
        batcher
            .sender
            .send(BatcherMessage::Delete(DeleteRequest {
                location: location("a"),
                reply,
            }))
            .unwrap_or_else(|_| panic!("batcher stopped early"));
        drop(batcher);

        let start = Instant::now();
        receiver.await.unwrap().unwrap();

        assert!(start.elapsed() < INTERVAL);
        assert_eq!(1, storage.delete_calls().len());
    }
}
