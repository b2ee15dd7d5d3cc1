//! An object store that lives entirely in process memory.
//!
//! Useful for dry runs and for exercising the task logic without network access.  It understands
//! the same COS object URLs as the real implementation, and lets callers inject failures into
//! probes, reads, and bulk deletes.
use super::{
    BatchDeleteOutput, ByteStream, DeleteObjectError, ObjectLocation, ObjectStorage, RangeReader,
    ReadSource, UploadOutput, UploadTarget, UrlSigner,
};
use crate::Result;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use snafu::prelude::*;
use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::debug;
use url::Url;

/// Size of the chunks range reads are split into
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// One call to [`ObjectStorage::delete_objects`] as seen by the in-memory store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteCall {
    pub bucket: String,
    pub region: String,
    pub keys: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<ObjectLocation, Bytes>,
    failing_probes: HashSet<ObjectLocation>,
    failing_reads: HashSet<ObjectLocation>,
    rejected_keys: HashMap<String, (String, String)>,
    failing_delete_calls: usize,
    delete_latency: Option<Duration>,
    upload_part_size: Option<u64>,
    delete_calls: Vec<DeleteCall>,
    opened_ranges: Vec<(ObjectLocation, Range<u64>)>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner
            .lock()
            .expect("BUG: memory storage lock poisoned")
    }

    /// Store `data` at `location`, replacing whatever was there
    pub fn put_object(&self, location: ObjectLocation, data: impl Into<Bytes>) {
        self.state().objects.insert(location, data.into());
    }

    pub fn object(&self, location: &ObjectLocation) -> Option<Bytes> {
        self.state().objects.get(location).cloned()
    }

    pub fn contains(&self, location: &ObjectLocation) -> bool {
        self.state().objects.contains_key(location)
    }

    /// Make every metadata probe of `url` fail
    pub fn fail_probe(&self, url: &Url) -> Result<()> {
        let location = ObjectLocation::parse_cos_url(url)?;
        self.state().failing_probes.insert(location);
        Ok(())
    }

    /// Make range reads of `url` fail after yielding the first chunk of data
    pub fn fail_read(&self, url: &Url) -> Result<()> {
        let location = ObjectLocation::parse_cos_url(url)?;
        self.state().failing_reads.insert(location);
        Ok(())
    }

    /// Report `key` as failed in every bulk delete that includes it
    pub fn reject_key(
        &self,
        key: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.state()
            .rejected_keys
            .insert(key.into(), (code.into(), message.into()));
    }

    /// Make the next `count` bulk delete calls fail outright
    pub fn fail_next_delete_calls(&self, count: usize) {
        self.state().failing_delete_calls = count;
    }

    /// Delay every bulk delete call by `latency`
    pub fn with_delete_latency(self, latency: Duration) -> Self {
        self.state().delete_latency = Some(latency);
        self
    }

    /// Make uploads read their source in ranges of `part_size` bytes rather than all at once
    pub fn with_upload_part_size(self, part_size: u64) -> Self {
        self.state().upload_part_size = Some(part_size.max(1));
        self
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.state().delete_calls.clone()
    }

    /// Every range that was actually read, in the order the reads started
    pub fn opened_ranges(&self) -> Vec<(ObjectLocation, Range<u64>)> {
        self.state().opened_ranges.clone()
    }

    fn read_range_now(&self, url: &Url, range: Range<u64>) -> Result<ByteStream> {
        let location = ObjectLocation::parse_cos_url(url)?;
        let mut state = self.state();

        state.opened_ranges.push((location.clone(), range.clone()));

        let data = state
            .objects
            .get(&location)
            .with_context(|| crate::error::MemoryObjectNotFoundSnafu { url: url.clone() })?;

        let end = (range.end as usize).min(data.len());
        let start = (range.start as usize).min(end);
        let data = data.slice(start..end);

        let mut chunks = data
            .chunks(READ_CHUNK_SIZE)
            .map(|chunk| Ok(data.slice_ref(chunk)))
            .collect::<Vec<_>>();

        if state.failing_reads.contains(&location) {
            chunks.truncate(1);
            chunks.push(crate::error::InjectedReadFailureSnafu { url: url.clone() }.fail());
        }

        Ok(futures::stream::iter(chunks).boxed())
    }
}

#[async_trait::async_trait]
impl UrlSigner for MemoryStorage {
    async fn sign(&self, url: &Url) -> Result<Url> {
        if url.query_pairs().any(|(name, _)| name == "q-signature") {
            return Ok(url.clone());
        }

        let mut signed = url.clone();
        signed
            .query_pairs_mut()
            .append_pair("q-sign-algorithm", "sha1")
            .append_pair("q-signature", "memory");

        Ok(signed)
    }
}

#[async_trait::async_trait]
impl RangeReader for MemoryStorage {
    async fn probe_size(&self, url: &Url) -> Result<u64> {
        let location = ObjectLocation::parse_cos_url(url)?;
        let state = self.state();

        ensure!(
            !state.failing_probes.contains(&location),
            crate::error::InjectedProbeFailureSnafu { url: url.clone() }
        );

        state
            .objects
            .get(&location)
            .map(|data| data.len() as u64)
            .with_context(|| crate::error::MemoryObjectNotFoundSnafu { url: url.clone() })
    }

    fn open_range(&self, url: &Url, range: Range<u64>) -> ByteStream {
        let me = self.clone();
        let url = url.clone();

        // Defer the read until the stream is polled, like a real HTTP request would be
        futures::stream::once(async move { me.read_range_now(&url, range) })
            .try_flatten()
            .boxed()
    }
}

#[async_trait::async_trait]
impl ObjectStorage for MemoryStorage {
    async fn delete_objects(
        &self,
        bucket: &str,
        region: &str,
        keys: Vec<String>,
    ) -> Result<BatchDeleteOutput> {
        let latency = {
            let mut state = self.state();
            state.delete_calls.push(DeleteCall {
                bucket: bucket.to_string(),
                region: region.to_string(),
                keys: keys.clone(),
            });
            state.delete_latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();

        if state.failing_delete_calls > 0 {
            state.failing_delete_calls -= 1;
            return crate::error::InjectedDeleteFailureSnafu { bucket }.fail();
        }

        let mut output = BatchDeleteOutput::default();
        for key in keys {
            if let Some((code, message)) = state.rejected_keys.get(&key) {
                output.errors.push(DeleteObjectError {
                    key,
                    code: code.clone(),
                    message: message.clone(),
                });
            } else {
                state
                    .objects
                    .remove(&ObjectLocation::new(bucket, region, key.as_str()));
                output.deleted.push(key);
            }
        }

        debug!(
            bucket,
            deleted = output.deleted.len(),
            errors = output.errors.len(),
            "In-memory bulk delete"
        );

        Ok(output)
    }

    async fn upload(
        &self,
        target: UploadTarget,
        source: Arc<dyn ReadSource>,
    ) -> Result<UploadOutput> {
        let part_size = self.state().upload_part_size;

        let streams = match part_size {
            None => vec![source.read_all()?],
            Some(part_size) => {
                let mut streams = Vec::new();
                let mut offset = 0u64;
                while offset < target.content_length {
                    let end = (offset + part_size).min(target.content_length);
                    streams.push(source.read_range(offset..end)?);
                    offset = end;
                }
                streams
            }
        };

        let mut buffer = BytesMut::with_capacity(target.content_length as usize);
        for mut stream in streams {
            while let Some(chunk) = stream.try_next().await? {
                buffer.extend_from_slice(&chunk);
            }
        }

        ensure!(
            buffer.len() as u64 == target.content_length,
            crate::error::UploadSizeMismatchSnafu {
                key: target.location.key.clone(),
                expected: target.content_length,
                actual: buffer.len() as u64,
            }
        );

        let etag = format!("\"{:016x}\"", buffer.len());
        let location = target.location;
        let output = UploadOutput {
            location: location.url()?.to_string(),
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            etag: Some(etag),
        };

        self.put_object(location, buffer.freeze());

        Ok(output)
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryStorage")
            .field("objects", &state.objects.len())
            .field("delete_calls", &state.delete_calls.len())
            .finish()
    }
}
