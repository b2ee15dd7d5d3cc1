//! Concatenation of many source objects into one target object.
//!
//! The sources are laid out end to end in a virtual address space.  Once every source's size is
//! known, any byte range of the virtual object can be read by streaming the overlapping slices of
//! the sources one after another, which is exactly what a (multipart) upload of the target needs.
use crate::{
    envelope::TaskOutcome,
    joiner::join_streams,
    objstore::{
        ByteStream, ObjectLocation, ObjectStorage, RangeReader, ReadSource, UploadOutput,
        UploadTarget, UrlSigner,
    },
    Config, Result,
};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use snafu::prelude::*;
use std::{ops::Range, sync::Arc};
use tracing::{debug, error, info, instrument};
use url::Url;

/// How many source URLs are echoed back in the parameters of a task outcome
const MAX_ECHOED_SOURCES: usize = 20;

/// One source object of a concatenation.
///
/// `signed_url` and `size` are filled in when sizes are resolved; `start` and `end` (exclusive)
/// locate the object in the virtual concatenated object once offsets are resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceItem {
    pub url: Url,
    #[serde(skip)]
    pub signed_url: Option<Url>,
    pub size: Option<u64>,
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl SourceItem {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            signed_url: None,
            size: None,
            start: None,
            end: None,
        }
    }
}

/// The slice of one source object that falls inside a requested range of the virtual object.
///
/// The offsets are relative to the start of the source object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelatedPart {
    /// Position of the source in the source list
    pub index: usize,
    pub signed_url: Url,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl RelatedPart {
    pub fn len(&self) -> u64 {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What to concatenate, and where to put the result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConcatParams {
    pub source_list: Vec<Url>,
    pub target: ObjectLocation,
}

/// The parameters reported in a concat task's outcome.  Only the first 20 sources are listed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcatParamsSummary {
    pub source_list: Vec<Url>,
    pub source_list_length: usize,
    pub target_bucket: String,
    pub target_region: String,
    pub target_key: String,
}

impl From<&ConcatParams> for ConcatParamsSummary {
    fn from(params: &ConcatParams) -> Self {
        Self {
            source_list: params
                .source_list
                .iter()
                .take(MAX_ECHOED_SOURCES)
                .cloned()
                .collect(),
            source_list_length: params.source_list.len(),
            target_bucket: params.target.bucket.clone(),
            target_region: params.target.region.clone(),
            target_key: params.target.key.clone(),
        }
    }
}

/// A source whose place in the virtual object is known
#[derive(Clone, Debug)]
struct PlacedSource {
    signed_url: Url,
    start: u64,
    end: u64,
}

/// The resolved layout of the virtual concatenated object.
///
/// This is what the uploader reads from; it's immutable, so the uploader can read many ranges of
/// it at the same time.
#[derive(Clone, Debug)]
pub struct ConcatLayout {
    sources: Vec<PlacedSource>,
    total_size: u64,
    reader: Box<dyn RangeReader>,
}

impl ConcatLayout {
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Intersect `range` with every source.  Sources that don't overlap the range are left out.
    pub fn related_parts(&self, range: Range<u64>) -> Result<Vec<RelatedPart>> {
        ensure!(
            range.start <= range.end && range.end <= self.total_size,
            crate::error::RangeOutOfBoundsSnafu {
                start: range.start,
                end: range.end,
                total_size: self.total_size,
            }
        );

        Ok(self
            .sources
            .iter()
            .enumerate()
            .filter(|(_, source)| !(source.end <= range.start || source.start >= range.end))
            .map(|(index, source)| RelatedPart {
                index,
                signed_url: source.signed_url.clone(),
                start_offset: source.start.max(range.start) - source.start,
                end_offset: source.end.min(range.end) - source.start,
            })
            .collect())
    }

    /// Stream the bytes `range` of the virtual object.
    ///
    /// The range of each related source is opened only once the previous one has been read to
    /// the end.
    pub fn read_stream(&self, range: Range<u64>) -> Result<ByteStream> {
        let parts = self.related_parts(range.clone())?;
        debug!(?range, parts = parts.len(), "Opening concatenated range");

        let reader = self.reader.clone();

        Ok(join_streams(parts.into_iter(), move |mut parts| {
            let part = parts.next()?;
            let stream = reader.open_range(&part.signed_url, part.start_offset..part.end_offset);
            Some((stream, parts))
        })
        .boxed())
    }
}

impl ReadSource for ConcatLayout {
    fn content_length(&self) -> u64 {
        self.total_size
    }

    fn read_range(&self, range: Range<u64>) -> Result<ByteStream> {
        self.read_stream(range)
    }
}

/// Concatenates the objects in a source list into one target object.
#[derive(Debug)]
pub struct ConcatFileTask {
    params: ConcatParams,
    config: Config,
    signer: Box<dyn UrlSigner>,
    reader: Box<dyn RangeReader>,
    storage: Box<dyn ObjectStorage>,
    sources: Vec<SourceItem>,
    total_size: Option<u64>,
    layout: Option<Arc<ConcatLayout>>,
}

impl ConcatFileTask {
    pub fn new(
        params: ConcatParams,
        config: Config,
        signer: Box<dyn UrlSigner>,
        reader: Box<dyn RangeReader>,
        storage: Box<dyn ObjectStorage>,
    ) -> Self {
        let sources = params.source_list.iter().cloned().map(SourceItem::new).collect();

        Self {
            params,
            config,
            signer,
            reader,
            storage,
            sources,
            total_size: None,
            layout: None,
        }
    }

    pub fn params(&self) -> &ConcatParams {
        &self.params
    }

    pub fn sources(&self) -> &[SourceItem] {
        &self.sources
    }

    /// Total size of the concatenated object, once sizes are resolved
    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Sign every source URL and probe the size of the object behind it, with at most
    /// `metadata_concurrency` probes in flight.
    ///
    /// The first failure aborts the whole resolution; in that case no source is updated.
    #[instrument(skip(self), fields(sources = self.sources.len()))]
    pub async fn resolve_sizes(&mut self) -> Result<u64> {
        let signer = &self.signer;
        let reader = &self.reader;

        let resolved = futures::stream::iter(self.sources.iter().map(|source| async move {
            let signed_url = signer.sign(&source.url).await?;
            let size = reader.probe_size(&signed_url).await?;

            Ok::<_, crate::CosTaskError>((signed_url, size))
        }))
        .buffered(self.config.metadata_concurrency())
        .try_collect::<Vec<_>>()
        .await?;

        for (source, (signed_url, size)) in self.sources.iter_mut().zip(resolved) {
            source.signed_url = Some(signed_url);
            source.size = Some(size);
        }

        let total_size = self.sources.iter().filter_map(|source| source.size).sum();
        self.total_size = Some(total_size);

        debug!(total_size, "Resolved source sizes");

        Ok(total_size)
    }

    /// Place the sources end to end, in order, starting at offset 0.
    ///
    /// Fails with [`crate::CosTaskError::OffsetsNotResolved`] if sizes haven't been resolved yet.
    pub fn resolve_offsets(&mut self) -> Result<()> {
        let mut placed = Vec::with_capacity(self.sources.len());
        let mut offset = 0u64;

        for source in &self.sources {
            let (Some(signed_url), Some(size)) = (&source.signed_url, source.size) else {
                return crate::error::OffsetsNotResolvedSnafu.fail();
            };

            placed.push(PlacedSource {
                signed_url: signed_url.clone(),
                start: offset,
                end: offset + size,
            });
            offset += size;
        }

        for (source, place) in self.sources.iter_mut().zip(&placed) {
            source.start = Some(place.start);
            source.end = Some(place.end);
        }

        self.total_size = Some(offset);
        self.layout = Some(Arc::new(ConcatLayout {
            sources: placed,
            total_size: offset,
            reader: self.reader.clone(),
        }));

        Ok(())
    }

    /// The resolved layout.  Only available after [`Self::resolve_offsets`].
    pub fn layout(&self) -> Result<Arc<ConcatLayout>> {
        self.layout
            .clone()
            .context(crate::error::OffsetsNotResolvedSnafu)
    }

    pub fn related_parts(&self, range: Range<u64>) -> Result<Vec<RelatedPart>> {
        self.layout()?.related_parts(range)
    }

    pub fn read_stream(&self, range: Range<u64>) -> Result<ByteStream> {
        self.layout()?.read_stream(range)
    }

    /// Resolve the sources and upload their concatenation to the target.
    ///
    /// Never fails; the outcome holds either the upload result or the error that stopped the
    /// task.
    pub async fn run_task(&mut self) -> TaskOutcome<ConcatParamsSummary, UploadOutput> {
        let outcome = self.run().await;

        match &outcome {
            Ok(output) => info!(location = %output.location, "Concatenation uploaded"),
            Err(e) => error!(error = %crate::envelope::error_chain(e), "Concatenation failed"),
        }

        TaskOutcome::new(ConcatParamsSummary::from(&self.params), outcome)
    }

    #[instrument(skip(self), fields(target = %self.params.target))]
    async fn run(&mut self) -> Result<UploadOutput> {
        self.params.target.validate()?;

        self.resolve_sizes().await?;
        self.resolve_offsets()?;

        let layout = self.layout()?;
        let target = UploadTarget {
            location: self.params.target.clone(),
            content_length: layout.total_size(),
        };

        debug!(content_length = target.content_length, "Uploading concatenation");

        self.storage.upload(target, layout).await
    }
}
