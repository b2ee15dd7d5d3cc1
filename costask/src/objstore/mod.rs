use crate::Result;
use bytes::Bytes;
use dyn_clone::DynClone;
use futures::Stream;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::{fmt, ops::Range, pin::Pin, sync::Arc};
use url::Url;

mod cos;
mod http;
mod memory;

pub use cos::CosStorage;
pub use http::HttpRangeReader;
pub use memory::{DeleteCall, MemoryStorage};

/// A stream of bytes read from, or about to be written to, object storage.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Host name suffixes under which COS serves buckets, and the infix that separates the bucket
/// name from the region.
const COS_HOST_PATTERNS: &[(&str, &str)] = &[
    (".cos.", ".myqcloud.com"),
    (".cos-internal.", ".myqcloud.com"),
    (".cos.", ".tencentcos.cn"),
    (".cos-internal.", ".tencentcos.cn"),
];

/// The location of one object: which bucket, in which region, under which key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub region: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            key: key.into(),
        }
    }

    /// Extract bucket, region and key from a COS object URL like
    /// `https://examplebucket-1250000000.cos.ap-guangzhou.myqcloud.com/dir/a.txt`.
    ///
    /// Both the public and the `cos-internal` hosts on `myqcloud.com` and `tencentcos.cn` are
    /// recognized.  The key is percent-decoded and the query string (a signature, most likely) is
    /// ignored.
    pub fn parse_cos_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .with_context(|| crate::error::UnsupportedObjectUrlSnafu { url: url.clone() })?;

        let (bucket, region) = COS_HOST_PATTERNS
            .iter()
            .find_map(|(infix, suffix)| {
                let rest = host.strip_suffix(suffix)?;
                let (bucket, region) = rest.split_once(infix)?;

                (!bucket.is_empty()
                    && !region.is_empty()
                    && !bucket.contains('.')
                    && !region.contains('.'))
                .then(|| (bucket.to_string(), region.to_string()))
            })
            .with_context(|| crate::error::UnsupportedObjectUrlSnafu { url: url.clone() })?;

        let path = url.path().strip_prefix('/').unwrap_or(url.path());
        let key = urlencoding::decode_binary(path.as_bytes());
        let key = String::from_utf8_lossy(&key).into_owned();

        Ok(Self {
            bucket,
            region,
            key,
        })
    }

    /// Make sure none of the components are empty, and that the bucket and region can be part of
    /// a host name
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.bucket.is_empty(),
            crate::error::IncompleteLocationSnafu { field: "bucket" }
        );
        ensure!(
            !self.region.is_empty(),
            crate::error::IncompleteLocationSnafu { field: "region" }
        );
        ensure!(
            !self.key.is_empty(),
            crate::error::IncompleteLocationSnafu { field: "key" }
        );

        self.ensure_host_labels()
    }

    /// The canonical public URL of this object
    pub fn url(&self) -> Result<Url> {
        self.ensure_host_labels()?;

        let mut url = Url::parse(&format!(
            "https://{}.cos.{}.myqcloud.com/",
            self.bucket, self.region
        ))
        .ok()
        .with_context(|| crate::error::InvalidLocationSnafu {
            bucket: self.bucket.clone(),
            region: self.region.clone(),
        })?;

        // `set_path` percent-encodes whatever needs it
        url.set_path(&self.key);

        Ok(url)
    }

    fn ensure_host_labels(&self) -> Result<()> {
        let is_label = |value: &str| {
            !value.is_empty()
                && value
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        };

        ensure!(
            is_label(&self.bucket) && is_label(&self.region),
            crate::error::InvalidLocationSnafu {
                bucket: self.bucket.clone(),
                region: self.region.clone(),
            }
        );

        Ok(())
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cos://{}/{} ({})", self.bucket, self.key, self.region)
    }
}

/// Turns a source URL into one that can be fetched without further credentials.
///
/// Implementations must be idempotent: signing an already-signed URL returns it unchanged.
#[async_trait::async_trait]
pub trait UrlSigner: DynClone + fmt::Debug + Sync + Send + 'static {
    async fn sign(&self, url: &Url) -> Result<Url>;
}

dyn_clone::clone_trait_object!(UrlSigner);

/// Reads byte ranges of objects identified by a (typically signed) URL.
#[async_trait::async_trait]
pub trait RangeReader: DynClone + fmt::Debug + Sync + Send + 'static {
    /// Query the size in bytes of the object at `url`.
    ///
    /// Objects whose size can't be determined from the response are reported as empty.
    async fn probe_size(&self, url: &Url) -> Result<u64>;

    /// Open a stream over the bytes `range` of the object at `url`.
    ///
    /// Implementations should not perform any I/O until the returned stream is first polled, so
    /// that a caller can line up many such streams and consume them one after another.
    fn open_range(&self, url: &Url, range: Range<u64>) -> ByteStream;
}

dyn_clone::clone_trait_object!(RangeReader);

/// The data that an upload reads from.
///
/// The uploader decides whether it reads everything in one stream via [`Self::read_all`] or
/// reads several byte ranges in parallel via [`Self::read_range`].
pub trait ReadSource: Send + Sync + 'static {
    /// Exact number of bytes the source yields
    fn content_length(&self) -> u64;

    fn read_range(&self, range: Range<u64>) -> Result<ByteStream>;

    fn read_all(&self) -> Result<ByteStream> {
        self.read_range(0..self.content_length())
    }
}

/// Where an upload goes and how big it will be
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    #[serde(flatten)]
    pub location: ObjectLocation,
    pub content_length: u64,
}

/// Result of a completed upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutput {
    pub location: String,
    pub bucket: String,
    pub key: String,
    pub etag: Option<String>,
}

/// A single key that a bulk delete call refused to delete
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteObjectError {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Response to a quiet-mode bulk delete.
///
/// In quiet mode only failures are itemized; every requested key not listed in `errors` was
/// deleted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDeleteOutput {
    pub deleted: Vec<String>,
    pub errors: Vec<DeleteObjectError>,
}

impl BatchDeleteOutput {
    /// Find the error reported for `key`.  If the provider reported more than one, the first wins.
    pub fn error_for(&self, key: &str) -> Option<&DeleteObjectError> {
        self.errors.iter().find(|error| error.key == key)
    }
}

/// An object storage system like COS.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait ObjectStorage: DynClone + fmt::Debug + Sync + Send + 'static {
    /// Delete up to 500 keys from one bucket in one call, in quiet mode.
    async fn delete_objects(
        &self,
        bucket: &str,
        region: &str,
        keys: Vec<String>,
    ) -> Result<BatchDeleteOutput>;

    /// Upload the bytes yielded by `source` as the object described by `target`.
    async fn upload(
        &self,
        target: UploadTarget,
        source: Arc<dyn ReadSource>,
    ) -> Result<UploadOutput>;
}

dyn_clone::clone_trait_object!(ObjectStorage);

/// Given the size of an object and the configured chunk size, return the chunk size to actually
/// use so that there are no more than 10,000 parts.
pub(crate) fn effective_chunk_size(size: u64, chunk_size: u64) -> u64 {
    const MAX_PARTS: u64 = 10_000;

    let chunk_size = chunk_size.max(1);

    if (size + chunk_size - 1) / chunk_size <= MAX_PARTS {
        chunk_size
    } else {
        (size + MAX_PARTS - 1) / MAX_PARTS
    }
}
