use std::time::Duration;
use url::Url;

/// The largest number of keys COS accepts in a single bulk delete call.
pub(crate) const MAX_DELETE_BATCH_SIZE: usize = 500;

/// The configuration settings that control the behavior of concat and delete tasks.
///
/// Library callers start from [`Config::default`] and adjust it with the `with_*` methods.  When
/// the `clap` feature is enabled the same struct can be parsed from the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3-compatible endpoint instead of the COS regional endpoint.
    ///
    /// If this is not set, requests for a bucket in region `ap-guangzhou` go to
    /// `https://cos.ap-guangzhou.myqcloud.com`.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub(crate) cos_endpoint: Option<Url>,

    /// The secret ID used to sign requests to COS.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, env = "TENCENTCLOUD_SECRETID", hide_env_values = true)
    )]
    pub(crate) secret_id: Option<String>,

    /// The secret key used to sign requests to COS.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, env = "TENCENTCLOUD_SECRETKEY", hide_env_values = true)
    )]
    pub(crate) secret_key: Option<String>,

    /// The session token that accompanies temporary credentials.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, env = "TENCENTCLOUD_SESSIONTOKEN", hide_env_values = true)
    )]
    pub(crate) session_token: Option<String>,

    /// The chunk size used for multipart uploads of the concatenated object.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    ///
    /// The maximum number of chunks in an upload is 10,000, so for very large objects this chunk
    /// size is raised to 1/10,000th of the size of the object.
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub(crate) multipart_chunk_size: byte_unit::Byte,

    /// The size at or above which the concatenated object is uploaded with multipart.
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub(crate) multipart_threshold: byte_unit::Byte,

    /// The maximum number of concurrent part uploads.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub(crate) max_concurrent_requests: usize,

    /// How many source objects are probed for their size at the same time.
    #[cfg_attr(feature = "clap", clap(long, default_value = "9", global = true))]
    pub(crate) metadata_concurrency: usize,

    /// Maximum number of keys in one bulk delete call.  Values above 500 are clamped to 500.
    #[cfg_attr(feature = "clap", clap(long, default_value = "500", global = true))]
    pub(crate) delete_batch_size: usize,

    /// How long, in milliseconds, delete requests are collected before a bulk delete is issued.
    #[cfg_attr(feature = "clap", clap(long, default_value = "5000", global = true))]
    pub(crate) delete_flush_interval_ms: u64,

    /// How many objects are deleted at the same time.
    ///
    /// A window of pending deletes is also flushed as soon as it holds this many requests, since
    /// no more can arrive until some of them complete.
    #[cfg_attr(feature = "clap", clap(long, default_value = "100", global = true))]
    pub(crate) delete_parallel_limit: usize,

    /// Stop a delete task once more than this many objects failed to delete.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub(crate) max_fail_limit: Option<u64>,

    /// How long, in seconds, presigned source URLs remain valid.
    #[cfg_attr(feature = "clap", clap(long, default_value = "86400", global = true))]
    pub(crate) signed_url_expiry_secs: u64,

    /// How many times a metadata probe is attempted before giving up.
    #[cfg_attr(feature = "clap", clap(long, default_value = "3", global = true))]
    pub(crate) request_attempts: usize,

    /// Timeout, in seconds, of a single range read of a source object.
    #[cfg_attr(feature = "clap", clap(long, default_value = "300", global = true))]
    pub(crate) range_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: This is duplicated here and in the `clap` attributes; keep them in sync.  The
        // `defaults_match` test catches drift.
        Self {
            cos_endpoint: None,
            secret_id: None,
            secret_key: None,
            session_token: None,
            multipart_chunk_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            multipart_threshold: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            max_concurrent_requests: 10,
            metadata_concurrency: 9,
            delete_batch_size: MAX_DELETE_BATCH_SIZE,
            delete_flush_interval_ms: 5000,
            delete_parallel_limit: 100,
            max_fail_limit: None,
            signed_url_expiry_secs: 24 * 60 * 60,
            request_attempts: 3,
            range_timeout_secs: 5 * 60,
        }
    }
}

impl Config {
    pub fn with_cos_endpoint(mut self, endpoint: impl Into<Option<Url>>) -> Self {
        self.cos_endpoint = endpoint.into();
        self
    }

    pub fn with_credentials(
        mut self,
        secret_id: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        self.secret_id = Some(secret_id.into());
        self.secret_key = Some(secret_key.into());
        self.session_token = session_token;
        self
    }

    pub fn with_multipart(mut self, chunk_size: u64, threshold: u64) -> Self {
        self.multipart_chunk_size = byte_unit::Byte::from_bytes(chunk_size as u128);
        self.multipart_threshold = byte_unit::Byte::from_bytes(threshold as u128);
        self
    }

    pub fn with_metadata_concurrency(mut self, concurrency: usize) -> Self {
        self.metadata_concurrency = concurrency;
        self
    }

    pub fn with_delete_batching(
        mut self,
        batch_size: usize,
        flush_interval: Duration,
        parallel_limit: usize,
    ) -> Self {
        self.delete_batch_size = batch_size;
        self.delete_flush_interval_ms = flush_interval.as_millis() as u64;
        self.delete_parallel_limit = parallel_limit;
        self
    }

    pub fn with_max_fail_limit(mut self, max_fail_limit: impl Into<Option<u64>>) -> Self {
        self.max_fail_limit = max_fail_limit.into();
        self
    }

    pub fn max_fail_limit(&self) -> Option<u64> {
        self.max_fail_limit
    }

    pub(crate) fn multipart_chunk_size(&self) -> u64 {
        self.multipart_chunk_size.get_bytes() as u64
    }

    pub(crate) fn multipart_threshold(&self) -> u64 {
        self.multipart_threshold.get_bytes() as u64
    }

    /// The window size at which pending deletes are flushed without waiting for the timer.
    pub(crate) fn delete_flush_threshold(&self) -> usize {
        self.delete_batch_size
            .clamp(1, MAX_DELETE_BATCH_SIZE)
            .min(self.delete_parallel_limit.max(1))
    }

    pub(crate) fn delete_flush_interval(&self) -> Duration {
        Duration::from_millis(self.delete_flush_interval_ms)
    }

    pub(crate) fn delete_parallel_limit(&self) -> usize {
        self.delete_parallel_limit.max(1)
    }

    pub(crate) fn metadata_concurrency(&self) -> usize {
        self.metadata_concurrency.max(1)
    }

    pub(crate) fn signed_url_expiry(&self) -> Duration {
        Duration::from_secs(self.signed_url_expiry_secs)
    }

    pub(crate) fn request_attempts(&self) -> usize {
        self.request_attempts.max(1)
    }

    pub(crate) fn range_timeout(&self) -> Duration {
        Duration::from_secs(self.range_timeout_secs)
    }
}
