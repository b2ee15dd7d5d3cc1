//! [`RangeReader`] implementation that fetches (signed) object URLs over plain HTTP.
use super::{ByteStream, RangeReader};
use crate::{Config, Result};
use futures::{future, StreamExt, TryStreamExt};
use reqwest::{
    header::{CONTENT_RANGE, RANGE},
    StatusCode,
};
use snafu::{prelude::*, IntoError};
use std::{ops::Range, sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};
use url::Url;

/// Delay between attempts of a failed metadata probe
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct HttpRangeReader {
    inner: Arc<HttpRangeReaderInner>,
}

struct HttpRangeReaderInner {
    client: reqwest::Client,
    attempts: usize,
    range_timeout: Duration,
}

impl HttpRangeReader {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(HttpRangeReaderInner {
                client: reqwest::Client::new(),
                attempts: config.request_attempts(),
                range_timeout: config.range_timeout(),
            }),
        }
    }

    async fn probe_size_once(&self, url: &Url) -> Result<u64> {
        let response = self
            .inner
            .client
            .get(url.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .with_context(|_| crate::error::HttpRequestSnafu {
                url: without_query(url),
            })?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Any range of an empty object is unsatisfiable
            debug!(url = %without_query(url), "Range not satisfiable; object is empty");
            return Ok(0);
        }

        ensure!(
            status.is_success(),
            crate::error::HttpStatusSnafu {
                url: without_query(url),
                status: status.as_u16()
            }
        );

        let size = if status == StatusCode::PARTIAL_CONTENT {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(content_range_total)
        } else {
            // The server ignored the range and is sending the whole object
            response.content_length()
        };

        Ok(size.unwrap_or_else(|| {
            debug!(
                url = %without_query(url),
                %status,
                "No content length; treating object as empty"
            );
            0
        }))
    }

    async fn request_range(&self, url: Url, range: Range<u64>) -> Result<ByteStream> {
        debug!(url = %without_query(&url), ?range, "Opening range stream");

        let response = self
            .inner
            .client
            .get(url.clone())
            .header(RANGE, format!("bytes={}-{}", range.start, range.end - 1))
            .timeout(self.inner.range_timeout)
            .send()
            .await
            .with_context(|_| crate::error::HttpRequestSnafu {
                url: without_query(&url),
            })?;

        let status = response.status();
        ensure!(
            status.is_success(),
            crate::error::HttpStatusSnafu {
                url: without_query(&url),
                status: status.as_u16()
            }
        );

        let stripped = without_query(&url);
        let body = response
            .bytes_stream()
            .map_err(move |source| {
                crate::error::HttpBodySnafu {
                    url: stripped.clone(),
                }
                .into_error(source)
            })
            .boxed();

        if status == StatusCode::PARTIAL_CONTENT {
            Ok(body)
        } else {
            debug!(
                url = %without_query(&url),
                %status,
                "Server ignored the range; slicing the body"
            );
            Ok(slice_body(body, range))
        }
    }
}

#[async_trait::async_trait]
impl RangeReader for HttpRangeReader {
    #[instrument(skip(self), fields(url = %without_query(url)))]
    async fn probe_size(&self, url: &Url) -> Result<u64> {
        let policy = again::RetryPolicy::fixed(RETRY_DELAY)
            .with_max_retries(self.inner.attempts - 1);

        let size = policy
            .retry(|| self.probe_size_once(url))
            .await
            .map_err(|e| {
                warn!(error = %e, attempts = self.inner.attempts, "Metadata probe failed");
                e
            })?;

        debug!(size, "Probed object size");

        Ok(size)
    }

    fn open_range(&self, url: &Url, range: Range<u64>) -> ByteStream {
        if range.start >= range.end {
            // Nothing to read; HTTP can't even express an empty range
            return futures::stream::empty().boxed();
        }

        let me = self.clone();
        let url = url.clone();

        futures::stream::once(async move { me.request_range(url, range).await })
            .try_flatten()
            .boxed()
    }
}

impl std::fmt::Debug for HttpRangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRangeReader")
            .field("attempts", &self.inner.attempts)
            .field("range_timeout", &self.inner.range_timeout)
            .finish()
    }
}

/// Signed URLs carry credentials in the query string, which must not end up in logs or errors
fn without_query(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_query(None);
    url
}

/// Cut `range` out of a body that holds the whole object, without reading past the end of the
/// range
fn slice_body(body: ByteStream, range: Range<u64>) -> ByteStream {
    body.scan(0u64, move |position, chunk| {
        let item = match chunk {
            Ok(_) if *position >= range.end => None,
            Ok(chunk) => {
                let chunk_start = *position;
                let len = chunk.len() as u64;
                *position += len;

                let from = range.start.saturating_sub(chunk_start).min(len) as usize;
                let to = range.end.saturating_sub(chunk_start).min(len) as usize;
                Some(Ok(chunk.slice(from..to)))
            }
            Err(e) => Some(Err(e)),
        };

        future::ready(item)
    })
    .try_filter(|chunk| future::ready(!chunk.is_empty()))
    .boxed()
}

/// Parse the total size out of a `Content-Range` header value like `bytes 0-0/1234`
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}
