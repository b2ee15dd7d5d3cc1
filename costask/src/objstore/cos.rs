use super::{
    effective_chunk_size, BatchDeleteOutput, ByteStream, DeleteObjectError, ObjectLocation,
    ObjectStorage, ReadSource, UploadOutput, UploadTarget, UrlSigner,
};
use crate::{Config, Result};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    presigning::PresigningConfig,
    primitives::ByteStream as SdkByteStream,
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
};
use aws_types::region::Region;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use snafu::prelude::*;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, Instrument};
use url::Url;

/// Query parameters that mark a URL as already carrying a signature
const SIGNATURE_PARAMS: &[&str] = &["q-signature", "x-amz-signature"];

/// Implementation of [`ObjectStorage`] and [`UrlSigner`] for Tencent COS, talking to its
/// S3-compatible API.
///
/// Every COS region has its own endpoint, so one SDK client is created (and cached) per region.
#[derive(Clone)]
pub struct CosStorage {
    inner: Arc<CosStorageInner>,
}

struct CosStorageInner {
    config: Config,
    clients: Mutex<HashMap<String, aws_sdk_s3::Client>>,
}

impl CosStorage {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(CosStorageInner {
                config,
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Get the client for `region`, creating it the first time a region is used
    async fn client(&self, region: &str) -> aws_sdk_s3::Client {
        let mut clients = self.inner.clients.lock().await;

        if let Some(client) = clients.get(region) {
            return client.clone();
        }

        debug!(region, "Creating COS client for region");
        let client = make_s3_client(&self.inner.config, region).await;
        clients.insert(region.to_string(), client.clone());

        client
    }

    /// Upload an object small enough to go in a single `PutObject` call
    #[instrument(skip(self, client, source), fields(bucket = %target.location.bucket, key = %target.location.key))]
    async fn put_small_object(
        &self,
        client: &aws_sdk_s3::Client,
        target: &UploadTarget,
        source: Arc<dyn ReadSource>,
    ) -> Result<UploadOutput> {
        let location = &target.location;
        let data = collect_exact(source.read_all()?, &location.key, target.content_length).await?;

        debug!(total_bytes = data.len(), "Uploading unipart object");

        let response = client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .content_length(data.len() as i64)
            .body(SdkByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
            })?;

        Ok(UploadOutput {
            location: object_location_string(location),
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            etag: response.e_tag().map(|etag| etag.to_string()),
        })
    }

    /// Upload an object with the multipart APIs, reading each part from `source` separately so
    /// that up to `max_concurrent_requests` parts are in flight at once
    #[instrument(skip(self, client, source), fields(bucket = %target.location.bucket, key = %target.location.key))]
    async fn multipart_upload(
        &self,
        client: &aws_sdk_s3::Client,
        target: &UploadTarget,
        source: Arc<dyn ReadSource>,
    ) -> Result<UploadOutput> {
        let config = &self.inner.config;
        let location = &target.location;
        let chunk_size =
            effective_chunk_size(target.content_length, config.multipart_chunk_size());

        let response = client
            .create_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
            })?;
        let upload_id = response
            .upload_id()
            .expect("BUG: multi-part uploads always have upload ID")
            .to_string();

        let result = self
            .upload_parts(client, target, source, &upload_id, chunk_size)
            .await;

        match result {
            Ok(output) => Ok(output),
            Err(e) => {
                // Before reporting this error, clean up the remains of the multi-part upload
                error!(error = %e, %upload_id,
                    "Multi-part upload failed; aborting multi-part upload on server side");

                if let Err(e) = client
                    .abort_multipart_upload()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    error!(?e, %upload_id,
                        "Error aborting multi-part upload.  This will remain on the server forever unless there's a lifecycle policy configured");
                }

                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        client: &aws_sdk_s3::Client,
        target: &UploadTarget,
        source: Arc<dyn ReadSource>,
        upload_id: &str,
        chunk_size: u64,
    ) -> Result<UploadOutput> {
        let location = &target.location;

        let mut ranges = Vec::new();
        let mut byte_offset = 0u64;
        while byte_offset < target.content_length {
            let byte_length = chunk_size.min(target.content_length - byte_offset);
            ranges.push(byte_offset..(byte_offset + byte_length));
            byte_offset += byte_length;
        }

        let part_futs = ranges.into_iter().enumerate().map(|(index, range)| {
            // The S3 API numbers parts from 1
            let part_number = index + 1;
            let span = tracing::debug_span!("upload part", part_number, ?range);
            let source = source.clone();

            async move {
                let data = collect_exact(
                    source.read_range(range.clone())?,
                    &location.key,
                    range.end - range.start,
                )
                .await?;

                debug!("Uploading multi-part chunk");

                let response = client
                    .upload_part()
                    .bucket(&location.bucket)
                    .key(&location.key)
                    .upload_id(upload_id)
                    .part_number(part_number as i32)
                    .content_length(data.len() as i64)
                    .body(SdkByteStream::from(data))
                    .send()
                    .await
                    .with_context(|_| crate::error::UploadPartSnafu {
                        bucket: location.bucket.clone(),
                        key: location.key.clone(),
                        part_number,
                    })?;

                let e_tag = response
                    .e_tag()
                    .expect("BUG: uploaded part missing etag")
                    .to_string();

                debug!(%e_tag, "Uploaded multi-part chunk");

                Ok::<_, crate::CosTaskError>(
                    CompletedPart::builder()
                        .e_tag(e_tag)
                        .part_number(part_number as i32)
                        .build(),
                )
            }
            .instrument(span)
        });

        let mut completed_parts = futures::stream::iter(part_futs)
            .buffer_unordered(self.inner.config.max_concurrent_requests.max(1))
            .try_collect::<Vec<_>>()
            .await?;

        debug!(
            total_parts = completed_parts.len(),
            "All parts uploaded; completing multi-part upload"
        );

        // The parts finished in whatever order, but must be listed in order of part number
        completed_parts.sort_unstable_by_key(|part| part.part_number());

        let response = client
            .complete_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
            })?;

        Ok(UploadOutput {
            location: response
                .location()
                .map(|location| location.to_string())
                .unwrap_or_else(|| object_location_string(location)),
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            etag: response.e_tag().map(|etag| etag.to_string()),
        })
    }
}

#[async_trait::async_trait]
impl UrlSigner for CosStorage {
    async fn sign(&self, url: &Url) -> Result<Url> {
        if is_signed(url) {
            return Ok(url.clone());
        }

        // Only COS objects can be signed with COS credentials; anything else is assumed to be
        // readable as-is
        let location = match ObjectLocation::parse_cos_url(url) {
            Ok(location) => location,
            Err(_) => return Ok(url.clone()),
        };

        let presigning = PresigningConfig::expires_in(self.inner.config.signed_url_expiry())
            .with_context(|_| crate::error::PresigningConfigSnafu { url: url.clone() })?;

        let client = self.client(&location.region).await;
        let request = client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .presigned(presigning)
            .await
            .with_context(|_| crate::error::SignUrlSnafu {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
            })?;

        Url::parse(request.uri()).with_context(|_| crate::error::ParseSignedUrlSnafu {
            signed: request.uri().to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ObjectStorage for CosStorage {
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    async fn delete_objects(
        &self,
        bucket: &str,
        region: &str,
        keys: Vec<String>,
    ) -> Result<BatchDeleteOutput> {
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|_| crate::error::BuildDeleteRequestSnafu {
                bucket: bucket.to_string(),
            })?;

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .with_context(|_| crate::error::BuildDeleteRequestSnafu {
                bucket: bucket.to_string(),
            })?;

        let client = self.client(region).await;
        let response = client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .with_context(|_| crate::error::DeleteObjectsSnafu {
                bucket: bucket.to_string(),
                region: region.to_string(),
            })?;

        let errors = response
            .errors()
            .iter()
            .map(|error| DeleteObjectError {
                key: error.key().unwrap_or_default().to_string(),
                code: error.code().unwrap_or("Unknown").to_string(),
                message: error.message().unwrap_or_default().to_string(),
            })
            .collect::<Vec<_>>();

        let deleted = response
            .deleted()
            .iter()
            .filter_map(|deleted| deleted.key().map(|key| key.to_string()))
            .collect::<Vec<_>>();

        debug!(
            deleted = deleted.len(),
            errors = errors.len(),
            "Bulk delete completed"
        );

        Ok(BatchDeleteOutput { deleted, errors })
    }

    async fn upload(
        &self,
        target: UploadTarget,
        source: Arc<dyn ReadSource>,
    ) -> Result<UploadOutput> {
        let client = self.client(&target.location.region).await;

        if target.content_length == 0
            || target.content_length < self.inner.config.multipart_threshold()
        {
            self.put_small_object(&client, &target, source).await
        } else {
            self.multipart_upload(&client, &target, source).await
        }
    }
}

impl std::fmt::Debug for CosStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CosStorage")
            .field("cos_endpoint", &self.inner.config.cos_endpoint)
            .field("clients", &"<...>")
            .finish()
    }
}

fn is_signed(url: &Url) -> bool {
    url.query_pairs().any(|(name, _)| {
        SIGNATURE_PARAMS
            .iter()
            .any(|param| name.eq_ignore_ascii_case(param))
    })
}

/// The location string COS reports for an object, without a scheme
fn object_location_string(location: &ObjectLocation) -> String {
    format!(
        "{}.cos.{}.myqcloud.com/{}",
        location.bucket, location.region, location.key
    )
}

/// Read an entire stream into memory, failing if it doesn't yield exactly `expected` bytes
async fn collect_exact(stream: ByteStream, key: &str, expected: u64) -> Result<Bytes> {
    let mut stream = stream;
    let mut buffer = BytesMut::with_capacity(expected as usize);

    while let Some(chunk) = stream.try_next().await? {
        buffer.extend_from_slice(&chunk);
    }

    ensure!(
        buffer.len() as u64 == expected,
        crate::error::UploadSizeMismatchSnafu {
            key: key.to_string(),
            expected,
            actual: buffer.len() as u64,
        }
    );

    Ok(buffer.freeze())
}

/// Create a new AWS SDK S3 client pointed at the COS endpoint for `region`
async fn make_s3_client(config: &Config, region: &str) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(region.to_string()));

    if let (Some(secret_id), Some(secret_key)) = (&config.secret_id, &config.secret_key) {
        loader = loader.credentials_provider(Credentials::from_keys(
            secret_id,
            secret_key,
            config.session_token.clone(),
        ));
    }

    let sdk_config = loader.load().await;

    let endpoint = match &config.cos_endpoint {
        Some(endpoint) => endpoint.to_string(),
        None => format!("https://cos.{region}.myqcloud.com"),
    };

    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .endpoint_url(endpoint)
        .build();

    aws_sdk_s3::Client::from_conf(s3_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::ops::Range;

    fn chunked(data: &'static [u8], range: Range<usize>) -> ByteStream {
        futures::stream::iter(
            data[range]
                .chunks(3)
                .map(|chunk| Ok(Bytes::from_static(chunk)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[test]
    fn recognizes_signed_urls() {
        let signed: Url =
            "https://b-1250000000.cos.ap-guangzhou.myqcloud.com/a.txt?q-sign-algorithm=sha1&q-signature=abc"
                .parse()
                .unwrap();
        let presigned: Url =
            "https://b-1250000000.cos.ap-guangzhou.myqcloud.com/a.txt?X-Amz-Signature=abc"
                .parse()
                .unwrap();
        let plain: Url = "https://b-1250000000.cos.ap-guangzhou.myqcloud.com/a.txt"
            .parse()
            .unwrap();

        assert!(is_signed(&signed));
        assert!(is_signed(&presigned));
        assert!(!is_signed(&plain));
    }

    #[tokio::test]
    async fn non_cos_urls_are_not_signed() {
        let storage = CosStorage::new(Config::default());
        let url: Url = "https://example.com/public/a.txt".parse().unwrap();

        assert_eq!(url, storage.sign(&url).await.unwrap());
    }

    #[tokio::test]
    async fn collect_exact_checks_size() {
        const DATA: &[u8] = b"hello, world";

        let bytes = collect_exact(chunked(DATA, 0..12), "k", 12).await.unwrap();
        assert_eq!(DATA, &bytes[..]);

        assert_matches!(
            collect_exact(chunked(DATA, 0..5), "k", 12).await,
            Err(crate::CosTaskError::UploadSizeMismatch {
                expected: 12,
                actual: 5,
                ..
            })
        );
    }

    #[test]
    fn location_string_has_no_scheme() {
        let location = ObjectLocation::new("b-1250000000", "ap-guangzhou", "out/all.bin");
        assert_eq!(
            "b-1250000000.cos.ap-guangzhou.myqcloud.com/out/all.bin",
            object_location_string(&location)
        );
    }
}
