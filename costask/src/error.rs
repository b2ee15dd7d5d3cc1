use snafu::prelude::*;
use std::sync::Arc;
use url::Url;

pub type Result<T, E = CosTaskError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CosTaskError {
    #[snafu(display("The URL '{url}' is not a COS object URL.  Expected a URL of the form https://<bucket>.cos.<region>.myqcloud.com/<key>"))]
    UnsupportedObjectUrl { url: Url },

    #[snafu(display("The source '{source_url}' is not a valid URL"))]
    InvalidSourceUrl {
        source_url: String,
        source: url::ParseError,
    },

    #[snafu(display("The COS object location is missing the {field}"))]
    IncompleteLocation { field: &'static str },

    #[snafu(display("Bucket '{bucket}' in region '{region}' does not form a valid COS host name"))]
    InvalidLocation { bucket: String, region: String },

    #[snafu(display("Error building the presigning config for '{url}'"))]
    PresigningConfig {
        url: Url,
        source: aws_sdk_s3::presigning::PresigningConfigError,
    },

    #[snafu(display("Error signing the URL for object '{key}' in COS bucket '{bucket}'"))]
    SignUrl {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    },

    #[snafu(display("The presigned URL '{signed}' could not be parsed"))]
    ParseSignedUrl {
        signed: String,
        source: url::ParseError,
    },

    #[snafu(display("HTTP request to '{url}' failed"))]
    HttpRequest { url: Url, source: reqwest::Error },

    #[snafu(display("HTTP request to '{url}' returned unexpected status {status}"))]
    HttpStatus { url: Url, status: u16 },

    #[snafu(display("Error reading the body of '{url}'"))]
    HttpBody { url: Url, source: reqwest::Error },

    #[snafu(display("The object at '{url}' is not present in the in-memory store"))]
    MemoryObjectNotFound { url: Url },

    #[snafu(display("Injected failure probing '{url}'"))]
    InjectedProbeFailure { url: Url },

    #[snafu(display("Injected failure reading '{url}'"))]
    InjectedReadFailure { url: Url },

    #[snafu(display("Injected failure of the bulk delete call on COS bucket '{bucket}'"))]
    InjectedDeleteFailure { bucket: String },

    #[snafu(display("Error calling DeleteObjects on COS bucket '{bucket}' in region '{region}'"))]
    DeleteObjects {
        bucket: String,
        region: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::delete_objects::DeleteObjectsError,
        >,
    },

    #[snafu(display("Error building the DeleteObjects request for COS bucket '{bucket}'"))]
    BuildDeleteRequest {
        bucket: String,
        source: aws_sdk_s3::error::BuildError,
    },

    #[snafu(display(
        "COS refused to delete object '{key}' in bucket '{bucket}': {code}: {message}"
    ))]
    DeleteObjectRejected {
        bucket: String,
        key: String,
        code: String,
        message: String,
    },

    #[snafu(display("Bulk delete on COS bucket '{bucket}' in region '{region}' failed"))]
    BatchDeleteFailed {
        bucket: String,
        region: String,
        source: Arc<CosTaskError>,
    },

    #[snafu(display("The delete batcher is no longer running; the request for '{key}' was dropped"))]
    DeleteBatcherGone { key: String },

    #[snafu(display("Error uploading object '{key}' to COS bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::put_object::PutObjectError>,
    },

    #[snafu(display("Error starting a multi-part upload of object '{key}' to COS bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError,
        >,
    },

    #[snafu(display("Error uploading part {part_number} of object '{key}' to COS bucket '{bucket}'"))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: usize,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>,
    },

    #[snafu(display("Error completing the multi-part upload of object '{key}' to COS bucket '{bucket}'"))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError,
        >,
    },

    #[snafu(display("The upload source for object '{key}' yielded {actual} bytes but {expected} were declared"))]
    UploadSizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[snafu(display("Byte range {start}..{end} is outside of the concatenated object of {total_size} bytes"))]
    RangeOutOfBounds { start: u64, end: u64, total_size: u64 },

    #[snafu(display("The concatenation layout was read before source sizes and offsets were resolved"))]
    OffsetsNotResolved,

    #[snafu(display("The task queue was cancelled: {reason}"))]
    TaskQueueCancelled { reason: String },

    #[snafu(display("Fail count {fail} exceeds the limit of {max_fail_limit}"))]
    FailLimitExceeded { fail: u64, max_fail_limit: u64 },

    #[snafu(display("The task queue is not running"))]
    TaskQueueNotRunning,

    #[snafu(display("The trigger event is not valid JSON"))]
    InvalidEventJson { source: serde_json::Error },

    #[snafu(display("The trigger event is malformed: {reason}"))]
    MalformedEvent { reason: String },
}
