//! `ObjectBackend` over a real S3 bucket, using rust-s3.

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use regstore_core::{ByteStream, DriverError, DriverResult, UrlMethod};
use s3::error::S3Error;
use s3::serde_types::Part;
use s3::{Bucket, Region, creds::Credentials};
use tokio_util::io::ReaderStream;

use crate::backend::{
    BackendError, BackendResult, CompletedPart, ListPage, ListRequest, ObjectBackend, ObjectMeta,
};
use crate::config::DriverParameters;
use crate::sigv4::{EMPTY_PAYLOAD_SHA256, Endpoint, Signer, SigningKey};

const CONTENT_TYPE: &str = "application/octet-stream";

/// S3 refuses presigned URLs valid for longer than a week.
const MAX_PRESIGN_SECS: u64 = 7 * 24 * 60 * 60;

/// Deletes in flight at once; rust-s3 has no bulk delete.
const DELETE_CONCURRENCY: usize = 16;

#[derive(Debug, Clone)]
pub struct BucketBackend {
    name: String,
    bucket: Box<Bucket>,
    /// Same bucket with the server-side encryption header, used for
    /// requests that create objects.
    write_bucket: Box<Bucket>,
    /// Signed requests sent outside rust-s3.
    http: reqwest::Client,
    endpoint: Endpoint,
    credentials: Arc<Mutex<Credentials>>,
    request_timeout: Option<Duration>,
}

impl BucketBackend {
    pub fn connect(params: &DriverParameters) -> DriverResult<Self> {
        let credentials = Credentials::new(
            params.access_key.as_deref(),
            params.secret_key.as_deref(),
            None,
            None,
            None,
        )
        .map_err(|e| DriverError::InvalidConfiguration(vec![format!("credentials: {e}")]))?;

        let region = region(params)?;
        let endpoint = Endpoint::new(&params.bucket, &region, params.path_style);
        let mut bucket = Bucket::new(&params.bucket, region, credentials.clone())
            .map_err(|e| DriverError::InvalidConfiguration(vec![format!("bucket: {e}")]))?;
        if params.path_style {
            bucket = bucket.with_path_style();
        }

        let mut write_bucket = bucket.clone();
        if params.encrypt {
            write_bucket.add_header("x-amz-server-side-encryption", "AES256");
        }

        tracing::debug!(
            bucket = %params.bucket,
            region = %params.region,
            endpoint = ?params.region_endpoint,
            "connected s3 backend"
        );

        Ok(Self {
            name: params.bucket.clone(),
            bucket,
            write_bucket,
            http: reqwest::Client::new(),
            endpoint,
            credentials: Arc::new(Mutex::new(credentials)),
            request_timeout: params.request_timeout,
        })
    }

    async fn timed<T>(&self, request: impl Future<Output = Result<T, S3Error>>) -> BackendResult<T> {
        self.within_limit(async { request.await.map_err(into_backend_error) })
            .await
    }

    async fn within_limit<T>(
        &self,
        request: impl Future<Output = BackendResult<T>>,
    ) -> BackendResult<T> {
        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .unwrap_or_else(|_| {
                    Err(BackendError::new(
                        "RequestTimeout",
                        format!("request did not finish within {limit:?}"),
                    ))
                }),
            None => request.await,
        }
    }

    /// Keys for requests signed here, refreshed once temporary credentials expire.
    async fn signing_key(&self) -> BackendResult<SigningKey> {
        let current = self.credentials.lock().clone();
        let expired = current
            .expiration
            .is_some_and(|at| at.0.unix_timestamp() <= Utc::now().timestamp());
        if !expired {
            return SigningKey::from_credentials(&current);
        }

        let refreshed = tokio::task::spawn_blocking(move || {
            let mut credentials = current;
            credentials.refresh().map(|()| credentials)
        })
        .await
        .map_err(|e| BackendError::new("ClientError", e.to_string()))?
        .map_err(|e| BackendError::new("ExpiredToken", format!("refreshing credentials: {e}")))?;
        tracing::debug!(bucket = %self.name, "refreshed signing credentials");
        *self.credentials.lock() = refreshed.clone();
        SigningKey::from_credentials(&refreshed)
    }

    fn ranged(&self, range: &str) -> Box<Bucket> {
        let mut bucket = self.bucket.clone();
        bucket.add_header("Range", range);
        bucket
    }

    /// UploadPartCopy. The ETag only comes back in the XML body, which
    /// rust-s3 discards, so the request is signed and sent here.
    async fn copy_part_on_server(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source_key: &str,
        range: Option<&Range<u64>>,
    ) -> BackendResult<String> {
        let signing_key = self.signing_key().await?;
        let path = self.endpoint.object_path(key);
        let query = BTreeMap::from([
            ("partNumber".to_string(), part_number.to_string()),
            ("uploadId".to_string(), upload_id.to_string()),
        ]);
        let mut headers = copy_part_headers(&self.name, source_key, range);
        let authorization = Signer::new(&self.endpoint, &signing_key, Utc::now()).authorize(
            "PUT",
            &path,
            &query,
            &mut headers,
            EMPTY_PAYLOAD_SHA256,
        )?;

        let mut request = self
            .http
            .put(self.endpoint.url(&path, &query))
            .header("authorization", authorization)
            .body(Vec::<u8>::new());
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }

        self.within_limit(async {
            let response = request.send().await.map_err(http_error)?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(http_error)?;
            copy_part_response(status, &body)
        })
        .await
    }
}

fn region(params: &DriverParameters) -> DriverResult<Region> {
    let scheme = if params.secure { "https" } else { "http" };
    match &params.region_endpoint {
        Some(endpoint) => {
            let endpoint = if endpoint.contains("://") {
                endpoint.clone()
            } else {
                format!("{scheme}://{endpoint}")
            };
            Ok(Region::Custom {
                region: params.region.clone(),
                endpoint,
            })
        }
        None if params.secure => params.region.parse::<Region>().map_err(|e| {
            DriverError::InvalidConfiguration(vec![format!("region {}: {e}", params.region)])
        }),
        None => Ok(Region::Custom {
            region: params.region.clone(),
            endpoint: format!("http://s3.{}.amazonaws.com", params.region),
        }),
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, serde::Deserialize)]
struct CopyPartResult {
    #[serde(rename = "ETag")]
    etag: String,
}

fn into_backend_error(err: S3Error) -> BackendError {
    match err {
        S3Error::HttpFailWithBody(status, body) => {
            match quick_xml::de::from_str::<ErrorBody>(&body) {
                Ok(parsed) => BackendError::new(parsed.code, parsed.message),
                Err(_) => BackendError::new(status_code_name(status), body),
            }
            .with_status(status)
        }
        other => BackendError::new("ClientError", other.to_string()),
    }
}

/// Error code for responses without a body, such as HEAD.
fn status_code_name(status: u16) -> &'static str {
    match status {
        403 => "AccessDenied",
        404 => "NotFound",
        416 => "InvalidRange",
        500 => "InternalError",
        503 => "SlowDown",
        _ => "UnknownError",
    }
}

/// Headers of an UploadPartCopy. S3 rejects encryption headers on parts;
/// the upload's encryption was set when it was created.
fn copy_part_headers(
    bucket: &str,
    source_key: &str,
    range: Option<&Range<u64>>,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::from([(
        "x-amz-copy-source".to_string(),
        format!("/{bucket}/{}", urlencoding::encode(source_key)),
    )]);
    if let Some(range) = range {
        headers.insert(
            "x-amz-copy-source-range".to_string(),
            format!("bytes={}-{}", range.start, range.end - 1),
        );
    }
    headers
}

fn http_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::new("RequestTimeout", err.to_string())
    } else {
        BackendError::new("ClientError", err.to_string())
    }
}

/// ETag of a copied part. S3 may report a copy failure with status 200 and
/// an `<Error>` body.
fn copy_part_response(status: u16, body: &str) -> BackendResult<String> {
    if !(200..300).contains(&status) {
        return Err(into_backend_error(S3Error::HttpFailWithBody(
            status,
            body.to_string(),
        )));
    }
    if let Ok(err) = quick_xml::de::from_str::<ErrorBody>(body) {
        return Err(BackendError::new(err.code, err.message).with_status(status));
    }
    quick_xml::de::from_str::<CopyPartResult>(body)
        .map(|res| res.etag)
        .map_err(|e| BackendError::new("InternalError", format!("copy-part response: {e}")))
}

fn parse_listing_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_header_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl ObjectBackend for BucketBackend {
    fn bucket_name(&self) -> &str {
        &self.name
    }

    async fn get_object(&self, key: &str) -> BackendResult<Bytes> {
        let res = self.timed(self.bucket.get_object(key)).await?;
        Ok(res.into_bytes())
    }

    async fn get_range(&self, key: &str, offset: u64, len: Option<u64>) -> BackendResult<Bytes> {
        let range = match len {
            Some(0) => return Ok(Bytes::new()),
            Some(len) => format!("bytes={}-{}", offset, offset + len - 1),
            None => format!("bytes={offset}-"),
        };
        let bucket = self.ranged(&range);
        let res = self.timed(bucket.get_object(key)).await?;
        Ok(res.into_bytes())
    }

    async fn get_stream(&self, key: &str, offset: u64) -> BackendResult<ByteStream> {
        // A range on an empty object is unsatisfiable even from zero.
        let bucket = if offset == 0 {
            self.bucket.clone()
        } else {
            self.ranged(&format!("bytes={offset}-"))
        };
        let response = self.timed(bucket.get_object_stream(key)).await?;
        Ok(Box::new(ReaderStream::new(response)))
    }

    async fn put_object(&self, key: &str, data: Bytes) -> BackendResult<()> {
        self.timed(
            self.write_bucket
                .put_object_with_content_type(key, &data, CONTENT_TYPE),
        )
        .await?;
        Ok(())
    }

    async fn head_object(&self, key: &str) -> BackendResult<ObjectMeta> {
        let (head, status) = self.timed(self.bucket.head_object(key)).await?;
        if status == 404 {
            return Err(BackendError::not_found(key));
        }
        let size = head
            .content_length
            .and_then(|len| u64::try_from(len).ok())
            .unwrap_or(0);
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
            last_modified: head.last_modified.as_deref().and_then(parse_header_time),
        })
    }

    async fn list_objects(&self, request: ListRequest<'_>) -> BackendResult<ListPage> {
        let (result, _) = self
            .timed(self.bucket.list_page(
                request.prefix.to_string(),
                request.delimiter.map(str::to_string),
                request.marker.map(str::to_string),
                None,
                Some(request.max_keys),
            ))
            .await?;

        Ok(ListPage {
            objects: result
                .contents
                .into_iter()
                .map(|object| ObjectMeta {
                    last_modified: parse_listing_time(&object.last_modified),
                    key: object.key,
                    size: object.size,
                })
                .collect(),
            common_prefixes: result
                .common_prefixes
                .unwrap_or_default()
                .into_iter()
                .map(|p| p.prefix)
                .collect(),
            is_truncated: result.is_truncated,
            next_marker: result.next_continuation_token,
        })
    }

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> BackendResult<()> {
        let source = urlencoding::encode(source_key);
        self.timed(self.write_bucket.copy_object_internal(source.as_ref(), dest_key))
            .await?;
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> BackendResult<()> {
        futures::stream::iter(keys)
            .map(|key| async move {
                self.timed(self.bucket.delete_object(key)).await.map(|_| ())
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
        let res = self
            .timed(self.write_bucket.initiate_multipart_upload(key, CONTENT_TYPE))
            .await?;
        Ok(res.upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> BackendResult<CompletedPart> {
        // rust-s3 takes the body by value, so each part is copied once out
        // of the pooled buffer.
        let part = self
            .timed(self.bucket.put_multipart_chunk(
                data.to_vec(),
                key,
                part_number,
                upload_id,
                CONTENT_TYPE,
            ))
            .await?;
        Ok(CompletedPart {
            part_number: part.part_number,
            etag: part.etag,
            size: data.len() as u64,
        })
    }

    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        source_key: &str,
        range: Option<Range<u64>>,
    ) -> BackendResult<CompletedPart> {
        let etag = self
            .copy_part_on_server(key, upload_id, part_number, source_key, range.as_ref())
            .await?;
        Ok(CompletedPart {
            part_number,
            etag,
            size: range.map(|r| r.end - r.start).unwrap_or(0),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> BackendResult<()> {
        let parts = parts
            .into_iter()
            .map(|p| Part {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();
        self.timed(self.bucket.complete_multipart_upload(key, upload_id, parts))
            .await?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        self.timed(self.bucket.abort_upload(key, upload_id)).await
    }

    async fn presign(
        &self,
        key: &str,
        method: UrlMethod,
        expires_in: Duration,
    ) -> BackendResult<String> {
        let secs = expires_in.as_secs().clamp(1, MAX_PRESIGN_SECS);
        match method {
            UrlMethod::Get => {
                self.timed(self.bucket.presign_get(key, secs as u32, None))
                    .await
            }
            // rust-s3 has no HEAD presign.
            UrlMethod::Head => {
                let signing_key = self.signing_key().await?;
                Signer::new(&self.endpoint, &signing_key, Utc::now()).presign("HEAD", key, secs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(region: &str) -> DriverParameters {
        crate::S3DriverConfig::new(region, "registry")
            .validate()
            .unwrap()
    }

    #[test]
    fn error_bodies_keep_their_code() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchUpload</Code><Message>The specified upload does not exist.</Message><RequestId>1</RequestId></Error>"#;
        let err = into_backend_error(S3Error::HttpFailWithBody(404, body.to_string()));
        assert_eq!(err.code, "NoSuchUpload");
        assert_eq!(err.message, "The specified upload does not exist.");
        assert_eq!(err.status, Some(404));
    }

    #[test]
    fn empty_bodies_fall_back_to_status() {
        let err = into_backend_error(S3Error::HttpFailWithBody(416, String::new()));
        assert!(err.is_invalid_range());
        let err = into_backend_error(S3Error::HttpFailWithBody(404, String::new()));
        assert!(err.is_not_found());
    }

    #[test]
    fn copy_part_etag_from_xml() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<CopyPartResult><LastModified>2009-10-28T22:32:00.000Z</LastModified><ETag>"9b2cf535f27731c974343645a3985328"</ETag></CopyPartResult>"#;
        assert_eq!(
            copy_part_response(200, body).unwrap(),
            "\"9b2cf535f27731c974343645a3985328\""
        );
    }

    #[test]
    fn copy_part_failures() {
        // Errors can arrive with a 200 once the copy has started.
        let body = r#"<Error><Code>InternalError</Code><Message>We encountered an internal error.</Message></Error>"#;
        let err = copy_part_response(200, body).unwrap_err();
        assert_eq!(err.code, "InternalError");

        let body = r#"<Error><Code>NoSuchUpload</Code><Message>gone</Message></Error>"#;
        let err = copy_part_response(404, body).unwrap_err();
        assert_eq!(err.code, "NoSuchUpload");
        assert_eq!(err.status, Some(404));

        assert!(copy_part_response(200, "").is_err());
    }

    #[test]
    fn copy_part_headers_name_the_source_range() {
        let headers = copy_part_headers("registry", "docker/data", Some(&(0..10)));
        assert_eq!(headers["x-amz-copy-source"], "/registry/docker%2Fdata");
        assert_eq!(headers["x-amz-copy-source-range"], "bytes=0-9");
        assert!(!headers.contains_key("x-amz-server-side-encryption"));
        assert_eq!(copy_part_headers("registry", "k", None).len(), 1);
    }

    #[tokio::test]
    async fn head_urls_are_signed() {
        let mut p = params("us-east-1");
        p.access_key = Some("AKID".into());
        p.secret_key = Some("secret".into());
        let backend = BucketBackend::connect(&p).unwrap();
        let url = backend
            .presign("docker/blob", UrlMethod::Head, Duration::from_secs(30 * 24 * 3600))
            .await
            .unwrap();
        assert!(url.starts_with("https://registry.s3.amazonaws.com/docker/blob?"), "{url}");
        assert!(url.contains("X-Amz-Expires=604800"), "{url}");
        assert!(url.contains("X-Amz-Signature="), "{url}");
    }

    #[test]
    fn timestamps() {
        assert!(parse_listing_time("2009-10-12T17:50:30.000Z").is_some());
        assert!(parse_header_time("Wed, 12 Oct 2009 17:50:00 GMT").is_some());
        assert!(parse_listing_time("yesterday").is_none());
    }

    #[test]
    fn insecure_region_uses_http() {
        let mut p = params("us-west-2");
        p.secure = false;
        match region(&p).unwrap() {
            Region::Custom { endpoint, .. } => assert!(endpoint.starts_with("http://")),
            other => panic!("unexpected region {other:?}"),
        }
    }

    #[test]
    fn bare_endpoint_gets_scheme() {
        let mut p = params("us-east-1");
        p.region_endpoint = Some("minio.local:9000".into());
        match region(&p).unwrap() {
            Region::Custom { endpoint, region } => {
                assert_eq!(endpoint, "https://minio.local:9000");
                assert_eq!(region, "us-east-1");
            }
            other => panic!("unexpected region {other:?}"),
        }
    }
}
