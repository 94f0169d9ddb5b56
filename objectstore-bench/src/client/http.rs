//! A storage client speaking the S3 HTTP API with path-style addressing.
//!
//! Requests are not signed. The client targets S3-compatible services that accept anonymous
//! requests or a static bearer token, such as local test deployments.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use reqwest::{Body, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretBox};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use super::{
    ListedObject, ObjectStat, PutOptions, PutResult, StatOptions, StorageClient, StorageError,
    StorageResult,
};
use crate::config::Secret;
use crate::generator::Payload;

/// User agent string used for outgoing requests.
pub const USER_AGENT: &str = concat!("objectstore-bench/", env!("CARGO_PKG_VERSION"));

/// Response header carrying the version assigned to an object.
const VERSION_ID_HEADER: &str = "x-amz-version-id";

const ENABLE_VERSIONING_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<VersioningConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Status>Enabled</Status></VersioningConfiguration>"#;

/// A builder for creating an [`S3Client`].
#[derive(Debug)]
pub struct S3ClientBuilder {
    endpoint: String,
    token: Option<SecretBox<Secret>>,
    request_timeout: Option<Duration>,
}

impl S3ClientBuilder {
    /// Sends the given bearer token with every request.
    pub fn token(mut self, token: impl Into<Secret>) -> Self {
        self.token = Some(SecretBox::new(Box::new(token.into())));
        self
    }

    /// Aborts requests that take longer than the given duration.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Creates the client instance.
    pub fn build(self) -> StorageResult<S3Client> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder.build().map_err(|cause| StorageError::Reqwest {
            context: "failed to build HTTP client".into(),
            cause,
        })?;

        Ok(S3Client {
            client,
            endpoint: self.endpoint.trim_end_matches('/').into(),
            token: self.token,
        })
    }
}

/// An S3-compatible storage client for a single endpoint.
#[derive(Debug)]
pub struct S3Client {
    client: reqwest::Client,
    endpoint: String,
    token: Option<SecretBox<Secret>>,
}

impl S3Client {
    /// Constructs a new client builder targeting the given endpoint URL.
    pub fn builder(endpoint: impl Into<String>) -> S3ClientBuilder {
        S3ClientBuilder {
            endpoint: endpoint.into(),
            token: None,
            request_timeout: None,
        }
    }

    fn bucket_url(&self, bucket: &str) -> String {
        format!("{}/{bucket}", self.endpoint)
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.endpoint)
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.expose_secret().as_str());
        }
        builder
    }
}

async fn send(builder: RequestBuilder, context: &str) -> StorageResult<Response> {
    builder.send().await.map_err(|cause| StorageError::Reqwest {
        context: format!("failed to send {context} request"),
        cause,
    })
}

fn check_status(response: &Response, context: &str) -> StorageResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    Err(StorageError::Status {
        context: format!("{context} request failed"),
        status: status.as_u16(),
    })
}

fn version_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(VERSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && *value != "null")
        .map(ToOwned::to_owned)
}

/// One page of a `ListObjectVersions` response.
#[derive(Debug, Default, PartialEq)]
struct VersionsPage {
    objects: Vec<ListedObject>,
    /// Key and version markers to continue from if the listing was truncated.
    next: Option<(String, Option<String>)>,
}

/// Yields the contents of every `<tag>...</tag>` element in `xml`.
fn elements<'a>(xml: &'a str, tag: &str) -> impl Iterator<Item = &'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut rest = xml;

    std::iter::from_fn(move || {
        let start = rest.find(&open)? + open.len();
        let len = rest[start..].find(&close)?;
        let content = &rest[start..start + len];
        rest = &rest[start + len + close.len()..];
        Some(content)
    })
}

fn element<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    elements(xml, tag).next()
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn parse_versions_page(xml: &str) -> VersionsPage {
    let objects = ["Version", "DeleteMarker"]
        .into_iter()
        .flat_map(|tag| elements(xml, tag))
        .filter_map(|entry| {
            let key = unescape(element(entry, "Key")?);
            let version_id = element(entry, "VersionId")
                .filter(|id| !id.is_empty() && *id != "null")
                .map(unescape);
            Some(ListedObject { key, version_id })
        })
        .collect();

    let truncated = element(xml, "IsTruncated") == Some("true");
    let next = match element(xml, "NextKeyMarker") {
        Some(key) if truncated => Some((
            unescape(key),
            element(xml, "NextVersionIdMarker").map(unescape),
        )),
        _ => None,
    };

    VersionsPage { objects, next }
}

#[async_trait::async_trait]
impl StorageClient for S3Client {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn create_bucket(&self, bucket: &str) -> StorageResult<()> {
        let request = self.request(Method::PUT, self.bucket_url(bucket));
        let response = send(request, "CreateBucket").await?;
        if response.status() == StatusCode::CONFLICT {
            tracing::debug!("Bucket already exists");
            return Ok(());
        }
        check_status(&response, "CreateBucket")
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn enable_versioning(&self, bucket: &str) -> StorageResult<()> {
        let url = format!("{}?versioning", self.bucket_url(bucket));
        let builder = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, "application/xml")
            .body(ENABLE_VERSIONING_BODY);

        let response = send(builder, "PutBucketVersioning").await?;
        check_status(&response, "PutBucketVersioning")
    }

    #[tracing::instrument(level = "trace", skip(self, payload, opts))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: Payload,
        size: u64,
        opts: &PutOptions,
    ) -> StorageResult<PutResult> {
        let written = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&written);
        let stream = ReaderStream::new(payload.take(size)).inspect_ok(move |chunk| {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });

        let builder = self
            .request(Method::PUT, self.object_url(bucket, key))
            .header(CONTENT_LENGTH, size)
            .header(CONTENT_TYPE, opts.content_type.as_str())
            .body(Body::wrap_stream(stream));

        let response = send(builder, "PutObject").await?;
        check_status(&response, "PutObject")?;

        Ok(PutResult {
            version_id: version_id(response.headers()),
            size: written.load(Ordering::Relaxed),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn stat_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &StatOptions,
    ) -> StorageResult<ObjectStat> {
        let mut builder = self.request(Method::HEAD, self.object_url(bucket, key));
        if let Some(version_id) = &opts.version_id {
            builder = builder.query(&[("versionId", version_id)]);
        }

        let response = send(builder, "HeadObject").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_owned()));
        }
        check_status(&response, "HeadObject")?;

        // `Response::content_length` reflects the (empty) body of a HEAD response.
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| {
                StorageError::Generic(format!("missing content length for `{key}`"))
            })?;

        Ok(ObjectStat {
            size,
            version_id: version_id(response.headers()),
        })
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ListedObject>> {
        let mut objects = Vec::new();
        let mut marker: Option<(String, Option<String>)> = None;

        loop {
            let mut builder = self
                .request(Method::GET, self.bucket_url(bucket))
                .query(&[("versions", "")]);
            if let Some((key, version_id)) = &marker {
                builder = builder.query(&[("key-marker", key)]);
                if let Some(version_id) = version_id {
                    builder = builder.query(&[("version-id-marker", version_id)]);
                }
            }

            let response = send(builder, "ListObjectVersions").await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(StorageError::NotFound(bucket.to_owned()));
            }
            check_status(&response, "ListObjectVersions")?;

            let body = response
                .text()
                .await
                .map_err(|cause| StorageError::Reqwest {
                    context: "failed to read ListObjectVersions response".into(),
                    cause,
                })?;

            let page = parse_versions_page(&body);
            objects.extend(page.objects);
            match page.next {
                Some(next) => marker = Some(next),
                None => return Ok(objects),
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StorageResult<()> {
        let mut builder = self.request(Method::DELETE, self.object_url(bucket, key));
        if let Some(version_id) = version_id {
            builder = builder.query(&[("versionId", version_id)]);
        }

        let response = send(builder, "DeleteObject").await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("Object already deleted");
            return Ok(());
        }
        check_status(&response, "DeleteObject")
    }
}
