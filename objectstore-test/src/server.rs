//! Exposes an in-process S3-compatible server for use in integration tests.
//!
//! ```
//! use objectstore_test::server::MockS3Server;
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = MockS3Server::new().await;
//!    let url = server.url("/bucket");
//!    // use the URL in tests...
//! }
//! ```
//!
//! The server understands just enough of the S3 API for benchmarks: creating buckets, enabling
//! versioning, listing object versions, and uploading, inspecting and deleting objects with
//! path-style addressing.
//! Objects are kept in memory.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::put;

const VERSION_ID_HEADER: &str = "x-amz-version-id";

type Params = Query<HashMap<String, String>>;

#[derive(Debug, Default)]
struct Bucket {
    versioned: bool,
    next_version: u64,
    objects: HashMap<String, Vec<(Option<String>, Bytes)>>,
}

#[derive(Debug, Default)]
struct Store {
    token: Option<String>,
    requests: AtomicUsize,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Store {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let Some(token) = &self.token else {
            return Ok(());
        };
        let expected = format!("Bearer {token}");
        match headers.get(AUTHORIZATION) {
            Some(value) if value.as_bytes() == expected.as_bytes() => Ok(()),
            _ => Err(StatusCode::FORBIDDEN),
        }
    }
}

/// An in-process S3-compatible server for use in integration tests.
///
/// It listens on a random available port on localhost and stops when dropped.
#[derive(Debug)]
pub struct MockS3Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    store: Arc<Store>,
}

impl MockS3Server {
    /// Starts a server accepting all requests.
    pub async fn new() -> Self {
        Self::start(None).await
    }

    /// Starts a server that rejects requests without the given bearer token.
    pub async fn with_token(token: &str) -> Self {
        Self::start(Some(token.to_owned())).await
    }

    async fn start(token: Option<String>) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let store = Arc::new(Store {
            token,
            ..Default::default()
        });

        let app = Router::new()
            .route("/{bucket}", put(put_bucket).get(list_versions))
            .route(
                "/{bucket}/{*key}",
                put(put_object).get(get_object).delete(delete_object),
            )
            .with_state(Arc::clone(&store));

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            store,
        }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }

    /// Returns the number of requests received, including rejected ones.
    pub fn requests(&self) -> usize {
        self.store.requests.load(Ordering::Relaxed)
    }

    /// Returns the number of stored object versions in the bucket.
    pub fn object_count(&self, bucket: &str) -> usize {
        let buckets = self.store.buckets.lock().unwrap();
        buckets
            .get(bucket)
            .map(|bucket| bucket.objects.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Stores an object directly, bypassing request counting and authorization.
    ///
    /// Creates the bucket if it does not exist.
    pub fn insert(&self, bucket: &str, key: &str, body: &'static [u8]) {
        let mut buckets = self.store.buckets.lock().unwrap();
        let bucket = buckets.entry(bucket.to_owned()).or_default();
        bucket
            .objects
            .entry(key.to_owned())
            .or_default()
            .push((None, Bytes::from_static(body)));
    }

    /// Returns `true` if versioning is enabled on the bucket.
    pub fn is_versioned(&self, bucket: &str) -> bool {
        let buckets = self.store.buckets.lock().unwrap();
        buckets.get(bucket).is_some_and(|bucket| bucket.versioned)
    }
}

impl Drop for MockS3Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn put_bucket(
    State(store): State<Arc<Store>>,
    Path(bucket): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    store.authorize(&headers)?;
    let mut buckets = store.buckets.lock().unwrap();

    if params.contains_key("versioning") {
        let bucket = buckets.get_mut(&bucket).ok_or(StatusCode::NOT_FOUND)?;
        bucket.versioned = true;
        return Ok(StatusCode::OK);
    }

    if buckets.contains_key(&bucket) {
        return Err(StatusCode::CONFLICT);
    }
    buckets.insert(bucket, Bucket::default());
    Ok(StatusCode::OK)
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Serves `ListObjectVersions` in a single, never truncated page.
async fn list_versions(
    State(store): State<Arc<Store>>,
    Path(bucket): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    store.authorize(&headers)?;
    if !params.contains_key("versions") {
        return Err(StatusCode::NOT_IMPLEMENTED);
    }

    let buckets = store.buckets.lock().unwrap();
    let bucket = buckets.get(&bucket).ok_or(StatusCode::NOT_FOUND)?;

    let mut body = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListVersionsResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><IsTruncated>false</IsTruncated>"#,
    );
    for (key, versions) in &bucket.objects {
        for (version_id, data) in versions {
            body.push_str(&format!(
                "<Version><Key>{}</Key><VersionId>{}</VersionId><Size>{}</Size></Version>",
                escape(key),
                version_id.as_deref().unwrap_or("null"),
                data.len()
            ));
        }
    }
    body.push_str("</ListVersionsResult>");

    Ok(([(CONTENT_TYPE, "application/xml")], body).into_response())
}

async fn put_object(
    State(store): State<Arc<Store>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StatusCode> {
    store.authorize(&headers)?;
    let mut buckets = store.buckets.lock().unwrap();
    let bucket = buckets.get_mut(&bucket).ok_or(StatusCode::NOT_FOUND)?;

    let version_id = bucket.versioned.then(|| {
        bucket.next_version += 1;
        format!("v{}", bucket.next_version)
    });

    let versions = bucket.objects.entry(key).or_default();
    if version_id.is_none() {
        versions.clear();
    }
    versions.push((version_id.clone(), body));

    let mut response = StatusCode::OK.into_response();
    if let Some(version_id) = version_id {
        response
            .headers_mut()
            .insert(VERSION_ID_HEADER, version_id.parse().unwrap());
    }
    Ok(response)
}

/// Serves both `GET` and `HEAD`. For `HEAD`, the body is dropped but its length is reported.
async fn get_object(
    State(store): State<Arc<Store>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    store.authorize(&headers)?;
    let buckets = store.buckets.lock().unwrap();
    let versions = buckets
        .get(&bucket)
        .and_then(|bucket| bucket.objects.get(&key))
        .ok_or(StatusCode::NOT_FOUND)?;

    let (version_id, body) = match params.get("versionId") {
        Some(wanted) => versions
            .iter()
            .find(|(version_id, _)| version_id.as_ref() == Some(wanted)),
        None => versions.last(),
    }
    .ok_or(StatusCode::NOT_FOUND)?;

    let mut response = body.clone().into_response();
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, body.len().into());
    if let Some(version_id) = version_id {
        response
            .headers_mut()
            .insert(VERSION_ID_HEADER, version_id.parse().unwrap());
    }
    Ok(response)
}

async fn delete_object(
    State(store): State<Arc<Store>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    store.authorize(&headers)?;
    let mut buckets = store.buckets.lock().unwrap();
    let bucket = buckets.get_mut(&bucket).ok_or(StatusCode::NOT_FOUND)?;
    let versions = bucket.objects.get_mut(&key).ok_or(StatusCode::NOT_FOUND)?;

    match params.get("versionId") {
        Some(wanted) => versions.retain(|(version_id, _)| version_id.as_ref() != Some(wanted)),
        None => versions.clear(),
    }
    if versions.is_empty() {
        bucket.objects.remove(&key);
    }

    Ok(StatusCode::NO_CONTENT)
}
