//! Clients for the storage service under test.
//!
//! [`StorageClient`] is the seam between the benchmark and the wire protocol. Workers never hold
//! on to a client: for every call they check one out of the [`ClientPool`] and the returned
//! [`ClientGuard`] gives it back when dropped, on every exit path.

use std::fmt::Debug;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::error::{Error, Result};
use crate::generator::Payload;

pub mod http;
pub mod in_memory;

pub use http::S3Client;
pub use in_memory::InMemoryClient;

/// A type-erased [`StorageClient`] instance.
pub type BoxedClient = Arc<dyn StorageClient>;

/// Options for uploads.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// The content type announced for the object.
    pub content_type: String,
}

/// Options for metadata lookups.
#[derive(Clone, Debug, Default)]
pub struct StatOptions {
    /// Looks up this specific version instead of the latest one.
    pub version_id: Option<String>,
}

/// The acknowledgement of a successful upload.
#[derive(Clone, Debug, PartialEq)]
pub struct PutResult {
    /// The version assigned by the service, if the bucket is versioned.
    pub version_id: Option<String>,
    /// The number of bytes the service accepted.
    pub size: u64,
}

/// An object version found when listing a bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct ListedObject {
    /// The key of the object.
    pub key: String,
    /// The version, if the bucket is versioned.
    pub version_id: Option<String>,
}

/// Metadata of a stored object.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectStat {
    /// The size of the object in bytes.
    pub size: u64,
    /// The version of the object, if the bucket is versioned.
    pub version_id: Option<String>,
}

/// Operations a benchmark performs against the storage service.
///
/// Implementations must be cheap to share between workers. All calls may run concurrently.
#[async_trait::async_trait]
pub trait StorageClient: Debug + Send + Sync + 'static {
    /// Identifies the server instance this client talks to.
    fn endpoint(&self) -> &str;

    /// Creates the bucket, succeeding if it already exists.
    async fn create_bucket(&self, bucket: &str) -> StorageResult<()>;

    /// Enables versioning on the bucket, succeeding if it is already enabled.
    async fn enable_versioning(&self, bucket: &str) -> StorageResult<()>;

    /// Uploads `size` bytes from `payload` to the given key.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: Payload,
        size: u64,
        opts: &PutOptions,
    ) -> StorageResult<PutResult>;

    /// Retrieves the metadata of the object at the given key.
    async fn stat_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &StatOptions,
    ) -> StorageResult<ObjectStat>;

    /// Lists every object version stored in the bucket.
    async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ListedObject>>;

    /// Deletes the object at the given key, or only the given version of it.
    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StorageResult<()>;
}

/// Errors returned by [`StorageClient`] calls.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO errors related to payload streaming.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Network errors and errors raised by the HTTP client while sending a request.
    #[error("reqwest error: {context}")]
    Reqwest {
        /// What the client was doing.
        context: String,
        /// The underlying error.
        #[source]
        cause: reqwest::Error,
    },

    /// The service responded with an unexpected status code.
    #[error("{context}: unexpected status {status}")]
    Status {
        /// The request that failed.
        context: String,
        /// The HTTP status code of the response.
        status: u16,
    },

    /// The requested object or bucket does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other error, which might be specific to a client or to a certain operation.
    #[error("storage client error: {0}")]
    Generic(String),
}

/// Result type for storage client operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug)]
struct Endpoint {
    client: BoxedClient,
    in_flight: AtomicUsize,
}

/// Hands out clients for one or more endpoints of the storage service.
///
/// Every checkout goes to the endpoint with the fewest calls in flight.
#[derive(Clone, Debug)]
pub struct ClientPool {
    endpoints: Arc<[Endpoint]>,
    next: Arc<AtomicUsize>,
}

impl ClientPool {
    /// Creates a pool over the given clients, one per endpoint.
    pub fn new(clients: Vec<BoxedClient>) -> Result<Self> {
        if clients.is_empty() {
            return Err(Error::InvalidConfig("no storage endpoints configured".into()));
        }

        let endpoints = clients
            .into_iter()
            .map(|client| Endpoint {
                client,
                in_flight: AtomicUsize::new(0),
            })
            .collect();

        Ok(Self {
            endpoints,
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Creates a pool with a single endpoint.
    pub fn single(client: impl StorageClient) -> Self {
        Self {
            endpoints: Arc::new([Endpoint {
                client: Arc::new(client),
                in_flight: AtomicUsize::new(0),
            }]),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the number of endpoints.
    pub fn endpoints(&self) -> usize {
        self.endpoints.len()
    }

    /// Checks out a client for a single call.
    ///
    /// The client is returned to the pool when the guard is dropped.
    pub fn checkout(&self) -> ClientGuard {
        let count = self.endpoints.len();
        // Rotate the starting point so that ties are spread over all endpoints.
        let offset = self.next.fetch_add(1, Ordering::Relaxed);

        let index = (0..count)
            .map(|i| (offset + i) % count)
            .min_by_key(|&i| self.endpoints[i].in_flight.load(Ordering::Relaxed))
            .unwrap_or(0);

        self.endpoints[index]
            .in_flight
            .fetch_add(1, Ordering::Relaxed);

        ClientGuard {
            endpoints: Arc::clone(&self.endpoints),
            index,
        }
    }

    /// Returns the number of calls currently in flight across all endpoints.
    pub fn in_flight(&self) -> usize {
        self.endpoints
            .iter()
            .map(|endpoint| endpoint.in_flight.load(Ordering::Relaxed))
            .sum()
    }
}

/// RAII guard for a checked out client.
///
/// Dropping the guard returns the client to its [`ClientPool`].
#[derive(Debug)]
pub struct ClientGuard {
    endpoints: Arc<[Endpoint]>,
    index: usize,
}

impl Deref for ClientGuard {
    type Target = dyn StorageClient;

    fn deref(&self) -> &Self::Target {
        self.endpoints[self.index].client.as_ref()
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.endpoints[self.index]
            .in_flight
            .fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> ClientPool {
        let clients = (0..n)
            .map(|i| Arc::new(InMemoryClient::new(format!("mem-{i}"))) as BoxedClient)
            .collect();
        ClientPool::new(clients).unwrap()
    }

    #[test]
    fn rejects_empty_pool() {
        assert!(ClientPool::new(vec![]).is_err());
    }

    #[test]
    fn checkout_spreads_over_endpoints() {
        let pool = pool(3);

        let a = pool.checkout();
        let b = pool.checkout();
        let c = pool.checkout();
        let mut endpoints = vec![a.endpoint(), b.endpoint(), c.endpoint()];
        endpoints.sort_unstable();
        assert_eq!(endpoints, vec!["mem-0", "mem-1", "mem-2"]);
        assert_eq!(pool.in_flight(), 3);
    }

    #[test]
    fn guard_releases_on_drop() {
        let pool = pool(2);

        let busy = pool.checkout();
        let busy_endpoint = busy.endpoint().to_owned();
        for _ in 0..4 {
            let guard = pool.checkout();
            assert_ne!(guard.endpoint(), busy_endpoint);
        }

        drop(busy);
        assert_eq!(pool.in_flight(), 0);
    }
}
