//! In-memory storage client for dry runs and tests.
//!
//! This provides a [`StorageClient`] backed by a `HashMap`, removing the need for a running
//! storage service. The client is [`Clone`] so tests can hold a handle for direct inspection
//! while the benchmark owns a boxed copy. Payloads are consumed and counted but not retained.
//!
//! A few knobs allow simulating misbehaving services: failing uploads, short writes, wrong sizes
//! reported on lookups and artificial latency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;

use super::{
    ListedObject, ObjectStat, PutOptions, PutResult, StatOptions, StorageClient, StorageError,
    StorageResult,
};
use crate::generator::Payload;

#[derive(Debug)]
struct Version {
    version_id: Option<String>,
    size: u64,
}

#[derive(Debug, Default)]
struct Bucket {
    versioned: bool,
    next_version: u64,
    objects: HashMap<String, Vec<Version>>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_puts: bool,
    fail_put_at: Option<usize>,
    puts: usize,
    missing_bytes: u64,
    size_overrides: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Store {
    buckets: HashMap<String, Bucket>,
    faults: Faults,
}

/// A [`StorageClient`] keeping all buckets in process memory.
///
/// Clones share the same store. Faults can be injected to exercise error paths.
#[derive(Debug, Clone)]
pub struct InMemoryClient {
    endpoint: String,
    latency: Duration,
    store: Arc<Mutex<Store>>,
}

impl InMemoryClient {
    /// Creates a client with an empty store and no latency.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            latency: Duration::ZERO,
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    /// Returns a client for another endpoint sharing the same store.
    pub fn with_endpoint(&self, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            latency: self.latency,
            store: Arc::clone(&self.store),
        }
    }

    /// Delays every call by the given duration.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes all subsequent uploads fail.
    pub fn fail_puts(&self, fail: bool) {
        self.store.lock().unwrap().faults.fail_puts = fail;
    }

    /// Makes only the `nth` upload from now on fail, counting from 1.
    pub fn fail_nth_put(&self, nth: usize) {
        let mut store = self.store.lock().unwrap();
        store.faults.puts = 0;
        store.faults.fail_put_at = Some(nth);
    }

    /// Makes all subsequent uploads acknowledge `missing` bytes less than were sent.
    pub fn short_writes(&self, missing: u64) {
        self.store.lock().unwrap().faults.missing_bytes = missing;
    }

    /// Reports the given size for all lookups of `key`, regardless of what is stored.
    pub fn override_size(&self, key: impl Into<String>, size: u64) {
        self.store
            .lock()
            .unwrap()
            .faults
            .size_overrides
            .insert(key.into(), size);
    }

    /// Returns the number of stored object versions in the bucket.
    pub fn object_count(&self, bucket: &str) -> usize {
        let store = self.store.lock().unwrap();
        store
            .buckets
            .get(bucket)
            .map(|bucket| bucket.objects.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Returns `true` if the bucket has no stored objects.
    pub fn is_empty(&self, bucket: &str) -> bool {
        self.object_count(bucket) == 0
    }

    /// Returns `true` if versioning is enabled on the bucket.
    pub fn is_versioned(&self, bucket: &str) -> bool {
        let store = self.store.lock().unwrap();
        store
            .buckets
            .get(bucket)
            .is_some_and(|bucket| bucket.versioned)
    }

    async fn simulate_latency(&self) {
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait::async_trait]
impl StorageClient for InMemoryClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create_bucket(&self, bucket: &str) -> StorageResult<()> {
        self.simulate_latency().await;
        let mut store = self.store.lock().unwrap();
        store.buckets.entry(bucket.to_owned()).or_default();
        Ok(())
    }

    async fn enable_versioning(&self, bucket: &str) -> StorageResult<()> {
        self.simulate_latency().await;
        let mut store = self.store.lock().unwrap();
        let bucket = store
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::NotFound(bucket.to_owned()))?;
        bucket.versioned = true;
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        payload: Payload,
        size: u64,
        _opts: &PutOptions,
    ) -> StorageResult<PutResult> {
        self.simulate_latency().await;
        let written = tokio::io::copy(&mut payload.take(size), &mut tokio::io::sink()).await?;

        let mut store = self.store.lock().unwrap();
        store.faults.puts += 1;
        if store.faults.fail_puts || store.faults.fail_put_at == Some(store.faults.puts) {
            return Err(StorageError::Generic(format!("simulated failure uploading `{key}`")));
        }
        let written = written.saturating_sub(store.faults.missing_bytes);

        let bucket_name = bucket;
        let bucket = store
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::NotFound(bucket_name.to_owned()))?;

        let version_id = bucket.versioned.then(|| {
            bucket.next_version += 1;
            format!("{:016x}", bucket.next_version)
        });

        let versions = bucket.objects.entry(key.to_owned()).or_default();
        if version_id.is_none() {
            versions.clear();
        }
        versions.push(Version {
            version_id: version_id.clone(),
            size: written,
        });

        Ok(PutResult {
            version_id,
            size: written,
        })
    }

    async fn stat_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &StatOptions,
    ) -> StorageResult<ObjectStat> {
        self.simulate_latency().await;
        let store = self.store.lock().unwrap();
        let versions = store
            .buckets
            .get(bucket)
            .and_then(|bucket| bucket.objects.get(key))
            .ok_or_else(|| StorageError::NotFound(key.to_owned()))?;

        let version = match &opts.version_id {
            Some(version_id) => versions
                .iter()
                .find(|v| v.version_id.as_ref() == Some(version_id)),
            None => versions.last(),
        }
        .ok_or_else(|| StorageError::NotFound(key.to_owned()))?;

        let size = store
            .faults
            .size_overrides
            .get(key)
            .copied()
            .unwrap_or(version.size);

        Ok(ObjectStat {
            size,
            version_id: version.version_id.clone(),
        })
    }

    async fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ListedObject>> {
        self.simulate_latency().await;
        let store = self.store.lock().unwrap();
        let bucket = store
            .buckets
            .get(bucket)
            .ok_or_else(|| StorageError::NotFound(bucket.to_owned()))?;

        let objects = bucket
            .objects
            .iter()
            .flat_map(|(key, versions)| {
                versions.iter().map(|version| ListedObject {
                    key: key.clone(),
                    version_id: version.version_id.clone(),
                })
            })
            .collect();

        Ok(objects)
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> StorageResult<()> {
        self.simulate_latency().await;
        let mut store = self.store.lock().unwrap();
        let Some(bucket) = store.buckets.get_mut(bucket) else {
            return Ok(());
        };

        if let Some(versions) = bucket.objects.get_mut(key) {
            match version_id {
                Some(version_id) => {
                    versions.retain(|v| v.version_id.as_deref() != Some(version_id))
                }
                None => versions.clear(),
            }
            if versions.is_empty() {
                bucket.objects.remove(key);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    use super::*;

    fn payload(len: u64) -> Payload {
        Payload {
            len,
            rng: SmallRng::seed_from_u64(0),
        }
    }

    #[tokio::test]
    async fn put_stat_delete() {
        let client = InMemoryClient::new("mem");
        client.create_bucket("b").await.unwrap();

        let put = client
            .put_object("b", "k", payload(10), 10, &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(put, PutResult { version_id: None, size: 10 });

        let stat = client
            .stat_object("b", "k", &StatOptions::default())
            .await
            .unwrap();
        assert_eq!(stat.size, 10);

        client.delete_object("b", "k", None).await.unwrap();
        assert!(client.is_empty("b"));
        assert!(matches!(
            client.stat_object("b", "k", &StatOptions::default()).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn versions_are_kept_separately() {
        let client = InMemoryClient::new("mem");
        client.create_bucket("b").await.unwrap();
        client.enable_versioning("b").await.unwrap();

        let v1 = client
            .put_object("b", "k", payload(1), 1, &PutOptions::default())
            .await
            .unwrap();
        let v2 = client
            .put_object("b", "k", payload(2), 2, &PutOptions::default())
            .await
            .unwrap();
        assert_ne!(v1.version_id, v2.version_id);
        assert_eq!(client.object_count("b"), 2);

        let opts = StatOptions {
            version_id: v1.version_id.clone(),
        };
        assert_eq!(client.stat_object("b", "k", &opts).await.unwrap().size, 1);

        client
            .delete_object("b", "k", v1.version_id.as_deref())
            .await
            .unwrap();
        assert_eq!(client.object_count("b"), 1);
    }

    #[tokio::test]
    async fn simulated_faults() {
        let client = InMemoryClient::new("mem");
        client.create_bucket("b").await.unwrap();

        client.short_writes(3);
        let put = client
            .put_object("b", "k", payload(10), 10, &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(put.size, 7);

        client.override_size("k", 99);
        let stat = client
            .stat_object("b", "k", &StatOptions::default())
            .await
            .unwrap();
        assert_eq!(stat.size, 99);

        client.fail_puts(true);
        assert!(
            client
                .put_object("b", "x", payload(1), 1, &PutOptions::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn fails_only_the_nth_put() {
        let client = InMemoryClient::new("mem");
        client.create_bucket("b").await.unwrap();
        client.fail_nth_put(2);

        let mut results = Vec::new();
        for key in ["k1", "k2", "k3"] {
            let put = client
                .put_object("b", key, payload(1), 1, &PutOptions::default())
                .await;
            results.push(put.is_ok());
        }

        assert_eq!(results, vec![true, false, true]);
        assert_eq!(client.object_count("b"), 2);
    }

    #[tokio::test]
    async fn lists_all_versions() {
        let client = InMemoryClient::new("mem");
        client.create_bucket("b").await.unwrap();
        client.enable_versioning("b").await.unwrap();

        for key in ["a", "a", "b"] {
            client
                .put_object("b", key, payload(1), 1, &PutOptions::default())
                .await
                .unwrap();
        }

        let mut listed = client.list_objects("b").await.unwrap();
        listed.sort_by(|x, y| (&x.key, &x.version_id).cmp(&(&y.key, &y.version_id)));
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "a", "b"]);
        assert!(listed.iter().all(|o| o.version_id.is_some()));

        assert!(matches!(
            client.list_objects("missing").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
