//! Benchmarks and the driver that runs their phases.
//!
//! Every benchmark goes through three phases:
//!
//! 1. **Prepare** creates the bucket, removes anything already stored in it and uploads the
//!    objects the benchmark needs. The objects are recorded in an inventory that later phases
//!    read and cleanup deletes.
//! 2. **Start** runs the measured workload. All workers are created first and wait on a
//!    [`StartGate`], so that they begin issuing requests at the same instant. The phase ends when
//!    its cancellation token fires, either after the configured duration, through
//!    auto-termination or from the outside.
//! 3. **Cleanup** deletes everything recorded in the inventory.
//!
//! [`run`] drives a benchmark through all phases.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::client::ClientPool;
use crate::error::{Error, Result};
use crate::gate::StartGate;
use crate::generator::ObjectGenerator;
use crate::object::Objects;
use crate::operation::Operations;
use crate::rate_limit::RateLimiter;

mod stat;

/// The largest number of workers, as every worker needs a distinct `u16` thread index.
pub const MAX_CONCURRENCY: usize = u16::MAX as usize + 1;

pub use stat::Stat;

/// A benchmark with a prepare, a measured and a cleanup phase.
#[async_trait::async_trait]
pub trait Benchmark: Send + Sync {
    /// Creates the bucket and the objects the measurement needs.
    ///
    /// Setup failures and the first upload failure abort the phase with an error.
    async fn prepare(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Runs the measured workload until `cancel` fires and returns all recorded operations.
    ///
    /// Workers do not issue any request before `gate` is opened. Failures of individual calls
    /// are recorded on their operations and never abort the phase.
    async fn start(&self, cancel: &CancellationToken, gate: StartGate) -> Operations;

    /// Deletes all objects created during prepare.
    async fn cleanup(&self, cancel: &CancellationToken) -> CleanupSummary;

    /// Settings and resources shared by all benchmarks.
    fn common(&self) -> &Common;

    /// Operations recorded while preparing.
    fn prepare_operations(&self) -> &Operations;
}

/// Ends the measurement once throughput has stabilized.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AutoTerm {
    /// Maximum relative deviation between segments that still counts as stable.
    pub threshold: f64,
    /// Minimum duration over which throughput must be stable.
    pub duration: Duration,
}

/// Completion of the prepare phase as a fraction between `0.0` and `1.0`.
///
/// The value only ever grows, so concurrent updates cannot make it go backwards.
#[derive(Debug, Default)]
pub struct Progress {
    bits: AtomicU64,
    finished: AtomicBool,
}

impl Progress {
    /// Returns the current fraction.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Raises the fraction to `value` unless it is already higher.
    pub fn raise(&self, value: f64) {
        let value = value.clamp(0.0, 1.0);
        // The bit patterns of non-negative floats order like the floats themselves.
        self.bits.fetch_max(value.to_bits(), Ordering::Relaxed);
    }

    /// Returns `true` once the prepare phase has returned, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

/// Settings and resources shared by all benchmarks.
#[derive(Clone, Debug)]
pub struct Common {
    /// The bucket all objects are placed in.
    pub bucket: String,
    /// Number of concurrent workers in every phase.
    pub concurrency: usize,
    /// Clients for the storage service under test.
    pub clients: ClientPool,
    /// Source of object names and payloads.
    pub generator: Arc<ObjectGenerator>,
    /// Global limit on the rate of operations, if any.
    pub rate_limit: Option<Arc<RateLimiter>>,
    /// Ends the measurement early once throughput is stable, if set.
    pub auto_term: Option<AutoTerm>,
    /// Whether prepare deletes objects already stored in the bucket.
    pub clear: bool,
    progress: Arc<Progress>,
    versioned: bool,
}

impl Common {
    /// Creates settings for a benchmark against the given bucket with a single worker.
    pub fn new(bucket: impl Into<String>, clients: ClientPool, generator: ObjectGenerator) -> Self {
        Self {
            bucket: bucket.into(),
            concurrency: 1,
            clients,
            generator: Arc::new(generator),
            rate_limit: None,
            auto_term: None,
            clear: true,
            progress: Arc::default(),
            versioned: false,
        }
    }

    /// Sets the number of concurrent workers, between 1 and [`MAX_CONCURRENCY`].
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }

    /// Sets whether prepare deletes objects already stored in the bucket.
    pub fn with_clear(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// Limits all workers together to the given rate.
    pub fn with_rate_limit(mut self, limiter: RateLimiter) -> Self {
        self.rate_limit = Some(Arc::new(limiter));
        self
    }

    /// Enables auto-termination of the measurement.
    pub fn with_auto_term(mut self, auto_term: AutoTerm) -> Self {
        self.auto_term = Some(auto_term);
        self
    }

    /// Returns the number of workers per phase, which always fits a `u16` thread index.
    pub(crate) fn workers(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    /// Returns a handle to the prepare progress that can be observed while preparing.
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Returns `true` once versioning has been enabled on the bucket.
    pub fn is_versioned(&self) -> bool {
        self.versioned
    }

    pub(crate) fn set_versioned(&mut self) {
        self.versioned = true;
    }

    /// Deletes every object version stored in the bucket and returns how many were deleted.
    ///
    /// Failing to list the bucket is an error. Failed deletes are logged and leave the object in
    /// place. Once `cancel` fires, no further deletes are started.
    pub async fn clear_bucket(&self, cancel: &CancellationToken) -> Result<usize> {
        let listed = {
            let client = self.clients.checkout();
            client
                .list_objects(&self.bucket)
                .await
                .map_err(|cause| Error::ClearBucket {
                    bucket: self.bucket.clone(),
                    cause,
                })?
        };

        if listed.is_empty() {
            return Ok(0);
        }
        tracing::info!(objects = listed.len(), bucket = %self.bucket, "clearing bucket");

        let deleted = AtomicUsize::new(0);
        futures::stream::iter(&listed)
            .for_each_concurrent(self.concurrency, |object| {
                let deleted = &deleted;
                async move {
                    if cancel.is_cancelled() {
                        return;
                    }

                    let client = self.clients.checkout();
                    let result = client
                        .delete_object(&self.bucket, &object.key, object.version_id.as_deref())
                        .await;

                    match result {
                        Ok(()) => {
                            deleted.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(error) => tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            key = %object.key,
                            "failed to delete existing object"
                        ),
                    }
                }
            })
            .await;

        Ok(deleted.into_inner())
    }

    /// Deletes all given objects with bounded concurrency.
    ///
    /// Objects are deleted one prefix at a time. Failures are logged and counted but do not stop
    /// the cleanup. Once `cancel` fires, remaining objects are skipped.
    pub async fn delete_all(
        &self,
        cancel: &CancellationToken,
        objects: &Objects,
    ) -> CleanupSummary {
        let deleted = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);

        for prefix in objects.prefixes() {
            tracing::debug!(prefix, "deleting objects");

            futures::stream::iter(objects.with_prefix(prefix))
                .for_each_concurrent(self.concurrency, |object| {
                    let (deleted, failed, skipped) = (&deleted, &failed, &skipped);
                    async move {
                        if cancel.is_cancelled() {
                            skipped.fetch_add(1, Ordering::Relaxed);
                            return;
                        }

                        let client = self.clients.checkout();
                        let result = client
                            .delete_object(&self.bucket, &object.name, object.version_id.as_deref())
                            .await;

                        match result {
                            Ok(()) => deleted.fetch_add(1, Ordering::Relaxed),
                            Err(error) => {
                                tracing::warn!(
                                    error = &error as &dyn std::error::Error,
                                    key = %object.name,
                                    "failed to delete object"
                                );
                                failed.fetch_add(1, Ordering::Relaxed)
                            }
                        };
                    }
                })
                .await;
        }

        let summary = CleanupSummary {
            deleted: deleted.into_inner(),
            failed: failed.into_inner(),
            skipped: skipped.into_inner(),
        };
        tracing::info!(?summary, "cleanup done");
        summary
    }
}

/// The result of deleting the inventory.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CleanupSummary {
    /// Objects deleted successfully.
    pub deleted: usize,
    /// Objects whose deletion failed.
    pub failed: usize,
    /// Objects not attempted because cleanup was cancelled.
    pub skipped: usize,
}

/// The results of a complete benchmark run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Operations recorded during the measurement.
    pub operations: Operations,
    /// Operations recorded while preparing.
    pub prepare_operations: Operations,
    /// The outcome of the cleanup, if it ran.
    pub cleanup: Option<CleanupSummary>,
}

/// Splits `total` iterations over `workers` as evenly as possible.
///
/// The first `total % workers` workers receive one more iteration than the others.
pub fn split_objects(total: usize, workers: usize) -> Vec<usize> {
    if workers == 0 {
        return Vec::new();
    }

    let base = total / workers;
    let remainder = total % workers;
    (0..workers)
        .map(|worker| base + usize::from(worker < remainder))
        .collect()
}

/// Runs a benchmark through all of its phases.
///
/// The measurement runs for `duration` unless it ends earlier through auto-termination or
/// `cancel`. If prepare fails, the objects uploaded so far are cleaned up and the error is
/// returned. Cleanup is not affected by `cancel`, so a cancelled run still removes its objects.
pub async fn run<B>(
    benchmark: &mut B,
    duration: Duration,
    cleanup: bool,
    cancel: &CancellationToken,
) -> Result<RunOutcome>
where
    B: Benchmark + ?Sized,
{
    let prepared = benchmark.prepare(cancel).await;
    benchmark.common().progress.finish();

    if let Err(error) = prepared {
        if cleanup {
            benchmark.cleanup(&CancellationToken::new()).await;
        }
        return Err(error);
    }

    let measure = cancel.child_token();
    let gate = StartGate::new();
    let operations = {
        let start = benchmark.start(&measure, gate.clone());
        tokio::pin!(start);

        tracing::info!(?duration, "starting measurement");
        gate.open();

        tokio::select! {
            operations = &mut start => operations,
            _ = tokio::time::sleep(duration) => {
                measure.cancel();
                start.await
            }
        }
    };
    tracing::info!(operations = operations.len(), "measurement done");

    let cleanup = if cleanup {
        Some(benchmark.cleanup(&CancellationToken::new()).await)
    } else {
        None
    };

    Ok(RunOutcome {
        operations,
        prepare_operations: benchmark.prepare_operations().clone(),
        cleanup,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_objects_spreads_remainder() {
        let parts = split_objects(10, 3);
        assert_eq!(parts, vec![4, 3, 3]);
        assert_eq!(parts.iter().sum::<usize>(), 10);
    }

    #[test]
    fn split_objects_with_more_workers_than_objects() {
        assert_eq!(split_objects(2, 4), vec![1, 1, 0, 0]);
        assert_eq!(split_objects(0, 2), vec![0, 0]);
        assert!(split_objects(5, 0).is_empty());
    }

    #[test]
    fn concurrency_fits_thread_indexes() {
        let common = |concurrency| {
            let generator = ObjectGenerator::builder().build().unwrap();
            let client = crate::client::InMemoryClient::new("mem");
            Common::new("b", ClientPool::single(client), generator).with_concurrency(concurrency)
        };

        assert_eq!(common(0).concurrency, 1);
        assert_eq!(common(MAX_CONCURRENCY).concurrency, MAX_CONCURRENCY);
        assert_eq!(common(100_000).concurrency, MAX_CONCURRENCY);
        assert_eq!(u16::try_from(MAX_CONCURRENCY - 1), Ok(u16::MAX));
    }

    #[test]
    fn progress_never_decreases() {
        let progress = Progress::default();
        progress.raise(0.5);
        progress.raise(0.25);
        assert_eq!(progress.get(), 0.5);
        progress.raise(2.0);
        assert_eq!(progress.get(), 1.0);
    }
}
