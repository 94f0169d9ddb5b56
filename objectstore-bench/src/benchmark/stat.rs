//! Measures metadata lookups of existing objects.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Benchmark, CleanupSummary, Common, split_objects};
use crate::client::{PutOptions, StatOptions};
use crate::collector::{AUTO_TERM_CHECK, AUTO_TERM_SAMPLES, Collector, OperationSender};
use crate::error::{Error, Result};
use crate::gate::StartGate;
use crate::object::{ObjectInfo, Objects};
use crate::operation::{OpType, Operation, Operations};

/// Uploads objects, then looks up the metadata of randomly chosen ones.
///
/// With more than one version per object, versioning is enabled on the bucket and every version
/// is recorded separately. Lookups then target a specific version.
#[derive(Debug)]
pub struct Stat {
    common: Common,
    create_objects: usize,
    versions: usize,
    objects: Objects,
    prepare_ops: Operations,
}

impl Stat {
    /// Creates a benchmark that uploads `objects` objects with `versions` versions each.
    pub fn new(common: Common, objects: usize, versions: usize) -> Self {
        Self {
            common,
            create_objects: objects,
            versions: versions.max(1),
            objects: Objects::default(),
            prepare_ops: Operations::default(),
        }
    }

    /// The inventory recorded by the prepare phase.
    pub fn objects(&self) -> &Objects {
        &self.objects
    }

    fn is_versioned(&self) -> bool {
        self.versions > 1
    }
}

#[derive(Debug, Default)]
struct PrepareState {
    objects: Vec<ObjectInfo>,
    first_error: Option<Error>,
}

impl PrepareState {
    fn fail(&mut self, error: Error) {
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }
}

#[async_trait::async_trait]
impl Benchmark for Stat {
    async fn prepare(&mut self, cancel: &CancellationToken) -> Result<()> {
        let bucket = self.common.bucket.clone();

        {
            let client = self.common.clients.checkout();
            client
                .create_bucket(&bucket)
                .await
                .map_err(|cause| Error::CreateBucket {
                    bucket: bucket.clone(),
                    cause,
                })?;
        }

        if self.common.clear {
            self.common.clear_bucket(cancel).await?;
        }

        if self.is_versioned() && !self.common.is_versioned() {
            let client = self.common.clients.checkout();
            client
                .enable_versioning(&bucket)
                .await
                .map_err(|cause| Error::Versioning {
                    bucket: bucket.clone(),
                    cause,
                })?;
            self.common.set_versioned();
        }

        tracing::info!(
            objects = self.create_objects,
            versions = self.versions,
            concurrency = self.common.workers(),
            "uploading objects"
        );

        let collector = Collector::new();
        let state = Arc::new(Mutex::new(PrepareState::default()));
        let total = self.create_objects * self.versions;

        let parts = split_objects(self.create_objects, self.common.workers());
        let workers: Vec<JoinHandle<()>> = parts
            .into_iter()
            .enumerate()
            .map(|(thread, count)| {
                let uploader = Uploader {
                    common: self.common.clone(),
                    cancel: cancel.clone(),
                    sender: collector.sender(),
                    state: Arc::clone(&state),
                    thread: thread as u16,
                    versions: self.versions,
                    total,
                };
                tokio::spawn(uploader.run(count))
            })
            .collect();

        for result in join_all(workers).await {
            if let Err(error) = result {
                tracing::error!(error = &error as &dyn std::error::Error, "upload worker failed");
            }
        }

        let PrepareState {
            objects,
            first_error,
        } = std::mem::take(&mut *state.lock().unwrap());

        tracing::info!(objects = objects.len(), "prepare done");
        self.objects = Objects::from(objects);
        self.prepare_ops = collector.close().await;

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn start(&self, cancel: &CancellationToken, gate: StartGate) -> Operations {
        let collector = Collector::new();
        let run = match self.common.auto_term {
            Some(auto_term) => collector.auto_term(
                cancel,
                OpType::Stat,
                auto_term.threshold,
                AUTO_TERM_CHECK,
                AUTO_TERM_SAMPLES,
                auto_term.duration,
            ),
            None => cancel.child_token(),
        };

        if self.objects.is_empty() {
            tracing::warn!("no objects to look up, skipping measurement");
            return collector.close().await;
        }

        let workers: Vec<_> = (0..self.common.workers())
            .map(|thread| {
                let worker = StatWorker {
                    common: self.common.clone(),
                    objects: self.objects.clone(),
                    run: run.clone(),
                    sender: collector.sender(),
                    thread: thread as u16,
                    versioned: self.is_versioned(),
                };
                tokio::spawn(worker.run(gate.clone()))
            })
            .collect();

        for result in join_all(workers).await {
            if let Err(error) = result {
                tracing::error!(error = &error as &dyn std::error::Error, "stat worker failed");
            }
        }

        collector.close().await
    }

    async fn cleanup(&self, cancel: &CancellationToken) -> CleanupSummary {
        self.common.delete_all(cancel, &self.objects).await
    }

    fn common(&self) -> &Common {
        &self.common
    }

    fn prepare_operations(&self) -> &Operations {
        &self.prepare_ops
    }
}

/// A prepare worker uploading its share of objects.
struct Uploader {
    common: Common,
    cancel: CancellationToken,
    sender: OperationSender,
    state: Arc<Mutex<PrepareState>>,
    thread: u16,
    versions: usize,
    total: usize,
}

impl Uploader {
    async fn run(self, count: usize) {
        let mut source = self.common.generator.source();

        for _ in 0..count {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Some(limiter) = &self.common.rate_limit {
                if limiter.consult(&self.cancel).await.is_err() {
                    return;
                }
            }

            let first = source.next_object();
            let name = first.name.clone();
            let mut versions = Vec::with_capacity(self.versions);
            versions.push(first);
            versions.extend((1..self.versions).map(|_| source.next_version(name.clone())));

            for object in versions {
                let (mut info, payload) = object.into_parts();

                let client = self.common.clients.checkout();
                let mut op = Operation::new(OpType::Put, self.thread, &info.name)
                    .with_size(info.size)
                    .with_endpoint(client.endpoint());
                let opts = PutOptions {
                    content_type: info.content_type.clone(),
                };

                let timer = op.begin();
                let result = client
                    .put_object(&self.common.bucket, &info.name, payload, info.size, &opts)
                    .await;
                timer.finish(&mut op);
                drop(client);

                let put = match result {
                    Ok(put) if put.size != info.size => Err(Error::ShortUpload {
                        want: info.size,
                        got: put.size,
                    }),
                    Ok(put) => Ok(put),
                    Err(cause) => Err(Error::Upload(cause)),
                };

                let put = match put {
                    Ok(put) => put,
                    Err(error) => {
                        tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            key = %info.name,
                            thread = self.thread,
                            "upload failed"
                        );
                        self.state.lock().unwrap().fail(error);
                        return;
                    }
                };

                info.version_id = put.version_id;
                {
                    let mut state = self.state.lock().unwrap();
                    state.objects.push(info);
                    let done = state.objects.len() as f64 / self.total as f64;
                    self.common.progress().raise(done);
                }

                self.sender.send(op).await;
            }
        }
    }
}

/// A measurement worker looking up random objects from the inventory.
struct StatWorker {
    common: Common,
    objects: Objects,
    run: CancellationToken,
    sender: OperationSender,
    thread: u16,
    versioned: bool,
}

impl StatWorker {
    async fn run(self, gate: StartGate) {
        let mut rng = SmallRng::seed_from_u64(self.thread as u64);

        tokio::select! {
            biased;
            _ = self.run.cancelled() => return,
            _ = gate.wait() => {}
        }

        loop {
            if self.run.is_cancelled() {
                return;
            }
            if let Some(limiter) = &self.common.rate_limit {
                if limiter.consult(&self.run).await.is_err() {
                    return;
                }
            }

            let object = &self.objects[rng.random_range(0..self.objects.len())];
            let client = self.common.clients.checkout();
            let mut op = Operation::new(OpType::Stat, self.thread, &object.name)
                .with_endpoint(client.endpoint());
            let opts = StatOptions {
                version_id: self.versioned.then(|| object.version_id.clone()).flatten(),
            };

            // Not raced against cancellation, so that every started call is recorded.
            let timer = op.begin();
            let result = client
                .stat_object(&self.common.bucket, &object.name, &opts)
                .await;
            timer.finish(&mut op);

            match result {
                Ok(stat) if stat.size != object.size => {
                    let message = format!(
                        "unexpected object size. want: {}, got: {}",
                        object.size, stat.size
                    );
                    tracing::warn!(key = %object.name, thread = self.thread, "{message}");
                    op.error = Some(message);
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        key = %object.name,
                        thread = self.thread,
                        "stat failed"
                    );
                    op.error = Some(error.to_string());
                }
            }

            self.sender.send(op).await;
            drop(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::{ClientPool, InMemoryClient, StorageClient};
    use crate::generator::{ObjectGenerator, Payload, SizeDistribution};

    fn stat(client: &InMemoryClient, concurrency: usize, objects: usize, versions: usize) -> Stat {
        let generator = ObjectGenerator::builder()
            .seed(42)
            .sizes(SizeDistribution::Fixed(128))
            .build()
            .unwrap();
        let common = Common::new("bench", ClientPool::single(client.clone()), generator)
            .with_concurrency(concurrency);
        Stat::new(common, objects, versions)
    }

    #[tokio::test]
    async fn prepare_records_every_version() {
        let client = InMemoryClient::new("mem");
        let mut bench = stat(&client, 3, 10, 2);

        bench.prepare(&CancellationToken::new()).await.unwrap();

        assert_eq!(bench.objects().len(), 20);
        assert!(bench.objects().iter().all(|o| o.version_id.is_some()));
        assert!(client.is_versioned("bench"));
        assert_eq!(client.object_count("bench"), 20);
        assert_eq!(bench.prepare_operations().len(), 20);
        assert_eq!(bench.common().progress().get(), 1.0);
        assert_eq!(bench.objects().prefixes().len(), 3);
    }

    async fn put_leftover(client: &InMemoryClient, key: &str) {
        let payload = Payload {
            len: 4,
            rng: SmallRng::seed_from_u64(0),
        };
        client.create_bucket("bench").await.unwrap();
        client
            .put_object("bench", key, payload, 4, &PutOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn prepare_clears_existing_objects() {
        let client = InMemoryClient::new("mem");
        put_leftover(&client, "leftover/old").await;
        let mut bench = stat(&client, 2, 4, 1);

        bench.prepare(&CancellationToken::new()).await.unwrap();
        assert_eq!(client.object_count("bench"), 4);

        let summary = bench.cleanup(&CancellationToken::new()).await;
        assert_eq!(summary.deleted, 4);
        assert!(client.is_empty("bench"));
    }

    #[tokio::test]
    async fn prepare_keeps_existing_objects_without_clear() {
        let client = InMemoryClient::new("mem");
        put_leftover(&client, "leftover/old").await;
        let mut bench = stat(&client, 2, 4, 1);
        bench.common.clear = false;

        bench.prepare(&CancellationToken::new()).await.unwrap();
        assert_eq!(client.object_count("bench"), 5);
    }

    #[tokio::test]
    async fn prepare_continues_after_first_failure() {
        let client = InMemoryClient::new("mem").with_latency(Duration::from_millis(1));
        // The second upload of the run fails, all other uploads succeed.
        client.fail_nth_put(2);
        let mut bench = stat(&client, 4, 20, 1);

        let error = bench.prepare(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(error, Error::Upload(_)), "{error}");

        // Only the failing worker stops, losing at most its own 5 objects.
        let uploaded = bench.objects().len();
        assert!((15..20).contains(&uploaded), "{uploaded} objects");
        assert_eq!(client.object_count("bench"), uploaded);
        assert_eq!(bench.prepare_operations().len(), uploaded);
        assert_eq!(bench.common().progress().get(), uploaded as f64 / 20.0);
    }

    #[tokio::test]
    async fn prepare_reports_short_upload() {
        let client = InMemoryClient::new("mem");
        client.short_writes(1);
        let mut bench = stat(&client, 2, 4, 1);

        let error = bench.prepare(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(error, Error::ShortUpload { want: 128, got: 127 }));
        assert!(bench.objects().is_empty());
    }

    #[tokio::test]
    async fn prepare_stops_when_cancelled() {
        let client = InMemoryClient::new("mem");
        let mut bench = stat(&client, 2, 100, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        bench.prepare(&cancel).await.unwrap();
        assert!(bench.objects().is_empty());
        assert!(client.is_empty("bench"));
    }

    #[tokio::test]
    async fn start_without_objects_returns_nothing() {
        let client = InMemoryClient::new("mem");
        let bench = stat(&client, 2, 0, 1);

        let ops = bench
            .start(&CancellationToken::new(), StartGate::opened())
            .await;
        assert!(ops.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_looks_up_versions() {
        let client = InMemoryClient::new("mem").with_latency(Duration::from_millis(1));
        let mut bench = stat(&client, 2, 5, 3);
        bench.prepare(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let gate = StartGate::new();
        let start = bench.start(&cancel, gate.clone());
        tokio::pin!(start);

        gate.open();
        let ops = tokio::select! {
            ops = &mut start => ops,
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                cancel.cancel();
                start.await
            }
        };

        assert!(!ops.is_empty());
        assert!(ops.iter().all(|op| op.op_type == OpType::Stat && !op.is_err()));
        assert!(ops.iter().all(|op| op.size == 0));
        assert_eq!(ops.iter().map(|op| op.thread).max(), Some(1));
    }
}
