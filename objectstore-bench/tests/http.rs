use std::sync::Arc;
use std::time::Duration;

use objectstore_bench::benchmark::{self, Benchmark, Common, Stat};
use objectstore_bench::client::{BoxedClient, ClientPool, S3Client};
use objectstore_bench::generator::{ObjectGenerator, SizeDistribution};
use objectstore_bench::{Error, OpType};
use objectstore_test::server::MockS3Server;
use tokio_util::sync::CancellationToken;

const BUCKET: &str = "bench";

fn common(clients: ClientPool, concurrency: usize) -> Common {
    let generator = ObjectGenerator::builder()
        .sizes(SizeDistribution::LogNormal { p50: 256, p99: 4096 })
        .build()
        .unwrap();

    Common::new(BUCKET, clients, generator).with_concurrency(concurrency)
}

#[tokio::test]
async fn stat_against_s3_api() {
    objectstore_test::tracing::init();
    let server = MockS3Server::new().await;

    let client = S3Client::builder(server.url("/")).build().unwrap();
    let mut bench = Stat::new(common(ClientPool::single(client), 3), 6, 2);

    let outcome = benchmark::run(
        &mut bench,
        Duration::from_millis(300),
        true,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(server.is_versioned(BUCKET));
    assert_eq!(bench.objects().len(), 12);
    assert!(bench.objects().iter().all(|o| o.version_id.is_some()));
    assert_eq!(outcome.prepare_operations.len(), 12);

    let ops = &outcome.operations;
    assert!(!ops.is_empty());
    assert!(ops.iter().all(|op| op.op_type == OpType::Stat));
    assert!(ops.errors().next().is_none(), "{:?}", ops.errors().next());

    assert_eq!(outcome.cleanup.map(|c| c.deleted), Some(12));
    assert_eq!(server.object_count(BUCKET), 0);
}

#[tokio::test]
async fn prepare_clears_bucket_over_s3_api() {
    let server = MockS3Server::new().await;
    server.insert(BUCKET, "leftover/a", b"old");
    server.insert(BUCKET, "leftover/b&c", b"old");

    let client = S3Client::builder(server.url("/")).build().unwrap();
    let mut bench = Stat::new(common(ClientPool::single(client), 2), 4, 2);

    let outcome = benchmark::run(
        &mut bench,
        Duration::from_millis(50),
        true,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.cleanup.map(|c| c.deleted), Some(8));
    assert_eq!(server.object_count(BUCKET), 0);
}

#[tokio::test]
async fn cleanup_routes_deletes_to_every_endpoint() {
    let first = MockS3Server::new().await;
    let second = MockS3Server::new().await;

    // Both servers must hold the same data, so every object is uploaded through the first.
    let uploader = S3Client::builder(first.url("/")).build().unwrap();
    let mut bench = Stat::new(common(ClientPool::single(uploader), 2), 4, 1);
    bench.prepare(&CancellationToken::new()).await.unwrap();

    let clients: Vec<BoxedClient> = vec![
        Arc::new(S3Client::builder(first.url("/")).build().unwrap()),
        Arc::new(S3Client::builder(second.url("/")).build().unwrap()),
    ];
    let pool = ClientPool::new(clients).unwrap();
    assert_eq!(pool.endpoints(), 2);

    let before = second.requests();
    let summary = common(pool, 2).delete_all(&CancellationToken::new(), bench.objects()).await;

    // Objects only exist on the first server, deletes routed to the second are no-ops.
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.deleted, 4);
    assert!(second.requests() > before);
}

#[tokio::test]
async fn missing_token_fails_prepare() {
    let server = MockS3Server::with_token("secret").await;

    let client = S3Client::builder(server.url("/")).build().unwrap();
    let mut bench = Stat::new(common(ClientPool::single(client), 1), 1, 1);
    let error = bench.prepare(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(error, Error::CreateBucket { .. }), "{error}");

    let client = S3Client::builder(server.url("/"))
        .token("secret")
        .build()
        .unwrap();
    let mut bench = Stat::new(common(ClientPool::single(client), 1), 1, 1);
    bench.prepare(&CancellationToken::new()).await.unwrap();
    assert_eq!(server.object_count(BUCKET), 1);
}
