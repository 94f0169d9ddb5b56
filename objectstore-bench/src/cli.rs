use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

use objectstore_bench::benchmark::{self, AutoTerm, Benchmark, Common, Stat};
use objectstore_bench::client::{BoxedClient, ClientPool, InMemoryClient, S3Client};
use objectstore_bench::config::{Config, Storage};
use objectstore_bench::generator::ObjectGenerator;
use objectstore_bench::rate_limit::RateLimiter;
use objectstore_bench::{observability, report};

/// Load generator for object storage services.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Stat(StatCommand),
    Version(VersionCommand),
}

/// upload objects, then measure metadata lookups of random objects
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "stat")]
struct StatCommand {
    /// keep objects already stored in the bucket instead of deleting them first
    #[argh(switch)]
    no_clear: bool,

    /// keep all uploaded objects after the benchmark
    #[argh(switch)]
    no_cleanup: bool,
}

/// print the version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("objectstore-bench {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("bench-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    runtime.block_on(async move {
        match args.command {
            Command::Stat(command) => stat(config, command).await,
            Command::Version(VersionCommand {}) => unreachable!(),
        }
    })
}

async fn stat(config: Config, command: StatCommand) -> Result<()> {
    let common = common(&config)?.with_clear(config.clear && !command.no_clear);
    let mut bench = Stat::new(common, config.objects, config.versions);
    let cleanup = config.cleanup && !command.no_cleanup;

    let cancel = CancellationToken::new();
    tokio::spawn(handle_signals(cancel.clone()));

    let bar = ProgressBar::new(1000)
        .with_style(ProgressStyle::with_template(
            "{msg} {wide_bar} {percent}% {elapsed}",
        )?)
        .with_message("Uploading objects:");
    bar.enable_steady_tick(Duration::from_millis(100));

    let progress = bench.common().progress();
    let ticker = tokio::spawn({
        let bar = bar.clone();
        async move {
            while !progress.is_finished() {
                bar.set_position((progress.get() * 1000.0) as u64);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            bar.set_style(ProgressStyle::default_spinner());
            bar.set_message("Running benchmark:");
            bar.reset_elapsed();
        }
    });

    let result = benchmark::run(&mut bench, config.duration, cleanup, &cancel).await;
    ticker.abort();
    bar.finish_and_clear();
    let outcome = result?;

    report::print_summary("PREPARE", &outcome.prepare_operations);
    report::print_summary("STAT", &outcome.operations);
    if let Some(summary) = &outcome.cleanup {
        report::print_cleanup(summary);
    }

    if let Some(path) = &config.oplog {
        report::write_oplog(path, &outcome.operations)
            .with_context(|| format!("failed to write operation log to {}", path.display()))?;
        tracing::info!(path = %path.display(), "operation log written");
    }

    Ok(())
}

fn common(config: &Config) -> Result<Common> {
    let mut generator = ObjectGenerator::builder()
        .sizes(config.object_size.into())
        .content_type(config.content_type.as_str());
    if let Some(prefix) = &config.prefix {
        generator = generator.prefix(prefix.as_str());
    }
    if let Some(seed) = config.seed {
        generator = generator.seed(seed);
    }

    let clients = clients(&config.storage)?;
    let mut common = Common::new(config.bucket.as_str(), clients, generator.build()?)
        .with_concurrency(config.concurrency);

    if let Some(rate_limit) = config.rate_limit {
        common = common.with_rate_limit(RateLimiter::new(rate_limit.rps, rate_limit.burst));
    }
    if config.autoterm.enabled {
        common = common.with_auto_term(AutoTerm {
            threshold: config.autoterm.threshold,
            duration: config.autoterm.duration,
        });
    }

    Ok(common)
}

fn clients(storage: &Storage) -> Result<ClientPool> {
    match storage {
        Storage::Memory { latency } => {
            let client = InMemoryClient::new("memory").with_latency(latency.unwrap_or_default());
            Ok(ClientPool::single(client))
        }
        Storage::S3Compatible {
            endpoints,
            token,
            request_timeout,
        } => {
            let clients = endpoints
                .iter()
                .map(|endpoint| {
                    let mut builder = S3Client::builder(endpoint.as_str());
                    if let Some(token) = token {
                        builder = builder.token(token.expose_secret().clone());
                    }
                    if let Some(timeout) = request_timeout {
                        builder = builder.request_timeout(*timeout);
                    }
                    Ok(Arc::new(builder.build()?) as BoxedClient)
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(ClientPool::new(clients)?)
        }
    }
}

/// Cancels the run on the first interrupt and exits on the second.
async fn handle_signals(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::warn!("interrupted, stopping benchmark");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::error!("interrupted again, exiting");
        std::process::exit(130);
    }
}
