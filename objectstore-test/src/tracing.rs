//! Log capture for tests.

use tracing_subscriber::EnvFilter;

/// Crates whose logs are shown in full. Everything else is limited to errors.
const CRATE_NAMES: &[&str] = &["objectstore_bench", "objectstore_test"];

/// Initialize the logger for testing.
///
/// Logs go to the output captured by the Rust test runner, so they only show up for failing
/// tests or with `--nocapture`. Benchmark crates log at `DEBUG`, which covers per-object failures
/// without the per-request spans of the HTTP client. Setting `RUST_LOG` replaces these defaults.
///
/// Calling this more than once is harmless.
///
/// # Example
///
/// ```
/// objectstore_test::tracing::init();
/// ```
pub fn init() {
    let env_filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => EnvFilter::new(value),
        Err(_) => CRATE_NAMES.iter().fold(EnvFilter::new("ERROR"), |filter, name| {
            match format!("{name}=DEBUG").parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(_) => filter,
            }
        }),
    };

    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}
