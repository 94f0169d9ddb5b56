//! Logging setup for the command line tool.

use std::env;
use std::io::IsTerminal;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::config::{LogFormat, Logging};

/// Installs the global tracing subscriber writing to stderr.
pub fn init_tracing(config: &Logging) {
    let (level, env_filter) = parse_rust_log(config.level);

    let format = match config.format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let layer = match format {
        LogFormat::Json => layer.json().with_filter(level).boxed(),
        LogFormat::Simplified => layer.with_ansi(false).with_filter(level).boxed(),
        LogFormat::Pretty | LogFormat::Auto => layer.compact().with_filter(level).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();
}

/// Resolves the effective level and per-module filters.
///
/// A plain level in `RUST_LOG` replaces the configured level. Any other value is used literally
/// as a filter directive.
pub fn parse_rust_log(configured: LevelFilter) -> (LevelFilter, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<Level>() {
            Ok(level) => LevelFilter::from(level),
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => configured,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        hyper=WARN,\
        reqwest=WARN,\
        objectstore_bench=TRACE,\
        ",
    );

    (level, env_filter)
}
