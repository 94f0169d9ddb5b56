//! Configuration for the benchmark.
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `OSB__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! Environment variables use double underscores (`__`) to denote nested structures. For example,
//! `OSB__STORAGE__TYPE=s3compatible` selects the storage client and
//! `OSB__RATE_LIMIT__RPS=100` limits the request rate.
//!
//! The same configuration in YAML:
//!
//! ```yaml
//! storage:
//!   type: s3compatible
//!   endpoints:
//!     - http://localhost:9000
//! rate_limit:
//!   rps: 100
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use bytesize::ByteSize;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::benchmark::MAX_CONCURRENCY;
use crate::generator::SizeDistribution;

const ENV_PREFIX: &str = "OSB__";

/// Newtype around `String` holding credentials. Use with [`secrecy::SecretBox`], which redacts
/// it in debug output and wipes it on drop.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Returns the secret value.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret(value.to_owned())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for Secret {}
impl SerializableSecret for Secret {}
impl Zeroize for Secret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// The storage service under test.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Storage {
    /// An in-process store. Useful for dry runs of a configuration.
    Memory {
        /// Artificial latency added to every call.
        #[serde(default, with = "humantime_serde")]
        latency: Option<Duration>,
    },

    /// One or more S3-compatible HTTP endpoints serving the same data.
    S3Compatible {
        /// Base URLs of all endpoints. Requests are spread over them.
        endpoints: Vec<String>,
        /// Bearer token sent with every request.
        #[serde(default)]
        token: Option<SecretBox<Secret>>,
        /// Aborts requests that take longer than this.
        #[serde(default, with = "humantime_serde")]
        request_timeout: Option<Duration>,
    },
}

/// Distribution of the sizes of uploaded objects.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "distribution", rename_all = "lowercase")]
pub enum ObjectSize {
    /// Every object has the same size.
    Fixed {
        /// The size of every object.
        size: ByteSize,
    },
    /// Many small objects with a long tail of larger ones.
    LogNormal {
        /// The median object size.
        p50: ByteSize,
        /// The 99th percentile of object sizes.
        p99: ByteSize,
    },
}

impl From<ObjectSize> for SizeDistribution {
    fn from(value: ObjectSize) -> Self {
        match value {
            ObjectSize::Fixed { size } => SizeDistribution::Fixed(size.as_u64()),
            ObjectSize::LogNormal { p50, p99 } => SizeDistribution::LogNormal {
                p50: p50.as_u64(),
                p99: p99.as_u64(),
            },
        }
    }
}

/// Global limit on the rate of requests across all workers.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct RateLimit {
    /// Sustained requests per second.
    pub rps: f64,
    /// Requests that may be issued at once after a pause.
    #[serde(default)]
    pub burst: u32,
}

/// Ends the measurement early once throughput is stable.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AutoTerm {
    /// Whether auto-termination is enabled.
    pub enabled: bool,
    /// Minimum duration over which throughput must be stable.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Maximum relative deviation that still counts as stable, e.g. `0.075` for 7.5%.
    pub threshold: f64,
}

impl Default for AutoTerm {
    fn default() -> Self {
        Self {
            enabled: false,
            duration: Duration::from_secs(10),
            threshold: 0.075,
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr. The `RUST_LOG` environment variable takes precedence over
/// the configured level.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct for the benchmark.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The storage service under test.
    ///
    /// # Default
    ///
    /// An in-memory store.
    pub storage: Storage,

    /// The bucket that objects are uploaded to. Created if missing.
    pub bucket: String,

    /// Number of concurrent workers.
    pub concurrency: usize,

    /// Duration of the measurement.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Number of objects to upload before measuring.
    pub objects: usize,

    /// Number of versions to upload per object. Enables bucket versioning if greater than 1.
    pub versions: usize,

    /// Sizes of uploaded objects.
    pub object_size: ObjectSize,

    /// Fixed prefix for all objects instead of a random prefix per worker.
    pub prefix: Option<String>,

    /// Content type announced on upload.
    pub content_type: String,

    /// Seed for object names and payloads. Random if not set.
    pub seed: Option<u64>,

    /// Global request rate limit. Unlimited if not set.
    pub rate_limit: Option<RateLimit>,

    /// Auto-termination of the measurement.
    pub autoterm: AutoTerm,

    /// Whether to delete objects already stored in the bucket before uploading.
    pub clear: bool,

    /// Whether to delete all uploaded objects at the end.
    pub cleanup: bool,

    /// Writes all measured operations to this file as JSON lines.
    ///
    /// The file is compressed with zstd if the path ends in `.zst`.
    pub oplog: Option<PathBuf>,

    /// Logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: Storage::Memory { latency: None },
            bucket: "objectstore-bench".into(),
            concurrency: 20,
            duration: Duration::from_secs(5 * 60),
            objects: 2500,
            versions: 1,
            object_size: ObjectSize::Fixed {
                size: ByteSize::kib(1),
            },
            prefix: None,
            content_type: "application/octet-stream".into(),
            seed: None,
            rate_limit: None,
            autoterm: AutoTerm::default(),
            clear: true,
            cleanup: true,
            oplog: None,
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from defaults, an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            bail!("bucket must not be empty");
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            bail!("concurrency must be between 1 and {MAX_CONCURRENCY}");
        }
        if self.versions == 0 {
            bail!("versions must be at least 1");
        }
        if let Storage::S3Compatible { endpoints, .. } = &self.storage {
            if endpoints.is_empty() {
                bail!("at least one storage endpoint is required");
            }
        }
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.rps.is_nan() || rate_limit.rps <= 0.0 {
                bail!("rate limit must be positive, got {}", rate_limit.rps);
            }
        }
        if self.autoterm.enabled && self.autoterm.duration.is_zero() {
            bail!("auto-termination duration must not be zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();

            assert!(matches!(config.storage, Storage::Memory { latency: None }));
            assert_eq!(config.concurrency, 20);
            assert_eq!(config.versions, 1);
            assert!(config.clear);
            assert!(config.cleanup);
            assert!(config.rate_limit.is_none());
            assert_eq!(config.logging.level, LevelFilter::INFO);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("OSB__STORAGE__TYPE", "s3compatible");
            jail.set_env("OSB__STORAGE__ENDPOINTS", r#"["http://a:9000","http://b:9000"]"#);
            jail.set_env("OSB__STORAGE__TOKEN", "secret");
            jail.set_env("OSB__STORAGE__REQUEST_TIMEOUT", "5s");
            jail.set_env("OSB__DURATION", "30s");
            jail.set_env("OSB__VERSIONS", "3");
            jail.set_env("OSB__RATE_LIMIT__RPS", "12.5");
            jail.set_env("OSB__AUTOTERM__ENABLED", "true");
            jail.set_env("OSB__LOGGING__LEVEL", "debug");
            jail.set_env("OSB__LOGGING__FORMAT", "json");

            let config = Config::load(None).unwrap();

            let Storage::S3Compatible {
                endpoints,
                token,
                request_timeout,
            } = &dbg!(&config).storage
            else {
                panic!("expected s3 storage");
            };
            assert_eq!(endpoints, &["http://a:9000", "http://b:9000"]);
            let token = token.as_ref().map(|token| token.expose_secret().as_str());
            assert_eq!(token, Some("secret"));
            assert_eq!(*request_timeout, Some(Duration::from_secs(5)));
            assert!(!format!("{config:?}").contains("secret"));

            assert_eq!(config.duration, Duration::from_secs(30));
            assert_eq!(config.versions, 3);
            assert_eq!(config.rate_limit, Some(RateLimit { rps: 12.5, burst: 0 }));
            assert!(config.autoterm.enabled);
            assert_eq!(config.autoterm.duration, Duration::from_secs(10));
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            bucket: measurements
            concurrency: 4
            objects: 100
            object_size:
                distribution: lognormal
                p50: 16KiB
                p99: 1MiB
            prefix: fixed
            oplog: ops.jsonl.zst
            clear: false
            cleanup: false
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.bucket, "measurements");
            assert_eq!(config.concurrency, 4);
            assert_eq!(config.objects, 100);
            assert_eq!(
                SizeDistribution::from(config.object_size),
                SizeDistribution::LogNormal {
                    p50: 16 * 1024,
                    p99: 1024 * 1024
                }
            );
            assert_eq!(config.prefix.as_deref(), Some("fixed"));
            assert_eq!(config.oplog.as_deref(), Some(Path::new("ops.jsonl.zst")));
            assert!(!config.clear);
            assert!(!config.cleanup);

            Ok(())
        });
    }

    #[test]
    fn configured_with_env_and_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            concurrency: 4
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("OSB__CONCURRENCY", "8");

            let config = Config::load(Some(tempfile.path())).unwrap();
            // Env should overwrite the yaml config
            assert_eq!(config.concurrency, 8);

            Ok(())
        });
    }

    #[test]
    fn rejects_invalid_values() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("OSB__VERSIONS", "0");
            assert!(Config::load(None).is_err());
            jail.set_env("OSB__VERSIONS", "1");

            jail.set_env("OSB__CONCURRENCY", "70000");
            assert!(Config::load(None).is_err());
            jail.set_env("OSB__CONCURRENCY", "65536");
            assert!(Config::load(None).is_ok());

            jail.set_env("OSB__STORAGE__TYPE", "s3compatible");
            jail.set_env("OSB__STORAGE__ENDPOINTS", "[]");
            assert!(Config::load(None).is_err());

            Ok(())
        });
    }
}
