//! Synthetic objects that are uploaded to the storage service.
//!
//! An [`ObjectGenerator`] is configured once per benchmark and hands out one [`ObjectSource`] per
//! worker. Every source uploads below its own prefix, which keeps the keys of concurrent workers
//! apart and allows cleanup to be scoped to the prefixes that were actually used.
//!
//! Object sizes are either fixed or follow a *LogNormal* distribution, defined by the `p50` and
//! `p99` of object sizes. This models the real-world distribution of many small objects with a
//! long tail of larger ones.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{io, task};

use rand::distr::{Alphanumeric, SampleString};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{Error, Result};
use crate::object::ObjectInfo;

/// Length of the random part of object names.
const NAME_LEN: usize = 16;
/// Length of random per-source prefixes.
const PREFIX_LEN: usize = 8;

/// Distribution of object sizes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SizeDistribution {
    /// Every object has exactly this size.
    Fixed(u64),
    /// Sizes follow a LogNormal distribution with the given percentiles.
    LogNormal {
        /// The median object size.
        p50: u64,
        /// The 99th percentile of object sizes.
        p99: u64,
    },
}

#[derive(Clone, Copy, Debug)]
enum Sizes {
    Fixed(u64),
    LogNormal(LogNormal<f64>),
}

impl Sizes {
    fn sample(&self, rng: &mut SmallRng) -> u64 {
        match self {
            Sizes::Fixed(size) => *size,
            Sizes::LogNormal(distribution) => distribution.sample(rng) as u64,
        }
    }
}

/// A builder for creating an [`ObjectGenerator`].
#[derive(Debug)]
pub struct GeneratorBuilder {
    seed: u64,
    prefix: Option<String>,
    sizes: SizeDistribution,
    content_type: String,
}

impl GeneratorBuilder {
    /// Uses a fixed prefix for all sources instead of a random one per source.
    ///
    /// An empty prefix places all objects at the top level of the bucket.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Distribution of object sizes.
    pub fn sizes(mut self, sizes: SizeDistribution) -> Self {
        self.sizes = sizes;
        self
    }

    /// The content type announced for all objects.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Seeds all randomness of the generator, making names and payloads reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Creates the generator instance.
    pub fn build(self) -> Result<ObjectGenerator> {
        let sizes = match self.sizes {
            SizeDistribution::Fixed(size) => Sizes::Fixed(size),
            SizeDistribution::LogNormal { p50, p99 } => {
                if p50 == 0 || p99 < p50 {
                    return Err(Error::InvalidConfig(format!(
                        "invalid size distribution: p50 {p50}, p99 {p99}"
                    )));
                }

                // Inspired by <https://stats.stackexchange.com/a/649432>
                let mu = (p50 as f64).ln();
                let sigma = ((p99 as f64).ln() - mu) / 2.3263;
                let distribution = LogNormal::new(mu, sigma).map_err(|err| {
                    Error::InvalidConfig(format!("invalid size distribution: {err}"))
                })?;
                Sizes::LogNormal(distribution)
            }
        };

        Ok(ObjectGenerator {
            seed: self.seed,
            prefix: self.prefix,
            sizes,
            content_type: self.content_type,
            sources: AtomicU64::new(0),
        })
    }
}

/// Hands out [`ObjectSource`]s, one per worker.
#[derive(Debug)]
pub struct ObjectGenerator {
    seed: u64,
    prefix: Option<String>,
    sizes: Sizes,
    content_type: String,
    sources: AtomicU64,
}

impl ObjectGenerator {
    /// Constructs a new generator builder with 1 KiB objects and random prefixes.
    pub fn builder() -> GeneratorBuilder {
        GeneratorBuilder {
            seed: rand::random(),
            prefix: None,
            sizes: SizeDistribution::Fixed(1024),
            content_type: "application/octet-stream".into(),
        }
    }

    /// Creates a new source with its own prefix and random state.
    pub fn source(&self) -> ObjectSource {
        let index = self.sources.fetch_add(1, Ordering::Relaxed);
        let mut rng = SmallRng::seed_from_u64(self.seed.wrapping_add(index));

        let prefix = match &self.prefix {
            Some(prefix) => prefix.clone(),
            None => Alphanumeric.sample_string(&mut rng, PREFIX_LEN),
        };

        ObjectSource {
            prefix,
            rng,
            sizes: self.sizes,
            content_type: self.content_type.clone(),
        }
    }
}

/// Produces objects below a single prefix.
#[derive(Debug)]
pub struct ObjectSource {
    prefix: String,
    rng: SmallRng,
    sizes: Sizes,
    content_type: String,
}

impl ObjectSource {
    /// The prefix of all objects from this source.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Generates a new object with a fresh name and payload.
    pub fn next_object(&mut self) -> Object {
        let random = Alphanumeric.sample_string(&mut self.rng, NAME_LEN);
        let name = if self.prefix.is_empty() {
            random
        } else {
            format!("{}/{random}", self.prefix)
        };

        self.next_version(name)
    }

    /// Generates a fresh payload for an object with the given name.
    pub fn next_version(&mut self, name: String) -> Object {
        let size = self.sizes.sample(&mut self.rng);
        let payload = Payload {
            len: size,
            rng: SmallRng::seed_from_u64(self.rng.next_u64()),
        };

        Object {
            name,
            prefix: self.prefix.clone(),
            size,
            content_type: self.content_type.clone(),
            payload,
        }
    }
}

/// An object that has not been uploaded yet.
#[derive(Debug)]
pub struct Object {
    /// The full key of the object.
    pub name: String,
    /// The prefix of the source that generated the object.
    pub prefix: String,
    /// The size of the payload in bytes.
    pub size: u64,
    /// The content type to announce on upload.
    pub content_type: String,
    /// The contents of the object.
    pub payload: Payload,
}

impl Object {
    /// Splits off the payload for uploading, keeping the descriptor.
    ///
    /// The returned [`ObjectInfo`] does not reference the payload, so uploaded contents are never
    /// retained in the inventory.
    pub fn into_parts(self) -> (ObjectInfo, Payload) {
        let info = ObjectInfo {
            name: self.name,
            prefix: self.prefix,
            size: self.size,
            content_type: self.content_type,
            version_id: None,
        };
        (info, self.payload)
    }
}

/// Randomized contents of an object.
///
/// Clone this instance to reuse it with deterministic contents across multiple reads.
#[derive(Debug, Clone)]
pub struct Payload {
    /// The remaining length of the payload in bytes.
    pub len: u64,
    /// The RNG used to fill the payload with random bytes.
    pub rng: SmallRng,
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len_to_fill = (buf.len() as u64).min(self.len) as usize;

        let fill_buf = &mut buf[..len_to_fill];
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        Ok(len_to_fill)
    }
}

impl AsyncRead for Payload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let len_to_fill = (buf.remaining() as u64).min(self.len) as usize;

        let fill_buf = buf.initialize_unfilled_to(len_to_fill);
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        buf.advance(len_to_fill);

        task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn lognormal_percentiles_work() {
        let generator = ObjectGenerator::builder()
            .seed(7)
            .sizes(SizeDistribution::LogNormal { p50: 100, p99: 1000 })
            .build()
            .unwrap();
        let mut source = generator.source();

        let mut sizes: Vec<_> = (0..1000).map(|_| source.next_object().size).collect();
        sizes.sort_unstable();

        let p50 = sizes[500];
        assert!((50..200).contains(&p50), "p50 was {p50}");
    }

    #[test]
    fn rejects_invalid_distribution() {
        let result = ObjectGenerator::builder()
            .sizes(SizeDistribution::LogNormal { p50: 1000, p99: 10 })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn sources_use_distinct_prefixes() {
        let generator = ObjectGenerator::builder().seed(1).build().unwrap();
        let mut a = generator.source();
        let mut b = generator.source();
        assert_ne!(a.prefix(), b.prefix());

        let object = a.next_object();
        assert!(object.name.starts_with(&format!("{}/", a.prefix())));
        assert_eq!(object.prefix, a.prefix());
        assert!(b.next_object().name.starts_with(b.prefix()));
    }

    #[test]
    fn empty_prefix_places_objects_at_top_level() {
        let generator = ObjectGenerator::builder().prefix("").build().unwrap();
        let object = generator.source().next_object();
        assert!(!object.name.contains('/'));
        assert_eq!(object.name.len(), NAME_LEN);
    }

    #[test]
    fn versions_keep_name_with_fresh_payload() {
        let generator = ObjectGenerator::builder()
            .sizes(SizeDistribution::Fixed(64))
            .build()
            .unwrap();
        let mut source = generator.source();
        let first = source.next_object();
        let second = source.next_version(first.name.clone());
        assert_eq!(first.name, second.name);

        let (_, mut p1) = first.into_parts();
        let (_, mut p2) = second.into_parts();
        let mut c1 = Vec::new();
        let mut c2 = Vec::new();
        p1.read_to_end(&mut c1).unwrap();
        p2.read_to_end(&mut c2).unwrap();
        assert_eq!(c1.len(), 64);
        assert_ne!(c1, c2);
    }
}
