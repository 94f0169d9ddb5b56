//! A load generator measuring the performance of object storage services.
//!
//! A benchmark runs in three phases. It first uploads a set of objects and records them in an
//! inventory, then measures a workload against these objects with a fixed number of concurrent
//! workers, and finally deletes everything it uploaded. Every call against the storage service
//! during the measurement is recorded as an [`Operation`], from which throughput and latency
//! are derived.
//!
//! The [`Stat`](benchmark::Stat) benchmark measures metadata lookups of existing objects. Storage
//! services are accessed through the [`StorageClient`](client::StorageClient) trait, with an
//! S3-compatible HTTP client and an in-memory store available.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod benchmark;
pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod gate;
pub mod generator;
pub mod object;
pub mod observability;
pub mod operation;
pub mod rate_limit;
pub mod report;

pub use crate::benchmark::{Benchmark, Common, RunOutcome, Stat, run};
pub use crate::error::{Error, Result};
pub use crate::operation::{OpType, Operation, Operations};
