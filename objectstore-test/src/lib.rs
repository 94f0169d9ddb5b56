//! Test utilities for the objectstore benchmark.
//!
//! This crate provides utilities to facilitate testing of the benchmark against a storage
//! service. See the modules for all available utilities.

pub mod server;
pub mod tracing;
