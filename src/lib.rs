//! tallyd: distributed metrics collection.
//!
//! The agent side aggregates keyed observations into per-second buckets,
//! partitioned across resolution and hash shards, and ships compressed
//! buckets forward. The aggregator side merges contributor buckets, applies
//! adaptive sampling against a per-second insert budget, and encodes rows
//! for the downstream column store.

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod data_model;
pub mod env;
pub mod format;
pub mod rowbinary;
