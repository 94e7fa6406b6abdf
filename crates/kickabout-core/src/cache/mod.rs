//! Caching layer for network reads.
//!
//! `RequestCache` fronts every backend read with a TTL cache that
//! deduplicates concurrent requests per key, retries transient failures
//! with exponential backoff, and degrades to stale data when the network
//! stays down.

pub mod request;

pub use request::{request_key, FetchOptions, RequestCache, RetryPolicy};
