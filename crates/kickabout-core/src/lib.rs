//! kickabout-core - session management and resilient data access for the
//! kickabout client.
//!
//! Kickabout lets people discover and organize informal sports matches.
//! This crate is the client's foundation layer, everything between the UI
//! and the network:
//!
//! - [`storage`]: shared key/value storage with cross-context change
//!   notifications
//! - [`auth`]: redundant token persistence ([`TokenStore`]) and the
//!   login-state machine ([`SessionController`])
//! - [`cache`]: TTL request cache with deduplication, retry/backoff and
//!   stale fallback ([`RequestCache`])
//! - [`api`]: the reqwest client for the current-user endpoint
//!
//! The UI layers (listings, maps, forms) live in sibling crates and only
//! consume the session snapshot published here.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod storage;

pub use api::{ApiClient, UserApi};
pub use auth::{SessionController, SessionOptions, SessionPhase, SessionSnapshot, TokenStore};
pub use cache::{FetchOptions, RequestCache};
pub use config::Config;
pub use error::{FetchError, StorageError};
pub use models::SessionUser;
pub use storage::{SharedStorage, StorageBackend, StorageEvent};
