//! REST client for the kickabout backend.
//!
//! The session layer has exactly one backend collaborator: the
//! current-user endpoint, reached with the bearer token. It is exposed as
//! the `UserApi` trait so tests can substitute scripted implementations;
//! `ApiClient` is the production reqwest implementation.

pub mod client;

pub use client::{ApiClient, UserApi, DEFAULT_BASE_URL};
