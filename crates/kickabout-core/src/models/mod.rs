//! Domain models owned by the session layer.
//!
//! Only the authenticated profile snapshot lives here; match, venue and
//! booking entities belong to the feature layers built on top of this
//! crate.

pub mod user;

pub use user::SessionUser;
