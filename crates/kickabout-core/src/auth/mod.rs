//! Authentication module: token persistence and session orchestration.
//!
//! `TokenStore` keeps the bearer token alive across storage failures by
//! writing it to three redundant locations; `SessionController` owns the
//! login-state machine, cross-context synchronization and background
//! revalidation built on top of it.

pub mod session;
pub mod token;

pub use session::{SessionController, SessionOptions, SessionPhase, SessionSnapshot};
pub use token::{ConsistencyReport, TokenStore};
