//! Bearer token validity and redundant persistence.
//!
//! Tokens are opaque JWT-style strings whose payload segment carries an
//! `exp` unix-seconds claim. Decoding is strictly best-effort: any
//! malformed input reads as "invalid", never as an error. The store keeps
//! three copies of the token so no single storage failure or corrupted
//! write can log the user out.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::storage::{keys, SharedStorage};

/// Redundant token locations in priority order.
const TOKEN_LOCATIONS: [&str; 3] = [
    keys::TOKEN_PRIMARY,
    keys::TOKEN_BACKUP,
    keys::TOKEN_RECOVERY,
];

#[derive(Debug, Deserialize)]
struct TokenClaims {
    exp: Option<i64>,
}

/// Decode the expiry claim embedded in a bearer token.
pub fn expiry(token: &str) -> Option<DateTime<Utc>> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return None;
    }
    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .ok()?;
    let claims: TokenClaims = serde_json::from_slice(&payload).ok()?;
    let exp = claims.exp?;
    Utc.timestamp_opt(exp, 0).single()
}

/// Whether a token is well-formed and unexpired. Never panics; a missing
/// or undecodable expiry claim counts as invalid.
pub fn is_valid(token: &str) -> bool {
    match expiry(token) {
        Some(exp) => exp > Utc::now(),
        None => false,
    }
}

/// Result of a three-way consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub consistent: bool,
    pub token: Option<String>,
    pub repaired: bool,
}

/// Redundant token storage with repair-on-read.
pub struct TokenStore {
    storage: SharedStorage,
}

impl TokenStore {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    /// Write the token to every redundant location. Each write is
    /// independent; a failed location is logged and skipped, and the token
    /// survives as long as one write lands.
    pub fn save(&self, token: &str) {
        for key in TOKEN_LOCATIONS {
            if let Err(e) = self.storage.set(key, token) {
                warn!(key, error = %e, "Failed to write token copy");
            }
        }
    }

    /// First valid copy in priority order. A hit found below the primary
    /// location is written back to every higher-priority location that
    /// lost or corrupted its copy.
    pub fn read(&self) -> Option<String> {
        for (index, key) in TOKEN_LOCATIONS.iter().enumerate() {
            let Some(value) = self.storage.get(key) else {
                continue;
            };
            if !is_valid(&value) {
                debug!(key, "Skipping invalid token copy");
                continue;
            }
            if index > 0 {
                self.repair(&value, index);
            }
            return Some(value);
        }
        None
    }

    fn repair(&self, token: &str, found_at: usize) {
        for key in &TOKEN_LOCATIONS[..found_at] {
            warn!(key, "Restoring token location from lower-priority copy");
            if let Err(e) = self.storage.set(key, token) {
                warn!(key, error = %e, "Token repair write failed");
            }
        }
    }

    /// Compare all three locations. Divergent copies are rewritten to the
    /// first valid one in priority order.
    pub fn verify_consistency(&self) -> ConsistencyReport {
        let copies: Vec<Option<String>> = TOKEN_LOCATIONS
            .iter()
            .map(|key| self.storage.get(key))
            .collect();

        let winner = copies
            .iter()
            .flatten()
            .find(|value| is_valid(value))
            .cloned();

        if copies.iter().all(|copy| *copy == copies[0]) {
            return ConsistencyReport {
                consistent: true,
                token: winner,
                repaired: false,
            };
        }

        if let Some(ref token) = winner {
            warn!("Token locations diverged, rewriting all copies");
            for key in TOKEN_LOCATIONS {
                if let Err(e) = self.storage.set(key, token) {
                    warn!(key, error = %e, "Consistency repair write failed");
                }
            }
        }

        ConsistencyReport {
            consistent: false,
            token: winner.clone(),
            repaired: winner.is_some(),
        }
    }

    /// Best-effort removal of every location.
    pub fn clear(&self) {
        for key in TOKEN_LOCATIONS {
            if let Err(e) = self.storage.remove(key) {
                warn!(key, error = %e, "Failed to remove token copy");
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn token_with_ttl(seconds: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "sub": "u_4812",
        "exp": (Utc::now() + chrono::Duration::seconds(seconds)).timestamp(),
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}
