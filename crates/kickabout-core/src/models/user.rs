use serde::{Deserialize, Serialize};
use tracing::debug;

/// Snapshot of the authenticated profile, used for optimistic rendering.
///
/// Replaced wholesale on every successful revalidation; fields are never
/// merged between versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    #[serde(rename = "userId")]
    pub user_id: i64,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "avatarUrl", default)]
    pub avatar_url: Option<String>,
    #[serde(rename = "homeCity", default)]
    pub home_city: Option<String>,
    /// Sport tags the user plays ("football", "padel", "basketball").
    #[serde(default)]
    pub sports: Vec<String>,
}

impl SessionUser {
    /// Parse a stored snapshot. Malformed data is logged and discarded,
    /// never an error.
    pub fn from_json(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(user) => Some(user),
            Err(e) => {
                debug!(error = %e, "Discarding unparsable user snapshot");
                None
            }
        }
    }

    pub fn plays(&self, sport: &str) -> bool {
        self.sports.iter().any(|s| s.eq_ignore_ascii_case(sport))
    }
}
