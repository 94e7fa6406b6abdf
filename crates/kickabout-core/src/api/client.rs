use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::debug;

use crate::cache::request_key;
use crate::error::FetchError;
use crate::models::SessionUser;

/// Base URL for the kickabout API.
pub const DEFAULT_BASE_URL: &str = "https://api.kickabout.app";

/// HTTP request timeout in seconds.
/// 30s allows for slow responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// The one backend collaborator of the session layer: resolve a bearer
/// token to the authoritative profile.
#[async_trait]
pub trait UserApi: Send + Sync {
    async fn fetch_current_user(&self, token: &str) -> Result<SessionUser, FetchError>;

    /// Cache key under which results are stored, following the
    /// `METHOD:URL:bodyFingerprint` convention.
    fn cache_key(&self) -> String;
}

/// API client for kickabout.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn with_default_base_url() -> Result<Self, FetchError> {
        Self::new(DEFAULT_BASE_URL)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn current_user_url(&self) -> String {
        format!("{}/v1/users/me", self.base_url)
    }
}

#[async_trait]
impl UserApi for ApiClient {
    async fn fetch_current_user(&self, token: &str) -> Result<SessionUser, FetchError> {
        let url = self.current_user_url();

        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status.as_u16(), &body));
        }

        debug!(url = %url, "Current user response received");
        let user = response.json::<SessionUser>().await?;
        Ok(user)
    }

    fn cache_key(&self) -> String {
        request_key("GET", &self.current_user_url(), None)
    }
}
