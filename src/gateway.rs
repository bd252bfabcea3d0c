use std::env;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::token::UserProfile;

/// Environment variable naming the authentication service base URL.
const AUTH_BASE_URL_ENV: &str = "AUTH_BASE_URL";

/// Successful login response. The server does not report an expiry here;
/// the orchestrator stamps one itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

/// Successful refresh response. The refresh token is not rotated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub token_type: String,
}

/// Thin boundary around the remote authentication service.
///
/// Each operation is a single request/response round trip with no retries;
/// retry policy belongs to the orchestrator.
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Exchange credentials for a token pair.
    async fn login(&self, username: &str, password: &str) -> SessionResult<LoginResponse>;

    /// Exchange a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> SessionResult<RefreshResponse>;

    /// Validate an access token and fetch the profile it belongs to.
    async fn verify(&self, access_token: &str) -> SessionResult<UserProfile>;

    /// End the server-side session. Best-effort: a 401 from an already-dead
    /// session counts as success.
    async fn logout(&self, access_token: &str) -> SessionResult<()>;
}

/// [`AuthGateway`] over HTTP, speaking to `POST /login`, `POST /refresh`,
/// `GET /me` and `POST /logout` under a base URL.
pub struct HttpAuthGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Build a gateway from the `AUTH_BASE_URL` environment variable.
    pub fn from_env() -> SessionResult<Self> {
        match env::var(AUTH_BASE_URL_ENV) {
            Ok(url) if !url.is_empty() => Ok(Self::new(url)),
            _ => Err(SessionError::Network(format!(
                "{} environment variable is not set",
                AUTH_BASE_URL_ENV
            ))),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl AuthGateway for HttpAuthGateway {
    async fn login(&self, username: &str, password: &str) -> SessionResult<LoginResponse> {
        debug!(username, "login request");
        let response = self
            .client
            .post(self.url("/login"))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            debug!(username, status = %status, "login rejected");
            return Err(SessionError::InvalidCredentials);
        }
        if !status.is_success() {
            return Err(SessionError::Network(format!(
                "login returned status {}",
                status
            )));
        }
        Ok(response.json::<LoginResponse>().await?)
    }

    async fn refresh(&self, refresh_token: &str) -> SessionResult<RefreshResponse> {
        debug!("token refresh request");
        let response = self
            .client
            .post(self.url("/refresh"))
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            debug!(status = %status, "refresh token rejected");
            return Err(SessionError::InvalidRefreshToken);
        }
        if !status.is_success() {
            return Err(SessionError::Network(format!(
                "refresh returned status {}",
                status
            )));
        }
        Ok(response.json::<RefreshResponse>().await?)
    }

    async fn verify(&self, access_token: &str) -> SessionResult<UserProfile> {
        let response = self
            .client
            .get(self.url("/me"))
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            debug!("access token rejected by verify");
            return Err(SessionError::Unauthorized);
        }
        if !status.is_success() {
            return Err(SessionError::Network(format!(
                "verify returned status {}",
                status
            )));
        }
        Ok(response.json::<UserProfile>().await?)
    }

    async fn logout(&self, access_token: &str) -> SessionResult<()> {
        let response = self
            .client
            .post(self.url("/logout"))
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        // The goal is a dead server-side session; an expired token already
        // satisfies that.
        if status.is_success() || status == StatusCode::UNAUTHORIZED {
            return Ok(());
        }
        warn!(status = %status, "logout returned unexpected status");
        Err(SessionError::Network(format!(
            "logout returned status {}",
            status
        )))
    }
}
