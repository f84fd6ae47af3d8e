//! Token validation against the external identity service.
//!
//! The messaging core only ever asks one question, "who does this token
//! belong to?", through [`IdentityService::validate`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sprout_config::IdentityConfig;
use thiserror::Error;
use tracing::{debug, warn};

const VALIDATE_PATH: &str = "/auth/validate";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
    #[error("identity service returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: i64,
    pub display_name: String,
    pub role: String,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub success: bool,
    pub identity: Option<Identity>,
}

impl AuthResult {
    pub fn rejected() -> Self {
        Self {
            success: false,
            identity: None,
        }
    }

    pub fn accepted(identity: Identity) -> Self {
        Self {
            success: true,
            identity: Some(identity),
        }
    }

    /// The identity, but only when validation succeeded.
    pub fn into_identity(self) -> Option<Identity> {
        if self.success {
            self.identity
        } else {
            None
        }
    }
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthResult, IdentityError>;
}

#[async_trait]
impl<T: IdentityService + ?Sized> IdentityService for Arc<T> {
    async fn validate(&self, token: &str) -> Result<AuthResult, IdentityError> {
        (**self).validate(token).await
    }
}

#[derive(Deserialize)]
struct ValidateResponse {
    success: bool,
    #[serde(default)]
    user: Option<ValidatedUser>,
}

#[derive(Deserialize)]
struct ValidatedUser {
    id: i64,
    #[serde(default, alias = "display_name")]
    username: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    is_verified: bool,
}

impl From<ValidatedUser> for Identity {
    fn from(user: ValidatedUser) -> Self {
        Self {
            user_id: user.id,
            display_name: user.username.unwrap_or_default(),
            role: user.role.unwrap_or_else(|| "user".to_string()),
            verified: user.is_verified,
        }
    }
}

/// Validates tokens with `POST {base_url}/auth/validate`.
#[derive(Clone)]
pub struct HttpIdentityService {
    http: reqwest::Client,
    validate_url: String,
}

impl HttpIdentityService {
    pub fn new(config: &IdentityConfig) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder()
            .user_agent("sprout-messaging")
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            validate_url: format!("{}{}", config.base_url.trim_end_matches('/'), VALIDATE_PATH),
        })
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn validate(&self, token: &str) -> Result<AuthResult, IdentityError> {
        let response = self
            .http
            .post(&self.validate_url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "identity service request failed");
                IdentityError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            debug!(%status, "identity service rejected token");
            return Ok(AuthResult::rejected());
        }
        if !status.is_success() {
            // A 4xx carrying `success: false` is still a verdict on the token.
            if status.is_client_error() {
                if let Ok(ValidateResponse { success: false, .. }) = response.json().await {
                    debug!(%status, "identity service rejected token");
                    return Ok(AuthResult::rejected());
                }
            }
            warn!(%status, "identity service returned error status");
            return Err(IdentityError::Unavailable(format!(
                "identity service returned {status}"
            )));
        }

        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::InvalidResponse(e.to_string()))?;

        if !body.success {
            debug!("identity service rejected token");
            return Ok(AuthResult::rejected());
        }

        let user = body.user.ok_or_else(|| {
            IdentityError::InvalidResponse("successful validation without user".to_string())
        })?;

        debug!(user_id = user.id, "identity service accepted token");
        Ok(AuthResult::accepted(user.into()))
    }
}

/// Fixed token table, for tests and local runs without an identity service.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityService {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, token: impl Into<String>, user_id: i64, display_name: &str) -> Self {
        self.tokens.insert(
            token.into(),
            Identity {
                user_id,
                display_name: display_name.to_string(),
                role: "user".to_string(),
                verified: true,
            },
        );
        self
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn validate(&self, token: &str) -> Result<AuthResult, IdentityError> {
        Ok(match self.tokens.get(token) {
            Some(identity) => AuthResult::accepted(identity.clone()),
            None => AuthResult::rejected(),
        })
    }
}
