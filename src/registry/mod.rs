//! Credential broker — short-lived container registry credentials
//!
//! Exchanges the service's cloud identity for a registry authorization token
//! and returns it in the shape a container runtime's credential helper
//! expects:
//!
//! ```json
//! {"Credentials":{"Username":"AWS","Password":"<token>"}}
//! ```
//!
//! Credentials are fetched fresh on every call and never cached.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{DispatchError, Result};

/// One authorization returned by the registry service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationData {
    /// Base64 of `user:password`
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub proxy_endpoint: Option<String>,
}

/// Registry authorization service
#[async_trait]
pub trait RegistryAuth: Send + Sync {
    /// Request authorization tokens for `registry_ids`
    async fn authorization_tokens(&self, registry_ids: &[String]) -> Result<Vec<AuthorizationData>>;

    /// Service name (for logging)
    fn name(&self) -> &str;
}

/// An ephemeral registry credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredential {
    pub username: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RegistryCredential {
    /// Whether the credential is no longer valid at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Decode the token into a `(user, password)` pair for docker-style logins
    pub fn basic_auth(&self) -> Result<(String, String)> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(self.token.trim())
            .map_err(|e| DispatchError::Registry(format!("token is not base64: {}", e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| DispatchError::Registry(format!("token is not UTF-8: {}", e)))?;
        let (user, password) = decoded.split_once(':').ok_or_else(|| {
            DispatchError::Registry("token is not a user:password pair".to_string())
        })?;
        Ok((user.to_string(), password.to_string()))
    }

    pub fn into_response(self) -> CredentialResponse {
        CredentialResponse {
            credentials: Credentials {
                username: self.username,
                password: self.token,
            },
        }
    }
}

/// Credential exchange response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CredentialResponse {
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Stateless broker; safe to call repeatedly and concurrently
pub struct CredentialBroker {
    auth: Arc<dyn RegistryAuth>,
    registry_ids: Vec<String>,
    username: String,
}

impl CredentialBroker {
    pub fn new(auth: Arc<dyn RegistryAuth>, registry_ids: Vec<String>, username: impl Into<String>) -> Self {
        Self {
            auth,
            registry_ids,
            username: username.into(),
        }
    }

    /// Fetch a fresh credential. Errors propagate; there is no local retry.
    pub async fn credential(&self) -> Result<RegistryCredential> {
        let data = self
            .auth
            .authorization_tokens(&self.registry_ids)
            .await?;

        let first = data.into_iter().next().ok_or_else(|| {
            DispatchError::Registry(format!(
                "{} returned no authorization data for {:?}",
                self.auth.name(),
                self.registry_ids
            ))
        })?;
        if first.token.is_empty() {
            return Err(DispatchError::Registry(format!(
                "{} returned an empty authorization token",
                self.auth.name()
            )));
        }

        tracing::debug!(
            auth = self.auth.name(),
            registries = self.registry_ids.len(),
            proxy_endpoint = first.proxy_endpoint.as_deref().unwrap_or("-"),
            "Obtained registry authorization"
        );

        Ok(RegistryCredential {
            username: self.username.clone(),
            token: first.token,
            expires_at: first.expires_at,
        })
    }

    /// Exchange for the credential-helper response body
    pub async fn exchange(&self) -> Result<CredentialResponse> {
        Ok(self.credential().await?.into_response())
    }
}

/// Registry auth returning fixed data, or a fixed error
pub struct StaticRegistryAuth {
    data: Vec<AuthorizationData>,
    error: Option<String>,
    requests: std::sync::Mutex<Vec<Vec<String>>>,
}

impl StaticRegistryAuth {
    pub fn new(data: Vec<AuthorizationData>) -> Self {
        Self {
            data,
            error: None,
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Auth that always denies
    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            error: Some(message.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Registry id lists requested so far
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryAuth for StaticRegistryAuth {
    async fn authorization_tokens(&self, registry_ids: &[String]) -> Result<Vec<AuthorizationData>> {
        self.requests.lock().unwrap().push(registry_ids.to_vec());
        match &self.error {
            Some(message) => Err(DispatchError::Registry(message.clone())),
            None => Ok(self.data.clone()),
        }
    }

    fn name(&self) -> &str {
        "static"
    }
}
