//! Secret backend access.
//!
//! The backend is reached with a single `GET path` call. A 404 means there is nothing stored for
//! the path, any other non-success status is an error, and a successful body is a JSON object
//! whose `data` field maps keys to string values.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use http::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

/// Secrets fetched for a single reconcile, keyed by name
pub type SecretSet = BTreeMap<String, String>;

/// Raw reply of the secret backend
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

/// A store that can be read by path
#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn read(&self, path: &str, token: Option<&str>) -> Result<BackendResponse>;
}

/// HTTP client for a Vault compatible backend
#[derive(Clone)]
pub struct VaultClient {
    address: String,
    http: reqwest::Client,
}

impl VaultClient {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::BackendError)?;

        Ok(Self {
            address: address.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.address, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl SecretBackend for VaultClient {
    async fn read(&self, path: &str, token: Option<&str>) -> Result<BackendResponse> {
        let mut request = self.http.get(self.url(path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(Error::BackendError)?;
        let status = response.status();
        let body = response.bytes().await.map_err(Error::BackendError)?;

        Ok(BackendResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Read the secrets stored under `path`, or `None` when the backend has none.
pub async fn fetch_secrets(
    backend: &dyn SecretBackend,
    path: &str,
    token: Option<&str>,
) -> Result<Option<SecretSet>> {
    let response = backend.read(path, token).await?;

    if response.status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !response.status.is_success() {
        return Err(Error::BackendStatus {
            path: path.to_string(),
            status: response.status,
        });
    }

    let secrets = parse_secret(&response.body)?;
    debug!("read {} secrets from {path}", secrets.len());
    Ok(Some(secrets))
}

/// Parse a backend body into a fresh secret set.
pub fn parse_secret(body: &[u8]) -> Result<SecretSet> {
    let document: Value = serde_json::from_slice(body)
        .map_err(|e| Error::SecretParseError(format!("invalid JSON: {e}")))?;
    let data = document
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::SecretParseError("missing `data` object".into()))?;

    data.iter()
        .map(|(key, value)| match value {
            Value::String(value) => Ok((key.clone(), value.clone())),
            other => Err(Error::SecretParseError(format!(
                "value of `{key}` is not a string: {other}"
            ))),
        })
        .collect()
}
