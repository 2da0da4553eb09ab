//! Process settings and the bootstrap configuration read from the cluster at startup.

use std::{collections::BTreeMap, future::Future, net::SocketAddr, time::Duration};

use clap::Parser;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{backoff::ExponentialBackoff, Error, Result};

pub const DEFAULT_INTERCEPTOR_NAME: &str = "vault.initializer.kubernetes.io";
pub const DEFAULT_ANNOTATION: &str = "initializer.kubernetes.io/vault";
pub const DEFAULT_VAULT_ADDRESS: &str = "https://127.0.0.1:8200";

/// Key of the bootstrap ConfigMap holding the YAML configuration
pub const CONFIG_KEY: &str = "config";

/// Key of the bootstrap Secret holding the secret backend token
pub const TOKEN_KEY: &str = "vaultToken";

/// Command line settings for the operator process
#[derive(Parser, Debug, Clone)]
#[command(name = "vault-initializer", about = "Injects secret backend material into new deployments")]
pub struct Settings {
    /// Name this controller claims in the pending-interceptor list
    #[arg(long, env = "INTERCEPTOR_NAME", default_value = DEFAULT_INTERCEPTOR_NAME)]
    pub interceptor_name: String,

    /// Namespace holding the bootstrap ConfigMap and Secret
    #[arg(long, env = "CONFIG_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Name of the bootstrap ConfigMap
    #[arg(long, env = "CONFIG_MAP", default_value = "vault-initializer")]
    pub configmap: String,

    /// Name of the bootstrap Secret
    #[arg(long, env = "CONFIG_SECRET", default_value = "vault-initializer")]
    pub secret: String,

    /// Only watch deployments in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Number of parallel reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    pub workers: u16,

    /// Timeout in seconds for every call to the cluster or the secret backend
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout: u64,

    /// Seconds in-flight reconciles may run after a shutdown signal before being cancelled
    #[arg(long, env = "SHUTDOWN_GRACE", default_value_t = 30)]
    pub shutdown_grace: u64,

    /// Address of the metrics and health server
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

/// How the controller authenticates against the secret backend
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VaultAuthMode {
    /// Send the bootstrap `vaultToken` as a bearer token.
    Token,

    /// Send no credentials.
    #[default]
    #[serde(other)]
    Unauthenticated,
}

/// Controller configuration, read once from the bootstrap ConfigMap
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializerConfig {
    /// Only inject into deployments carrying `annotation_name`
    #[serde(default)]
    pub require_annotation: bool,

    #[serde(default)]
    pub annotation_name: String,

    /// Leave deployments in `kube-system` alone
    #[serde(default)]
    pub ignore_system_namespaces: bool,

    #[serde(default)]
    pub vault_auth_mode: VaultAuthMode,

    #[serde(default)]
    pub vault_address: Option<String>,
}

impl InitializerConfig {
    /// Parse the YAML document stored in a ConfigMap, filling in defaults.
    pub fn from_configmap(cm: &ConfigMap) -> Result<Self> {
        let raw = cm
            .data
            .as_ref()
            .and_then(|data| data.get(CONFIG_KEY))
            .ok_or_else(|| Error::ConfigError(format!("missing `{CONFIG_KEY}` key")))?;
        let mut config: InitializerConfig =
            serde_yaml::from_str(raw).map_err(|e| Error::ConfigError(e.to_string()))?;

        if config.annotation_name.is_empty() {
            config.annotation_name = DEFAULT_ANNOTATION.to_string();
        }
        Ok(config)
    }

    pub async fn load(client: Client, namespace: &str, name: &str) -> Result<Self> {
        info!(r#"Reading config "{namespace}/{name}""#);
        let cm = Api::<ConfigMap>::namespaced(client, namespace).get(name).await?;
        Self::from_configmap(&cm)
    }

    /// Address of the secret backend, falling back to `VAULT_ADDR` and then the local default.
    pub fn vault_address(&self) -> String {
        self.vault_address
            .clone()
            .filter(|address| !address.is_empty())
            .or_else(|| std::env::var("VAULT_ADDR").ok())
            .unwrap_or_else(|| DEFAULT_VAULT_ADDRESS.to_string())
    }
}

/// Decoded entries of the bootstrap Secret
#[derive(Debug, Clone, Default)]
pub struct BootstrapSecrets(BTreeMap<String, String>);

impl BootstrapSecrets {
    pub fn from_secret(secret: &Secret) -> Self {
        let entries = secret
            .data
            .iter()
            .flatten()
            .map(|(key, value)| (key.clone(), String::from_utf8_lossy(&value.0).into_owned()))
            .collect();
        Self(entries)
    }

    pub async fn load(client: Client, namespace: &str, name: &str) -> Result<Self> {
        info!(r#"Reading secret "{namespace}/{name}""#);
        let secret = Api::<Secret>::namespaced(client, namespace).get(name).await?;
        Ok(Self::from_secret(&secret))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The token to present to the secret backend under `mode`.
    pub fn token(&self, mode: VaultAuthMode) -> Option<&str> {
        match mode {
            VaultAuthMode::Token => self.get(TOKEN_KEY),
            VaultAuthMode::Unauthenticated => None,
        }
    }
}

impl From<BTreeMap<String, String>> for BootstrapSecrets {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }
}

/// Keep retrying a bootstrap load until it succeeds.
pub async fn load_with_retry<T, F, Fut>(what: &str, mut load: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(60));
    let mut failures = 0;
    loop {
        match load().await {
            Ok(value) => return value,
            Err(e) => {
                let delay = backoff.delay(failures);
                warn!("failed to load {what}, retrying in {delay:?}: {e}");
                failures = failures.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
