use thiserror::Error;

/// Expose all controller components used by main
pub mod config;
pub mod operator;
pub mod backoff;
pub mod resources;

/// Deployment reconciliation and the pieces it is built from
pub mod interceptors;
pub mod patch;
pub mod publishers;
pub mod reconcilers;
pub mod template;
pub mod vault;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub(crate) mod fixtures;

/// Pod template annotation marking a deployment whose secrets were injected.
pub const INITIALIZED_ANNOTATION: &str = "vault-secrets-initialized";

/// Namespace that is left alone when `ignoreSystemNamespaces` is set.
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Field manager used for every write this controller makes.
pub const FIELD_MANAGER: &str = "vault-initializer";

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Secret backend error: {0}")]
    BackendError(#[source] reqwest::Error),

    #[error("Secret backend returned {status} for {path}")]
    BackendStatus { path: String, status: http::StatusCode },

    #[error("Template error: {0}")]
    TemplateError(#[from] template::TemplateError),

    #[error("Invalid publisher: {0}")]
    UnknownPublisher(String),

    #[error("Malformed secret payload: {0}")]
    SecretParseError(String),

    #[error("IllegalDeployment: {0}")]
    IllegalDeployment(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Reconcile cancelled by shutdown")]
    Cancelled,
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        let label = match self {
            Error::SerializationError(_) => "serialization",
            Error::KubeError(_) => "kube",
            Error::BackendError(_) | Error::BackendStatus { .. } => "backend",
            Error::TemplateError(_) => "template",
            Error::UnknownPublisher(_) => "unknown_publisher",
            Error::SecretParseError(_) => "secret_parse",
            Error::IllegalDeployment(_) => "illegal_deployment",
            Error::ConfigError(_) => "config",
            Error::Cancelled => "cancelled",
        };
        label.to_string()
    }

    /// Whether retrying the same input can ever succeed.
    ///
    /// Permanent errors come from configuration or payload shape; they wait for the object to
    /// change instead of being requeued with backoff.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::TemplateError(_)
                | Error::UnknownPublisher(_)
                | Error::SecretParseError(_)
                | Error::IllegalDeployment(_)
                | Error::ConfigError(_)
        )
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        Error::KubeError(error)
    }
}
