use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{runtime::reflector::ObjectRef, Client, Resource};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::RetryTracker,
    config::{BootstrapSecrets, InitializerConfig},
    operator::Diagnostics,
    resources::BindingStore,
    vault::SecretBackend,
    Error, Metrics,
};

pub mod deployment;

pub use deployment::Outcome;

/// The context passed around
pub struct Context {
    /// Kubernetes client
    pub client: Client,

    /// Name claimed in the pending-interceptor list
    pub interceptor_name: String,

    /// Bootstrap configuration, read once at startup
    pub config: Arc<InitializerConfig>,

    /// Bootstrap secrets, read once at startup
    pub secrets: Arc<BootstrapSecrets>,

    /// Reflected secret bindings
    pub bindings: BindingStore,

    /// Where secrets are fetched from
    pub backend: Arc<dyn SecretBackend>,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,

    /// Consecutive failures per deployment, driving the requeue delay
    pub retries: RetryTracker<ObjectRef<Deployment>>,

    /// Cancelled once the shutdown grace period has run out
    pub cancel: CancellationToken,
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub(crate) trait Reconcile
where
    Self: Resource,
{
    type Context;

    /// Attempt to reconcile a resource
    async fn reconcile(&self, context: Arc<Self::Context>) -> Result<Outcome, Error>;
}
