use std::{future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use futures::{future, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::ListParams,
    runtime::{
        controller::{self, Action},
        reflector::{self, ObjectRef},
        watcher, Controller, WatchStreamExt,
    },
    Api, Client,
};
use serde::Serialize;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, field, info, instrument, warn, Span};

use crate::{
    backoff::RetryTracker,
    config::{load_with_retry, BootstrapSecrets, InitializerConfig, Settings},
    reconcilers::{Context, Reconcile},
    resources::{BindingStore, VaultMap},
    telemetry,
    vault::{SecretBackend, VaultClient},
    Error, Metrics, Result,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub(crate) fn to_context(
        &self,
        client: Client,
        settings: &Settings,
        config: InitializerConfig,
        secrets: BootstrapSecrets,
        bindings: BindingStore,
        backend: Arc<dyn SecretBackend>,
    ) -> Result<Arc<Context>, prometheus::Error> {
        Ok(Arc::new(Context {
            client,
            interceptor_name: settings.interceptor_name.clone(),
            config: Arc::new(config),
            secrets: Arc::new(secrets),
            bindings,
            backend,
            diagnostics: self.diagnostics.clone(),
            metrics: Metrics::default().register(&self.registry)?,
            retries: RetryTracker::default(),
            cancel: CancellationToken::new(),
        }))
    }
}

pub struct InitializerController {
    state: State,
}

impl InitializerController {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    /// Load the bootstrap configuration, then watch and initialize deployments until a shutdown
    /// signal arrives
    pub async fn run(self, settings: Settings) -> Result<(), anyhow::Error> {
        // Every cluster call is bounded by the request timeout
        let mut kube_config = kube::Config::infer().await?;
        kube_config.connect_timeout = Some(settings.request_timeout());
        kube_config.read_timeout = Some(settings.request_timeout());
        let client = Client::try_from(kube_config)?;

        let config = load_with_retry("bootstrap config", || {
            InitializerConfig::load(client.clone(), &settings.namespace, &settings.configmap)
        })
        .await;
        let secrets = load_with_retry("bootstrap secrets", || {
            BootstrapSecrets::load(client.clone(), &settings.namespace, &settings.secret)
        })
        .await;
        let backend = VaultClient::new(config.vault_address(), settings.request_timeout())?;
        info!("Using secret backend at {}", config.vault_address());

        let bindings_api = Api::<VaultMap>::all(client.clone());
        let deployments_api = match &settings.watch_namespace {
            Some(namespace) => Api::<Deployment>::namespaced(client.clone(), namespace),
            None => Api::<Deployment>::all(client.clone()),
        };

        // Test that we can actually query for our CRDs (a.k.a. they are installed)
        if let Err(e) = bindings_api.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            return Err(e.into());
        }

        let (bindings, bindings_writer) = reflector::store::<VaultMap>();
        let bindings_watch = tokio::spawn(
            reflector::reflector(
                bindings_writer,
                watcher(bindings_api, watcher::Config::default()).default_backoff(),
            )
            .for_each(|event| {
                if let Err(e) = event {
                    warn!("vault map watch failed: {e}");
                }
                future::ready(())
            }),
        );

        let context = self.state.to_context(
            client,
            &settings,
            config,
            secrets,
            BindingStore::new(bindings.clone()),
            Arc::new(backend),
        )?;

        // Stop intake on the first signal, abort what is still running after the grace period
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let grace = settings.shutdown_grace();
        let cancel = context.cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutting down, draining in-flight reconciles");
            let _ = shutdown_tx.send(());
            tokio::time::sleep(grace).await;
            warn!("Grace period of {grace:?} expired, cancelling in-flight reconciles");
            cancel.cancel();
        });

        // Nothing is reconciled against a partial view of the vault maps
        tokio::select! {
            ready = bindings.wait_until_ready() => ready?,
            _ = &mut shutdown_rx => {
                bindings_watch.abort();
                return Ok(());
            }
        }
        info!("Vault maps synced, starting {} workers", settings.workers);

        Controller::new(deployments_api, watcher::Config::default().any_semantic())
            .with_config(controller::Config::default().concurrency(settings.workers))
            .graceful_shutdown_on(async move {
                let _ = shutdown_rx.await;
            })
            .run(reconcile, error_policy, context)
            .filter_map(|x| async move { Result::ok(x) })
            .for_each(|_| future::ready(()))
            .await;

        bindings_watch.abort();
        Ok(())
    }
}

/// Entry point of a single deployment reconcile
#[instrument(skip(ctx, deployment), fields(trace_id))]
async fn reconcile(deployment: Arc<Deployment>, ctx: Arc<Context>) -> Result<Action> {
    // Add some tracing for debugging's sake
    let trace_id = telemetry::get_trace_id();

    // Take some metrics to see the average reconcile time
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let outcome = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
        outcome = deployment.reconcile(ctx.clone()) => outcome,
    }?;

    ctx.metrics.outcome(outcome);
    ctx.retries.forget(&ObjectRef::from_obj(&*deployment));

    // Every relevant change arrives as a watch event
    Ok(Action::await_change())
}

/// Error handler for failed reconciliations
fn error_policy(deployment: Arc<Deployment>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.metrics.reconcile_failure(&deployment, error);
    let key = ObjectRef::from_obj(&*deployment);

    if error.is_permanent() {
        error!("reconcile of {key} failed permanently, waiting for a change: {error}");
        ctx.retries.forget(&key);
        return Action::await_change();
    }

    let delay = ctx.retries.next_delay(&key);
    warn!("reconcile of {key} failed, retrying in {delay:?}: {error}");
    Action::requeue(delay)
}

/// Resolves on SIGINT or SIGTERM
fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {e}");
                future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("failed to listen for SIGTERM: {e}");
                    future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }
}
