use std::future::IntoFuture as _;

use anyhow::Context as _;
use clap::Parser as _;
use tokio::net::TcpListener;
use tracing::info;
use vault_initializer::{
    config::Settings,
    operator::{self, State},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    telemetry::init().await?;

    // Initialize Kubernetes controller state
    let state = State::default();
    let controller = operator::InitializerController::new(state.clone());

    // Start web server
    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen))?;
    let router = handlers::router();
    let server = axum::serve(listener, router.with_state(state));

    // The controller returns once a shutdown signal has drained its workers
    tokio::select! {
        c = controller.run(settings) => {
            c?;
            info!("controller stopped");
            Ok(())
        },
        s = server.into_future() => {
            s.context("server exited early")?;
            anyhow::bail!("server exited early")
        }
    }
}

/// Handlers for the web server portion of the operator
mod handlers {
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
    use prometheus::{Encoder, TextEncoder};

    use vault_initializer::operator::State as OperatorState;

    /// Construct the router for all the handlers
    pub fn router() -> Router<OperatorState> {
        Router::new()
            .route("/metrics", routing::get(metrics))
            .route("/health", routing::get(health))
            .route("/", routing::get(index))
    }

    /// Handler for exposing prometheus metrics
    async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
        let metrics = state.metrics();
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        match encoder.encode(&metrics, &mut buffer) {
            Ok(()) => (StatusCode::OK, buffer),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes()),
        }
    }

    /// Handler for checking the health of the server
    async fn health() -> impl IntoResponse {
        (StatusCode::OK, Json("healthy"))
    }

    /// Handler for interacting with the operator
    async fn index(State(state): State<OperatorState>) -> impl IntoResponse {
        let diagnostics = state.diagnostics().await;

        (StatusCode::OK, Json(diagnostics))
    }
}
