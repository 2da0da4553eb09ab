//! Helper methods only available for tests
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use assert_json_diff::assert_json_eq;
use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use hyper::{body::to_bytes, Body};
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    core::v1::{Container, PodSpec, PodTemplateSpec, Secret},
};
use kube::{
    runtime::{reflector, watcher},
    Client,
};
use serde_json::{json, Value};
use tokio::{sync::RwLock, task::JoinHandle};

use crate::{
    config::{BootstrapSecrets, InitializerConfig, DEFAULT_INTERCEPTOR_NAME, TOKEN_KEY},
    interceptors::PENDING_ANNOTATION,
    meta,
    reconcilers::Context,
    resources::{BindingStore, VaultMap, VaultMapSpec},
    vault::{BackendResponse, SecretBackend, SecretSet},
    Metrics, Result,
};

pub const TEST_INTERCEPTOR: &str = DEFAULT_INTERCEPTOR_NAME;
pub const TEST_TOKEN: &str = "s.test-token";

/// A deployment with the given containers and pending-interceptor annotation
pub fn deployment(
    namespace: &str,
    name: &str,
    containers: &[&str],
    pending: Option<&str>,
) -> Deployment {
    let annotations = pending
        .map(|pending| BTreeMap::from([(PENDING_ANNOTATION.to_string(), pending.to_string())]));

    Deployment {
        metadata: meta! {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            annotations: annotations
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: containers
                        .iter()
                        .map(|name| Container {
                            name: name.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// A binding using the common test patterns and the given publisher tag
pub fn binding(namespace: &str, name: &str, publisher: &str) -> VaultMap {
    let mut binding = VaultMap::new(
        name,
        VaultMapSpec {
            vault_path_pattern: "/v1/secret/{{.Namespace}}/{{.ContainerName}}".into(),
            secrets_publisher: publisher.into(),
            secrets_file_path_pattern: "/".into(),
            secrets_file_name_pattern: "config.json".into(),
            secret_name_pattern: "{{.Namespace}}.{{.ContainerName}}".into(),
        },
    );
    binding.metadata.namespace = Some(namespace.into());
    binding
}

pub fn secrets(entries: &[(&str, &str)]) -> SecretSet {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Build a reconcile context around a mocked client
pub fn context(
    client: Client,
    config: InitializerConfig,
    bindings: Vec<VaultMap>,
    backend: Arc<FakeBackend>,
) -> Arc<Context> {
    let (reader, mut writer) = reflector::store::<VaultMap>();
    writer.apply_watcher_event(&watcher::Event::Restarted(bindings));

    Arc::new(Context {
        client,
        interceptor_name: TEST_INTERCEPTOR.into(),
        config: Arc::new(config),
        secrets: Arc::new(BootstrapSecrets::from(BTreeMap::from([(
            TOKEN_KEY.to_string(),
            TEST_TOKEN.to_string(),
        )]))),
        bindings: BindingStore::new(reader),
        backend,
        diagnostics: Arc::new(RwLock::new(Default::default())),
        metrics: Metrics::default(),
        retries: Default::default(),
        cancel: Default::default(),
    })
}

/// Secret backend answering every read with the same response
pub struct FakeBackend {
    response: BackendResponse,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeBackend {
    pub fn status(status: StatusCode) -> Arc<Self> {
        Arc::new(Self {
            response: BackendResponse {
                status,
                body: Vec::new(),
            },
            calls: Mutex::default(),
        })
    }

    pub fn secrets(entries: &[(&str, &str)]) -> Arc<Self> {
        let body = json!({ "data": secrets(entries) });
        Arc::new(Self {
            response: BackendResponse {
                status: StatusCode::OK,
                body: body.to_string().into_bytes(),
            },
            calls: Mutex::default(),
        })
    }

    /// Every `(path, token)` read so far
    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecretBackend for FakeBackend {
    async fn read(&self, path: &str, token: Option<&str>) -> Result<BackendResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_string(), token.map(String::from)));
        Ok(self.response.clone())
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// Scripted replies of the mocked apiserver
pub enum Scenario {
    /// The deployment is patched with exactly `expected`
    DeploymentPatched {
        namespace: String,
        name: String,
        expected: Value,
    },
    /// The secret is looked up, found missing, and created holding `expected` under `file`
    SecretCreated {
        namespace: String,
        name: String,
        file: String,
        expected: SecretSet,
    },
    /// The secret is looked up and already exists
    SecretExists { namespace: String, name: String },
}

pub struct ApiServerVerifier(ApiServerHandle);

impl ApiServerVerifier {
    /// A client whose requests are answered by the returned verifier
    pub fn client() -> (Client, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        (client, ApiServerVerifier(handle))
    }

    pub fn run(self, scenario: Scenario) -> JoinHandle<()> {
        self.run_all(vec![scenario])
    }

    /// Answer the scenarios in order on a background task
    pub fn run_all(mut self, scenarios: Vec<Scenario>) -> JoinHandle<()> {
        tokio::spawn(async move {
            for scenario in scenarios {
                match scenario {
                    Scenario::DeploymentPatched {
                        namespace,
                        name,
                        expected,
                    } => self.handle_deployment_patch(&namespace, &name, expected).await,
                    Scenario::SecretCreated {
                        namespace,
                        name,
                        file,
                        expected,
                    } => {
                        self.handle_secret_lookup(&namespace, &name, false).await;
                        self.handle_secret_create(&namespace, &name, &file, expected)
                            .await;
                    }
                    Scenario::SecretExists { namespace, name } => {
                        self.handle_secret_lookup(&namespace, &name, true).await
                    }
                }
            }
        })
    }

    /// Assert that the client stays silent
    pub async fn expect_no_requests(mut self) {
        match tokio::time::timeout(Duration::from_millis(100), self.0.next_request()).await {
            Err(_) | Ok(None) => {}
            Ok(Some((request, _))) => {
                panic!("unexpected request {} {}", request.method(), request.uri())
            }
        }
    }

    async fn handle_deployment_patch(&mut self, namespace: &str, name: &str, expected: Value) {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}")
        );
        assert_eq!(
            request.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/strategic-merge-patch+json"
        );

        let body = to_bytes(request.into_body()).await.unwrap();
        let actual: Value = serde_json::from_slice(&body).expect("patch is json");
        assert_json_eq!(actual, expected);

        let response = serde_json::to_vec(&deployment(namespace, name, &["contname"], None)).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
    }

    async fn handle_secret_lookup(&mut self, namespace: &str, name: &str, exists: bool) {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            format!("/api/v1/namespaces/{namespace}/secrets/{name}")
        );

        let response = if exists {
            let secret = Secret {
                metadata: meta! {
                    name: Some(name.into()),
                    namespace: Some(namespace.into())
                },
                ..Default::default()
            };
            Response::builder()
                .body(Body::from(serde_json::to_vec(&secret).unwrap()))
                .unwrap()
        } else {
            let status = json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": format!(r#"secrets "{name}" not found"#),
                "reason": "NotFound",
                "code": 404
            });
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from(status.to_string()))
                .unwrap()
        };
        send.send_response(response);
    }

    async fn handle_secret_create(
        &mut self,
        namespace: &str,
        name: &str,
        file: &str,
        expected: SecretSet,
    ) {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(
            request.uri().path(),
            format!("/api/v1/namespaces/{namespace}/secrets")
        );

        let body = to_bytes(request.into_body()).await.unwrap();
        let secret: Secret = serde_json::from_slice(&body).expect("valid secret");
        assert_eq!(secret.metadata.name.as_deref(), Some(name));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));

        let data = secret.data.as_ref().expect("secret has data");
        assert_eq!(data.len(), 1);
        let contents: SecretSet =
            serde_json::from_slice(&data.get(file).expect("data keyed by file name").0)
                .expect("file holds a json object of strings");
        assert_eq!(contents, expected);

        send.send_response(Response::builder().body(Body::from(body)).unwrap());
    }
}

/// Wait for a scenario to finish, failing the test if it does not within a second
pub async fn timeout_after_1s(handle: JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}
