use std::sync::Arc;

use kube::{runtime::reflector::Store, CustomResource, ResourceExt as _};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Secret injection configuration bound to a namespace
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "VaultMap",
    group = "vaultinit.k8s.io",
    version = "v1alpha1",
    doc = "Where to fetch secrets for the deployments of a namespace and how to publish them",
    namespaced,
    printcolumn = r#"{ "name": "publisher", "type": "string", "description": "secrets publisher", "jsonPath": ".spec.secretsPublisher" }"#,
    printcolumn = r#"{ "name": "path", "type": "string", "description": "secret backend path pattern", "jsonPath": ".spec.vaultPathPattern" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct VaultMapSpec {
    /// Secret backend path to read, e.g. `/v1/secret/{{.Namespace}}/{{.ContainerName}}`.
    ///
    /// Patterns may reference `.Namespace`, `.DeploymentName` and `.ContainerName`.
    pub vault_path_pattern: String,

    /// How secrets are injected: `env` or `volume`.
    pub secrets_publisher: String,

    /// Directory the secrets file is mounted into (volume publisher only).
    #[serde(default)]
    pub secrets_file_path_pattern: String,

    /// Name of the mounted secrets file (volume publisher only).
    #[serde(default)]
    pub secrets_file_name_pattern: String,

    /// Name of the Secret holding the secrets file (volume publisher only).
    #[serde(default)]
    pub secret_name_pattern: String,
}

/// Read-only view over the reflected bindings
#[derive(Clone)]
pub struct BindingStore(Store<VaultMap>);

impl BindingStore {
    pub fn new(store: Store<VaultMap>) -> Self {
        Self(store)
    }

    /// The binding that applies to `namespace`.
    ///
    /// When several bindings live in one namespace the one with the smallest name wins, so the
    /// choice does not depend on watch ordering.
    pub fn for_namespace(&self, namespace: &str) -> Option<Arc<VaultMap>> {
        self.0
            .state()
            .into_iter()
            .filter(|binding| binding.namespace().as_deref() == Some(namespace))
            .min_by_key(|binding| binding.name_any())
    }
}
