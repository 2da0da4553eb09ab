use async_trait::async_trait;
use k8s_openapi::api::core::v1::EnvVar;
use kube::Client;

use super::Publisher;
use crate::{patch::DeploymentPatch, resources::VaultMapSpec, vault::SecretSet, Result};

/// Exposes every secret as an environment variable of the first container
pub struct EnvironmentPublisher;

#[async_trait]
impl Publisher for EnvironmentPublisher {
    async fn publish(
        &self,
        _binding: &VaultMapSpec,
        _client: &Client,
        target: &mut DeploymentPatch,
        secrets: &SecretSet,
    ) -> Result<()> {
        for (name, value) in secrets {
            target.append_env_var(EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fixtures::{binding, deployment, secrets, ApiServerVerifier},
        patch::Mutation,
    };

    #[tokio::test]
    async fn adds_one_variable_per_secret() {
        let (client, _verifier) = ApiServerVerifier::client();
        let mut target = DeploymentPatch::new(&deployment("ns", "depname", &["contname"], None));
        let secrets = secrets(&[("secret1", "my secret1"), ("secret2", "my secret2")]);

        EnvironmentPublisher
            .publish(&binding("ns", "name", "env").spec, &client, &mut target, &secrets)
            .await
            .unwrap();

        let container = &target.deployment().spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        assert_eq!(env.len(), secrets.len());
        for var in env {
            assert_eq!(var.value.as_deref(), secrets.get(&var.name).map(String::as_str));
        }
        assert!(target
            .mutations()
            .iter()
            .all(|m| matches!(m, Mutation::AppendEnvVar { container, .. } if container == "contname")));
    }

    #[tokio::test]
    async fn an_empty_set_changes_nothing() {
        let (client, _verifier) = ApiServerVerifier::client();
        let mut target = DeploymentPatch::new(&deployment("ns", "depname", &["contname"], None));

        EnvironmentPublisher
            .publish(&binding("ns", "name", "env").spec, &client, &mut target, &SecretSet::new())
            .await
            .unwrap();

        assert!(target.mutations().is_empty());
    }
}
