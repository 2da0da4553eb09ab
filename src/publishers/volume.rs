use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{Secret, SecretVolumeSource, Volume, VolumeMount},
    ByteString,
};
use kube::{api::PostParams, Api, Client};
use tracing::info;

use super::Publisher;
use crate::{
    meta,
    patch::DeploymentPatch,
    resources::VaultMapSpec,
    template::{self, PathContext},
    vault::SecretSet,
    Error, Result, FIELD_MANAGER,
};

/// Volume name used when the Secret name yields no usable label
const FALLBACK_VOLUME_NAME: &str = "secrets";

/// Longest name a pod volume may have
const MAX_VOLUME_NAME_LEN: usize = 63;

/// Writes the secrets as one JSON file into a Secret and mounts it into the first container
pub struct VolumePublisher;

#[async_trait]
impl Publisher for VolumePublisher {
    async fn publish(
        &self,
        binding: &VaultMapSpec,
        client: &Client,
        target: &mut DeploymentPatch,
        secrets: &SecretSet,
    ) -> Result<()> {
        let context = PathContext::from_deployment(target.deployment())?;
        let namespace = context.namespace.clone();

        let secret_name = template::resolve(&context, &binding.secret_name_pattern)?;
        let file_path = template::resolve(&context, &binding.secrets_file_path_pattern)?;
        let file_name = template::resolve(&context, &binding.secrets_file_name_pattern)?;
        if secret_name.is_empty() {
            return Err(Error::ConfigError(
                "secretNamePattern resolved to an empty secret name".into(),
            ));
        }
        if file_name.is_empty() {
            return Err(Error::ConfigError(
                "secretsFileNamePattern resolved to an empty file name".into(),
            ));
        }
        let mount_path = join_path(&file_path, &file_name);

        let contents = serde_json::to_vec(secrets).map_err(Error::SerializationError)?;

        // An existing secret is reused as is, never overwritten
        let api = Api::<Secret>::namespaced(client.clone(), &namespace);
        if api.get_opt(&secret_name).await?.is_some() {
            info!(r#"Secret "{namespace}/{secret_name}" already exists"#);
        } else {
            info!(r#"Creating secret "{namespace}/{secret_name}""#);
            let secret = Secret {
                metadata: meta! {
                    name: Some(secret_name.clone()),
                    namespace: Some(namespace.clone())
                },
                data: Some(BTreeMap::from([(file_name.clone(), ByteString(contents))])),
                type_: Some("Opaque".into()),

                ..Default::default()
            };
            let params = PostParams {
                field_manager: Some(FIELD_MANAGER.into()),
                ..Default::default()
            };
            api.create(&params, &secret).await?;
        }

        let volume_name = volume_name(&secret_name);
        target.append_volume(Volume {
            name: volume_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name),
                ..Default::default()
            }),
            ..Default::default()
        })?;
        target.append_volume_mount(VolumeMount {
            name: volume_name,
            mount_path,
            sub_path: Some(file_name),
            read_only: Some(true),
            ..Default::default()
        })
    }
}

/// Derive a pod volume name (a DNS-1123 label) from the Secret it mounts.
pub fn volume_name(secret_name: &str) -> String {
    let label: String = secret_name
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-') => c,
            _ => '-',
        })
        .take(MAX_VOLUME_NAME_LEN)
        .collect();
    let label = label.trim_matches('-');

    if label.is_empty() {
        FALLBACK_VOLUME_NAME.to_string()
    } else {
        label.to_string()
    }
}

/// Join a directory and a file name, then clean the result lexically.
///
/// Empty elements are ignored, `.` segments dropped and `..` pops the previous segment. A rooted
/// path never climbs above `/`, a relative one keeps its leading `..` segments.
fn join_path(dir: &str, file: &str) -> String {
    let joined = [dir, file]
        .into_iter()
        .filter(|element| !element.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        return joined;
    }

    let rooted = joined.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            segment => segments.push(segment),
        }
    }

    match (rooted, segments.is_empty()) {
        (true, _) => format!("/{}", segments.join("/")),
        (false, true) => ".".to_string(),
        (false, false) => segments.join("/"),
    }
}
