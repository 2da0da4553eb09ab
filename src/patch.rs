//! Typed mutation record for a deployment.
//!
//! A [`DeploymentPatch`] owns a private clone of the observed deployment. Every change is applied
//! to that clone and recorded as a [`Mutation`]; the strategic merge patch sent to the cluster is
//! derived from the record alone, so it only ever contains the fields that were touched.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Container, EnvVar, Volume, VolumeMount},
};
use serde_json::{json, Map, Value};

use crate::{
    interceptors::{self, PendingInterceptors as _, PENDING_ANNOTATION},
    Error, Result,
};

/// A single field-level change to a deployment.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// The head of the pending-interceptor list was removed; `None` once the list is absent.
    RemovePendingHead { remaining: Option<Vec<String>> },
    AppendEnvVar { container: String, var: EnvVar },
    AppendVolume(Volume),
    AppendVolumeMount { container: String, mount: VolumeMount },
    SetTemplateAnnotation { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct DeploymentPatch {
    deployment: Deployment,
    mutations: Vec<Mutation>,
}

impl DeploymentPatch {
    /// Start a patch from a clone of `original`, which is never touched.
    pub fn new(original: &Deployment) -> Self {
        Self {
            deployment: original.clone(),
            mutations: Vec::new(),
        }
    }

    /// The mutated clone.
    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn remove_pending_head(&mut self) {
        let remaining = self.deployment.pop_interceptor();
        self.mutations.push(Mutation::RemovePendingHead { remaining });
    }

    /// Append an environment variable to the first container.
    pub fn append_env_var(&mut self, var: EnvVar) -> Result<()> {
        let container = self.first_container()?;
        container.env.get_or_insert_with(Vec::new).push(var.clone());
        let container = container.name.clone();
        self.mutations.push(Mutation::AppendEnvVar { container, var });
        Ok(())
    }

    /// Append a volume mount to the first container.
    pub fn append_volume_mount(&mut self, mount: VolumeMount) -> Result<()> {
        let container = self.first_container()?;
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(mount.clone());
        let container = container.name.clone();
        self.mutations
            .push(Mutation::AppendVolumeMount { container, mount });
        Ok(())
    }

    pub fn append_volume(&mut self, volume: Volume) -> Result<()> {
        let pod = self
            .deployment
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
            .ok_or_else(|| Error::IllegalDeployment("deployment has no pod spec".into()))?;
        pod.volumes.get_or_insert_with(Vec::new).push(volume.clone());
        self.mutations.push(Mutation::AppendVolume(volume));
        Ok(())
    }

    /// Set an annotation on the pod template, creating the annotation map when absent.
    pub fn set_template_annotation(&mut self, key: &str, value: &str) -> Result<()> {
        let template = &mut self
            .deployment
            .spec
            .as_mut()
            .ok_or_else(|| Error::IllegalDeployment("deployment has no spec".into()))?
            .template;
        template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self.mutations.push(Mutation::SetTemplateAnnotation {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn first_container(&mut self) -> Result<&mut Container> {
        self.deployment
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
            .and_then(|pod| pod.containers.first_mut())
            .ok_or_else(|| Error::IllegalDeployment("deployment has no containers".into()))
    }

    /// Derive the strategic merge patch describing the recorded mutations.
    ///
    /// Containers and volumes are merged by name, env vars by name and volume mounts by mount
    /// path, so the patch only needs to list the appended entries. The observed resource version
    /// is carried along, making the apiserver reject the patch with a conflict once the
    /// deployment has changed underneath it.
    pub fn to_strategic_merge(&self) -> Result<Value> {
        let mut annotations = Map::new();
        let mut template_annotations = Map::new();
        let mut volumes = Vec::new();
        let mut containers: Vec<ContainerPatch> = Vec::new();

        for mutation in &self.mutations {
            match mutation {
                Mutation::RemovePendingHead { remaining } => {
                    let value = match remaining {
                        Some(names) => Value::String(interceptors::format(names)),
                        None => Value::Null,
                    };
                    annotations.insert(PENDING_ANNOTATION.to_string(), value);
                }
                Mutation::AppendEnvVar { container, var } => {
                    ContainerPatch::entry(&mut containers, container)
                        .env
                        .push(to_value(var)?);
                }
                Mutation::AppendVolumeMount { container, mount } => {
                    ContainerPatch::entry(&mut containers, container)
                        .volume_mounts
                        .push(to_value(mount)?);
                }
                Mutation::AppendVolume(volume) => volumes.push(to_value(volume)?),
                Mutation::SetTemplateAnnotation { key, value } => {
                    template_annotations.insert(key.clone(), Value::String(value.clone()));
                }
            }
        }

        let mut metadata = Map::new();
        if let Some(version) = &self.deployment.metadata.resource_version {
            metadata.insert("resourceVersion".into(), Value::String(version.clone()));
        }
        if !annotations.is_empty() {
            metadata.insert("annotations".into(), Value::Object(annotations));
        }

        let mut patch = Map::new();
        if !metadata.is_empty() {
            patch.insert("metadata".into(), Value::Object(metadata));
        }

        let mut template = Map::new();
        if !template_annotations.is_empty() {
            template.insert(
                "metadata".into(),
                json!({ "annotations": template_annotations }),
            );
        }
        let mut pod = Map::new();
        if !containers.is_empty() {
            let containers = containers.into_iter().map(ContainerPatch::into_value).collect();
            pod.insert("containers".into(), Value::Array(containers));
        }
        if !volumes.is_empty() {
            pod.insert("volumes".into(), Value::Array(volumes));
        }
        if !pod.is_empty() {
            template.insert("spec".into(), Value::Object(pod));
        }
        if !template.is_empty() {
            patch.insert("spec".into(), json!({ "template": template }));
        }

        Ok(Value::Object(patch))
    }
}

/// Entries appended to one container, keyed by its name in the patch
struct ContainerPatch {
    name: String,
    env: Vec<Value>,
    volume_mounts: Vec<Value>,
}

impl ContainerPatch {
    /// The patch for `name`, added in first-touched order when missing.
    fn entry<'a>(containers: &'a mut Vec<ContainerPatch>, name: &str) -> &'a mut ContainerPatch {
        let index = match containers.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                containers.push(ContainerPatch {
                    name: name.to_string(),
                    env: Vec::new(),
                    volume_mounts: Vec::new(),
                });
                containers.len() - 1
            }
        };
        &mut containers[index]
    }

    fn into_value(self) -> Value {
        let mut container = Map::new();
        container.insert("name".into(), Value::String(self.name));
        if !self.env.is_empty() {
            container.insert("env".into(), Value::Array(self.env));
        }
        if !self.volume_mounts.is_empty() {
            container.insert("volumeMounts".into(), Value::Array(self.volume_mounts));
        }
        Value::Object(container)
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::SerializationError)
}
