//! Deployment initialization.
//!
//! A deployment is only acted on while this controller heads its pending-interceptor list. The
//! claim is always released in the patch, whether secrets were injected or injection was skipped.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Patch, PatchParams},
    Api, ResourceExt as _,
};
use tracing::{debug, info};

use super::{Context, Reconcile};
use crate::{
    interceptors::PendingInterceptors as _,
    patch::DeploymentPatch,
    publishers,
    template::{self, PathContext},
    vault, Error, Result, FIELD_MANAGER, INITIALIZED_ANNOTATION, SYSTEM_NAMESPACE,
};

/// How a reconcile ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Another interceptor (or none) heads the pending list; nothing was done.
    Unclaimed,
    SkippedSystemNamespace,
    SkippedAnnotationMissing,
    SkippedNoBinding,
    SkippedNoSecret,
    Injected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Unclaimed => "unclaimed",
            Outcome::SkippedSystemNamespace => "skipped_system_namespace",
            Outcome::SkippedAnnotationMissing => "skipped_annotation_missing",
            Outcome::SkippedNoBinding => "skipped_no_binding",
            Outcome::SkippedNoSecret => "skipped_no_secret",
            Outcome::Injected => "injected",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
impl Reconcile for Deployment {
    type Context = Context;

    async fn reconcile(&self, context: Arc<Context>) -> Result<Outcome> {
        if !self.is_claimed_by(&context.interceptor_name) {
            return Ok(Outcome::Unclaimed);
        }

        let name = self.name_any();
        let namespace = self
            .namespace()
            .ok_or_else(|| Error::IllegalDeployment(format!("deployment {name} has no namespace")))?;
        info!(r#"Initializing deployment "{namespace}/{name}""#);

        let mut patch = DeploymentPatch::new(self);
        patch.remove_pending_head();

        let outcome = inject(self, &context, &namespace, &mut patch).await?;
        if outcome == Outcome::Injected {
            patch.set_template_annotation(INITIALIZED_ANNOTATION, "true")?;
        }

        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        Api::<Deployment>::namespaced(context.client.clone(), &namespace)
            .patch(&name, &params, &Patch::Strategic(patch.to_strategic_merge()?))
            .await?;

        info!(r#"Patched deployment "{namespace}/{name}" ({outcome})"#);
        Ok(outcome)
    }
}

/// Decide whether to inject, and inject into `patch` if so.
async fn inject(
    original: &Deployment,
    context: &Context,
    namespace: &str,
    patch: &mut DeploymentPatch,
) -> Result<Outcome> {
    let config = &context.config;

    if config.ignore_system_namespaces && namespace == SYSTEM_NAMESPACE {
        info!("Ignoring deployments in {SYSTEM_NAMESPACE} namespace");
        return Ok(Outcome::SkippedSystemNamespace);
    }

    if config.require_annotation && !original.annotations().contains_key(&config.annotation_name) {
        debug!(
            "Required '{}' annotation missing; skipping secret injection",
            config.annotation_name
        );
        return Ok(Outcome::SkippedAnnotationMissing);
    }

    let Some(binding) = context.bindings.for_namespace(namespace) else {
        debug!("No secret binding in namespace {namespace}; skipping secret injection");
        return Ok(Outcome::SkippedNoBinding);
    };

    let path_context = PathContext::from_deployment(patch.deployment())?;
    let path = template::resolve(&path_context, &binding.spec.vault_path_pattern)?;

    debug!("Querying secret backend with path: {path}");
    let token = context.secrets.token(config.vault_auth_mode);
    let Some(secrets) = vault::fetch_secrets(context.backend.as_ref(), &path, token).await? else {
        info!("No secrets in secret backend for path {path}");
        return Ok(Outcome::SkippedNoSecret);
    };

    let publisher = publishers::create_publisher(&binding.spec.secrets_publisher)?;
    publisher
        .publish(&binding.spec, &context.client, patch, &secrets)
        .await?;

    Ok(Outcome::Injected)
}
