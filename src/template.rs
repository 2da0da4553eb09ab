//! Resolution of `{{.Field}}` patterns against a deployment.
//!
//! Patterns are plain text interspersed with actions delimited by `{{` and `}}`. An action holds a
//! single field reference (`.Namespace`, `.DeploymentName` or `.ContainerName`), optionally padded
//! with whitespace. Anything else inside the delimiters is a syntax error.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt as _;
use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("syntax error at offset {offset}: {reason}")]
    Syntax { offset: usize, reason: String },

    #[error("unknown field `{0}`")]
    UnknownField(String),
}

/// The values a pattern may substitute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathContext {
    pub namespace: String,
    pub deployment_name: String,
    pub container_name: String,
}

impl PathContext {
    /// Build the context for a deployment, naming its first container.
    pub fn from_deployment(deployment: &Deployment) -> Result<Self, crate::Error> {
        let deployment_name = deployment.name_any();
        let namespace = deployment.namespace().ok_or_else(|| {
            crate::Error::IllegalDeployment(format!("deployment {deployment_name} has no namespace"))
        })?;
        let container_name = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.containers.first())
            .map(|container| container.name.clone())
            .ok_or_else(|| {
                crate::Error::IllegalDeployment(format!(
                    "deployment {namespace}/{deployment_name} has no containers"
                ))
            })?;

        Ok(Self {
            namespace,
            deployment_name,
            container_name,
        })
    }

    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "Namespace" => Some(&self.namespace),
            "DeploymentName" => Some(&self.deployment_name),
            "ContainerName" => Some(&self.container_name),
            _ => None,
        }
    }
}

/// Resolve `pattern` against `context`.
///
/// Pure and deterministic; on error nothing is produced.
pub fn resolve(context: &PathContext, pattern: &str) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(pattern.len());
    let mut rest = pattern;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        output.push_str(&rest[..start]);

        let action_start = start + OPEN.len();
        let Some(len) = rest[action_start..].find(CLOSE) else {
            return Err(TemplateError::Syntax {
                offset: offset + start,
                reason: "unclosed action".into(),
            });
        };
        let action = &rest[action_start..action_start + len];
        let name = field_name(action).ok_or_else(|| TemplateError::Syntax {
            offset: offset + start,
            reason: format!("unexpected `{action}` in action"),
        })?;
        let value = context
            .field(name)
            .ok_or_else(|| TemplateError::UnknownField(name.to_string()))?;
        output.push_str(value);

        let consumed = action_start + len + CLOSE.len();
        rest = &rest[consumed..];
        offset += consumed;
    }
    output.push_str(rest);

    Ok(output)
}

/// Extract `Name` from ` .Name `, rejecting anything that is not a lone field reference.
fn field_name(action: &str) -> Option<&str> {
    let name = action.trim().strip_prefix('.')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    chars
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        .then_some(name)
}
