//! Strategies for injecting a secret set into a deployment.

use std::str::FromStr;

use async_trait::async_trait;
use kube::Client;

use crate::{patch::DeploymentPatch, resources::VaultMapSpec, vault::SecretSet, Error, Result};

mod env;
mod volume;

pub use env::EnvironmentPublisher;
pub use volume::VolumePublisher;

/// Injects secrets into a deployment clone
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        binding: &VaultMapSpec,
        client: &Client,
        target: &mut DeploymentPatch,
        secrets: &SecretSet,
    ) -> Result<()>;
}

/// The built-in publishers, selected by the binding's `secretsPublisher` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherKind {
    Environment,
    Volume,
}

impl FromStr for PublisherKind {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        match tag {
            "env" => Ok(PublisherKind::Environment),
            "volume" => Ok(PublisherKind::Volume),
            other => Err(Error::UnknownPublisher(other.to_string())),
        }
    }
}

impl PublisherKind {
    pub fn publisher(self) -> Box<dyn Publisher> {
        match self {
            PublisherKind::Environment => Box::new(EnvironmentPublisher),
            PublisherKind::Volume => Box::new(VolumePublisher),
        }
    }
}

/// Create the publisher named by `tag`.
pub fn create_publisher(tag: &str) -> Result<Box<dyn Publisher>> {
    tag.parse::<PublisherKind>().map(PublisherKind::publisher)
}
