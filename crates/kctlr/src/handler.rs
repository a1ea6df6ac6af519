//! Projects registry credentials into every watched namespace.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use kctlr_core::{BoxError, Handler};
use tracing::{info, warn};

use crate::namespace::Namespace;
use crate::secret::{RegistryCredentials, SecretTarget};

/// Default name of the projected secret.
pub const DEFAULT_SECRET_NAME: &str = "ecr";

/// Keeps a docker-config secret in every namespace that is not excluded.
pub struct NamespaceSecretHandler {
    target: Arc<dyn SecretTarget>,
    credentials: RegistryCredentials,
    exclude: HashSet<String>,
    secret_name: String,
}

impl NamespaceSecretHandler {
    /// An empty `secret_name` falls back to [`DEFAULT_SECRET_NAME`].
    pub fn new(
        target: Arc<dyn SecretTarget>,
        credentials: RegistryCredentials,
        exclude: impl IntoIterator<Item = String>,
        secret_name: &str,
    ) -> Self {
        let secret_name = if secret_name.is_empty() {
            DEFAULT_SECRET_NAME
        } else {
            secret_name
        };
        Self {
            target,
            credentials,
            exclude: exclude.into_iter().collect(),
            secret_name: secret_name.to_string(),
        }
    }

    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    fn is_excluded(&self, namespace: &str) -> bool {
        self.exclude.contains(namespace)
    }

    /// Create or refresh the secret. Creation and every later update take
    /// this path, so a resync re-issues the current credentials.
    async fn upsert(&self, ns: &Namespace) -> Result<(), BoxError> {
        let namespace = ns.name.as_str();

        if self.is_excluded(namespace) {
            if self.target.get(namespace, &self.secret_name).await?.is_some() {
                match self.target.delete(namespace, &self.secret_name).await {
                    Ok(()) => info!(namespace, secret = %self.secret_name, "deleted secret from excluded namespace"),
                    Err(e) => warn!(namespace, secret = %self.secret_name, error = %e, "failed to delete secret from excluded namespace"),
                }
            }
            info!(namespace, "ignoring excluded namespace");
            return Ok(());
        }

        let secret = self
            .credentials
            .docker_config_secret(namespace, &self.secret_name)?;

        if self.target.get(namespace, &self.secret_name).await?.is_none() {
            self.target.create(secret).await.inspect_err(|e| {
                warn!(namespace, secret = %self.secret_name, error = %e, "failed to create secret");
            })?;
            info!(namespace, secret = %self.secret_name, "created secret");
        } else {
            self.target.update(secret).await.inspect_err(|e| {
                warn!(namespace, secret = %self.secret_name, error = %e, "failed to update secret");
            })?;
            info!(namespace, secret = %self.secret_name, "updated secret");
        }

        Ok(())
    }
}

#[async_trait]
impl Handler<Namespace> for NamespaceSecretHandler {
    async fn create(&self, obj: Namespace) -> Result<(), BoxError> {
        self.upsert(&obj).await
    }

    async fn update(&self, _old: Option<Namespace>, new: Namespace) -> Result<(), BoxError> {
        self.upsert(&new).await
    }

    /// Secrets go away with their namespace.
    async fn delete(&self, _key: &str, _obj: Option<Namespace>) -> Result<(), BoxError> {
        Ok(())
    }
}
