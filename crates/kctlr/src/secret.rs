//! Registry credential secrets and the target they are written to.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Secret type for docker registry credentials.
pub const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Data key holding the docker config.
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },

    #[error("secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("failed to encode docker config: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub type_: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Static credentials for one registry.
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub endpoint: String,
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
struct DockerConfig<'a> {
    auths: BTreeMap<&'a str, RegistryAuth>,
}

#[derive(Serialize)]
struct RegistryAuth {
    auth: String,
    email: &'static str,
}

impl RegistryCredentials {
    /// Build the docker-config secret for `namespace`.
    pub fn docker_config_secret(&self, namespace: &str, name: &str) -> Result<Secret, SecretError> {
        let auth = STANDARD.encode(format!("{}:{}", self.username, self.password));
        let config = DockerConfig {
            auths: BTreeMap::from([(
                self.endpoint.as_str(),
                RegistryAuth {
                    auth,
                    email: "none",
                },
            )]),
        };

        Ok(Secret {
            namespace: namespace.to_string(),
            name: name.to_string(),
            type_: DOCKER_CONFIG_JSON_TYPE.to_string(),
            data: BTreeMap::from([(DOCKER_CONFIG_JSON_KEY.to_string(), serde_json::to_vec(&config)?)]),
        })
    }
}

/// Where secrets are written.
#[async_trait]
pub trait SecretTarget: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, SecretError>;
    async fn create(&self, secret: Secret) -> Result<(), SecretError>;
    async fn update(&self, secret: Secret) -> Result<(), SecretError>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), SecretError>;
}

/// In-process secret target.
#[derive(Debug, Default)]
pub struct MemorySecretTarget {
    secrets: DashMap<(String, String), Secret>,
}

impl MemorySecretTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `namespace/name` of every stored secret, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .secrets
            .iter()
            .map(|r| format!("{}/{}", r.key().0, r.key().1))
            .collect();
        keys.sort();
        keys
    }
}

fn secret_key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl SecretTarget for MemorySecretTarget {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, SecretError> {
        Ok(self
            .secrets
            .get(&secret_key(namespace, name))
            .map(|r| r.value().clone()))
    }

    async fn create(&self, secret: Secret) -> Result<(), SecretError> {
        let key = secret_key(&secret.namespace, &secret.name);
        match self.secrets.entry(key) {
            Entry::Occupied(_) => Err(SecretError::AlreadyExists {
                namespace: secret.namespace,
                name: secret.name,
            }),
            Entry::Vacant(entry) => {
                debug!(
                    namespace = %secret.namespace,
                    name = %secret.name,
                    kind = %secret.type_,
                    keys = secret.data.len(),
                    "secret stored"
                );
                entry.insert(secret);
                Ok(())
            }
        }
    }

    async fn update(&self, secret: Secret) -> Result<(), SecretError> {
        match self.secrets.get_mut(&secret_key(&secret.namespace, &secret.name)) {
            Some(mut existing) => {
                *existing = secret;
                Ok(())
            }
            None => Err(SecretError::NotFound {
                namespace: secret.namespace,
                name: secret.name,
            }),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), SecretError> {
        self.secrets
            .remove(&secret_key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| SecretError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}
