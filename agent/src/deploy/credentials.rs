//! Credential resolution
//!
//! Credentials are issued and scoped by an external secret store. This module
//! only looks them up by a host's `credential_ref` and keeps them wrapped in
//! [`SecretString`] so they never end up in logs or ledger records.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::errors::DeployError;
use crate::models::host::Host;

/// Default prefix for [`EnvCredentials`]
pub const ENV_PREFIX: &str = "PUSHDEPLOY_IDENTITY_";

/// Credential for one host: the path of the SSH identity to authenticate with
#[derive(Debug, Clone)]
pub struct AuthToken {
    identity: Arc<SecretString>,
}

impl AuthToken {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: Arc::new(SecretString::from(identity.into())),
        }
    }

    pub fn expose_identity(&self) -> &str {
        self.identity.expose_secret()
    }
}

/// Source of host credentials
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, host: &Host) -> Result<AuthToken, DeployError>;
}

/// Fixed credential table, keyed by credential reference
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    tokens: HashMap<String, AuthToken>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, credential_ref: impl Into<String>, token: AuthToken) {
        self.tokens.insert(credential_ref.into(), token);
    }

    pub fn with(mut self, credential_ref: impl Into<String>, token: AuthToken) -> Self {
        self.insert(credential_ref, token);
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, host: &Host) -> Result<AuthToken, DeployError> {
        self.tokens.get(&host.credential_ref).cloned().ok_or_else(|| {
            DeployError::AuthError(format!("No credential for host {}", host.name))
        })
    }
}

/// Reads `<prefix><CREDENTIAL_REF>` from the environment, with the reference
/// upper-cased and non-alphanumerics mapped to `_`
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    prefix: String,
}

impl EnvCredentials {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn var_name(&self, credential_ref: &str) -> String {
        let suffix: String = credential_ref
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new(ENV_PREFIX)
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentials {
    async fn resolve(&self, host: &Host) -> Result<AuthToken, DeployError> {
        let var = self.var_name(&host.credential_ref);
        match std::env::var(&var) {
            Ok(value) if !value.is_empty() => Ok(AuthToken::new(value)),
            _ => Err(DeployError::AuthError(format!(
                "No credential for host {} ({} unset)",
                host.name, var
            ))),
        }
    }
}

/// Tries each resolver in order, returning the first credential found
pub struct ChainedCredentials {
    resolvers: Vec<Arc<dyn CredentialResolver>>,
}

impl ChainedCredentials {
    pub fn new(resolvers: Vec<Arc<dyn CredentialResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl CredentialResolver for ChainedCredentials {
    async fn resolve(&self, host: &Host) -> Result<AuthToken, DeployError> {
        let mut last_err = None;
        for resolver in &self.resolvers {
            match resolver.resolve(host).await {
                Ok(token) => return Ok(token),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            DeployError::AuthError(format!("No credential for host {}", host.name))
        }))
    }
}
