//! Deployment target hosts

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A remote machine being deployed to
///
/// Holds only a reference to its credential; the secret itself is resolved
/// per command by a [`CredentialResolver`](crate::deploy::credentials::CredentialResolver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Identifier used for lookup and per-host locking
    pub name: String,

    /// DNS name or IP address
    pub address: String,

    /// SSH port
    pub port: u16,

    /// Remote login user
    pub user: String,

    /// Key into the credential store
    pub credential_ref: String,

    /// Timeout for establishing the channel
    pub connect_timeout: Duration,
}

impl Host {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            credential_ref: name.clone(),
            name,
            address: address.into(),
            port: 22,
            user: "deploy".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// `user@address`, as passed to the ssh client
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}
