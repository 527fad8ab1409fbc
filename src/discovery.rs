//! Registry Discovery Module
//!
//! How a storage peer finds registry addresses is an environment concern; the
//! daemon only depends on the [`RegistryLocator`] seam. The static locator
//! serves deployments where the registry address is configured directly.

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("invalid registry address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("no registry found")]
    NoRegistryFound,
}

/// Yields candidate registry control addresses, most preferred first.
#[async_trait]
pub trait RegistryLocator: Send + Sync {
    async fn locate(&self) -> Result<Vec<SocketAddr>, DiscoveryError>;
}

/// Locator backed by a fixed, configured address list.
pub struct StaticLocator {
    addrs: Vec<SocketAddr>,
}

impl StaticLocator {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        StaticLocator { addrs }
    }

    pub fn from_address(address: &str) -> Result<Self, DiscoveryError> {
        let addr = address
            .parse::<SocketAddr>()
            .map_err(|e| DiscoveryError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(StaticLocator { addrs: vec![addr] })
    }
}

#[async_trait]
impl RegistryLocator for StaticLocator {
    async fn locate(&self) -> Result<Vec<SocketAddr>, DiscoveryError> {
        if self.addrs.is_empty() {
            return Err(DiscoveryError::NoRegistryFound);
        }
        Ok(self.addrs.clone())
    }
}
