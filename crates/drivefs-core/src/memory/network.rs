//! In-memory network configuration registry.

use crate::drive::{NetworkConfig, NetworkConfigRequest, NetworkConfiguration};
use crate::error::DriveResult;
use crate::key::DiscoveryKey;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Network configuration shared by every connection to one backend.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    configs: DashMap<DiscoveryKey, NetworkConfiguration>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of drives with a configuration.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[async_trait]
impl NetworkConfig for MemoryNetwork {
    async fn get(&self, discovery_key: DiscoveryKey) -> DriveResult<Option<NetworkConfiguration>> {
        Ok(self.configs.get(&discovery_key).map(|c| *c))
    }

    async fn configure(
        &self,
        discovery_key: DiscoveryKey,
        request: NetworkConfigRequest,
    ) -> DriveResult<Option<NetworkConfiguration>> {
        let (announce, lookup) = match request.copy_from {
            Some(source) => match self.configs.get(&source).map(|c| *c) {
                Some(parent) => (parent.announce, parent.lookup),
                None => {
                    tracing::trace!(%source, "no configuration to copy");
                    return Ok(self.configs.get(&discovery_key).map(|c| *c));
                }
            },
            None => (request.announce, request.lookup),
        };
        let next = NetworkConfiguration {
            announce,
            lookup,
            remember: request.remember,
        };
        match self.configs.entry(discovery_key) {
            Entry::Occupied(existing) if !request.overwrite => Ok(Some(*existing.get())),
            Entry::Occupied(mut existing) => {
                existing.insert(next);
                Ok(Some(next))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(next);
                Ok(Some(next))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::DriveKey;

    fn dkey(b: u8) -> DiscoveryKey {
        DriveKey::from_bytes([b; 32]).discovery_key()
    }

    #[tokio::test]
    async fn test_configure_without_overwrite_keeps_existing() {
        let net = MemoryNetwork::new();
        let announce = NetworkConfigRequest {
            announce: true,
            lookup: true,
            remember: true,
            ..Default::default()
        };
        net.configure(dkey(1), announce).await.unwrap();
        let kept = net
            .configure(dkey(1), NetworkConfigRequest::lookup_only())
            .await
            .unwrap()
            .unwrap();
        assert!(kept.announce);

        let replaced = net
            .configure(
                dkey(1),
                NetworkConfigRequest {
                    overwrite: true,
                    ..NetworkConfigRequest::lookup_only()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(!replaced.announce);
        assert!(replaced.lookup);
    }

    #[tokio::test]
    async fn test_copy_from_parent() {
        let net = MemoryNetwork::new();
        net.configure(
            dkey(1),
            NetworkConfigRequest {
                announce: true,
                lookup: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let child = net
            .configure(dkey(2), NetworkConfigRequest::inherit(dkey(1)))
            .await
            .unwrap()
            .unwrap();
        assert!(child.announce && child.lookup);
    }

    #[tokio::test]
    async fn test_copy_from_missing_parent_is_noop() {
        let net = MemoryNetwork::new();
        let res = net
            .configure(dkey(2), NetworkConfigRequest::inherit(dkey(1)))
            .await
            .unwrap();
        assert!(res.is_none());
        assert!(net.is_empty());
    }
}
