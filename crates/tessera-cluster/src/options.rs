//! Cluster construction options.
//!
//! Addressing is explicit: whether nodes advertise a cluster address, and
//! where those addresses come from, is part of the options a cluster is
//! built with rather than process-wide state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tessera_core::{SealError, SealResult, SealSettings};

/// Offset between a node's API port and its cluster port
pub const CLUSTER_PORT_OFFSET: u16 = 10;

/// Resolves the replication address of a node
pub trait ServerAddressProvider: Send + Sync + fmt::Debug {
    /// Address node `index` listens on for replication traffic
    fn server_addr(&self, index: usize) -> SealResult<SocketAddr>;
}

/// Loopback addresses at `base_port + CLUSTER_PORT_OFFSET + index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardcodedAddressProvider {
    /// API port of node 0
    pub base_port: u16,
    /// Nodes the provider knows about
    pub num_nodes: usize,
}

impl ServerAddressProvider for HardcodedAddressProvider {
    fn server_addr(&self, index: usize) -> SealResult<SocketAddr> {
        if index >= self.num_nodes {
            return Err(SealError::invalid_request(format!(
                "no address for node {index}; cluster has {} nodes",
                self.num_nodes
            )));
        }
        port_for(self.base_port, CLUSTER_PORT_OFFSET as usize + index)
            .map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }
}

fn port_for(base: u16, offset: usize) -> SealResult<u16> {
    u16::try_from(offset)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| SealError::invalid_request(format!("port {base}+{offset} out of range")))
}

/// How a test or embedded cluster is laid out
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Number of nodes
    pub num_nodes: usize,
    /// API port of node 0; node `i` listens on `base_port + i`
    pub base_port: u16,
    /// Whether nodes advertise their cluster address to peers
    pub advertise_cluster_addr: bool,
    /// Source of cluster addresses when advertising
    pub address_provider: Option<Arc<dyn ServerAddressProvider>>,
    /// Share-set shape used when initialising
    pub seal: SealSettings,
}

impl ClusterOptions {
    /// Options for `num_nodes` nodes starting at `base_port`
    pub fn new(num_nodes: usize, base_port: u16) -> Self {
        Self {
            num_nodes,
            base_port,
            advertise_cluster_addr: false,
            address_provider: None,
            seal: SealSettings::default(),
        }
    }

    /// Advertise cluster addresses resolved by the hardcoded provider
    pub fn with_advertised_addresses(mut self) -> Self {
        self.advertise_cluster_addr = true;
        self.address_provider = Some(Arc::new(HardcodedAddressProvider {
            base_port: self.base_port,
            num_nodes: self.num_nodes,
        }));
        self
    }

    /// Use a custom share-set shape
    pub fn with_seal_settings(mut self, seal: SealSettings) -> Self {
        self.seal = seal;
        self
    }

    /// API address of node `index`
    pub fn api_addr(&self, index: usize) -> SealResult<SocketAddr> {
        port_for(self.base_port, index).map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    /// Address node `index` is reached at by peers.
    ///
    /// Without advertising, peers use the API address.
    pub fn cluster_addr(&self, index: usize) -> SealResult<SocketAddr> {
        match (&self.address_provider, self.advertise_cluster_addr) {
            (Some(provider), true) => provider.server_addr(index),
            _ => self.api_addr(index),
        }
    }

    /// Node whose cluster address is `addr`
    pub fn node_at(&self, addr: SocketAddr) -> SealResult<usize> {
        for index in 0..self.num_nodes {
            if self.cluster_addr(index)? == addr {
                return Ok(index);
            }
        }
        Err(SealError::invalid_request(format!(
            "no node is reachable at {addr}"
        )))
    }

    /// Reject layouts that cannot form a cluster
    pub fn validate(&self) -> SealResult<()> {
        if self.num_nodes == 0 {
            return Err(SealError::invalid_request("a cluster needs at least one node"));
        }
        if self.advertise_cluster_addr && self.address_provider.is_none() {
            return Err(SealError::invalid_request(
                "advertising cluster addresses requires an address provider",
            ));
        }
        port_for(self.base_port, self.num_nodes + CLUSTER_PORT_OFFSET as usize)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses() {
        let options = ClusterOptions::new(3, 21000);
        assert_eq!(options.api_addr(2).unwrap().port(), 21002);
        assert_eq!(options.cluster_addr(2).unwrap().port(), 21002);

        let options = options.with_advertised_addresses();
        assert_eq!(options.cluster_addr(2).unwrap().port(), 21012);
        assert_eq!(
            options.node_at(options.cluster_addr(1).unwrap()).unwrap(),
            1
        );
        assert!(options.node_at("127.0.0.1:1".parse().unwrap()).is_err());
    }

    #[test]
    fn test_validate() {
        ClusterOptions::new(5, 20000).validate().unwrap();
        assert!(ClusterOptions::new(0, 20000).validate().is_err());
        assert!(ClusterOptions::new(5, u16::MAX).validate().is_err());

        let mut options = ClusterOptions::new(5, 20000);
        options.advertise_cluster_addr = true;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_provider_bounds() {
        let provider = HardcodedAddressProvider {
            base_port: 20000,
            num_nodes: 2,
        };
        assert!(provider.server_addr(1).is_ok());
        assert!(provider.server_addr(2).is_err());
    }
}
