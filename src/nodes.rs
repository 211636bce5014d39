//! Service-node directory client. The registry itself (pubkey to advertised
//! services) is an external collaborator; the coordinator consumes it as a
//! read-only directory and selects relay nodes from it.

use bitcoin::hashes::{hash160, Hash};
use rand::seq::SliceRandom;
use rand::thread_rng;

use std::collections::{BTreeSet, HashSet};

/// One registered service node.
#[derive(Debug, Clone)]
pub struct ServiceNodeEntry {
    /// 33-byte compressed public key identifying the node.
    pub pubkey: Vec<u8>,
    /// Wallet services the node advertises, by currency ticker.
    pub services: BTreeSet<String>,
    pub protocol_version: u32,
    /// Fee-chain address receiving taker fees.
    pub collateral_address: String,
    pub running: bool,
}

impl ServiceNodeEntry {
    /// 20-byte relay address of the node.
    pub fn address(&self) -> Vec<u8> {
        hash160::Hash::hash(&self.pubkey).into_inner().to_vec()
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains(service)
    }
}

/// Read-only view of the service-node registry.
pub trait NodeDirectory: Send + Sync {
    fn list(&self) -> Vec<ServiceNodeEntry>;

    fn get(&self, pubkey: &[u8]) -> Option<ServiceNodeEntry> {
        self.list().into_iter().find(|n| n.pubkey == pubkey)
    }

    /// Whether this process itself runs a registered, started service node.
    fn active_node(&self) -> Option<ServiceNodeEntry> {
        None
    }

    /// Announce this node's services to the network. No-op for traders.
    fn send_ping(&self) {}
}

/// Nodes advertising every requested service at the given protocol version,
/// excluding `not_in`, in uniform-random order.
pub fn find_shuffled_nodes_with_service(
    directory: &dyn NodeDirectory,
    services: &BTreeSet<String>,
    version: u32,
    not_in: &HashSet<Vec<u8>>,
) -> Vec<ServiceNodeEntry> {
    let mut list: Vec<ServiceNodeEntry> = directory
        .list()
        .into_iter()
        .filter(|n| {
            n.running
                && n.protocol_version == version
                && !not_in.contains(&n.pubkey)
                && services.iter().all(|s| n.has_service(s))
        })
        .collect();
    list.shuffle(&mut thread_rng());
    list
}

/// Whether `pubkey` is a running node advertising `service`.
pub fn has_node_service(directory: &dyn NodeDirectory, pubkey: &[u8], service: &str) -> bool {
    match directory.get(pubkey) {
        Some(node) => node.running && node.has_service(service),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticDirectory(Vec<ServiceNodeEntry>);

    impl NodeDirectory for StaticDirectory {
        fn list(&self) -> Vec<ServiceNodeEntry> {
            self.0.clone()
        }
    }

    fn node(tag: u8, services: &[&str], version: u32, running: bool) -> ServiceNodeEntry {
        ServiceNodeEntry {
            pubkey: vec![tag; 33],
            services: services.iter().map(|s| s.to_string()).collect(),
            protocol_version: version,
            collateral_address: String::new(),
            running,
        }
    }

    fn wanted(services: &[&str]) -> BTreeSet<String> {
        services.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn selection_filters_by_service_version_and_exclusion() {
        let dir = StaticDirectory(vec![
            node(1, &["BTC", "LTC"], 49, true),
            node(2, &["BTC"], 49, true),
            node(3, &["BTC", "LTC"], 48, true),
            node(4, &["BTC", "LTC"], 49, false),
            node(5, &["BTC", "LTC"], 49, true),
        ]);

        let mut not_in = HashSet::new();
        not_in.insert(vec![5u8; 33]);

        let picked = find_shuffled_nodes_with_service(&dir, &wanted(&["BTC", "LTC"]), 49, &not_in);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].pubkey, vec![1u8; 33]);
    }

    #[test]
    fn selection_keeps_all_eligible() {
        let dir = StaticDirectory(vec![
            node(1, &["BTC", "LTC"], 49, true),
            node(2, &["BTC", "LTC"], 49, true),
        ]);
        let picked =
            find_shuffled_nodes_with_service(&dir, &wanted(&["BTC"]), 49, &HashSet::new());
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn service_lookup() {
        let dir = StaticDirectory(vec![node(1, &["BTC"], 49, true), node(2, &["LTC"], 49, false)]);
        assert!(has_node_service(&dir, &[1u8; 33], "BTC"));
        assert!(!has_node_service(&dir, &[1u8; 33], "LTC"));
        // Stopped nodes never match.
        assert!(!has_node_service(&dir, &[2u8; 33], "LTC"));
        assert!(!has_node_service(&dir, &[9u8; 33], "BTC"));
    }

    #[test]
    fn node_address_is_key_hash() {
        let n = node(7, &["BTC"], 49, true);
        assert_eq!(n.address().len(), 20);
    }
}
