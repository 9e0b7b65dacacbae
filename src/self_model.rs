//! Identity of the local node and its current set of parents.
//!
//! A [`SelfRegistry`] is shared by every overlay instance of a node (and by
//! every node when one process simulates many). The traverser is its only
//! writer; handshakes and outgoing headers read from it.

use natpunch_core::nat::NatDescriptor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::protocol::{Address, VodAddress};

#[derive(Debug, Clone)]
struct Entry {
    nat: NatDescriptor,
    parents: Vec<Address>,
}

#[derive(Clone, Debug)]
pub struct SelfRegistry {
    nodes: Arc<RwLock<HashMap<u32, Entry>>>,
    max_parents: usize,
}

impl SelfRegistry {
    pub fn new(max_parents: usize) -> Self {
        Self {
            nodes: Default::default(),
            max_parents,
        }
    }

    /// Registers `node_id`, keeping its parents if it already exists.
    pub fn init(&self, node_id: u32, nat: NatDescriptor) {
        let mut nodes = self.nodes.write();
        nodes
            .entry(node_id)
            .and_modify(|entry| entry.nat = nat)
            .or_insert(Entry {
                nat,
                parents: Vec::new(),
            });
    }

    pub fn teardown(&self, node_id: u32) -> bool {
        self.nodes.write().remove(&node_id).is_some()
    }

    pub fn contains(&self, node_id: u32) -> bool {
        self.nodes.read().contains_key(&node_id)
    }

    pub fn nat(&self, node_id: u32) -> Option<NatDescriptor> {
        self.nodes.read().get(&node_id).map(|e| e.nat)
    }

    /// A node that turns out to be open drops all of its parents.
    pub fn set_nat(&self, node_id: u32, nat: NatDescriptor) -> bool {
        let mut nodes = self.nodes.write();
        let Some(entry) = nodes.get_mut(&node_id) else {
            return false;
        };
        entry.nat = nat;
        if nat.is_open() {
            entry.parents.clear();
        }
        true
    }

    pub fn parents(&self, node_id: u32) -> Vec<Address> {
        self.nodes
            .read()
            .get(&node_id)
            .map(|e| e.parents.clone())
            .unwrap_or_default()
    }

    /// False if the node is unknown or open, the parent is already present or
    /// the set is full.
    pub fn add_parent(&self, node_id: u32, parent: Address) -> bool {
        let mut nodes = self.nodes.write();
        let Some(entry) = nodes.get_mut(&node_id) else {
            return false;
        };
        if entry.nat.is_open()
            || entry.parents.len() >= self.max_parents
            || entry.parents.contains(&parent)
        {
            return false;
        }
        entry.parents.push(parent);
        true
    }

    pub fn remove_parent(&self, node_id: u32, parent: &Address) -> bool {
        let mut nodes = self.nodes.write();
        let Some(entry) = nodes.get_mut(&node_id) else {
            return false;
        };
        let before = entry.parents.len();
        entry.parents.retain(|p| p != parent);
        entry.parents.len() != before
    }

    pub fn max_parents(&self) -> usize {
        self.max_parents
    }
}

#[derive(Clone, Debug)]
pub struct SelfCore {
    pub addr: Address,
    pub overlay_id: u32,
    registry: SelfRegistry,
}

impl SelfCore {
    pub fn new(addr: Address, overlay_id: u32, registry: SelfRegistry) -> Self {
        Self {
            addr,
            overlay_id,
            registry,
        }
    }
}

/// The local node as seen by one overlay.
#[derive(Clone, Debug)]
pub enum SelfModel {
    /// Carries the node's current utility in the overlay.
    Full { core: SelfCore, utility: u32 },
    Minimal { core: SelfCore },
}

impl SelfModel {
    pub fn minimal(addr: Address, overlay_id: u32, registry: SelfRegistry) -> Self {
        SelfModel::Minimal {
            core: SelfCore::new(addr, overlay_id, registry),
        }
    }

    pub fn full(addr: Address, overlay_id: u32, registry: SelfRegistry, utility: u32) -> Self {
        SelfModel::Full {
            core: SelfCore::new(addr, overlay_id, registry),
            utility,
        }
    }

    pub fn core(&self) -> &SelfCore {
        match self {
            SelfModel::Full { core, .. } | SelfModel::Minimal { core } => core,
        }
    }

    pub fn registry(&self) -> &SelfRegistry {
        &self.core().registry
    }

    pub fn address(&self) -> Address {
        self.core().addr
    }

    pub fn node_id(&self) -> u32 {
        self.core().addr.node_id
    }

    pub fn overlay_id(&self) -> u32 {
        self.core().overlay_id
    }

    /// Unknown nodes are treated as open.
    pub fn nat(&self) -> NatDescriptor {
        self.registry().nat(self.node_id()).unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        self.nat().is_open()
    }

    pub fn parents(&self) -> Vec<Address> {
        self.registry().parents(self.node_id())
    }

    pub fn utility(&self) -> Option<u32> {
        match self {
            SelfModel::Full { utility, .. } => Some(*utility),
            SelfModel::Minimal { .. } => None,
        }
    }

    /// No effect on a minimal self.
    pub fn set_utility(&mut self, value: u32) {
        if let SelfModel::Full { utility, .. } = self {
            *utility = value;
        }
    }

    /// Snapshot advertised in outgoing headers.
    pub fn vod_address(&self) -> VodAddress {
        let core = self.core();
        let nat = self.nat();
        let vod = VodAddress::new(core.addr, core.overlay_id, nat);
        if nat.is_open() {
            vod
        } else {
            vod.with_parents(self.parents())
        }
    }

    /// Independent instance for another overlay. Parents stay shared through
    /// the registry.
    pub fn clone_for_overlay(&self, overlay_id: u32) -> Self {
        let mut model = self.clone();
        match &mut model {
            SelfModel::Full { core, .. } | SelfModel::Minimal { core } => {
                core.overlay_id = overlay_id
            }
        }
        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natpunch_core::nat::{AllocationPolicy, FilteringPolicy, MappingPolicy};
    use std::net::Ipv4Addr;

    fn natted() -> NatDescriptor {
        NatDescriptor::natted(
            MappingPolicy::EndpointIndependent,
            AllocationPolicy::PortPreservation,
            FilteringPolicy::AddressAndPortDependent,
        )
    }

    fn parent(id: u32) -> Address {
        Address::new(Ipv4Addr::new(1, 1, 1, id as u8), 3478, id)
    }

    #[test]
    fn parents_capped_and_unique() {
        let registry = SelfRegistry::new(2);
        registry.init(7, natted());
        assert!(registry.add_parent(7, parent(1)));
        assert!(!registry.add_parent(7, parent(1)));
        assert!(registry.add_parent(7, parent(2)));
        assert!(!registry.add_parent(7, parent(3)));
        assert!(!registry.add_parent(8, parent(3)));
        assert!(registry.remove_parent(7, &parent(1)));
        assert_eq!(registry.parents(7), vec![parent(2)]);
        assert!(registry.teardown(7));
        assert!(registry.parents(7).is_empty());
    }

    #[test]
    fn open_self_advertises_no_parents() {
        let registry = SelfRegistry::new(3);
        registry.init(7, natted());
        registry.add_parent(7, parent(1));
        let model = SelfModel::minimal(Address::new(Ipv4Addr::LOCALHOST, 1, 7), 0, registry.clone());
        assert_eq!(model.vod_address().parents, vec![parent(1)]);

        registry.set_nat(7, NatDescriptor::open());
        let vod = model.vod_address();
        assert!(vod.is_open());
        assert!(vod.parents.is_empty());
        assert!(!registry.add_parent(7, parent(2)));
    }

    #[test]
    fn overlay_clone_shares_parents() {
        let registry = SelfRegistry::new(3);
        registry.init(7, natted());
        let first = SelfModel::full(Address::new(Ipv4Addr::LOCALHOST, 1, 7), 1, registry.clone(), 5);
        let mut second = first.clone_for_overlay(2);
        second.set_utility(9);
        registry.add_parent(7, parent(1));
        assert_eq!(first.overlay_id(), 1);
        assert_eq!(second.overlay_id(), 2);
        assert_eq!(first.utility(), Some(5));
        assert_eq!(second.utility(), Some(9));
        assert_eq!(second.vod_address().parents, vec![parent(1)]);
        let minimal = SelfModel::minimal(first.address(), 1, registry);
        assert_eq!(minimal.utility(), None);
    }
}
