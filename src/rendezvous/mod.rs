//! Session table of an open node acting as parent for natted clients.
//!
//! The registry itself is plain data driven by explicit instants; the
//! [`server`] actor owns one and feeds it requests and timer ticks.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::protocol::{
    Address, KeepAliveStatus, RegisterStatus, UnregisterStatus, VodAddress,
};

pub mod server;

pub use server::RendezvousServer;

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub client_id: u32,
    /// Where the client's packets come from, as observed by the server.
    pub public_address: Address,
    /// What the client advertises as its own address.
    pub private_address: Address,
    pub overlay_id: u32,
    pub last_seen: Instant,
    pub ttl: Duration,
    /// A delayed unregister is pending.
    pub moving: bool,
}

impl SessionEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > self.ttl
    }
}

pub struct RendezvousRegistry {
    sessions: HashMap<u32, SessionEntry>,
    /// (initiator, target) pairs the server currently forwards for.
    connections: HashSet<(u32, u32)>,
    ttl: Duration,
    max_sessions: usize,
}

impl RendezvousRegistry {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            connections: HashSet::new(),
            ttl,
            max_sessions,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Live session of `client_id`; expired entries count as absent even
    /// before the sweep removes them.
    pub fn get(&self, client_id: u32, now: Instant) -> Option<&SessionEntry> {
        self.sessions
            .get(&client_id)
            .filter(|entry| !entry.is_expired(now))
    }

    pub fn is_forwarding(&self, initiator: u32, target: u32) -> bool {
        self.connections.contains(&(initiator, target))
    }

    /// Creates or refreshes the session. A known client coming from a new
    /// public address keeps its session under the new address.
    pub fn register(&mut self, client: &VodAddress, public: Address, now: Instant) -> RegisterStatus {
        let client_id = client.node_id();
        if let Some(entry) = self.sessions.get_mut(&client_id) {
            if entry.public_address != public {
                log::info!(
                    "client {client_id} moved from {} to {public}",
                    entry.public_address
                );
            }
            entry.public_address = public;
            entry.private_address = client.addr;
            entry.overlay_id = client.overlay_id;
            entry.last_seen = now;
            entry.moving = false;
            return RegisterStatus::Accepted;
        }
        if self.sessions.len() >= self.max_sessions {
            log::warn!("reject client {client_id}: {} sessions", self.sessions.len());
            return RegisterStatus::Rejected;
        }
        self.sessions.insert(
            client_id,
            SessionEntry {
                client_id,
                public_address: public,
                private_address: client.addr,
                overlay_id: client.overlay_id,
                last_seen: now,
                ttl: self.ttl,
                moving: false,
            },
        );
        log::debug!("client {client_id} registered from {public}");
        RegisterStatus::Accepted
    }

    pub fn keepalive(&mut self, client_id: u32, public: Address, now: Instant) -> KeepAliveStatus {
        match self.sessions.get_mut(&client_id) {
            Some(entry) if !entry.is_expired(now) => {
                entry.public_address = public;
                entry.last_seen = now;
                KeepAliveStatus::Alive
            }
            _ => KeepAliveStatus::NotRegistered,
        }
    }

    /// Returns the public address the connect request must be forwarded to,
    /// or `None` if the target has no live session.
    pub fn connect(&mut self, initiator: u32, target: u32, now: Instant) -> Option<Address> {
        let public = self.get(target, now)?.public_address;
        self.connections.insert((initiator, target));
        Some(public)
    }

    pub fn delete_connection(&mut self, initiator: u32, target: u32) -> bool {
        let removed = self.connections.remove(&(initiator, target));
        self.connections.remove(&(target, initiator)) || removed
    }

    pub fn unregister(
        &mut self,
        client_id: u32,
        public: Address,
        delay: i32,
        now: Instant,
    ) -> UnregisterStatus {
        let Some(entry) = self.get(client_id, now) else {
            return UnregisterStatus::NotRegistered;
        };
        if entry.public_address != public {
            return UnregisterStatus::Fail;
        }
        if delay < 0 {
            self.remove(client_id);
            return UnregisterStatus::DelayLessThanZero;
        }
        if delay == 0 {
            self.remove(client_id);
            return UnregisterStatus::Success;
        }
        if entry.moving {
            return UnregisterStatus::AlreadyMoving;
        }
        if let Some(entry) = self.sessions.get_mut(&client_id) {
            entry.moving = true;
        }
        UnregisterStatus::Success
    }

    /// Ends a delayed unregister. A client that registered again in the
    /// meantime is kept.
    pub fn complete_move(&mut self, client_id: u32) -> bool {
        if self.sessions.get(&client_id).is_some_and(|e| e.moving) {
            self.remove(client_id);
            return true;
        }
        false
    }

    /// Removes and returns every expired session.
    pub fn sweep(&mut self, now: Instant) -> Vec<SessionEntry> {
        let expired: Vec<u32> = self
            .sessions
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.client_id)
            .collect();
        expired
            .into_iter()
            .filter_map(|client_id| self.remove(client_id))
            .collect()
    }

    fn remove(&mut self, client_id: u32) -> Option<SessionEntry> {
        self.connections
            .retain(|(initiator, target)| *initiator != client_id && *target != client_id);
        self.sessions.remove(&client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natpunch_core::nat::{AllocationPolicy, FilteringPolicy, MappingPolicy, NatDescriptor};
    use std::net::Ipv4Addr;

    const TTL: Duration = Duration::from_secs(120);

    fn client(id: u32) -> VodAddress {
        let nat = NatDescriptor::natted(
            MappingPolicy::EndpointIndependent,
            AllocationPolicy::PortPreservation,
            FilteringPolicy::AddressDependent,
        );
        VodAddress::new(Address::new(Ipv4Addr::new(192, 168, 0, 2), 4000, id), 0, nat)
    }

    fn public(id: u32, port: u16) -> Address {
        Address::new(Ipv4Addr::new(80, 1, 1, 1), port, id)
    }

    #[test]
    fn unrefreshed_session_is_unknown_after_ttl() {
        let t0 = Instant::now();
        let mut registry = RendezvousRegistry::new(TTL, 16);
        registry.register(&client(9), public(9, 5000), t0);
        assert_eq!(registry.connect(1, 9, t0 + Duration::from_secs(60)), Some(public(9, 5000)));

        let late = t0 + Duration::from_secs(121);
        assert_eq!(registry.connect(1, 9, late), None);
        let expired = registry.sweep(late);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].client_id, 9);
        assert!(registry.is_empty());
        assert!(!registry.is_forwarding(1, 9));
    }

    #[test]
    fn keepalive_extends_session() {
        let t0 = Instant::now();
        let mut registry = RendezvousRegistry::new(TTL, 16);
        registry.register(&client(9), public(9, 5000), t0);
        let t1 = t0 + Duration::from_secs(100);
        assert_eq!(registry.keepalive(9, public(9, 5000), t1), KeepAliveStatus::Alive);
        assert!(registry.sweep(t0 + Duration::from_secs(200)).is_empty());
        assert_eq!(
            registry.keepalive(9, public(9, 5000), t1 + Duration::from_secs(121)),
            KeepAliveStatus::NotRegistered
        );
        assert_eq!(registry.keepalive(3, public(3, 1), t1), KeepAliveStatus::NotRegistered);
    }

    #[test]
    fn duplicate_register_is_idempotent() {
        let t0 = Instant::now();
        let mut registry = RendezvousRegistry::new(TTL, 16);
        assert_eq!(registry.register(&client(9), public(9, 5000), t0), RegisterStatus::Accepted);
        assert_eq!(registry.register(&client(9), public(9, 5000), t0), RegisterStatus::Accepted);
        assert_eq!(registry.len(), 1);
        // a new public address replaces the old one
        registry.register(&client(9), public(9, 6000), t0);
        assert_eq!(registry.get(9, t0).unwrap().public_address, public(9, 6000));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn full_registry_rejects() {
        let t0 = Instant::now();
        let mut registry = RendezvousRegistry::new(TTL, 1);
        registry.register(&client(1), public(1, 1), t0);
        assert_eq!(registry.register(&client(2), public(2, 2), t0), RegisterStatus::Rejected);
        assert_eq!(registry.register(&client(1), public(1, 1), t0), RegisterStatus::Accepted);
    }

    #[test]
    fn unregister_statuses() {
        let t0 = Instant::now();
        let mut registry = RendezvousRegistry::new(TTL, 16);
        assert_eq!(
            registry.unregister(9, public(9, 5000), 0, t0),
            UnregisterStatus::NotRegistered
        );

        registry.register(&client(9), public(9, 5000), t0);
        assert_eq!(registry.unregister(9, public(9, 1), 0, t0), UnregisterStatus::Fail);
        assert_eq!(
            registry.unregister(9, public(9, 5000), -1, t0),
            UnregisterStatus::DelayLessThanZero
        );
        assert!(registry.is_empty());

        registry.register(&client(9), public(9, 5000), t0);
        assert_eq!(registry.unregister(9, public(9, 5000), 0, t0), UnregisterStatus::Success);
        assert!(registry.is_empty());

        registry.register(&client(9), public(9, 5000), t0);
        assert_eq!(registry.unregister(9, public(9, 5000), 500, t0), UnregisterStatus::Success);
        assert_eq!(
            registry.unregister(9, public(9, 5000), 500, t0),
            UnregisterStatus::AlreadyMoving
        );
        assert!(registry.get(9, t0).is_some());
        assert!(registry.complete_move(9));
        assert!(registry.is_empty());
        assert!(!registry.complete_move(9));
    }

    #[test]
    fn register_cancels_pending_move() {
        let t0 = Instant::now();
        let mut registry = RendezvousRegistry::new(TTL, 16);
        registry.register(&client(9), public(9, 5000), t0);
        registry.unregister(9, public(9, 5000), 500, t0);
        registry.register(&client(9), public(9, 5000), t0);
        assert!(!registry.complete_move(9));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn delete_connection_stops_forwarding() {
        let t0 = Instant::now();
        let mut registry = RendezvousRegistry::new(TTL, 16);
        registry.register(&client(9), public(9, 5000), t0);
        assert!(registry.connect(1, 9, t0).is_some());
        assert!(registry.is_forwarding(1, 9));
        assert!(registry.delete_connection(9, 1));
        assert!(!registry.is_forwarding(1, 9));
        assert!(!registry.delete_connection(1, 9));
    }
}
