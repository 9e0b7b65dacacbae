use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

/// Bijective `port -> local address -> channel` table for one transport.
pub struct PortTable<C> {
    by_port: HashMap<u16, SocketAddr>,
    by_addr: HashMap<SocketAddr, C>,
}

impl<C> Default for PortTable<C> {
    fn default() -> Self {
        Self {
            by_port: HashMap::new(),
            by_addr: HashMap::new(),
        }
    }
}

impl<C> PortTable<C> {
    /// Rejects the insert, handing the channel back, if either the port or
    /// the address is taken.
    pub fn insert(&mut self, addr: SocketAddr, channel: C) -> Result<(), C> {
        if self.by_port.contains_key(&addr.port()) || self.by_addr.contains_key(&addr) {
            return Err(channel);
        }
        self.by_port.insert(addr.port(), addr);
        self.by_addr.insert(addr, channel);
        Ok(())
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.by_port.contains_key(&port)
    }

    pub fn addr(&self, port: u16) -> Option<SocketAddr> {
        self.by_port.get(&port).copied()
    }

    pub fn get(&self, port: u16) -> Option<&C> {
        self.by_port.get(&port).and_then(|addr| self.by_addr.get(addr))
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&C> {
        self.by_addr.get(addr)
    }

    pub fn remove(&mut self, port: u16) -> Option<(SocketAddr, C)> {
        let addr = self.by_port.remove(&port)?;
        self.by_addr.remove(&addr).map(|c| (addr, c))
    }

    pub fn ports(&self) -> BTreeSet<u16> {
        self.by_port.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_port.clear();
        self.by_addr.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_bijective(&self) -> bool {
        self.by_port.len() == self.by_addr.len()
            && self
                .by_port
                .iter()
                .all(|(port, addr)| addr.port() == *port && self.by_addr.contains_key(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn duplicate_port_rejected() {
        let mut table = PortTable::default();
        assert!(table.insert(addr(50001), "a").is_ok());
        assert_eq!(
            table.insert(SocketAddr::from(([10, 0, 0, 1], 50001)), "b"),
            Err("b")
        );
        assert_eq!(table.get(50001), Some(&"a"));
        assert!(table.is_bijective());
    }

    #[test]
    fn remove_clears_both_directions() {
        let mut table = PortTable::default();
        table.insert(addr(50001), 1).unwrap();
        table.insert(addr(50002), 2).unwrap();
        assert_eq!(table.remove(50001), Some((addr(50001), 1)));
        assert!(table.get_by_addr(&addr(50001)).is_none());
        assert!(table.remove(50001).is_none());
        assert_eq!(table.ports(), BTreeSet::from([50002]));
        assert!(table.is_bijective());
    }

    #[test]
    fn random_bind_release_stays_bijective() {
        let mut rng = rand::thread_rng();
        let mut table = PortTable::default();
        for i in 0..2000u32 {
            let port = rng.gen_range(50000..50050);
            if rng.gen_bool(0.6) {
                _ = table.insert(addr(port), i);
            } else {
                table.remove(port);
            }
            assert!(table.is_bijective());
        }
    }
}
