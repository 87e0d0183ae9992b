//! The address manager collaborator: routability decisions, best-local-
//! address selection, and the node's address cache. Out of scope for this
//! engine (see the module overview); consumed here only through the
//! [`AddressManager`] trait, with an in-memory implementation for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::wire::NetAddress;

/// Where an address entry came from, mirroring the reference protocol's
/// distinction between self-reported and peer-gossiped addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSource {
    /// The peer advertised this as its own listening address.
    SelfReported,
    /// Learned from an `Addr` message relayed by some peer.
    Gossiped,
}

pub trait AddressManager: Send + Sync {
    /// The best local address to advertise to a peer reachable at `remote`,
    /// if this node has one that's routable to it.
    fn best_local_address(&self, remote: &NetAddress) -> Option<NetAddress>;

    /// Whether `addr` is routable from the public internet (used to decide
    /// whether to advertise it).
    fn is_routable(&self, addr: &NetAddress) -> bool;

    /// Marks an address as confirmed-good (successful handshake observed).
    fn good(&self, addr: &NetAddress);

    /// Marks an address as attempted (outbound dial was initiated).
    fn attempt(&self, addr: &NetAddress);

    /// Marks an address as connected.
    fn connected(&self, addr: &NetAddress);

    /// Records a single address, deduplicating by [`NetAddress::key`].
    fn add_address(&self, addr: NetAddress, source: AddressSource);

    /// Records a batch of addresses, as from an `Addr` message.
    fn add_addresses(&self, addrs: &[NetAddress], source: AddressSource) {
        for addr in addrs {
            self.add_address(*addr, source);
        }
    }

    /// Builds a [`NetAddress`] for a freshly-resolved host/port pair.
    fn host_to_net_address(&self, ip: std::net::IpAddr, port: u16, stream: u32, services: u64) -> NetAddress {
        NetAddress::new(ip, port, stream, services)
    }

    /// The current address cache, suitable for a bootstrap `Addr` message.
    fn address_cache(&self) -> Vec<NetAddress>;

    /// A stable string key for `addr`, usable as a hash map key or log tag.
    fn net_address_key(&self, addr: &NetAddress) -> String {
        let (ip, port) = addr.key();
        format!("{ip}:{port}")
    }
}

/// A simple in-memory address manager, sufficient for tests and the
/// integration harness in this crate. Production deployments would back
/// this with a persistent store, the way the node keeps one on disk.
#[derive(Default)]
pub struct InMemoryAddressManager {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    addresses: HashMap<(std::net::Ipv6Addr, u16), NetAddress>,
    local_addresses: Vec<NetAddress>,
}

impl InMemoryAddressManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a local address this node may advertise to peers.
    pub fn add_local_address(&self, addr: NetAddress) {
        self.inner.lock().unwrap().local_addresses.push(addr);
    }
}

impl AddressManager for InMemoryAddressManager {
    fn best_local_address(&self, _remote: &NetAddress) -> Option<NetAddress> {
        self.inner.lock().unwrap().local_addresses.first().copied()
    }

    fn is_routable(&self, addr: &NetAddress) -> bool {
        !addr.ip().is_loopback() && !addr.ip().is_unspecified()
    }

    fn good(&self, _addr: &NetAddress) {}

    fn attempt(&self, _addr: &NetAddress) {}

    fn connected(&self, _addr: &NetAddress) {}

    fn add_address(&self, addr: NetAddress, _source: AddressSource) {
        self.inner.lock().unwrap().addresses.insert(addr.key(), addr);
    }

    fn address_cache(&self) -> Vec<NetAddress> {
        self.inner.lock().unwrap().addresses.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn dedups_by_key_ignoring_time() {
        let mgr = InMemoryAddressManager::new();
        let a = NetAddress::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80, 1, 0);
        mgr.add_address(a, AddressSource::Gossiped);
        mgr.add_address(a.with_time(999), AddressSource::Gossiped);

        assert_eq!(mgr.address_cache().len(), 1);
    }

    #[test]
    fn loopback_is_not_routable() {
        let mgr = InMemoryAddressManager::new();
        let a = NetAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 80, 1, 0);
        assert!(!mgr.is_routable(&a));
    }
}
