use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::{Decode, Encode, Error};

/// A network address as gossiped in `Version` and `Addr` messages.
///
/// IPv4 addresses are stored as IPv4-mapped IPv6 addresses on the wire, the
/// same convention the reference protocol uses, so a single 16-byte field
/// covers both families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetAddress {
    /// Seconds since epoch this address was last seen active. Zero for
    /// addresses embedded in a `Version` message, which carry no timestamp
    /// in the reference protocol.
    pub time: u32,
    pub stream: u32,
    pub services: u64,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16, stream: u32, services: u64) -> Self {
        Self {
            time: 0,
            stream,
            services,
            ip: to_mapped(ip),
            port,
        }
    }

    pub fn with_time(mut self, time: u32) -> Self {
        self.time = time;
        self
    }

    pub fn ip(&self) -> IpAddr {
        from_mapped(self.ip)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }

    /// A stable key identifying this address for dedup purposes, independent
    /// of the timestamp and advertised services.
    pub fn key(&self) -> (Ipv6Addr, u16) {
        (self.ip, self.port)
    }
}

fn to_mapped(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn from_mapped(ip: Ipv6Addr) -> IpAddr {
    match ip.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(ip),
    }
}

impl Default for NetAddress {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 1, 0)
    }
}

impl Encode for NetAddress {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.time.encode(writer)?;
        n += self.stream.encode(writer)?;
        n += self.services.encode(writer)?;
        n += self.ip.octets().encode(writer)?;
        n += self.port.encode(writer)?;
        Ok(n)
    }
}

impl Decode for NetAddress {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let time = u32::decode(reader)?;
        let stream = u32::decode(reader)?;
        let services = u64::decode(reader)?;
        let octets: [u8; 16] = Decode::decode(reader)?;
        let port = u16::decode(reader)?;

        Ok(Self {
            time,
            stream,
            services,
            ip: Ipv6Addr::from(octets),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{deserialize, serialize};

    #[test]
    fn round_trips_an_ipv4_address() {
        let na = NetAddress::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8444, 1, 1)
            .with_time(1_700_000_000);
        let buf = serialize(&na);
        let decoded: NetAddress = deserialize(&buf).unwrap();
        assert_eq!(decoded, na);
        assert_eq!(decoded.ip(), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn key_ignores_time_and_services() {
        let a = NetAddress::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80, 1, 0);
        let b = a.with_time(123);
        assert_eq!(a.key(), b.key());
    }
}
