//! Address pool arithmetic and the in-memory reservation set.
//!
//! The pool of a subnet is every host address between the network and
//! broadcast addresses. The first usable host is the gateway and belongs to
//! the bridge; containers are handed the remaining hosts in ascending order.

pub mod store;

use ipnetwork::Ipv4Network;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};

pub use store::{load_reservations, save_reservations, ReservationStore};

/// Parse an IPv4 CIDR strictly. Host bits may be set, truncated dotted quads are rejected.
pub fn parse_subnet(subnet: &str) -> Result<Ipv4Network> {
    let invalid = |reason: &str| Error::InvalidSubnet {
        subnet: subnet.to_string(),
        reason: reason.to_string(),
    };

    let (addr, prefix) = subnet
        .trim()
        .split_once('/')
        .ok_or_else(|| invalid("missing prefix length"))?;
    let addr = Ipv4Addr::from_str(addr).map_err(|e| invalid(&e.to_string()))?;
    let prefix = prefix.parse::<u8>().map_err(|e| invalid(&e.to_string()))?;

    Ipv4Network::new(addr, prefix).map_err(|e| invalid(&e.to_string()))
}

fn host_range(subnet: &str) -> Result<(Ipv4Network, std::ops::Range<u32>)> {
    let net = parse_subnet(subnet)?;
    if net.prefix() > 30 {
        return Err(Error::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: format!("/{} leaves fewer than 2 usable hosts", net.prefix()),
        });
    }

    let network = u32::from(net.network());
    let broadcast = u32::from(net.broadcast());
    Ok((net, network + 1..broadcast))
}

fn with_prefix(ip: u32, net: &Ipv4Network) -> Ipv4Network {
    // prefix is already validated by the parse above
    Ipv4Network::new(Ipv4Addr::from(ip), net.prefix()).unwrap_or(*net)
}

/// Every host address of `subnet` in ascending order, network and broadcast excluded.
///
/// The first element is the gateway.
pub fn usable_hosts(subnet: &str) -> Result<Vec<Ipv4Network>> {
    let (net, range) = host_range(subnet)?;
    Ok(range.map(|ip| with_prefix(ip, &net)).collect())
}

/// The gateway of `subnet`: its first usable host, carrying the subnet prefix.
pub fn gateway(subnet: &str) -> Result<Ipv4Network> {
    let (net, range) = host_range(subnet)?;
    Ok(with_prefix(range.start, &net))
}

/// Pick the lowest non-gateway host that is not reserved.
pub fn allocate(subnet: &str, reservations: &ReservationSet) -> Result<Ipv4Network> {
    let (net, range) = host_range(subnet)?;
    range
        .skip(1)
        .map(|ip| with_prefix(ip, &net))
        .find(|candidate| !reservations.contains(candidate.ip()))
        .ok_or_else(|| Error::PoolExhausted(subnet.to_string()))
}

/// Drop the first reservation holding `address`. Releasing an unknown address is a no-op.
pub fn release(address: Ipv4Addr, reservations: &mut ReservationSet) -> Option<Reservation> {
    reservations.release(address)
}

/// The container interface an address was handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub container_id: String,
    pub if_name: String,
}

impl Owner {
    pub fn new(container_id: &str, if_name: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            if_name: if_name.to_string(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container_id, self.if_name)
    }
}

/// One reserved address, optionally tagged with the interface it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub address: Ipv4Network,
    pub owner: Option<Owner>,
}

impl Reservation {
    pub fn new(address: Ipv4Network, owner: Option<Owner>) -> Self {
        Self { address, owner }
    }
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{} {}", self.address, owner),
            None => write!(f, "{}", self.address),
        }
    }
}

impl FromStr for Reservation {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let mut fields = line.split_whitespace();
        let address = fields.next().ok_or("empty reservation line")?;
        let address = parse_subnet(address).map_err(|e| e.to_string())?;

        let owner = match fields.next() {
            Some(tag) => {
                let (container_id, if_name) = tag
                    .rsplit_once('/')
                    .ok_or_else(|| format!("malformed owner tag {tag:?}"))?;
                Some(Owner::new(container_id, if_name))
            }
            None => None,
        };

        if let Some(extra) = fields.next() {
            return Err(format!("unexpected trailing field {extra:?}"));
        }

        Ok(Self { address, owner })
    }
}

/// Reserved addresses in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationSet {
    entries: Vec<Reservation>,
}

impl ReservationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.entries.iter().any(|r| r.address.ip() == address)
    }

    pub fn get(&self, address: Ipv4Addr) -> Option<&Reservation> {
        self.entries.iter().find(|r| r.address.ip() == address)
    }

    pub fn find_owner(&self, owner: &Owner) -> Option<&Reservation> {
        self.entries
            .iter()
            .find(|r| r.owner.as_ref() == Some(owner))
    }

    /// Append a reservation; survivors keep their position.
    pub fn insert(&mut self, reservation: Reservation) {
        self.entries.push(reservation);
    }

    pub fn release(&mut self, address: Ipv4Addr) -> Option<Reservation> {
        let idx = self
            .entries
            .iter()
            .position(|r| r.address.ip() == address)?;
        Some(self.entries.remove(idx))
    }

    /// Drop every reservation tagged with `owner`.
    pub fn release_owner(&mut self, owner: &Owner) -> Vec<Reservation> {
        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|r| r.owner.as_ref() == Some(owner));
        self.entries = kept;
        released
    }

    /// Drop every reservation held by any interface of `container_id`.
    pub fn release_container(&mut self, container_id: &str) -> Vec<Reservation> {
        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|r| {
                r.owner
                    .as_ref()
                    .is_some_and(|o| o.container_id == container_id)
            });
        self.entries = kept;
        released
    }
}

impl FromIterator<Reservation> for ReservationSet {
    fn from_iter<I: IntoIterator<Item = Reservation>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
