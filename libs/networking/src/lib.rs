//! IPv4 address pool allocation and WireGuard key/peer types for the overlay
//! network described in the control plane's IPAM design.
//!
//! Two allocators live here:
//! - [`Ipv4Allocator`] hands out single host addresses from a pool (used for
//!   loopback `/32`s).
//! - [`LinkAllocator`] hands out `/31` point-to-point subnets, one per
//!   hub-worker or hub-hub link, by walking the enclosing prefix two
//!   addresses at a time.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the allocators and WireGuard types in this crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    #[error("address pool exhausted")]
    PoolExhausted,

    #[error("hub-worker listen port space exhausted for hub {hub_number} (worker id {worker_id} >= 1000)")]
    PortSpaceExhausted { hub_number: i32, worker_id: i64 },

    #[error("invalid WireGuard key: {0}")]
    InvalidKey(String),
}

/// An IPv4 CIDR prefix, e.g. `10.255.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Prefix {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Prefix {
    /// Parses a prefix from its `a.b.c.d/n` textual form, masking the address
    /// down to its network portion.
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let (addr_part, len_part) = s
            .split_once('/')
            .ok_or_else(|| NetworkError::InvalidPrefix(s.to_string()))?;
        let addr = Ipv4Addr::from_str(addr_part)
            .map_err(|_| NetworkError::InvalidAddress(addr_part.to_string()))?;
        let prefix_len: u8 = len_part
            .parse()
            .map_err(|_| NetworkError::InvalidPrefix(s.to_string()))?;
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(s.to_string()));
        }
        Ok(Self {
            network: mask(addr, prefix_len),
            prefix_len,
        })
    }

    /// The network address (masked).
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// The prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The broadcast address of this prefix.
    pub fn broadcast(&self) -> Ipv4Addr {
        let mask_bits = host_mask(self.prefix_len);
        Ipv4Addr::from(u32::from(self.network) | mask_bits)
    }

    /// Whether `addr` falls within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask_bits = !host_mask(self.prefix_len);
        (u32::from(addr) & mask_bits) == (u32::from(self.network) & mask_bits)
    }

    /// The number of addresses in this prefix (including network/broadcast).
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix_len as u32)
    }

    /// The first usable host address, skipping the network address itself.
    pub fn first_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn host_mask(prefix_len: u8) -> u32 {
    if prefix_len >= 32 {
        0
    } else {
        (1u32 << (32 - prefix_len as u32)) - 1
    }
}

fn mask(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let net_mask = !host_mask(prefix_len);
    Ipv4Addr::from(u32::from(addr) & net_mask)
}

fn next_addr(addr: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr).wrapping_add(1))
}

/// Allocates single host addresses (used for loopback `/32`s) from a prefix,
/// skipping addresses the caller has already claimed.
///
/// The allocator holds no allocation state itself: callers pass in the set
/// of addresses already taken, read fresh from the store on each call, which
/// matches the control plane's "the row is the source of truth" discipline.
pub struct Ipv4Allocator {
    prefix: Ipv4Prefix,
}

impl Ipv4Allocator {
    pub fn new(prefix: Ipv4Prefix) -> Self {
        Self { prefix }
    }

    /// Returns the first address in the prefix, starting at `first_host()`,
    /// not present in `taken`.
    pub fn allocate(&self, taken: &[Ipv4Addr]) -> Result<Ipv4Addr, NetworkError> {
        let mut candidate = self.prefix.first_host();
        let broadcast = self.prefix.broadcast();
        loop {
            if candidate >= broadcast {
                return Err(NetworkError::PoolExhausted);
            }
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
            candidate = next_addr(candidate);
        }
    }
}

/// Allocates `/31` point-to-point links from a prefix, walking two addresses
/// at a time since each `/31` consumes a pair.
pub struct LinkAllocator {
    prefix: Ipv4Prefix,
}

/// A single allocated `/31` link: the two host addresses plus the subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSubnet {
    pub lower: Ipv4Addr,
    pub higher: Ipv4Addr,
}

impl LinkSubnet {
    pub fn cidr(&self) -> String {
        format!("{}/31", self.lower)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr == self.lower || addr == self.higher
    }
}

impl LinkAllocator {
    pub fn new(prefix: Ipv4Prefix) -> Self {
        Self { prefix }
    }

    /// Returns the first `/31` pair not overlapping any subnet already in
    /// `taken`.
    pub fn allocate(&self, taken: &[LinkSubnet]) -> Result<LinkSubnet, NetworkError> {
        let mut lower = self.prefix.network();
        let broadcast = self.prefix.broadcast();
        loop {
            let higher = next_addr(lower);
            if higher > broadcast {
                return Err(NetworkError::PoolExhausted);
            }
            let candidate = LinkSubnet { lower, higher };
            let overlaps = taken.iter().any(|t| {
                t.lower == lower || t.lower == higher || t.higher == lower || t.higher == higher
            });
            if !overlaps {
                return Ok(candidate);
            }
            lower = next_addr(higher);
        }
    }
}

// ---------------------------------------------------------------------------
// WireGuard types
// ---------------------------------------------------------------------------

/// Default persistent-keepalive used on the hub side of a link, seconds.
pub const HUB_SIDE_KEEPALIVE_SECS: u32 = 25;

/// OSPF multicast address every WireGuard peer's allowed-ips carries.
pub const OSPF_MULTICAST_ALLOWED_IP: &str = "224.0.0.5/32";

/// A base64-encoded WireGuard public key, validated to decode to 32 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WgPublicKey(String);

impl WgPublicKey {
    pub fn from_base64(s: &str) -> Result<Self, NetworkError> {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|_| NetworkError::InvalidKey(s.to_string()))?;
        if decoded.len() != 32 {
            return Err(NetworkError::InvalidKey(s.to_string()));
        }
        Ok(Self(s.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// An unpopulated key placeholder, used before the agent uploads one.
    pub fn empty() -> Self {
        Self(String::new())
    }
}

impl fmt::Display for WgPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer entry within a rendered WireGuard interface config.
#[derive(Debug, Clone)]
pub struct WgPeer {
    pub public_key: WgPublicKey,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: u32,
}

impl WgPeer {
    pub fn new(public_key: WgPublicKey, allowed_ips: Vec<String>) -> Self {
        Self {
            public_key,
            endpoint: None,
            allowed_ips,
            persistent_keepalive: 0,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_keepalive(mut self, seconds: u32) -> Self {
        self.persistent_keepalive = seconds;
        self
    }
}

/// A rendered WireGuard interface: one `[Interface]` block plus its peers.
#[derive(Debug, Clone)]
pub struct WgInterface {
    pub name: String,
    pub listen_port: u16,
    pub private_key: Option<String>,
    pub peers: Vec<WgPeer>,
}

impl WgInterface {
    pub fn new(name: impl Into<String>, listen_port: u16) -> Self {
        Self {
            name: name.into(),
            listen_port,
            private_key: None,
            peers: Vec::new(),
        }
    }

    pub fn add_peer(&mut self, peer: WgPeer) {
        self.peers.push(peer);
    }

    pub fn find_peer(&self, key: &WgPublicKey) -> Option<&WgPeer> {
        self.peers.iter().find(|p| &p.public_key == key)
    }

    /// Renders the `[Interface]` + `[Peer]...` config text.
    ///
    /// When `private_key` hasn't been set the file carries the
    /// `PRIVATE_KEY_PLACEHOLDER` sentinel; the agent substitutes the real key
    /// locally before writing the file to disk, so the control plane never
    /// needs to see it.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("ListenPort = {}\n", self.listen_port));
        match &self.private_key {
            Some(key) => out.push_str(&format!("PrivateKey = {key}\n")),
            None => out.push_str("PrivateKey = PRIVATE_KEY_PLACEHOLDER\n"),
        }

        for peer in &self.peers {
            if peer.public_key.is_empty() {
                continue;
            }
            out.push('\n');
            out.push_str("[Peer]\n");
            out.push_str(&format!("PublicKey = {}\n", peer.public_key));
            if !peer.allowed_ips.is_empty() {
                out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ips.join(", ")));
            }
            if let Some(endpoint) = &peer.endpoint {
                out.push_str(&format!("Endpoint = {endpoint}\n"));
            }
            if peer.persistent_keepalive > 0 {
                out.push_str(&format!(
                    "PersistentKeepalive = {}\n",
                    peer.persistent_keepalive
                ));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_masks_to_network_address() {
        let p = Ipv4Prefix::from_cidr("10.255.3.17/16").unwrap();
        assert_eq!(p.network(), Ipv4Addr::new(10, 255, 0, 0));
        assert_eq!(p.to_string(), "10.255.0.0/16");
    }

    #[test]
    fn prefix_contains() {
        let p = Ipv4Prefix::from_cidr("10.255.0.0/16").unwrap();
        assert!(p.contains(Ipv4Addr::new(10, 255, 200, 1)));
        assert!(!p.contains(Ipv4Addr::new(10, 254, 0, 1)));
    }

    #[test]
    fn ipv4_allocator_skips_taken() {
        let p = Ipv4Prefix::from_cidr("10.255.0.0/24").unwrap();
        let alloc = Ipv4Allocator::new(p);
        let taken = vec![Ipv4Addr::new(10, 255, 0, 1), Ipv4Addr::new(10, 255, 0, 2)];
        let next = alloc.allocate(&taken).unwrap();
        assert_eq!(next, Ipv4Addr::new(10, 255, 0, 3));
    }

    #[test]
    fn ipv4_allocator_exhausts() {
        let p = Ipv4Prefix::from_cidr("10.255.0.0/30").unwrap();
        let alloc = Ipv4Allocator::new(p);
        let taken: Vec<Ipv4Addr> = (1..3).map(|i| Ipv4Addr::new(10, 255, 0, i)).collect();
        assert_eq!(alloc.allocate(&taken), Err(NetworkError::PoolExhausted));
    }

    #[test]
    fn link_allocator_walks_by_twos() {
        let p = Ipv4Prefix::from_cidr("10.254.0.0/24").unwrap();
        let alloc = LinkAllocator::new(p);
        let first = alloc.allocate(&[]).unwrap();
        assert_eq!(first.lower, Ipv4Addr::new(10, 254, 0, 0));
        assert_eq!(first.higher, Ipv4Addr::new(10, 254, 0, 1));

        let second = alloc.allocate(&[first]).unwrap();
        assert_eq!(second.lower, Ipv4Addr::new(10, 254, 0, 2));
        assert_eq!(second.higher, Ipv4Addr::new(10, 254, 0, 3));
    }

    #[test]
    fn link_allocator_disjoint_under_many_allocations() {
        let p = Ipv4Prefix::from_cidr("10.253.0.0/20").unwrap();
        let alloc = LinkAllocator::new(p);
        let mut taken: Vec<LinkSubnet> = Vec::new();
        for _ in 0..100 {
            let link = alloc.allocate(&taken).unwrap();
            for existing in &taken {
                assert!(!existing.contains(link.lower));
                assert!(!existing.contains(link.higher));
            }
            taken.push(link);
        }
    }

    #[test]
    fn interface_renders_placeholder_without_private_key() {
        let iface = WgInterface::new("wg0", 51820);
        assert!(iface.render().contains("PrivateKey = PRIVATE_KEY_PLACEHOLDER"));
    }

    #[test]
    fn interface_skips_peers_without_public_key() {
        let mut iface = WgInterface::new("wg0", 51820);
        iface.private_key = Some("abc".into());
        iface.add_peer(WgPeer::new(WgPublicKey::empty(), vec!["10.0.0.0/32".into()]));
        assert!(!iface.render().contains("[Peer]"));
    }

    #[test]
    fn public_key_rejects_wrong_length() {
        use base64::Engine;
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert!(WgPublicKey::from_base64(&short).is_err());
    }

    #[test]
    fn public_key_accepts_32_bytes() {
        use base64::Engine;
        let valid = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        assert!(WgPublicKey::from_base64(&valid).is_ok());
    }
}
