//! Kademlia DHT construction and bootstrap peer selection.

use std::num::NonZeroUsize;
use std::time::Duration;

use libp2p::kad::{self, store::MemoryStore};
use libp2p::multiaddr::{Multiaddr, Protocol};
use libp2p::{PeerId, StreamProtocol};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{P2pError, P2pResult};

/// DHT protocol namespace shared by every soroban node.
pub const DHT_PROTOCOL: StreamProtocol = StreamProtocol::new("/soroban/kad/1.0.0");
/// Upper bound on bootstrap peers used, whatever the configured list length.
pub const MAX_BOOTSTRAP_PEERS: usize = 2;
/// Internal query concurrency.
pub const DHT_CONCURRENCY: usize = 16;
/// Lifetime of rendezvous provider records.
pub const RENDEZVOUS_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Bootstrap,
    Regular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtMode {
    Client,
    Server,
    Auto,
}

impl DhtMode {
    pub fn as_kad(self) -> Option<kad::Mode> {
        match self {
            DhtMode::Client => Some(kad::Mode::Client),
            DhtMode::Server => Some(kad::Mode::Server),
            DhtMode::Auto => None,
        }
    }
}

/// A node is a bootstrap node when one of its listen addresses prefixes a bootstrap address.
///
/// Addresses are compared segment by segment. An unspecified listen IP
/// (`0.0.0.0`, `::`) stands for every interface and matches any IP of its family.
pub fn node_role(listen: &[Multiaddr], bootstrap: &[Multiaddr]) -> NodeRole {
    let is_bootstrap = bootstrap
        .iter()
        .any(|b| listen.iter().any(|l| is_prefix_of(l, b)));
    if is_bootstrap {
        NodeRole::Bootstrap
    } else {
        NodeRole::Regular
    }
}

fn is_prefix_of(listen: &Multiaddr, bootstrap: &Multiaddr) -> bool {
    let mut remote = bootstrap.iter();
    listen.iter().all(|own| match (own, remote.next()) {
        (Protocol::Ip4(ip), Some(Protocol::Ip4(_))) if ip.is_unspecified() => true,
        (Protocol::Ip6(ip), Some(Protocol::Ip6(_))) if ip.is_unspecified() => true,
        (own, Some(other)) => own == other,
        (_, None) => false,
    })
}

/// Mode to switch to once the swarm reports a concrete listen address.
///
/// `None` when the address does not make this node a bootstrap node, or it already serves.
pub fn promoted_mode(current: DhtMode, address: &Multiaddr, bootstrap: &[Multiaddr]) -> Option<DhtMode> {
    if current == DhtMode::Server {
        return None;
    }
    match node_role(std::slice::from_ref(address), bootstrap) {
        NodeRole::Bootstrap => Some(DhtMode::Server),
        NodeRole::Regular => None,
    }
}

pub fn dht_mode(role: NodeRole, dht_server_mode: bool) -> DhtMode {
    match (role, dht_server_mode) {
        (NodeRole::Bootstrap, _) => DhtMode::Server,
        (NodeRole::Regular, true) => DhtMode::Auto,
        (NodeRole::Regular, false) => DhtMode::Client,
    }
}

/// Parses the comma separated bootstrap option. Blank entries are skipped.
pub fn parse_bootstrap_list(bootstrap: &str) -> P2pResult<Vec<Multiaddr>> {
    bootstrap
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(|b| b.parse::<Multiaddr>().map_err(P2pError::from))
        .collect()
}

/// Keeps at most [`MAX_BOOTSTRAP_PEERS`] addresses, drawn without replacement.
pub fn select_bootstrap_peers<R: Rng + ?Sized>(
    addrs: &[Multiaddr],
    rng: &mut R,
) -> Vec<Multiaddr> {
    let mut selected = addrs.to_vec();
    if selected.len() > MAX_BOOTSTRAP_PEERS {
        selected.shuffle(rng);
        selected.truncate(MAX_BOOTSTRAP_PEERS);
    }
    selected
}

/// Splits `<transport addr>/p2p/<peer id>` into its peer identity and address.
pub fn peer_from_p2p_addr(addr: &Multiaddr) -> P2pResult<(PeerId, Multiaddr)> {
    let mut transport = addr.clone();
    match transport.pop() {
        Some(Protocol::P2p(peer_id)) if !transport.is_empty() => Ok((peer_id, transport)),
        _ => Err(P2pError::InvalidAddress(format!(
            "{addr} does not end with a /p2p/<peer id> segment"
        ))),
    }
}

/// Kademlia behaviour seeded with the selected bootstrap peers.
///
/// Any bootstrap address that fails to parse aborts construction.
pub fn new_dht<R: Rng + ?Sized>(
    local_peer_id: PeerId,
    mode: DhtMode,
    bootstrap: &[Multiaddr],
    rng: &mut R,
) -> P2pResult<(kad::Behaviour<MemoryStore>, Vec<(PeerId, Multiaddr)>)> {
    let peers = select_bootstrap_peers(bootstrap, rng)
        .iter()
        .map(peer_from_p2p_addr)
        .collect::<P2pResult<Vec<_>>>()?;

    let mut config = kad::Config::new(DHT_PROTOCOL);
    let parallelism = NonZeroUsize::new(DHT_CONCURRENCY)
        .ok_or_else(|| P2pError::Dht("query concurrency must be non-zero".to_string()))?;
    config.set_parallelism(parallelism);
    config.set_provider_record_ttl(Some(RENDEZVOUS_TTL));

    let store = MemoryStore::new(local_peer_id);
    let mut dht = kad::Behaviour::with_config(local_peer_id, store, config);
    dht.set_mode(mode.as_kad());
    for (peer_id, addr) in &peers {
        dht.add_address(peer_id, addr.clone());
    }
    Ok((dht, peers))
}
