//! libp2p swarm driving the gossip mesh, the DHT and connection bookkeeping.
//!
//! The swarm lives in its own task. The rest of the node talks to it through
//! a cloneable [`NetworkHandle`] (commands in) and a bounded channel of raw
//! gossip messages (events out). A full channel stalls the swarm task.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::Boxed;
use libp2p::core::upgrade;
use libp2p::futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, MessageAuthenticity, ValidationMode};
use libp2p::kad::{self, store::MemoryStore, GetProvidersOk, QueryResult};
use libp2p::multiaddr::Multiaddr;
use libp2p::swarm::{
    dial_opts::DialOpts, Config as SwarmConfig, DialError, NetworkBehaviour, Swarm, SwarmEvent,
};
use libp2p::{dns, identify, identity, noise, ping, plaintext, tcp, yamux, PeerId, Transport};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GossipParameters;
use crate::error::{P2pError, P2pResult};
use crate::p2p::connmgr::ConnectionManager;
use crate::p2p::dht::{new_dht, promoted_mode, DhtMode, RENDEZVOUS_TTL};
use crate::p2p::transport::{CircuitDialer, HiddenService, OnionTransport};

const IDENTIFY_PROTOCOL: &str = "/soroban/id/1.0.0";
/// Applied to every connection setup of the session.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Gossip redundancy factor.
pub const GOSSIP_FACTOR: f64 = 0.25;
const TRIM_INTERVAL: Duration = Duration::from_secs(60);
const MAX_ADDRS_PER_PEER: usize = 8;
/// Raw gossip waiting for the receive loop.
pub const INBOUND_QUEUE_SIZE: usize = 128;

/// Tor circuit dialer and published hidden service.
pub struct TorSettings {
    pub dialer: Arc<dyn CircuitDialer>,
    pub service: HiddenService,
}

/// Resolved settings of one swarm.
pub struct SwarmSettings {
    pub keypair: identity::Keypair,
    pub listen: Multiaddr,
    /// `None` selects the insecure clearnet fallback
    pub tor: Option<TorSettings>,
    pub bootstrap: Vec<Multiaddr>,
    pub dht_mode: DhtMode,
    pub room: String,
    pub gossip: GossipParameters,
    pub low_water: usize,
    pub high_water: usize,
}

/// Gossip message as handed over by the swarm, before envelope decoding.
#[derive(Debug, Clone)]
pub struct InboundGossip {
    /// peer that forwarded the message to us
    pub propagation_source: PeerId,
    /// original author, when signed
    pub source: Option<PeerId>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) enum NetworkCommand {
    Publish(Vec<u8>),
    Connect {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<P2pResult<()>>,
    },
    KnownPeers(oneshot::Sender<Vec<(PeerId, Vec<Multiaddr>)>>),
    ListenAddrs(oneshot::Sender<Vec<Multiaddr>>),
}

#[derive(Debug, Clone)]
pub struct NetworkHandle {
    local_peer_id: PeerId,
    command_tx: mpsc::Sender<NetworkCommand>,
}

impl NetworkHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub async fn publish(&self, data: Vec<u8>) -> P2pResult<()> {
        self.command_tx
            .send(NetworkCommand::Publish(data))
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }

    /// Resolves once the connection is established or has failed.
    pub async fn connect(&self, peer_id: PeerId, addrs: Vec<Multiaddr>) -> P2pResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(NetworkCommand::Connect {
                peer_id,
                addrs,
                reply,
            })
            .await
            .map_err(|_| P2pError::ChannelClosed)?;
        rx.await.map_err(|_| P2pError::ChannelClosed)?
    }

    /// Peers with at least one known address.
    pub async fn known_peers(&self) -> P2pResult<Vec<(PeerId, Vec<Multiaddr>)>> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(NetworkCommand::KnownPeers(reply))
            .await
            .map_err(|_| P2pError::ChannelClosed)?;
        rx.await.map_err(|_| P2pError::ChannelClosed)
    }

    pub async fn listen_addrs(&self) -> P2pResult<Vec<Multiaddr>> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(NetworkCommand::ListenAddrs(reply))
            .await
            .map_err(|_| P2pError::ChannelClosed)?;
        rx.await.map_err(|_| P2pError::ChannelClosed)
    }

    /// Handle with no swarm behind it; commands land on the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(local_peer_id: PeerId) -> (Self, mpsc::Receiver<NetworkCommand>) {
        let (command_tx, command_rx) = mpsc::channel(16);
        (
            Self {
                local_peer_id,
                command_tx,
            },
            command_rx,
        )
    }
}

#[derive(NetworkBehaviour)]
struct OverlayBehaviour {
    gossipsub: gossipsub::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

/// Builds the swarm, joins the room topic and spawns the swarm task.
pub fn spawn_network<R: Rng + ?Sized>(
    settings: SwarmSettings,
    rng: &mut R,
    cancel: CancellationToken,
) -> P2pResult<(
    NetworkHandle,
    mpsc::Receiver<InboundGossip>,
    JoinHandle<()>,
)> {
    let SwarmSettings {
        keypair,
        listen,
        tor,
        bootstrap,
        dht_mode,
        room,
        gossip,
        low_water,
        high_water,
    } = settings;
    let local_peer_id = PeerId::from(keypair.public());

    let connmgr = ConnectionManager::new(low_water, high_water)?;
    let transport = build_transport(&keypair, tor)?;
    let gossipsub = build_gossipsub(&keypair, &gossip)?;
    let (kademlia, bootstrap_peers) = new_dht(local_peer_id, dht_mode, &bootstrap, rng)?;
    let identify = identify::Behaviour::new(identify::Config::new(
        IDENTIFY_PROTOCOL.into(),
        keypair.public(),
    ));

    let behaviour = OverlayBehaviour {
        gossipsub,
        kademlia,
        identify,
        ping: ping::Behaviour::default(),
    };
    let swarm_config =
        SwarmConfig::with_tokio_executor().with_idle_connection_timeout(Duration::from_secs(60));
    let mut swarm = Swarm::new(transport, behaviour, local_peer_id, swarm_config);

    let topic = IdentTopic::new(room.clone());
    swarm
        .behaviour_mut()
        .gossipsub
        .subscribe(&topic)
        .map_err(|e| P2pError::Gossip(e.to_string()))?;

    swarm
        .listen_on(listen.clone())
        .map_err(|e| P2pError::Transport(format!("failed to listen on {listen}: {e}")))?;

    for (peer_id, addr) in &bootstrap_peers {
        debug!("Bootstrap address: {addr}/p2p/{peer_id}");
        let opts = DialOpts::peer_id(*peer_id).addresses(vec![addr.clone()]).build();
        if let Err(e) = swarm.dial(opts) {
            warn!("Bootstrap dial failed for {addr}: {e}");
        }
    }
    if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
        debug!("DHT bootstrap skipped: {e}");
    }

    let (command_tx, command_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);

    let worker = NetworkWorker {
        swarm,
        topic,
        local_peer_id,
        dht_mode,
        bootstrap,
        connmgr,
        peer_book: PeerBook::default(),
        rendezvous: Rendezvous::new(&room, gossip.limit),
        pending_dials: HashMap::new(),
        command_rx,
        inbound_tx,
    };
    let task = tokio::spawn(worker.run(cancel));

    Ok((
        NetworkHandle {
            local_peer_id,
            command_tx,
        },
        inbound_rx,
        task,
    ))
}

fn build_transport(
    keypair: &identity::Keypair,
    tor: Option<TorSettings>,
) -> P2pResult<Boxed<(PeerId, StreamMuxerBox)>> {
    match tor {
        Some(tor) => {
            let noise = noise::Config::new(keypair).map_err(|e| P2pError::Transport(e.to_string()))?;
            Ok(OnionTransport::new(tor.dialer, Some(tor.service))
                .upgrade(upgrade::Version::V1)
                .authenticate(noise)
                .multiplex(yamux::Config::default())
                .timeout(DIAL_TIMEOUT)
                .boxed())
        }
        None => {
            warn!("No p2p seed configured, using unauthenticated clearnet transport");
            let tcp = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
            let base = dns::tokio::Transport::system(tcp)?;
            Ok(base
                .upgrade(upgrade::Version::V1)
                .authenticate(plaintext::Config::new(keypair))
                .multiplex(yamux::Config::default())
                .timeout(DIAL_TIMEOUT)
                .boxed())
        }
    }
}

fn build_gossipsub(
    keypair: &identity::Keypair,
    params: &GossipParameters,
) -> P2pResult<gossipsub::Behaviour> {
    let config = gossipsub::ConfigBuilder::default()
        .validation_mode(ValidationMode::Strict)
        .mesh_n(params.d)
        .mesh_n_low(params.dlo)
        .mesh_n_high(params.dhi)
        .mesh_outbound_min(params.dout)
        .retain_scores(params.dscore)
        .gossip_lazy(params.dlazy)
        .gossip_factor(GOSSIP_FACTOR)
        .prune_peers(params.prune_peers)
        .build()
        .map_err(|e| P2pError::Gossip(e.to_string()))?;
    gossipsub::Behaviour::new(MessageAuthenticity::Signed(keypair.clone()), config)
        .map_err(|e| P2pError::Gossip(e.to_string()))
}

struct NetworkWorker {
    swarm: Swarm<OverlayBehaviour>,
    topic: IdentTopic,
    local_peer_id: PeerId,
    dht_mode: DhtMode,
    /// configured bootstrap addresses, used to recognise our own listen addresses
    bootstrap: Vec<Multiaddr>,
    connmgr: ConnectionManager,
    peer_book: PeerBook,
    rendezvous: Rendezvous<kad::QueryId>,
    pending_dials: HashMap<libp2p::swarm::ConnectionId, oneshot::Sender<P2pResult<()>>>,
    command_rx: mpsc::Receiver<NetworkCommand>,
    inbound_tx: mpsc::Sender<InboundGossip>,
}

impl NetworkWorker {
    async fn run(mut self, cancel: CancellationToken) {
        let mut rendezvous_tick = tokio::time::interval(RENDEZVOUS_TTL);
        let mut trim_tick = tokio::time::interval(TRIM_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Network task stopped");
                    break;
                }
                Some(command) = self.command_rx.recv() => self.handle_command(command),
                event = self.swarm.select_next_some() => self.handle_event(event).await,
                _ = rendezvous_tick.tick() => self.advertise(),
                _ = trim_tick.tick() => self.trim_connections(),
            }
        }
    }

    fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::Publish(data) => {
                if let Err(e) = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(self.topic.clone(), data)
                {
                    debug!("Failed to publish message: {e}");
                }
            }
            NetworkCommand::Connect {
                peer_id,
                addrs,
                reply,
            } => {
                if self.swarm.is_connected(&peer_id) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let opts = DialOpts::peer_id(peer_id).addresses(addrs).build();
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials.insert(connection_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(P2pError::Transport(e.to_string())));
                    }
                }
            }
            NetworkCommand::KnownPeers(reply) => {
                let _ = reply.send(self.peer_book.peers());
            }
            NetworkCommand::ListenAddrs(reply) => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
        }
    }

    async fn handle_event(&mut self, event: SwarmEvent<OverlayBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(OverlayBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let inbound = InboundGossip {
                    propagation_source,
                    source: message.source,
                    data: message.data,
                };
                if self.inbound_tx.send(inbound).await.is_err() {
                    debug!("Receive loop is gone, dropping gossip message");
                }
            }
            SwarmEvent::Behaviour(OverlayBehaviourEvent::Gossipsub(
                gossipsub::Event::Subscribed { peer_id, topic },
            )) => {
                debug!("Peer {peer_id} subscribed to topic {topic}");
            }
            SwarmEvent::Behaviour(OverlayBehaviourEvent::Kademlia(event)) => {
                self.handle_kad_event(event)
            }
            SwarmEvent::Behaviour(OverlayBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    self.peer_book.add(peer_id, addr);
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Peer address: {address}/p2p/{}", self.local_peer_id);
                if let Some(mode) = promoted_mode(self.dht_mode, &address, &self.bootstrap) {
                    info!("Listening on bootstrap address {address}, DHT mode: {mode:?}");
                    self.dht_mode = mode;
                    self.swarm.behaviour_mut().kademlia.set_mode(mode.as_kad());
                }
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                debug!("Connection established with peer {peer_id}");
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(()));
                }
                if endpoint.is_dialer() {
                    self.peer_book
                        .add(peer_id, endpoint.get_remote_address().clone());
                }
                self.connmgr.connected(peer_id, Instant::now());
                if self.connmgr.peer_count() > self.connmgr.high_water() {
                    self.trim_connections();
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    debug!("Connection closed with peer {peer_id}");
                    self.connmgr.disconnected(&peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                debug!("Outgoing connection to {peer_id:?} failed: {error}");
                if let Some(peer_id) = peer_id {
                    if !matches!(error, DialError::DialPeerConditionFalse(_))
                        && !self.swarm.is_connected(&peer_id)
                        && self.peer_book.remove(&peer_id)
                    {
                        debug!("Forgetting unreachable peer {peer_id}");
                    }
                }
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(P2pError::Transport(error.to_string())));
                }
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated {
                peer,
                addresses,
                old_peer,
                ..
            } => {
                if let Some(evicted) = old_peer {
                    self.peer_book.remove(&evicted);
                }
                for addr in addresses.iter() {
                    self.peer_book.add(peer, addr.clone());
                }
            }
            kad::Event::UnroutablePeer { peer } => {
                self.peer_book.remove(&peer);
            }
            kad::Event::OutboundQueryProgressed { id, result, .. } => match result {
                QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders {
                    providers, ..
                })) => self.dial_providers(id, providers),
                QueryResult::GetProviders(Ok(
                    GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
                )) => self.rendezvous.finish(&id),
                QueryResult::GetProviders(Err(e)) => {
                    debug!("Rendezvous query failed: {e}");
                    self.rendezvous.finish(&id);
                }
                QueryResult::StartProviding(Err(e)) => debug!("Rendezvous advertise failed: {e}"),
                QueryResult::Bootstrap(Err(e)) => debug!("DHT bootstrap failed: {e}"),
                _ => {}
            },
            _ => {}
        }
    }

    fn advertise(&mut self) {
        let key = self.rendezvous.key();
        let kademlia = &mut self.swarm.behaviour_mut().kademlia;
        if let Err(e) = kademlia.start_providing(key.clone()) {
            debug!("Rendezvous advertise failed: {e}");
        }
        let id = kademlia.get_providers(key);
        self.rendezvous.track(id);
    }

    fn dial_providers(&mut self, id: kad::QueryId, providers: HashSet<PeerId>) {
        for provider in providers {
            if provider == self.local_peer_id || self.swarm.is_connected(&provider) {
                continue;
            }
            if !self.rendezvous.accept(&id) {
                if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                    query.finish();
                }
                self.rendezvous.finish(&id);
                return;
            }
            debug!("Rendezvous discovered peer {provider}");
            if let Err(e) = self.swarm.dial(DialOpts::peer_id(provider).build()) {
                debug!("Rendezvous dial failed for {provider}: {e}");
            }
        }
    }

    fn trim_connections(&mut self) {
        let protected: HashSet<PeerId> = self
            .swarm
            .behaviour()
            .gossipsub
            .all_mesh_peers()
            .copied()
            .collect();
        for peer in self.connmgr.trim_candidates(Instant::now(), &protected) {
            debug!("Trimming connection to {peer}");
            let _ = self.swarm.disconnect_peer_id(peer);
        }
    }
}

/// Known addresses per peer, the local stand-in for a peerstore.
#[derive(Debug, Default)]
pub struct PeerBook {
    peers: HashMap<PeerId, Vec<Multiaddr>>,
}

impl PeerBook {
    pub fn add(&mut self, peer: PeerId, addr: Multiaddr) {
        let addrs = self.peers.entry(peer).or_default();
        if addrs.contains(&addr) {
            return;
        }
        if addrs.len() == MAX_ADDRS_PER_PEER {
            addrs.remove(0);
        }
        addrs.push(addr);
    }

    /// True if the peer was known.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub fn peers(&self) -> Vec<(PeerId, Vec<Multiaddr>)> {
        self.peers
            .iter()
            .filter(|(_, addrs)| !addrs.is_empty())
            .map(|(peer, addrs)| (*peer, addrs.clone()))
            .collect()
    }
}

/// Rendezvous key of the room and per-query discovery accounting.
#[derive(Debug)]
pub struct Rendezvous<Q> {
    key: kad::RecordKey,
    limit: usize,
    queries: HashMap<Q, usize>,
}

impl<Q: Hash + Eq> Rendezvous<Q> {
    pub fn new(room: &str, limit: usize) -> Self {
        Self {
            key: kad::RecordKey::new(&format!("floodsub:{room}")),
            limit,
            queries: HashMap::new(),
        }
    }

    pub fn key(&self) -> kad::RecordKey {
        self.key.clone()
    }

    pub fn track(&mut self, query: Q) {
        self.queries.insert(query, 0);
    }

    /// Counts one discovered peer; false once the query has reached its limit.
    pub fn accept(&mut self, query: &Q) -> bool {
        match self.queries.get_mut(query) {
            Some(found) if *found < self.limit => {
                *found += 1;
                true
            }
            _ => false,
        }
    }

    pub fn finish(&mut self, query: &Q) {
        self.queries.remove(query);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_book_dedups_and_bounds_addresses() {
        let mut book = PeerBook::default();
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        book.add(peer, addr.clone());
        book.add(peer, addr.clone());
        assert_eq!(book.peers(), vec![(peer, vec![addr])]);

        for port in 0..20u16 {
            book.add(peer, format!("/ip4/10.0.0.2/tcp/{}", 5000 + port).parse().unwrap());
        }
        assert_eq!(book.peers()[0].1.len(), MAX_ADDRS_PER_PEER);
    }

    #[test]
    fn test_peer_book_forgets_evicted_peers() {
        let mut book = PeerBook::default();
        let stale = PeerId::random();
        let live = PeerId::random();
        book.add(stale, "/ip4/10.0.0.1/tcp/4001".parse().unwrap());
        book.add(live, "/ip4/10.0.0.2/tcp/4001".parse().unwrap());

        assert!(book.remove(&stale));
        assert!(!book.remove(&stale));
        let peers = book.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, live);
    }

    #[test]
    fn test_rendezvous_limit_per_query() {
        let mut rendezvous = Rendezvous::new("room", 2);
        rendezvous.track(1u32);
        rendezvous.track(2u32);

        assert!(rendezvous.accept(&1));
        assert!(rendezvous.accept(&1));
        assert!(!rendezvous.accept(&1));
        assert!(rendezvous.accept(&2));

        rendezvous.finish(&2);
        assert!(!rendezvous.accept(&2));
        assert!(!rendezvous.accept(&3));
    }

    #[test]
    fn test_rendezvous_key_is_room_namespace() {
        let rendezvous: Rendezvous<u32> = Rendezvous::new("samourai-p2p", 1);
        assert_eq!(rendezvous.key().to_vec(), b"floodsub:samourai-p2p".to_vec());
    }

    #[test]
    fn test_gossip_parameters_build() {
        let keypair = identity::Keypair::generate_ed25519();
        assert!(build_gossipsub(&keypair, &GossipParameters::default()).is_ok());

        let invalid = GossipParameters {
            dlo: 30,
            ..GossipParameters::default()
        };
        assert!(matches!(
            build_gossipsub(&keypair, &invalid),
            Err(P2pError::Gossip(_))
        ));
    }
}
