//! Gossip mesh facade.
//!
//! [`P2p`] owns one network instance: it derives the node identity, builds
//! the transport for the configured mode, joins the room topic and runs the
//! receive loop that turns raw gossip into decoded [`Message`]s.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use libp2p::{identity, PeerId};
use serde::Serialize;
use sha3::{Digest, Sha3_256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Options, P2pConfig};
use crate::error::{P2pError, P2pResult};
use crate::p2p::dht::{dht_mode, node_role, parse_bootstrap_list, NodeRole};
use crate::p2p::libp2p_network::{
    spawn_network, InboundGossip, NetworkHandle, SwarmSettings, TorSettings,
};
use crate::p2p::messages::Message;
use crate::p2p::peerstore::{connect_to_persisted_peers, start_peerstore_persistence};
use crate::p2p::transport::{onion_service_id, HiddenService, OnionEndpoint, Socks5Dialer};

const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshState {
    Uninitialized,
    Connecting,
    Joined,
    Subscribed,
    Closed,
}

/// Publishing side of the mesh, cheap to clone.
///
/// Without a network handle every non-empty publish succeeds as a no-op.
#[derive(Debug, Clone, Default)]
pub struct Publisher {
    network: Option<NetworkHandle>,
}

impl Publisher {
    pub fn new(network: Option<NetworkHandle>) -> Self {
        Self { network }
    }

    pub fn valid(&self) -> bool {
        self.network.is_some()
    }

    pub async fn publish(&self, message: &str) -> P2pResult<()> {
        if message.is_empty() {
            return Err(P2pError::EmptyMessage);
        }
        let Some(network) = &self.network else {
            return Ok(());
        };
        if let Err(e) = network.publish(message.as_bytes().to_vec()).await {
            debug!("Publish dropped: {e}");
        }
        Ok(())
    }

    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        context: &str,
        payload: &T,
    ) -> P2pResult<()> {
        let data = Message::new(context, payload)?.to_bytes()?;
        let text = String::from_utf8(data)
            .map_err(|e| P2pError::Serialization(e.to_string()))?;
        self.publish(&text).await
    }
}

pub struct P2p {
    on_message: mpsc::Sender<Message>,
    state: MeshState,
    publisher: Publisher,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl P2p {
    /// Decoded inbound messages are delivered on `on_message`.
    pub fn new(on_message: mpsc::Sender<Message>) -> Self {
        Self {
            on_message,
            state: MeshState::Uninitialized,
            publisher: Publisher::default(),
            cancel: None,
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> MeshState {
        match &self.cancel {
            Some(cancel) if cancel.is_cancelled() && self.state == MeshState::Subscribed => {
                MeshState::Closed
            }
            _ => self.state,
        }
    }

    /// True once the room topic has been joined.
    pub fn valid(&self) -> bool {
        self.publisher.valid()
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.publisher.network.as_ref().map(NetworkHandle::local_peer_id)
    }

    pub async fn publish(&self, message: &str) -> P2pResult<()> {
        self.publisher.publish(message).await
    }

    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        context: &str,
        payload: &T,
    ) -> P2pResult<()> {
        self.publisher.publish_json(context, payload).await
    }

    /// Brings the mesh up. `ready` fires when the attempt is over, whether it succeeded or not.
    ///
    /// On failure the instance stays [`MeshState::Uninitialized`].
    pub async fn start(
        &mut self,
        cancel: &CancellationToken,
        options: &Options,
        ready: oneshot::Sender<()>,
    ) -> P2pResult<()> {
        if self.state != MeshState::Uninitialized {
            let _ = ready.send(());
            return Err(P2pError::Gossip("mesh already started".to_string()));
        }
        let token = cancel.child_token();
        let result = self.try_start(&token, options).await;
        if let Err(e) = &result {
            warn!("Failed to start p2p mesh: {e}");
            token.cancel();
            for task in self.tasks.drain(..) {
                task.abort();
            }
            self.publisher = Publisher::default();
            self.state = MeshState::Uninitialized;
        }
        let _ = ready.send(());
        result
    }

    async fn try_start(&mut self, cancel: &CancellationToken, options: &Options) -> P2pResult<()> {
        self.state = MeshState::Connecting;
        self.cancel = Some(cancel.clone());

        let p2p = &options.p2p;
        let child_id = options.ipc.child_id;
        let keypair = node_keypair(p2p, child_id)?;
        let settings = swarm_settings(options, keypair).await?;
        let role = node_role(std::slice::from_ref(&settings.listen), &settings.bootstrap);
        debug!("isBootstrap: {}", role == NodeRole::Bootstrap);
        debug!("DHT mode: {:?}", settings.dht_mode);

        let (network, inbound, swarm_task) =
            spawn_network(settings, &mut rand::rng(), cancel.clone())?;
        self.tasks.push(swarm_task);
        self.publisher = Publisher::new(Some(network.clone()));
        self.state = MeshState::Joined;

        if role != NodeRole::Bootstrap && p2p.peerstore_enabled() {
            connect_to_persisted_peers(&network, p2p, child_id).await?;
        }

        self.tasks.push(tokio::spawn(receive_loop(
            network.local_peer_id(),
            inbound,
            self.on_message.clone(),
            cancel.clone(),
        )));
        if p2p.peerstore_enabled() {
            self.tasks.push(start_peerstore_persistence(
                cancel.clone(),
                p2p.clone(),
                child_id,
                network.clone(),
            ));
        }

        self.state = MeshState::Subscribed;
        info!("Joined room {} as {}", p2p.room, network.local_peer_id());
        Ok(())
    }

    /// Cancels every task of this instance and waits for them.
    pub async fn shutdown(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!("Mesh task ended abnormally: {e}");
            }
        }
        if self.state == MeshState::Subscribed {
            self.state = MeshState::Closed;
        }
    }
}

/// ed25519 identity of the node.
///
/// Without a seed a fresh identity is generated. A shard derives its own seed
/// from the configured one so each shard has a distinct identity.
pub fn node_keypair(config: &P2pConfig, child_id: u32) -> P2pResult<identity::Keypair> {
    if !config.tor_enabled() {
        return Ok(identity::Keypair::generate_ed25519());
    }
    let mut seed = shard_seed(&config.seed_bytes()?, child_id);
    identity::Keypair::ed25519_from_bytes(&mut seed)
        .map_err(|e| P2pError::Config(format!("invalid p2p seed: {e}")))
}

fn shard_seed(seed: &[u8; 32], child_id: u32) -> [u8; 32] {
    if child_id == 0 {
        return *seed;
    }
    let mut hasher = Sha3_256::new();
    hasher.update(seed);
    hasher.update(child_id.to_be_bytes());
    hasher.finalize().into()
}

async fn swarm_settings(options: &Options, keypair: identity::Keypair) -> P2pResult<SwarmSettings> {
    let p2p = &options.p2p;
    let port = options.effective_listen_port();

    let (listen, tor) = if p2p.tor_enabled() {
        let public = keypair
            .public()
            .try_into_ed25519()
            .map_err(|e| P2pError::Config(e.to_string()))?;
        let endpoint = OnionEndpoint {
            service_id: onion_service_id(&public.to_bytes()),
            port,
        };
        let listen = endpoint.to_multiaddr()?;
        let service =
            HiddenService::bind(endpoint, SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
        let dialer = Arc::new(Socks5Dialer::new(&p2p.socks_proxy)?);
        (listen, Some(TorSettings { dialer, service }))
    } else {
        (p2p.clearnet_listen_addr(port)?, None)
    };

    let bootstrap = parse_bootstrap_list(&p2p.bootstrap)?;
    let role = node_role(std::slice::from_ref(&listen), &bootstrap);
    Ok(SwarmSettings {
        keypair,
        dht_mode: dht_mode(role, p2p.dht_server_mode),
        listen,
        tor,
        bootstrap,
        room: p2p.room.clone(),
        gossip: options.gossip,
        low_water: p2p.low_water,
        high_water: p2p.high_water,
    })
}

/// Decodes inbound gossip and hands it to the consumer until cancelled.
///
/// Messages authored or forwarded by `local` are dropped, as is anything that
/// does not decode as a [`Message`]. A full `deliver` queue stalls intake.
pub async fn receive_loop(
    local: PeerId,
    mut inbound: mpsc::Receiver<InboundGossip>,
    deliver: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let mut input_closed = false;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbound.recv() => next,
        };
        let Some(gossip) = next else {
            if !input_closed {
                warn!("failed to get next message: inbound gossip channel closed");
                input_closed = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
            }
            continue;
        };

        if gossip.propagation_source == local || gossip.source == Some(local) {
            continue;
        }
        let message = match Message::from_bytes(&gossip.data) {
            Ok(message) => message,
            Err(_) => {
                debug!("Skip unknown message");
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = deliver.send(message) => {
                if sent.is_err() {
                    debug!("Message consumer is gone, dropping message");
                }
            }
        }
    }
    info!("Exiting receive loop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::dht::DhtMode;
    use crate::p2p::messages::CONTEXT_DIRECTORY_ADD;
    use serde_json::json;

    fn gossip(source: PeerId, data: &[u8]) -> InboundGossip {
        InboundGossip {
            propagation_source: source,
            source: Some(source),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_publish_without_topic() {
        let publisher = Publisher::default();
        assert!(matches!(
            publisher.publish("").await,
            Err(P2pError::EmptyMessage)
        ));
        assert!(publisher.publish("hello").await.is_ok());
        assert!(publisher
            .publish_json(CONTEXT_DIRECTORY_ADD, &json!({"key": "k", "value": "v"}))
            .await
            .is_ok());
        assert!(publisher.publish_json("", &json!(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_receive_loop_filters_and_decodes() {
        let local = PeerId::random();
        let remote = PeerId::random();
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (deliver_tx, mut deliver_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(receive_loop(local, inbound_rx, deliver_tx, cancel.clone()));

        let valid = br#"{"Context":"directory.add","Payload":{"key":"k","value":"v","mode":"default"}}"#;
        inbound_tx.send(gossip(local, valid)).await.unwrap();
        inbound_tx
            .send(InboundGossip {
                propagation_source: remote,
                source: Some(local),
                data: valid.to_vec(),
            })
            .await
            .unwrap();
        inbound_tx.send(gossip(remote, b"garbage")).await.unwrap();
        inbound_tx.send(gossip(remote, &[0xff, 0x00])).await.unwrap();
        inbound_tx.send(gossip(remote, valid)).await.unwrap();

        let message = deliver_rx.recv().await.unwrap();
        assert_eq!(message.context, CONTEXT_DIRECTORY_ADD);
        assert_eq!(message.payload["key"], "k");
        assert!(deliver_rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_loop_survives_closed_input() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundGossip>(1);
        drop(inbound_tx);
        let (deliver_tx, _deliver_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            PeerId::random(),
            inbound_rx,
            deliver_tx,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!task.is_finished());
        cancel.cancel();
        task.await.unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output.matches("inbound gossip channel closed").count(), 1);
    }

    #[tokio::test]
    async fn test_default_clearnet_bootstrap_node_serves_dht() {
        let keypair = identity::Keypair::generate_ed25519();
        let mut options = Options::default();
        options.p2p.listen_port = 0;
        options.p2p.bootstrap = format!("/ip4/127.0.0.1/tcp/0/p2p/{}", keypair.public().to_peer_id());

        let settings = swarm_settings(&options, keypair).await.unwrap();
        assert_eq!(settings.listen.to_string(), "/ip4/0.0.0.0/tcp/0");
        assert_eq!(settings.dht_mode, DhtMode::Server);
    }

    #[test]
    fn test_shard_identities_are_distinct() {
        let mut config = P2pConfig::default();
        config.seed = "42".repeat(32);

        let parent = node_keypair(&config, 0).unwrap().public().to_peer_id();
        let again = node_keypair(&config, 0).unwrap().public().to_peer_id();
        let shard = node_keypair(&config, 1).unwrap().public().to_peer_id();
        assert_eq!(parent, again);
        assert_ne!(parent, shard);
    }

    #[tokio::test]
    async fn test_failed_start_stays_uninitialized() {
        let (tx, _rx) = mpsc::channel(1);
        let mut p2p = P2p::new(tx);
        let mut options = Options::default();
        options.p2p.bootstrap = "not-a-multiaddr".to_string();
        options.p2p.listen_port = 0;

        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        assert!(p2p.start(&cancel, &options, ready_tx).await.is_err());
        assert!(ready_rx.await.is_ok());
        assert_eq!(p2p.state(), MeshState::Uninitialized);
        assert!(!p2p.valid());
        assert!(p2p.publish("still fine").await.is_ok());
    }
}
