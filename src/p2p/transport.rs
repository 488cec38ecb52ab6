//! Onion transport: libp2p connections carried over Tor circuits.
//!
//! Outbound connections are opened through the SOCKS proxy of a local Tor
//! daemon. Inbound connections arrive on the local listener that the hidden
//! service forwards to. Both sides hand raw streams to the upgrade chain
//! (noise + yamux) of the enclosing swarm.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use data_encoding::BASE32_NOPAD;
use libp2p::core::transport::{DialOpts, ListenerId, TransportError, TransportEvent};
use libp2p::futures::future::{self, BoxFuture, Ready};
use libp2p::futures::FutureExt;
use libp2p::multiaddr::{Multiaddr, Protocol};
use libp2p::Transport;
use sha3::{Digest, Sha3_256};
use tokio::net::{TcpListener, TcpStream};
use tokio_socks::tcp::Socks5Stream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use crate::error::{P2pError, P2pResult};

/// Smallest hidden-service port accepted for dialing.
pub const MIN_ONION_PORT: u16 = 1024;
/// Upper bound (exclusive) of dialable hidden-service ports.
pub const MAX_ONION_PORT: u16 = 65535;

const ONION_VERSION: u8 = 0x03;
const ONION_CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// Address schemes handled by [`OnionTransport`].
pub fn protocols() -> &'static [&'static str] {
    &["onion3"]
}

/// Service identifier and virtual port of a v3 onion address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionEndpoint {
    /// lowercase base32 service id, without the `.onion` suffix
    pub service_id: String,
    pub port: u16,
}

impl OnionEndpoint {
    /// Parses a transport address made of exactly one onion3 segment.
    ///
    /// A trailing `/p2p/<peer>` segment names the remote peer rather than a
    /// transport protocol and is ignored.
    pub fn from_multiaddr(addr: &Multiaddr) -> P2pResult<Self> {
        let stripped = strip_peer_id(addr);
        let mut segments = stripped.iter();
        let onion = match (segments.next(), segments.next()) {
            (Some(Protocol::Onion3(onion)), None) => onion,
            _ => {
                return Err(P2pError::InvalidAddress(format!(
                    "{addr} is not a single onion3 address"
                )))
            }
        };
        let port = onion.port();
        if !(MIN_ONION_PORT..MAX_ONION_PORT).contains(&port) {
            return Err(P2pError::InvalidAddress(format!(
                "onion port {port} outside [{MIN_ONION_PORT}, {MAX_ONION_PORT})"
            )));
        }
        Ok(Self {
            service_id: BASE32_NOPAD.encode(onion.hash()).to_lowercase(),
            port,
        })
    }

    /// Host name in Tor's native addressing convention.
    pub fn hostname(&self) -> String {
        format!("{}.onion", self.service_id)
    }

    pub fn to_multiaddr(&self) -> P2pResult<Multiaddr> {
        format!("/onion3/{}:{}", self.service_id, self.port)
            .parse()
            .map_err(P2pError::from)
    }
}

pub fn is_valid_onion_multiaddr(addr: &Multiaddr) -> bool {
    OnionEndpoint::from_multiaddr(addr).is_ok()
}

fn strip_peer_id(addr: &Multiaddr) -> Multiaddr {
    let mut addr = addr.clone();
    let ends_with_peer = matches!(addr.iter().last(), Some(Protocol::P2p(_)));
    if ends_with_peer {
        addr.pop();
    }
    addr
}

/// v3 onion service id of an ed25519 public key.
pub fn onion_service_id(public_key: &[u8; 32]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(ONION_CHECKSUM_PREFIX);
    hasher.update(public_key);
    hasher.update([ONION_VERSION]);
    let checksum = hasher.finalize();

    let mut raw = Vec::with_capacity(35);
    raw.extend_from_slice(public_key);
    raw.extend_from_slice(&checksum[..2]);
    raw.push(ONION_VERSION);
    BASE32_NOPAD.encode(&raw).to_lowercase()
}

/// Opens anonymized circuits to `host:port`.
pub trait CircuitDialer: Send + Sync {
    fn dial(&self, host: String, port: u16) -> BoxFuture<'static, io::Result<TcpStream>>;
}

/// Dials through the SOCKS5 proxy of a Tor daemon.
///
/// The proxy is a `host:port` pair, resolved on every dial.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: String,
}

impl Socks5Dialer {
    pub fn new(proxy: &str) -> P2pResult<Self> {
        let invalid = || P2pError::Config(format!("invalid socks proxy {proxy}: expected host:port"));
        let (host, port) = proxy.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }
        Ok(Self {
            proxy: proxy.to_string(),
        })
    }
}

impl CircuitDialer for Socks5Dialer {
    fn dial(&self, host: String, port: u16) -> BoxFuture<'static, io::Result<TcpStream>> {
        let proxy = self.proxy.clone();
        async move {
            let mut last_error = io::Error::new(
                io::ErrorKind::NotFound,
                format!("socks proxy {proxy} did not resolve"),
            );
            for addr in tokio::net::lookup_host(proxy.as_str()).await? {
                match Socks5Stream::connect(addr, (host.as_str(), port)).await {
                    Ok(stream) => return Ok(stream.into_inner()),
                    Err(e) => {
                        debug!("Socks proxy {addr} failed: {e}");
                        last_error = io::Error::new(io::ErrorKind::ConnectionRefused, e);
                    }
                }
            }
            Err(last_error)
        }
        .boxed()
    }
}

/// A published hidden service: its endpoint and the local listener Tor forwards to.
///
/// Publishing the service (torrc `HiddenServicePort`) is up to the operator;
/// this only binds the local side.
pub struct HiddenService {
    endpoint: OnionEndpoint,
    listener: TcpListener,
}

impl HiddenService {
    pub async fn bind(endpoint: OnionEndpoint, local: SocketAddr) -> P2pResult<Self> {
        let listener = TcpListener::bind(local).await?;
        debug!("Hidden service {} forwarded to {local}", endpoint.hostname());
        Ok(Self { endpoint, listener })
    }

    pub fn from_listener(endpoint: OnionEndpoint, listener: TcpListener) -> Self {
        Self { endpoint, listener }
    }

    pub fn endpoint(&self) -> &OnionEndpoint {
        &self.endpoint
    }
}

struct ActiveListener {
    id: ListenerId,
    addr: Multiaddr,
    listener: TcpListener,
}

pub struct OnionTransport {
    dialer: Arc<dyn CircuitDialer>,
    service: Option<HiddenService>,
    listener: Option<ActiveListener>,
    /// bound local address, used as the source of outbound connections
    local_addr: Option<Multiaddr>,
    pending: VecDeque<TransportEvent<Ready<io::Result<Compat<TcpStream>>>, io::Error>>,
}

impl OnionTransport {
    pub fn new(dialer: Arc<dyn CircuitDialer>, service: Option<HiddenService>) -> Self {
        Self {
            dialer,
            service,
            listener: None,
            local_addr: None,
            pending: VecDeque::new(),
        }
    }

    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        is_valid_onion_multiaddr(addr)
    }

    pub fn local_addr(&self) -> Option<&Multiaddr> {
        self.local_addr.as_ref()
    }
}

impl Transport for OnionTransport {
    type Output = Compat<TcpStream>;
    type Error = io::Error;
    type ListenerUpgrade = Ready<Result<Self::Output, Self::Error>>;
    type Dial = BoxFuture<'static, Result<Self::Output, Self::Error>>;

    fn listen_on(
        &mut self,
        id: ListenerId,
        addr: Multiaddr,
    ) -> Result<(), TransportError<Self::Error>> {
        let endpoint = match OnionEndpoint::from_multiaddr(&addr) {
            Ok(endpoint) => endpoint,
            Err(_) => return Err(TransportError::MultiaddrNotSupported(addr)),
        };
        let service = match self.service.take() {
            Some(service) if service.endpoint == endpoint => service,
            Some(service) => {
                self.service = Some(service);
                return Err(TransportError::MultiaddrNotSupported(addr));
            }
            None => {
                return Err(TransportError::Other(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "hidden service listener already bound",
                )))
            }
        };

        self.local_addr = Some(addr.clone());
        self.pending.push_back(TransportEvent::NewAddress {
            listener_id: id,
            listen_addr: addr.clone(),
        });
        self.listener = Some(ActiveListener {
            id,
            addr,
            listener: service.listener,
        });
        Ok(())
    }

    fn remove_listener(&mut self, id: ListenerId) -> bool {
        match &self.listener {
            Some(active) if active.id == id => {
                self.listener = None;
                self.pending.push_back(TransportEvent::ListenerClosed {
                    listener_id: id,
                    reason: Ok(()),
                });
                true
            }
            _ => false,
        }
    }

    fn dial(
        &mut self,
        addr: Multiaddr,
        _opts: DialOpts,
    ) -> Result<Self::Dial, TransportError<Self::Error>> {
        let endpoint = match OnionEndpoint::from_multiaddr(&addr) {
            Ok(endpoint) => endpoint,
            Err(_) => return Err(TransportError::MultiaddrNotSupported(addr)),
        };
        debug!("Opening circuit to {}:{}", endpoint.hostname(), endpoint.port);
        let circuit = self.dialer.dial(endpoint.hostname(), endpoint.port);
        Ok(async move { circuit.await.map(TokioAsyncReadCompatExt::compat) }.boxed())
    }

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<TransportEvent<Self::ListenerUpgrade, Self::Error>> {
        let this = self.get_mut();
        if let Some(event) = this.pending.pop_front() {
            return Poll::Ready(event);
        }
        let Some(active) = this.listener.as_ref() else {
            return Poll::Pending;
        };
        match active.listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, remote))) => {
                let send_back_addr = socket_multiaddr(remote);
                Poll::Ready(TransportEvent::Incoming {
                    listener_id: active.id,
                    upgrade: future::ready(Ok(stream.compat())),
                    local_addr: active.addr.clone(),
                    send_back_addr,
                })
            }
            Poll::Ready(Err(error)) => {
                warn!("Hidden service accept failed: {error}");
                Poll::Ready(TransportEvent::ListenerError {
                    listener_id: active.id,
                    error,
                })
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn socket_multiaddr(addr: SocketAddr) -> Multiaddr {
    let mut multiaddr = Multiaddr::empty();
    match addr {
        SocketAddr::V4(v4) => multiaddr.push(Protocol::Ip4(*v4.ip())),
        SocketAddr::V6(v6) => multiaddr.push(Protocol::Ip6(*v6.ip())),
    }
    multiaddr.push(Protocol::Tcp(addr.port()));
    multiaddr
}
