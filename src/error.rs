/// Error types for the soroban overlay node
use thiserror::Error;

#[derive(Error, Debug)]
pub enum P2pError {
    /// Invalid or inconsistent options (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),
    /// Address that cannot be parsed or that misses required segments
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Transport construction or circuit failure
    #[error("transport error: {0}")]
    Transport(String),
    /// DHT construction failure
    #[error("DHT error: {0}")]
    Dht(String),
    /// Gossip mesh construction, join or subscribe failure
    #[error("gossip error: {0}")]
    Gossip(String),
    /// Envelope or payload (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Malformed persisted peer file
    #[error("peerstore error: {0}")]
    Peerstore(String),
    /// Directory store rejected a mutation
    #[error("directory error: {0}")]
    Directory(String),
    /// Message bus failure
    #[error("IPC error: {0}")]
    Ipc(String),
    /// Child process could not be spawned
    #[error("spawn error: {0}")]
    Spawn(String),
    /// The network task is gone
    #[error("network channel closed")]
    ChannelClosed,
    #[error("failed to publish empty message")]
    EmptyMessage,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for P2pError {
    fn from(err: serde_json::Error) -> Self {
        P2pError::Serialization(err.to_string())
    }
}

impl From<libp2p::multiaddr::Error> for P2pError {
    fn from(err: libp2p::multiaddr::Error) -> Self {
        P2pError::InvalidAddress(err.to_string())
    }
}

pub type P2pResult<T> = Result<T, P2pError>;
