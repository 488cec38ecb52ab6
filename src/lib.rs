//! Soroban peer-to-peer overlay
//!
//! Nodes of the soroban directory replicate short-lived key/value entries
//! over a gossip mesh. Connections run over Tor hidden services, or over
//! plain TCP in the insecure clearnet mode used for local testing, and peers
//! find each other through a Kademlia DHT.
//!
//! ## Key Components
//!
//! - **Transport**: libp2p connections carried over Tor circuits ([`p2p::transport`])
//! - **Discovery**: bootstrap selection and DHT rendezvous ([`p2p::dht`])
//! - **Mesh**: room topic, publish and receive loop ([`p2p::gossip`])
//! - **Persistence**: peerstore snapshots and reconnection ([`p2p::peerstore`])
//! - **Sharding**: one parent supervising N mesh processes over a NATS bus ([`ipc`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use soroban_p2p::config::Options;
//! use soroban_p2p::p2p::P2p;
//! use tokio::sync::{mpsc, oneshot};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> soroban_p2p::error::P2pResult<()> {
//! let (tx, mut rx) = mpsc::channel(16);
//! let mut p2p = P2p::new(tx);
//! let (ready, _) = oneshot::channel();
//! let cancel = CancellationToken::new();
//! p2p.start(&cancel, &Options::default(), ready).await?;
//!
//! p2p.publish_json("directory.add", &serde_json::json!({"key": "k", "value": "v"}))
//!     .await?;
//! if let Some(message) = rx.recv().await {
//!     println!("{}: {}", message.context, message.payload);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod p2p;
pub mod server;

pub use error::{P2pError, P2pResult};
