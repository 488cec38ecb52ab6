//! Peer-to-peer overlay of the soroban directory.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────┐  commands   ┌──────────────────────────────────┐
//!  │    P2p     ├────────────►│ swarm task                       │
//!  │ (gossip.rs)│◄────────────┤  gossipsub · kademlia · identify │
//!  └─────┬──────┘  raw gossip │  connmgr · rendezvous            │
//!        │ Message            └───────────────┬──────────────────┘
//!        ▼                                    │ onion3 or tcp
//!  directory / IPC relay             Tor SOCKS · hidden service
//! ```
//!
//! Every node joins one gossip topic (the room). Peers are found through the
//! bootstrap list, the DHT rendezvous key of the room and the persisted
//! peerstore of the previous run.

pub mod connmgr;
pub mod dht;
pub mod gossip;
pub mod libp2p_network;
pub mod messages;
pub mod peerstore;
pub mod transport;

pub use gossip::{MeshState, P2p, Publisher};
pub use libp2p_network::{InboundGossip, NetworkHandle};
pub use messages::{DirectoryEntry, DirectoryMutation, Message, MessageRegistry};
pub use transport::{OnionEndpoint, OnionTransport};
