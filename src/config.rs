//! Node options.
//!
//! Options are resolved once at startup: built-in defaults, then an optional
//! YAML file, then command line flags. The resulting value is immutable and
//! handed down by reference.

use std::net::IpAddr;
use std::path::Path;

use libp2p::multiaddr::{Multiaddr, Protocol};
use serde::Deserialize;

use crate::error::{P2pError, P2pResult};

/// Peerstore file value that disables persistence.
pub const PEERSTORE_DISABLED: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "lowercase")]
pub struct Options {
    #[serde(rename = "loglevel")]
    pub log_level: String,
    #[serde(rename = "logfile")]
    pub log_file: String,
    pub p2p: P2pConfig,
    pub gossip: GossipParameters,
    pub ipc: IpcConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: "-".to_string(),
            p2p: P2pConfig::default(),
            gossip: GossipParameters::default(),
            ipc: IpcConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "lowercase")]
pub struct P2pConfig {
    /// Hex encoded ed25519 seed. Empty selects the clearnet fallback.
    pub seed: String,
    /// Comma separated bootstrap multiaddresses (each ending in `/p2p/<id>`)
    pub bootstrap: String,
    pub hostname: String,
    #[serde(rename = "listenport")]
    pub listen_port: u16,
    #[serde(rename = "lowwater")]
    pub low_water: usize,
    #[serde(rename = "highwater")]
    pub high_water: usize,
    pub room: String,
    #[serde(rename = "dhtservermode")]
    pub dht_server_mode: bool,
    #[serde(rename = "peerstorefile")]
    pub peerstore_file: String,
    /// SOCKS endpoint of the local Tor daemon
    #[serde(rename = "socksproxy")]
    pub socks_proxy: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            seed: String::new(),
            bootstrap: String::new(),
            hostname: String::new(),
            listen_port: 1042,
            low_water: 16,
            high_water: 40,
            room: "samourai-p2p".to_string(),
            dht_server_mode: false,
            peerstore_file: PEERSTORE_DISABLED.to_string(),
            socks_proxy: "127.0.0.1:9050".to_string(),
        }
    }
}

/// Gossip mesh degree parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "lowercase")]
pub struct GossipParameters {
    /// target mesh degree
    pub d: usize,
    pub dlo: usize,
    pub dhi: usize,
    /// minimum outbound mesh slots
    pub dout: usize,
    pub dscore: usize,
    pub dlazy: usize,
    #[serde(rename = "prunepeers")]
    pub prune_peers: usize,
    /// bound on discovery results per rendezvous query
    pub limit: usize,
}

impl Default for GossipParameters {
    fn default() -> Self {
        Self {
            d: 10,
            dlo: 8,
            dhi: 20,
            dout: 5,
            dscore: 7,
            dlazy: 10,
            prune_peers: 40,
            limit: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "lowercase")]
pub struct IpcConfig {
    pub subject: String,
    /// Non-zero when this process runs as a shard
    #[serde(rename = "childid")]
    pub child_id: u32,
    #[serde(rename = "childprocesscount")]
    pub child_process_count: u32,
    #[serde(rename = "natshost")]
    pub nats_host: String,
    #[serde(rename = "natsport")]
    pub nats_port: u16,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            subject: "ipc.server".to_string(),
            child_id: 0,
            child_process_count: 0,
            nats_host: "localhost".to_string(),
            nats_port: 4322,
        }
    }
}

impl Options {
    /// Applies a YAML file on top of `self`. An empty path is a no-op.
    pub fn load(mut self, path: &str) -> P2pResult<Self> {
        if path.is_empty() {
            return Ok(self);
        }
        let data = std::fs::read_to_string(Path::new(path))
            .map_err(|e| P2pError::Config(format!("unable to read {path}: {e}")))?;
        let file = Self::parse(&data)?;
        self.merge(file);
        Ok(self)
    }

    pub fn parse(data: &str) -> P2pResult<Self> {
        serde_yaml::from_str(data).map_err(|e| P2pError::Config(e.to_string()))
    }

    /// Overrides with every non-empty / non-zero value of `other`.
    pub fn merge(&mut self, other: Options) {
        merge_string(&mut self.log_level, other.log_level);
        merge_string(&mut self.log_file, other.log_file);
        self.p2p.merge(other.p2p);
        self.gossip.merge(other.gossip);
        self.ipc.merge(other.ipc);
    }

    pub fn validate(&self) -> P2pResult<()> {
        if self.p2p.low_water > self.p2p.high_water {
            return Err(P2pError::Config(format!(
                "low watermark {} exceeds high watermark {}",
                self.p2p.low_water, self.p2p.high_water
            )));
        }
        if self.p2p.room.is_empty() {
            return Err(P2pError::Config("room must not be empty".to_string()));
        }
        if !self.p2p.seed.is_empty() {
            self.p2p.seed_bytes()?;
        }
        self.p2p.clearnet_listen_addr(self.effective_listen_port())?;
        Ok(())
    }

    pub fn is_child(&self) -> bool {
        self.ipc.child_id > 0
    }

    /// Port this process listens on: a shard adds its child id to the base port.
    pub fn effective_listen_port(&self) -> u16 {
        let offset = u16::try_from(self.ipc.child_id).unwrap_or(u16::MAX);
        self.p2p.listen_port.saturating_add(offset)
    }
}

impl P2pConfig {
    pub fn merge(&mut self, other: P2pConfig) {
        merge_string(&mut self.seed, other.seed);
        merge_string(&mut self.bootstrap, other.bootstrap);
        merge_string(&mut self.hostname, other.hostname);
        merge_value(&mut self.listen_port, other.listen_port);
        merge_value(&mut self.low_water, other.low_water);
        merge_value(&mut self.high_water, other.high_water);
        merge_string(&mut self.room, other.room);
        if other.dht_server_mode {
            self.dht_server_mode = true;
        }
        merge_string(&mut self.peerstore_file, other.peerstore_file);
        merge_string(&mut self.socks_proxy, other.socks_proxy);
    }

    pub fn tor_enabled(&self) -> bool {
        !self.seed.is_empty()
    }

    pub fn peerstore_enabled(&self) -> bool {
        !self.peerstore_file.is_empty() && self.peerstore_file != PEERSTORE_DISABLED
    }

    pub fn seed_bytes(&self) -> P2pResult<[u8; 32]> {
        let bytes = hex::decode(self.seed.trim())
            .map_err(|e| P2pError::Config(format!("invalid p2p seed: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| P2pError::Config("p2p seed must be 32 bytes".to_string()))
    }

    /// Clearnet listen address (`/ip4/<hostname>/tcp/<port>`).
    pub fn clearnet_listen_addr(&self, port: u16) -> P2pResult<Multiaddr> {
        let host = if self.hostname.is_empty() {
            "0.0.0.0"
        } else {
            self.hostname.as_str()
        };
        let ip: IpAddr = host
            .parse()
            .map_err(|_| P2pError::Config(format!("invalid p2p hostname {host}")))?;
        let mut addr = Multiaddr::empty();
        match ip {
            IpAddr::V4(v4) => addr.push(Protocol::Ip4(v4)),
            IpAddr::V6(v6) => addr.push(Protocol::Ip6(v6)),
        }
        addr.push(Protocol::Tcp(port));
        Ok(addr)
    }
}

impl GossipParameters {
    pub fn merge(&mut self, other: GossipParameters) {
        merge_value(&mut self.d, other.d);
        merge_value(&mut self.dlo, other.dlo);
        merge_value(&mut self.dhi, other.dhi);
        merge_value(&mut self.dout, other.dout);
        merge_value(&mut self.dscore, other.dscore);
        merge_value(&mut self.dlazy, other.dlazy);
        merge_value(&mut self.prune_peers, other.prune_peers);
        merge_value(&mut self.limit, other.limit);
    }
}

impl IpcConfig {
    pub fn merge(&mut self, other: IpcConfig) {
        merge_string(&mut self.subject, other.subject);
        merge_value(&mut self.child_id, other.child_id);
        merge_value(&mut self.child_process_count, other.child_process_count);
        merge_string(&mut self.nats_host, other.nats_host);
        merge_value(&mut self.nats_port, other.nats_port);
    }
}

fn merge_string(target: &mut String, value: String) {
    if !value.is_empty() {
        *target = value;
    }
}

fn merge_value<T: Default + PartialEq>(target: &mut T, value: T) {
    if value != T::default() {
        *target = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_overrides_only_given_keys() {
        let yaml = "loglevel: debug\np2p:\n  room: test-room\n  lowwater: 4\ngossip:\n  d: 6\n  dlo: 0\n";
        let mut options = Options::default();
        options.merge(Options::parse(yaml).unwrap());

        assert_eq!(options.log_level, "debug");
        assert_eq!(options.p2p.room, "test-room");
        assert_eq!(options.p2p.low_water, 4);
        assert_eq!(options.p2p.high_water, 40);
        assert_eq!(options.gossip.d, 6);
        // zero keeps the default
        assert_eq!(options.gossip.dlo, 8);
        assert_eq!(options.ipc.nats_port, 4322);
    }

    #[test]
    fn test_validate_rejects_inverted_watermarks() {
        let mut options = Options::default();
        options.p2p.low_water = 50;
        assert!(matches!(options.validate(), Err(P2pError::Config(_))));
    }

    #[test]
    fn test_seed_must_be_32_hex_bytes() {
        let mut config = P2pConfig::default();
        config.seed = "abcd".to_string();
        assert!(config.seed_bytes().is_err());

        config.seed = "11".repeat(32);
        assert_eq!(config.seed_bytes().unwrap(), [0x11u8; 32]);
    }

    #[test]
    fn test_clearnet_listen_addr() {
        let mut config = P2pConfig::default();
        assert_eq!(
            config.clearnet_listen_addr(1042).unwrap().to_string(),
            "/ip4/0.0.0.0/tcp/1042"
        );

        config.hostname = "not a host".to_string();
        assert!(config.clearnet_listen_addr(1042).is_err());
    }

    #[test]
    fn test_shard_listen_port_is_offset_by_child_id() {
        let mut options = Options::default();
        assert_eq!(options.effective_listen_port(), 1042);

        options.ipc.child_id = 3;
        assert_eq!(options.effective_listen_port(), 1045);
    }
}
