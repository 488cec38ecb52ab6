//! Command line surface of the `soroban` binary.

use clap::{ArgAction, Parser};

use crate::config::{GossipParameters, IpcConfig, Options, P2pConfig};
use crate::error::P2pResult;

#[derive(Parser, Debug)]
#[command(about = "Soroban peer-to-peer directory node", author, version)]
pub struct Cli {
    /// Log level (trace, debug, info, warning, error)
    #[arg(long = "log")]
    pub log: Option<String>,

    /// Log file, `-` for stderr
    #[arg(long = "logfile")]
    pub log_file: Option<String>,

    /// YAML configuration file
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<String>,

    /// Hex encoded ed25519 seed of the onion identity
    #[arg(long = "p2pSeed")]
    pub p2p_seed: Option<String>,

    /// Comma separated bootstrap multiaddresses
    #[arg(long = "p2pBootstrap")]
    pub p2p_bootstrap: Option<String>,

    /// Clearnet listen address when no seed is set
    #[arg(long = "p2pHostname")]
    pub p2p_hostname: Option<String>,

    #[arg(long = "p2pListenPort")]
    pub p2p_listen_port: Option<u16>,

    /// Connection manager low watermark
    #[arg(long = "p2pLowWater")]
    pub p2p_low_water: Option<usize>,

    /// Connection manager high watermark
    #[arg(long = "p2pHighWater")]
    pub p2p_high_water: Option<usize>,

    /// Gossip topic shared by all nodes
    #[arg(long = "p2pRoom")]
    pub p2p_room: Option<String>,

    /// Take part in the DHT as a server; `--p2pDHTServerMode=false` overrides the file
    #[arg(
        long = "p2pDHTServerMode",
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub p2p_dht_server_mode: Option<bool>,

    /// Peerstore file base path, `-` disables persistence
    #[arg(long = "p2pPeerstoreFile")]
    pub p2p_peerstore_file: Option<String>,

    /// SOCKS5 endpoint of the Tor daemon
    #[arg(long = "p2pSocksProxy")]
    pub p2p_socks_proxy: Option<String>,

    #[arg(long = "gossipD")]
    pub gossip_d: Option<usize>,
    #[arg(long = "gossipDlo")]
    pub gossip_dlo: Option<usize>,
    #[arg(long = "gossipDhi")]
    pub gossip_dhi: Option<usize>,
    #[arg(long = "gossipDout")]
    pub gossip_dout: Option<usize>,
    #[arg(long = "gossipDscore")]
    pub gossip_dscore: Option<usize>,
    #[arg(long = "gossipDlazy")]
    pub gossip_dlazy: Option<usize>,
    #[arg(long = "gossipPrunePeers")]
    pub gossip_prune_peers: Option<usize>,
    /// Discovery results per rendezvous query
    #[arg(long = "gossipLimit")]
    pub gossip_limit: Option<usize>,

    /// Base subject of the IPC bus
    #[arg(long = "ipcSubject")]
    pub ipc_subject: Option<String>,

    /// Shard identifier, set by the parent process
    #[arg(long = "ipcChildID")]
    pub ipc_child_id: Option<u32>,

    /// Number of shards to spawn
    #[arg(long = "ipcChildProcessCount")]
    pub ipc_child_process_count: Option<u32>,

    #[arg(long = "ipcNatsHost")]
    pub ipc_nats_host: Option<String>,

    #[arg(long = "ipcNatsPort")]
    pub ipc_nats_port: Option<u16>,
}

impl Cli {
    /// Resolves defaults, then the configuration file, then the given flags.
    pub fn into_options(self) -> P2pResult<Options> {
        let config = self.config.clone().unwrap_or_default();
        let mut options = Options::default().load(&config)?;
        let dht_server_mode = self.p2p_dht_server_mode;
        options.merge(self.overrides());
        if let Some(enabled) = dht_server_mode {
            options.p2p.dht_server_mode = enabled;
        }
        options.validate()?;
        Ok(options)
    }

    /// Flags as an options value where every absent flag is empty.
    fn overrides(self) -> Options {
        Options {
            log_level: self.log.unwrap_or_default(),
            log_file: self.log_file.unwrap_or_default(),
            p2p: P2pConfig {
                seed: self.p2p_seed.unwrap_or_default(),
                bootstrap: self.p2p_bootstrap.unwrap_or_default(),
                hostname: self.p2p_hostname.unwrap_or_default(),
                listen_port: self.p2p_listen_port.unwrap_or_default(),
                low_water: self.p2p_low_water.unwrap_or_default(),
                high_water: self.p2p_high_water.unwrap_or_default(),
                room: self.p2p_room.unwrap_or_default(),
                dht_server_mode: self.p2p_dht_server_mode.unwrap_or_default(),
                peerstore_file: self.p2p_peerstore_file.unwrap_or_default(),
                socks_proxy: self.p2p_socks_proxy.unwrap_or_default(),
            },
            gossip: GossipParameters {
                d: self.gossip_d.unwrap_or_default(),
                dlo: self.gossip_dlo.unwrap_or_default(),
                dhi: self.gossip_dhi.unwrap_or_default(),
                dout: self.gossip_dout.unwrap_or_default(),
                dscore: self.gossip_dscore.unwrap_or_default(),
                dlazy: self.gossip_dlazy.unwrap_or_default(),
                prune_peers: self.gossip_prune_peers.unwrap_or_default(),
                limit: self.gossip_limit.unwrap_or_default(),
            },
            ipc: IpcConfig {
                subject: self.ipc_subject.unwrap_or_default(),
                child_id: self.ipc_child_id.unwrap_or_default(),
                child_process_count: self.ipc_child_process_count.unwrap_or_default(),
                nats_host: self.ipc_nats_host.unwrap_or_default(),
                nats_port: self.ipc_nats_port.unwrap_or_default(),
            },
        }
    }
}
