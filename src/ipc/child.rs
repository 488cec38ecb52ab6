//! Shard processes spawned from the current executable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use libp2p::futures::future::{BoxFuture, FutureExt};
use tracing::{info, warn};

use crate::config::Options;
use crate::error::{P2pError, P2pResult};

/// One shard as launched by the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildDescriptor {
    pub child_id: u32,
    /// port the shard binds: base port + child id
    pub listen_port: u16,
    pub nats_host: String,
    pub nats_port: u16,
}

impl ChildDescriptor {
    pub fn new(child_id: u32, options: &Options) -> Self {
        let offset = u16::try_from(child_id).unwrap_or(u16::MAX);
        Self {
            child_id,
            listen_port: options.p2p.listen_port.saturating_add(offset),
            nats_host: options.ipc.nats_host.clone(),
            nats_port: options.ipc.nats_port,
        }
    }
}

/// Command line of shard `child_id`.
///
/// The base listen port is passed through: the shard applies its own offset.
/// `--p2pDHTServerMode` is always the last flag.
pub fn child_arguments(child_id: u32, options: &Options) -> Vec<String> {
    let p2p = &options.p2p;
    let gossip = &options.gossip;
    let mut args = vec![
        "--ipcChildID".to_string(),
        child_id.to_string(),
        "--ipcSubject".to_string(),
        options.ipc.subject.clone(),
        "--ipcNatsHost".to_string(),
        options.ipc.nats_host.clone(),
        "--ipcNatsPort".to_string(),
        options.ipc.nats_port.to_string(),
    ];
    let mut push = |flag: &str, value: String| {
        if !value.is_empty() {
            args.push(flag.to_string());
            args.push(value);
        }
    };
    push("--p2pSeed", p2p.seed.clone());
    push("--p2pBootstrap", p2p.bootstrap.clone());
    push("--p2pHostname", p2p.hostname.clone());
    push("--p2pRoom", p2p.room.clone());
    push("--p2pListenPort", p2p.listen_port.to_string());
    push("--p2pLowWater", p2p.low_water.to_string());
    push("--p2pHighWater", p2p.high_water.to_string());
    push("--p2pPeerstoreFile", p2p.peerstore_file.clone());
    push("--p2pSocksProxy", p2p.socks_proxy.clone());
    push("--gossipD", gossip.d.to_string());
    push("--gossipDlo", gossip.dlo.to_string());
    push("--gossipDhi", gossip.dhi.to_string());
    push("--gossipDout", gossip.dout.to_string());
    push("--gossipDscore", gossip.dscore.to_string());
    push("--gossipDlazy", gossip.dlazy.to_string());
    push("--gossipPrunePeers", gossip.prune_peers.to_string());
    push("--gossipLimit", gossip.limit.to_string());
    push("--log", options.log_level.clone());
    if p2p.dht_server_mode {
        args.push("--p2pDHTServerMode".to_string());
    }
    args
}

pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;
    /// Kills the process and reaps it.
    fn kill(&mut self) -> BoxFuture<'_, P2pResult<()>>;
}

/// Starts processes on behalf of the [`Supervisor`].
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, name: &str, program: &Path, args: &[String]) -> P2pResult<Box<dyn ChildProcess>>;
}

/// Launches real processes; they are killed if their handle is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

struct TokioChild(tokio::process::Child);

impl ChildProcess for TokioChild {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn kill(&mut self) -> BoxFuture<'_, P2pResult<()>> {
        async move { Ok(self.0.kill().await?) }.boxed()
    }
}

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, name: &str, program: &Path, args: &[String]) -> P2pResult<Box<dyn ChildProcess>> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| P2pError::Spawn(format!("{name}: {e}")))?;
        info!("Started {name} (pid {:?})", child.id());
        Ok(Box::new(TokioChild(child)))
    }
}

struct RunningChild {
    descriptor: ChildDescriptor,
    process: Box<dyn ChildProcess>,
}

/// Running shards keyed by child id.
pub struct Supervisor<L> {
    executable: PathBuf,
    launcher: L,
    children: BTreeMap<u32, RunningChild>,
}

impl<L: ProcessLauncher> Supervisor<L> {
    /// Supervises copies of the current executable.
    pub fn new(launcher: L) -> P2pResult<Self> {
        let executable = std::env::current_exe()
            .map_err(|e| P2pError::Spawn(format!("failed to get current executable path: {e}")))?;
        Self::with_executable(launcher, executable)
    }

    pub fn with_executable(launcher: L, executable: PathBuf) -> P2pResult<Self> {
        let executable = if executable.is_absolute() {
            executable
        } else {
            Path::new(".").join(executable)
        };
        if !executable.is_file() {
            return Err(P2pError::Spawn(format!(
                "soroban executable not found: {}",
                executable.display()
            )));
        }
        Ok(Self {
            executable,
            launcher,
            children: BTreeMap::new(),
        })
    }

    pub fn start_child(&mut self, child_id: u32, options: &Options) -> P2pResult<&ChildDescriptor> {
        if child_id == 0 {
            return Err(P2pError::Spawn("child id 0 is reserved for the parent".to_string()));
        }
        if self.children.contains_key(&child_id) {
            return Err(P2pError::Spawn(format!("child {child_id} already running")));
        }
        let name = format!("soroban-child-{child_id}");
        let process = self.launcher.launch(
            &name,
            &self.executable,
            &child_arguments(child_id, options),
        )?;
        let descriptor = ChildDescriptor::new(child_id, options);
        let running = self.children.entry(child_id).or_insert(RunningChild {
            descriptor,
            process,
        });
        Ok(&running.descriptor)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ChildDescriptor> {
        self.children.values().map(|child| &child.descriptor)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Kills every child.
    pub async fn shutdown(&mut self) {
        while let Some((child_id, mut child)) = self.children.pop_first() {
            match child.process.kill().await {
                Ok(()) => info!("Stopped soroban-child-{child_id}"),
                Err(e) => warn!("Failed to stop soroban-child-{child_id}: {e}"),
            }
        }
    }
}
