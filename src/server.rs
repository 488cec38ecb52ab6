//! Run modes of a soroban process.
//!
//! - shard (`ipc.child_id > 0`): headless mesh node relaying to the parent over the bus
//! - parent (`ipc.child_process_count > 0`): owns the directory and supervises the shards
//! - single process: mesh node feeding its own directory

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Options;
use crate::directory::{run_consumer, MemoryDirectory};
use crate::error::P2pResult;
use crate::ipc::child::{Supervisor, TokioLauncher};
use crate::ipc::{relay_child, relay_parent, MessageBus, NatsBus, Subjects};
use crate::p2p::gossip::P2p;
use crate::p2p::messages::{Message, MessageRegistry};

/// Depth of the decoded message queue between the mesh and its consumer.
pub const MESSAGE_QUEUE_SIZE: usize = 256;
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(options: &Options, cancel: CancellationToken) -> P2pResult<()> {
    if options.is_child() {
        run_child(options, cancel).await
    } else if options.ipc.child_process_count > 0 {
        run_parent(options, cancel).await
    } else {
        run_standalone(options, cancel).await
    }
}

async fn start_mesh(
    options: &Options,
    cancel: &CancellationToken,
) -> P2pResult<(P2p, mpsc::Receiver<Message>)> {
    let (on_message, messages) = mpsc::channel(MESSAGE_QUEUE_SIZE);
    let mut p2p = P2p::new(on_message);
    let (ready_tx, ready_rx) = oneshot::channel();
    p2p.start(cancel, options, ready_tx).await?;
    if ready_rx.await.is_ok() {
        debug!("P2P mesh ready");
    }
    Ok((p2p, messages))
}

async fn run_child(options: &Options, cancel: CancellationToken) -> P2pResult<()> {
    let child_id = options.ipc.child_id;
    info!(
        "Soroban started in child mode (child {child_id}, port {})",
        options.effective_listen_port()
    );
    let bus: Arc<dyn MessageBus> =
        Arc::new(NatsBus::connect(&options.ipc.nats_host, options.ipc.nats_port).await?);
    let (mut p2p, messages) = start_mesh(options, &cancel).await?;

    let relayed = relay_child(
        bus,
        Subjects::new(&options.ipc.subject),
        child_id,
        p2p.publisher(),
        messages,
        cancel.clone(),
    )
    .await;
    if relayed.is_ok() {
        cancel.cancelled().await;
    }
    p2p.shutdown().await;
    relayed
}

async fn run_parent(options: &Options, cancel: CancellationToken) -> P2pResult<()> {
    let directory = Arc::new(MemoryDirectory::new());
    let bus: Arc<dyn MessageBus> =
        Arc::new(NatsBus::connect(&options.ipc.nats_host, options.ipc.nats_port).await?);

    let mut supervisor = Supervisor::new(TokioLauncher)?;
    for child_id in 1..=options.ipc.child_process_count {
        if let Err(e) = supervisor.start_child(child_id, options) {
            supervisor.shutdown().await;
            return Err(e);
        }
    }
    info!("Started {} shards", supervisor.len());

    let eviction = tokio::spawn(evict_periodically(directory.clone(), cancel.clone()));
    let relayed = relay_parent(
        bus,
        Subjects::new(&options.ipc.subject),
        directory,
        MessageRegistry::default(),
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    supervisor.shutdown().await;
    let _ = eviction.await;
    relayed
}

async fn run_standalone(options: &Options, cancel: CancellationToken) -> P2pResult<()> {
    let directory = Arc::new(MemoryDirectory::new());
    let (mut p2p, messages) = start_mesh(options, &cancel).await?;

    let consumer = tokio::spawn(run_consumer(
        directory.clone(),
        MessageRegistry::default(),
        messages,
        cancel.clone(),
    ));
    let eviction = tokio::spawn(evict_periodically(directory, cancel.clone()));
    info!("Soroban started");

    cancel.cancelled().await;
    p2p.shutdown().await;
    let _ = consumer.await;
    let _ = eviction.await;
    Ok(())
}

async fn evict_periodically(directory: Arc<MemoryDirectory>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Ok(evicted) = directory.evict_expired() {
                    if evicted > 0 {
                        debug!("Evicted {evicted} expired keys");
                    }
                }
            }
        }
    }
}

/// Cancels `cancel` on Ctrl-C or SIGTERM.
pub fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_standalone_node_stops_on_cancel() {
        let mut options = Options::default();
        options.p2p.hostname = "127.0.0.1".to_string();
        options.p2p.listen_port = 0;
        let cancel = CancellationToken::new();

        let node = {
            let cancel = cancel.clone();
            tokio::spawn(async move { run(&options, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!node.is_finished());

        cancel.cancel();
        node.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_standalone_startup_failure_is_fatal() {
        let mut options = Options::default();
        options.p2p.bootstrap = "/ip4/10.0.0.1/tcp/1042".to_string();
        options.p2p.listen_port = 0;
        assert!(run(&options, CancellationToken::new()).await.is_err());
    }
}
