//! Peerstore persistence.
//!
//! Known peers are written to `<base>.c<child id>.json` every five minutes.
//! On startup a random subset of them is dialed again so a restarted node
//! does not depend on the bootstrap peers alone.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use libp2p::futures::future::{join_all, BoxFuture, FutureExt};
use libp2p::multiaddr::Multiaddr;
use libp2p::PeerId;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};
use crate::p2p::libp2p_network::NetworkHandle;

pub const PERSIST_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One persisted peer, keyed like go-libp2p's `AddrInfo`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    #[serde(rename = "ID", alias = "PeerID")]
    pub id: String,
    #[serde(rename = "Addrs", alias = "Addresses")]
    pub addrs: Vec<String>,
}

/// What persistence needs from a running node.
pub trait Peerstore: Send + Sync {
    fn local_peer_id(&self) -> PeerId;
    fn known_peers(&self) -> BoxFuture<'_, P2pResult<Vec<(PeerId, Vec<Multiaddr>)>>>;
    fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> BoxFuture<'_, P2pResult<()>>;
}

impl Peerstore for NetworkHandle {
    fn local_peer_id(&self) -> PeerId {
        NetworkHandle::local_peer_id(self)
    }

    fn known_peers(&self) -> BoxFuture<'_, P2pResult<Vec<(PeerId, Vec<Multiaddr>)>>> {
        NetworkHandle::known_peers(self).boxed()
    }

    fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> BoxFuture<'_, P2pResult<()>> {
        NetworkHandle::connect(self, peer, addrs).boxed()
    }
}

pub fn peerstore_path(base: &str, child_id: u32) -> PathBuf {
    PathBuf::from(format!("{base}.c{child_id}.json"))
}

/// Peers worth persisting: never `local`, at most `high_water + 1` of them.
pub fn snapshot_records(
    local: PeerId,
    peers: Vec<(PeerId, Vec<Multiaddr>)>,
    high_water: usize,
) -> Vec<PeerRecord> {
    peers
        .into_iter()
        .filter(|(peer, addrs)| *peer != local && !addrs.is_empty())
        .take(high_water.saturating_add(1))
        .map(|(peer, addrs)| PeerRecord {
            id: peer.to_string(),
            addrs: addrs.iter().map(Multiaddr::to_string).collect(),
        })
        .collect()
}

/// Writes one snapshot, replacing the previous file. Returns the number of peers written.
pub async fn persist_peerstore<P: Peerstore + ?Sized>(
    peerstore: &P,
    config: &P2pConfig,
    child_id: u32,
) -> P2pResult<usize> {
    let records = snapshot_records(
        peerstore.local_peer_id(),
        peerstore.known_peers().await?,
        config.high_water,
    );
    if records.is_empty() {
        return Ok(0);
    }
    let mut data = serde_json::to_vec(&records)?;
    data.push(b'\n');
    tokio::fs::write(peerstore_path(&config.peerstore_file, child_id), data).await?;
    Ok(records.len())
}

/// Snapshots the peerstore every [`PERSIST_INTERVAL`] until cancelled.
pub fn start_peerstore_persistence<P: Peerstore + 'static>(
    cancel: CancellationToken,
    config: P2pConfig,
    child_id: u32,
    peerstore: P,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + PERSIST_INTERVAL, PERSIST_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Exiting peerstore persistence loop");
                    return;
                }
                _ = ticker.tick() => {
                    match persist_peerstore(&peerstore, &config, child_id).await {
                        Ok(count) => debug!("Persisted {count} peers"),
                        Err(e) => warn!("Failed to persist peerstore: {e}"),
                    }
                }
            }
        }
    })
}

/// Reads a snapshot. A missing file yields no peers.
pub async fn load_persisted_peers(path: &Path) -> P2pResult<Vec<(PeerId, Vec<Multiaddr>)>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let records: Vec<PeerRecord> = serde_json::from_slice(&data)
        .map_err(|e| P2pError::Peerstore(format!("malformed {}: {e}", path.display())))?;

    records
        .into_iter()
        .map(|record| {
            let peer = record
                .id
                .parse::<PeerId>()
                .map_err(|e| P2pError::Peerstore(format!("invalid peer id {}: {e}", record.id)))?;
            let addrs = record
                .addrs
                .iter()
                .map(|a| {
                    a.parse::<Multiaddr>()
                        .map_err(|e| P2pError::Peerstore(format!("invalid address {a}: {e}")))
                })
                .collect::<P2pResult<Vec<_>>>()?;
            Ok((peer, addrs))
        })
        .collect()
}

/// Keeps everything up to `low_water / 2` records, otherwise a random `low_water / 2 + 1`.
pub fn select_persisted_peers<T, R: Rng + ?Sized>(
    mut records: Vec<T>,
    low_water: usize,
    rng: &mut R,
) -> Vec<T> {
    let max_selected = low_water / 2;
    if records.len() > max_selected {
        records.shuffle(rng);
        records.truncate(max_selected + 1);
    }
    records
}

/// Dials the persisted peers concurrently and waits for every attempt.
///
/// Returns the number of attempts. Failed attempts are only logged.
pub async fn connect_to_persisted_peers<P: Peerstore + ?Sized>(
    peerstore: &P,
    config: &P2pConfig,
    child_id: u32,
) -> P2pResult<usize> {
    let path = peerstore_path(&config.peerstore_file, child_id);
    let records = load_persisted_peers(&path).await?;
    let local = peerstore.local_peer_id();

    let selected: Vec<_> = select_persisted_peers(records, config.low_water, &mut process_rng())
        .into_iter()
        .filter(|(peer, _)| *peer != local)
        .collect();

    let attempts = selected.into_iter().map(|(peer, addrs)| async move {
        debug!("Bootstrapping attempt with {peer}");
        if let Err(e) = peerstore.connect(peer, addrs).await {
            warn!("Bootstrap warning: {peer}: {e}");
        }
    });
    let count = join_all(attempts).await.len();
    Ok(count)
}

/// Generator with one seed for the whole process run.
fn process_rng() -> StdRng {
    static SEED: OnceLock<u64> = OnceLock::new();
    StdRng::seed_from_u64(*SEED.get_or_init(rand::random))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FakePeerstore {
        local: PeerId,
        peers: Vec<(PeerId, Vec<Multiaddr>)>,
        failing: HashSet<PeerId>,
        dialed: Mutex<Vec<PeerId>>,
    }

    impl FakePeerstore {
        fn new(peers: Vec<(PeerId, Vec<Multiaddr>)>) -> Self {
            Self {
                local: PeerId::random(),
                peers,
                failing: HashSet::new(),
                dialed: Mutex::new(Vec::new()),
            }
        }
    }

    impl Peerstore for FakePeerstore {
        fn local_peer_id(&self) -> PeerId {
            self.local
        }

        fn known_peers(&self) -> BoxFuture<'_, P2pResult<Vec<(PeerId, Vec<Multiaddr>)>>> {
            let peers = self.peers.clone();
            async move { Ok(peers) }.boxed()
        }

        fn connect(&self, peer: PeerId, _addrs: Vec<Multiaddr>) -> BoxFuture<'_, P2pResult<()>> {
            self.dialed.lock().unwrap().push(peer);
            let failed = self.failing.contains(&peer);
            async move {
                if failed {
                    Err(P2pError::Transport("unreachable".to_string()))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    fn peers(count: usize) -> Vec<(PeerId, Vec<Multiaddr>)> {
        (0..count)
            .map(|i| {
                let addr = format!("/ip4/10.0.0.{}/tcp/1042", i % 250).parse().unwrap();
                (PeerId::random(), vec![addr])
            })
            .collect()
    }

    fn config_in(dir: &Path) -> P2pConfig {
        P2pConfig {
            peerstore_file: dir.join("peers").to_string_lossy().into_owned(),
            low_water: 6,
            high_water: 8,
            ..P2pConfig::default()
        }
    }

    #[test]
    fn test_snapshot_excludes_self_and_is_bounded() {
        let local = PeerId::random();
        for count in [0, 1, 5, 6, 50] {
            let mut known = peers(count);
            known.insert(0, (local, vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()]));
            known.push((PeerId::random(), Vec::new()));
            let records = snapshot_records(local, known, 4);
            assert!(records.len() <= 5);
            assert_eq!(records.len(), count.min(5));
            assert!(records.iter().all(|r| r.id != local.to_string()));
        }
    }

    #[test]
    fn test_peerstore_path() {
        assert_eq!(
            peerstore_path("/var/lib/soroban/peers", 3),
            PathBuf::from("/var/lib/soroban/peers.c3.json")
        );
    }

    #[test]
    fn test_select_persisted_peers() {
        let mut rng = StdRng::seed_from_u64(5);
        let records: Vec<u32> = (0..20).collect();
        let selected = select_persisted_peers(records.clone(), 16, &mut rng);
        assert_eq!(selected.len(), 9);
        let unique: HashSet<_> = selected.iter().collect();
        assert_eq!(unique.len(), 9);

        let few: Vec<u32> = (0..8).collect();
        assert_eq!(select_persisted_peers(few.clone(), 16, &mut rng), few);

        let exact: Vec<u32> = (0..9).collect();
        assert_eq!(select_persisted_peers(exact, 16, &mut rng).len(), 9);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let known = peers(3);
        let store = FakePeerstore::new(known.clone());

        assert_eq!(persist_peerstore(&store, &config, 2).await.unwrap(), 3);
        let path = peerstore_path(&config.peerstore_file, 2);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with("\n"));
        assert!(raw.contains("\"ID\""));

        let loaded = load_persisted_peers(&path).await.unwrap();
        assert_eq!(loaded, known);

        // a shorter snapshot truncates the previous one
        let store = FakePeerstore::new(known[..1].to_vec());
        persist_peerstore(&store, &config, 2).await.unwrap();
        assert_eq!(load_persisted_peers(&path).await.unwrap(), known[..1].to_vec());
    }

    #[tokio::test]
    async fn test_empty_snapshot_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let store = FakePeerstore::new(Vec::new());
        assert_eq!(persist_peerstore(&store, &config, 1).await.unwrap(), 0);
        assert!(!peerstore_path(&config.peerstore_file, 1).exists());
    }

    #[tokio::test]
    async fn test_reload_missing_file_dials_nobody() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let store = FakePeerstore::new(Vec::new());
        assert_eq!(connect_to_persisted_peers(&store, &config, 1).await.unwrap(), 0);
        assert!(store.dialed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_malformed_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(peerstore_path(&config.peerstore_file, 1), b"{not json").unwrap();
        let store = FakePeerstore::new(Vec::new());
        assert!(matches!(
            connect_to_persisted_peers(&store, &config, 1).await,
            Err(P2pError::Peerstore(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_dials_subset_and_tolerates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let known = peers(10);
        let records = snapshot_records(PeerId::random(), known.clone(), 100);
        std::fs::write(
            peerstore_path(&config.peerstore_file, 1),
            serde_json::to_vec(&records).unwrap(),
        )
        .unwrap();

        let mut store = FakePeerstore::new(Vec::new());
        store.failing = known.iter().take(5).map(|(peer, _)| *peer).collect();
        // low_water 6 selects 6 / 2 + 1 peers
        assert_eq!(connect_to_persisted_peers(&store, &config, 1).await.unwrap(), 4);
        assert_eq!(store.dialed.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_legacy_record_keys_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        let peer = PeerId::random();
        std::fs::write(
            &path,
            format!(r#"[{{"PeerID":"{peer}","Addresses":["/ip4/10.0.0.1/tcp/1042"]}}]"#),
        )
        .unwrap();
        let loaded = load_persisted_peers(&path).await.unwrap();
        assert_eq!(loaded[0].0, peer);
    }
}
