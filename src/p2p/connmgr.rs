//! Watermark based connection manager.
//!
//! Once more than `high_water` peers are connected, the oldest unprotected
//! peers past their grace period are selected for disconnection until the
//! count is back down to `low_water`.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use libp2p::PeerId;

use crate::error::{P2pError, P2pResult};

/// New connections are never trimmed before this delay.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct ConnectionManager {
    low_water: usize,
    high_water: usize,
    grace: Duration,
    connected: HashMap<PeerId, Instant>,
}

impl ConnectionManager {
    pub fn new(low_water: usize, high_water: usize) -> P2pResult<Self> {
        Self::with_grace(low_water, high_water, DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace(low_water: usize, high_water: usize, grace: Duration) -> P2pResult<Self> {
        if low_water > high_water {
            return Err(P2pError::Config(format!(
                "connection manager low watermark {low_water} exceeds high watermark {high_water}"
            )));
        }
        Ok(Self {
            low_water,
            high_water,
            grace,
            connected: HashMap::new(),
        })
    }

    pub fn connected(&mut self, peer: PeerId, now: Instant) {
        self.connected.entry(peer).or_insert(now);
    }

    pub fn disconnected(&mut self, peer: &PeerId) {
        self.connected.remove(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.connected.len()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }

    /// Peers to disconnect, oldest first. Empty unless the high watermark is exceeded.
    pub fn trim_candidates(&self, now: Instant, protected: &HashSet<PeerId>) -> Vec<PeerId> {
        if self.connected.len() <= self.high_water {
            return Vec::new();
        }
        let excess = self.connected.len() - self.low_water;

        let mut candidates: Vec<(Instant, PeerId)> = self
            .connected
            .iter()
            .filter(|(peer, since)| {
                !protected.contains(peer) && now.saturating_duration_since(**since) >= self.grace
            })
            .map(|(peer, since)| (*since, *peer))
            .collect();
        candidates.sort();
        candidates
            .into_iter()
            .take(excess)
            .map(|(_, peer)| peer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(count: usize, low: usize, high: usize) -> (ConnectionManager, Vec<PeerId>, Instant) {
        let mut manager = ConnectionManager::with_grace(low, high, Duration::from_secs(10)).unwrap();
        let start = Instant::now();
        let peers: Vec<PeerId> = (0..count).map(|_| PeerId::random()).collect();
        for (i, peer) in peers.iter().enumerate() {
            manager.connected(*peer, start + Duration::from_millis(i as u64));
        }
        (manager, peers, start)
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        assert!(ConnectionManager::new(10, 5).is_err());
    }

    #[test]
    fn test_no_trim_below_high_water() {
        let (manager, _, start) = manager_with(5, 2, 5);
        assert!(manager
            .trim_candidates(start + Duration::from_secs(60), &HashSet::new())
            .is_empty());
    }

    #[test]
    fn test_trims_oldest_down_to_low_water() {
        let (manager, peers, start) = manager_with(8, 3, 5);
        let trimmed = manager.trim_candidates(start + Duration::from_secs(60), &HashSet::new());
        assert_eq!(trimmed, peers[..5].to_vec());
    }

    #[test]
    fn test_grace_period_and_protection() {
        let (manager, peers, start) = manager_with(8, 3, 5);
        assert!(manager.trim_candidates(start, &HashSet::new()).is_empty());

        let protected: HashSet<PeerId> = peers[..2].iter().copied().collect();
        let trimmed = manager.trim_candidates(start + Duration::from_secs(60), &protected);
        assert_eq!(trimmed, peers[2..7].to_vec());
    }
}
