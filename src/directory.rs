//! Key/value directory fed by gossip-delivered mutations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{P2pError, P2pResult};
use crate::p2p::messages::{DirectoryMutation, Message, MessageRegistry};

pub const TTL_SHORT: Duration = Duration::from_secs(60);
pub const TTL_DEFAULT: Duration = Duration::from_secs(5 * 60);
pub const TTL_LONG: Duration = Duration::from_secs(60 * 60);
/// Smallest accepted time to live.
pub const MIN_TTL: Duration = Duration::from_secs(1);

pub type NameValue = BTreeMap<String, String>;

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusInfo {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub keyspace: NameValue,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub stats: NameValue,
}

/// Multi-valued store with per-key expiry.
pub trait Directory: Send + Sync {
    fn status(&self) -> P2pResult<StatusInfo>;

    /// Resolves a mode label (`short`, `default`, `long`) to a duration.
    fn time_to_live(&self, mode: &str) -> Duration;

    fn list(&self, key: &str) -> P2pResult<Vec<String>>;

    /// Adds `value` under `key`. All values of a key share the latest TTL.
    fn add(&self, key: &str, value: &str, ttl: Duration) -> P2pResult<()>;

    fn remove(&self, key: &str, value: &str) -> P2pResult<()>;
}

#[derive(Debug)]
struct Slot {
    values: Vec<String>,
    expires: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    slots: Mutex<HashMap<String, Slot>>,
    added: Mutex<u64>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> P2pResult<MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| P2pError::Directory("directory lock poisoned".to_string()))
    }

    fn list_at(&self, key: &str, now: Instant) -> P2pResult<Vec<String>> {
        let mut slots = self.slots()?;
        match slots.get(key) {
            Some(slot) if slot.expires > now => Ok(slot.values.clone()),
            Some(_) => {
                slots.remove(key);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    fn add_at(&self, key: &str, value: &str, ttl: Duration, now: Instant) -> P2pResult<()> {
        if ttl < MIN_TTL {
            return Err(P2pError::Directory(format!(
                "time to live must be at least {}s",
                MIN_TTL.as_secs()
            )));
        }
        let mut slots = self.slots()?;
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            values: Vec::new(),
            expires: now,
        });
        if slot.expires <= now {
            slot.values.clear();
        }
        if !slot.values.iter().any(|v| v == value) {
            slot.values.push(value.to_string());
        }
        slot.expires = now + ttl;
        drop(slots);

        if let Ok(mut added) = self.added.lock() {
            *added += 1;
        }
        Ok(())
    }

    /// Drops every expired key.
    pub fn evict_expired(&self) -> P2pResult<usize> {
        self.evict_at(Instant::now())
    }

    fn evict_at(&self, now: Instant) -> P2pResult<usize> {
        let mut slots = self.slots()?;
        let before = slots.len();
        slots.retain(|_, slot| slot.expires > now);
        Ok(before - slots.len())
    }
}

impl Directory for MemoryDirectory {
    fn status(&self) -> P2pResult<StatusInfo> {
        let keys = self.slots()?.len();
        let added = self.added.lock().map(|a| *a).unwrap_or_default();
        let mut status = StatusInfo::default();
        status.keyspace.insert("keys".to_string(), keys.to_string());
        status.stats.insert("added".to_string(), added.to_string());
        Ok(status)
    }

    fn time_to_live(&self, mode: &str) -> Duration {
        match mode {
            "short" => TTL_SHORT,
            "long" => TTL_LONG,
            _ => TTL_DEFAULT,
        }
    }

    fn list(&self, key: &str) -> P2pResult<Vec<String>> {
        self.list_at(key, Instant::now())
    }

    fn add(&self, key: &str, value: &str, ttl: Duration) -> P2pResult<()> {
        self.add_at(key, value, ttl, Instant::now())
    }

    fn remove(&self, key: &str, value: &str) -> P2pResult<()> {
        let mut slots = self.slots()?;
        if let Some(slot) = slots.get_mut(key) {
            slot.values.retain(|v| v != value);
            if slot.values.is_empty() {
                slots.remove(key);
            }
        }
        Ok(())
    }
}

/// Applies one envelope. `Ok(false)` when its context is not a directory mutation.
pub fn apply_message(
    directory: &dyn Directory,
    registry: &MessageRegistry,
    message: &Message,
) -> P2pResult<bool> {
    let Some(decoded) = registry.decode(message) else {
        return Ok(false);
    };
    match decoded? {
        DirectoryMutation::Add(entry) => {
            let ttl = directory.time_to_live(&entry.mode);
            directory.add(&entry.key, &entry.value, ttl)?;
        }
        DirectoryMutation::Remove(entry) => directory.remove(&entry.key, &entry.value)?,
    }
    Ok(true)
}

/// Applies every delivered envelope to `directory` until cancelled or the queue closes.
pub async fn run_consumer(
    directory: Arc<dyn Directory>,
    registry: MessageRegistry,
    mut messages: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match apply_message(directory.as_ref(), &registry, &message) {
            Ok(true) => debug!("Applied {} mutation", message.context),
            Ok(false) => debug!("Ignoring message with context {}", message.context),
            Err(e) => warn!("Rejected {} mutation: {e}", message.context),
        }
    }
    info!("Directory consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::messages::{CONTEXT_DIRECTORY_ADD, CONTEXT_DIRECTORY_REMOVE};
    use serde_json::json;

    #[test]
    fn test_add_list_remove() {
        let directory = MemoryDirectory::new();
        directory.add("k", "a", TTL_DEFAULT).unwrap();
        directory.add("k", "b", TTL_DEFAULT).unwrap();
        directory.add("k", "a", TTL_DEFAULT).unwrap();
        assert_eq!(directory.list("k").unwrap(), vec!["a", "b"]);

        directory.remove("k", "a").unwrap();
        assert_eq!(directory.list("k").unwrap(), vec!["b"]);
        directory.remove("k", "b").unwrap();
        assert!(directory.list("k").unwrap().is_empty());
        assert!(directory.remove("missing", "x").is_ok());
    }

    #[test]
    fn test_entries_expire() {
        let directory = MemoryDirectory::new();
        let now = Instant::now();
        directory.add_at("k", "a", Duration::from_secs(2), now).unwrap();
        assert_eq!(directory.list_at("k", now + Duration::from_secs(1)).unwrap(), vec!["a"]);
        assert!(directory.list_at("k", now + Duration::from_secs(3)).unwrap().is_empty());

        directory.add_at("j", "a", Duration::from_secs(2), now).unwrap();
        directory
            .add_at("j", "b", Duration::from_secs(2), now + Duration::from_secs(3))
            .unwrap();
        assert_eq!(
            directory.list_at("j", now + Duration::from_secs(4)).unwrap(),
            vec!["b"]
        );
        assert_eq!(directory.evict_at(now + Duration::from_secs(10)).unwrap(), 1);
    }

    #[test]
    fn test_ttl_modes() {
        let directory = MemoryDirectory::new();
        assert_eq!(directory.time_to_live("short"), TTL_SHORT);
        assert_eq!(directory.time_to_live("default"), TTL_DEFAULT);
        assert_eq!(directory.time_to_live("long"), TTL_LONG);
        assert_eq!(directory.time_to_live(""), TTL_DEFAULT);
        assert!(directory.add("k", "v", Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_apply_message() {
        let directory = MemoryDirectory::new();
        let registry = MessageRegistry::default();

        let add = Message::new(
            CONTEXT_DIRECTORY_ADD,
            &json!({"key": "k", "value": "v", "mode": "short"}),
        )
        .unwrap();
        assert!(apply_message(&directory, &registry, &add).unwrap());
        assert_eq!(directory.list("k").unwrap(), vec!["v"]);

        let other = Message::new("chat.say", &json!("hi")).unwrap();
        assert!(!apply_message(&directory, &registry, &other).unwrap());

        let malformed = Message::new(CONTEXT_DIRECTORY_ADD, &json!([1])).unwrap();
        assert!(apply_message(&directory, &registry, &malformed).is_err());

        let remove = Message::new(CONTEXT_DIRECTORY_REMOVE, &json!({"key": "k", "value": "v"})).unwrap();
        assert!(apply_message(&directory, &registry, &remove).unwrap());
        assert!(directory.list("k").unwrap().is_empty());

        let status = directory.status().unwrap();
        assert_eq!(status.stats["added"], "1");
    }

    #[tokio::test]
    async fn test_consumer_applies_until_closed() {
        let directory = Arc::new(MemoryDirectory::new());
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run_consumer(
            directory.clone(),
            MessageRegistry::default(),
            rx,
            CancellationToken::new(),
        ));

        tx.send(
            Message::new(CONTEXT_DIRECTORY_ADD, &json!({"key": "k", "value": "v"})).unwrap(),
        )
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(directory.list("k").unwrap(), vec!["v"]);
    }
}
