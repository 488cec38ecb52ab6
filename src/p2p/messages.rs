//! Gossip envelope and the typed directory mutations it carries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::P2pResult;

/// Context label of a directory insertion.
pub const CONTEXT_DIRECTORY_ADD: &str = "directory.add";
/// Context label of a directory removal.
pub const CONTEXT_DIRECTORY_REMOVE: &str = "directory.remove";

/// Envelope used for all gossip traffic.
///
/// Serializes to `{"Context": <label>, "Payload": <json>}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    #[serde(rename = "Context")]
    pub context: String,
    #[serde(rename = "Payload")]
    pub payload: Value,
}

impl Message {
    pub fn new<T: Serialize + ?Sized>(context: &str, payload: &T) -> P2pResult<Self> {
        Ok(Self {
            context: context.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn to_bytes(&self) -> P2pResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Sole validation gate for inbound gossip.
    pub fn from_bytes(data: &[u8]) -> P2pResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Key/value pair of a directory mutation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub key: String,
    pub value: String,
    /// TTL mode label, resolved by the directory
    #[serde(default)]
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryMutation {
    Add(DirectoryEntry),
    Remove(DirectoryEntry),
}

impl DirectoryMutation {
    pub fn context(&self) -> &'static str {
        match self {
            DirectoryMutation::Add(_) => CONTEXT_DIRECTORY_ADD,
            DirectoryMutation::Remove(_) => CONTEXT_DIRECTORY_REMOVE,
        }
    }

    pub fn entry(&self) -> &DirectoryEntry {
        match self {
            DirectoryMutation::Add(entry) | DirectoryMutation::Remove(entry) => entry,
        }
    }

    pub fn to_message(&self) -> P2pResult<Message> {
        Message::new(self.context(), self.entry())
    }
}

pub type DecodeFn = fn(&Value) -> P2pResult<DirectoryMutation>;

/// Maps a context label to the decoder of its payload.
pub struct MessageRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl MessageRegistry {
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register(&mut self, context: &'static str, decode: DecodeFn) {
        self.decoders.insert(context, decode);
    }

    pub fn knows(&self, context: &str) -> bool {
        self.decoders.contains_key(context)
    }

    /// `None` when no decoder is registered for the message context.
    pub fn decode(&self, message: &Message) -> Option<P2pResult<DirectoryMutation>> {
        self.decoders
            .get(message.context.as_str())
            .map(|decode| decode(&message.payload))
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(CONTEXT_DIRECTORY_ADD, decode_add);
        registry.register(CONTEXT_DIRECTORY_REMOVE, decode_remove);
        registry
    }
}

fn decode_entry(payload: &Value) -> P2pResult<DirectoryEntry> {
    Ok(DirectoryEntry::deserialize(payload)?)
}

fn decode_add(payload: &Value) -> P2pResult<DirectoryMutation> {
    decode_entry(payload).map(DirectoryMutation::Add)
}

fn decode_remove(payload: &Value) -> P2pResult<DirectoryMutation> {
    decode_entry(payload).map(DirectoryMutation::Remove)
}
