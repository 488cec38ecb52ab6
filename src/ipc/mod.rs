//! Inter-process bus between the parent and its shards.
//!
//! Three subjects derive from the configured base subject:
//!
//! - `<subject>.parent`: envelopes a shard received from the mesh
//! - `<subject>.children`: envelopes the parent wants published by every shard
//! - `<subject>.ready`: one handshake per shard once its mesh is up

pub mod child;

use std::sync::Arc;

use libp2p::futures::future::{BoxFuture, FutureExt};
use libp2p::futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::{apply_message, Directory};
use crate::error::{P2pError, P2pResult};
use crate::p2p::gossip::Publisher;
use crate::p2p::messages::{Message, MessageRegistry};

/// Context of the shard ready handshake.
pub const CONTEXT_IPC_READY: &str = "ipc.ready";

/// Subject addressed publish/subscribe.
pub trait MessageBus: Send + Sync {
    fn publish(&self, subject: String, data: Vec<u8>) -> BoxFuture<'_, P2pResult<()>>;
    fn subscribe(&self, subject: String) -> BoxFuture<'_, P2pResult<BoxStream<'static, Vec<u8>>>>;
}

/// NATS client bound to the configured server.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(host: &str, port: u16) -> P2pResult<Self> {
        let addr = format!("{host}:{port}");
        let client = async_nats::connect(addr.as_str())
            .await
            .map_err(|e| P2pError::Ipc(format!("unable to reach nats at {addr}: {e}")))?;
        info!("Connected to nats at {addr}");
        Ok(Self { client })
    }
}

impl MessageBus for NatsBus {
    fn publish(&self, subject: String, data: Vec<u8>) -> BoxFuture<'_, P2pResult<()>> {
        async move {
            self.client
                .publish(subject, data.into())
                .await
                .map_err(|e| P2pError::Ipc(e.to_string()))
        }
        .boxed()
    }

    fn subscribe(&self, subject: String) -> BoxFuture<'_, P2pResult<BoxStream<'static, Vec<u8>>>> {
        async move {
            let subscriber = self
                .client
                .subscribe(subject)
                .await
                .map_err(|e| P2pError::Ipc(e.to_string()))?;
            Ok(subscriber.map(|message| message.payload.to_vec()).boxed())
        }
        .boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    pub parent: String,
    pub children: String,
    pub ready: String,
}

impl Subjects {
    pub fn new(base: &str) -> Self {
        Self {
            parent: format!("{base}.parent"),
            children: format!("{base}.children"),
            ready: format!("{base}.ready"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyPayload {
    pub child_id: u32,
}

/// Shard side of the bus.
///
/// Sends the ready handshake, then forwards mesh deliveries to the parent and
/// publishes every envelope arriving on `<subject>.children`, until cancelled.
pub async fn relay_child(
    bus: Arc<dyn MessageBus>,
    subjects: Subjects,
    child_id: u32,
    publisher: Publisher,
    mut from_mesh: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) -> P2pResult<()> {
    let mut from_parent = bus.subscribe(subjects.children.clone()).await?;
    let ready = Message::new(CONTEXT_IPC_READY, &ReadyPayload { child_id })?;
    bus.publish(subjects.ready.clone(), ready.to_bytes()?).await?;
    info!("Child {child_id} relay started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(message) = from_mesh.recv() => {
                let data = message.to_bytes()?;
                if let Err(e) = bus.publish(subjects.parent.clone(), data).await {
                    warn!("Failed to forward {} to parent: {e}", message.context);
                }
            }
            next = from_parent.next() => {
                let Some(data) = next else {
                    warn!("Parent subscription closed");
                    break;
                };
                let Ok(text) = String::from_utf8(data) else {
                    debug!("Skip non utf-8 parent message");
                    continue;
                };
                if Message::from_bytes(text.as_bytes()).is_err() {
                    debug!("Skip unknown parent message");
                    continue;
                }
                if let Err(e) = publisher.publish(&text).await {
                    warn!("Failed to publish parent message: {e}");
                }
            }
        }
    }
    info!("Child {child_id} relay stopped");
    Ok(())
}

/// Parent side of the bus: applies shard deliveries to `directory` and logs handshakes.
pub async fn relay_parent(
    bus: Arc<dyn MessageBus>,
    subjects: Subjects,
    directory: Arc<dyn Directory>,
    registry: MessageRegistry,
    cancel: CancellationToken,
) -> P2pResult<()> {
    let mut from_children = bus.subscribe(subjects.parent.clone()).await?;
    let mut ready = bus.subscribe(subjects.ready.clone()).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = from_children.next() => {
                let Some(data) = next else { break };
                let message = match Message::from_bytes(&data) {
                    Ok(message) => message,
                    Err(_) => {
                        debug!("Skip unknown child message");
                        continue;
                    }
                };
                if let Err(e) = apply_message(directory.as_ref(), &registry, &message) {
                    warn!("Rejected {} mutation: {e}", message.context);
                }
            }
            Some(data) = ready.next() => {
                match Message::from_bytes(&data)
                    .and_then(|m| Ok(serde_json::from_value::<ReadyPayload>(m.payload)?))
                {
                    Ok(payload) => info!("Child {} ready", payload.child_id),
                    Err(_) => debug!("Skip malformed ready handshake"),
                }
            }
        }
    }
    info!("Parent relay stopped");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::p2p::libp2p_network::{NetworkCommand, NetworkHandle};
    use crate::p2p::messages::CONTEXT_DIRECTORY_ADD;
    use libp2p::futures::channel::mpsc as fmpsc;
    use libp2p::PeerId;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-process bus delivering each publish to every current subscriber.
    #[derive(Default)]
    pub(crate) struct TestBus {
        subscribers: Mutex<HashMap<String, Vec<fmpsc::UnboundedSender<Vec<u8>>>>>,
    }

    impl MessageBus for TestBus {
        fn publish(&self, subject: String, data: Vec<u8>) -> BoxFuture<'_, P2pResult<()>> {
            if let Some(subscribers) = self.subscribers.lock().unwrap().get_mut(&subject) {
                subscribers.retain(|tx| tx.unbounded_send(data.clone()).is_ok());
            }
            async { Ok(()) }.boxed()
        }

        fn subscribe(
            &self,
            subject: String,
        ) -> BoxFuture<'_, P2pResult<BoxStream<'static, Vec<u8>>>> {
            let (tx, rx) = fmpsc::unbounded();
            self.subscribers
                .lock()
                .unwrap()
                .entry(subject)
                .or_default()
                .push(tx);
            async move { Ok(rx.boxed()) }.boxed()
        }
    }

    fn add_message() -> Message {
        Message::new(
            CONTEXT_DIRECTORY_ADD,
            &json!({"key": "k", "value": "v", "mode": "default"}),
        )
        .unwrap()
    }

    #[test]
    fn test_subjects() {
        let subjects = Subjects::new("ipc.server");
        assert_eq!(subjects.parent, "ipc.server.parent");
        assert_eq!(subjects.children, "ipc.server.children");
        assert_eq!(subjects.ready, "ipc.server.ready");
    }

    #[tokio::test]
    async fn test_child_announces_and_forwards_to_parent() {
        let bus = Arc::new(TestBus::default());
        let subjects = Subjects::new("ipc.test");
        let mut ready = bus.subscribe(subjects.ready.clone()).await.unwrap();
        let mut parent = bus.subscribe(subjects.parent.clone()).await.unwrap();

        let (mesh_tx, mesh_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(relay_child(
            bus.clone(),
            subjects.clone(),
            3,
            Publisher::default(),
            mesh_rx,
            cancel.clone(),
        ));

        let handshake = Message::from_bytes(&ready.next().await.unwrap()).unwrap();
        assert_eq!(handshake.context, CONTEXT_IPC_READY);
        assert_eq!(handshake.payload["child_id"], 3);

        mesh_tx.send(add_message()).await.unwrap();
        let forwarded = Message::from_bytes(&parent.next().await.unwrap()).unwrap();
        assert_eq!(forwarded, add_message());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_child_publishes_envelopes_from_parent() {
        let bus = Arc::new(TestBus::default());
        let subjects = Subjects::new("ipc.test");
        let mut ready = bus.subscribe(subjects.ready.clone()).await.unwrap();
        let (network, mut commands) = NetworkHandle::detached(PeerId::random());

        let (_mesh_tx, mesh_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(relay_child(
            bus.clone(),
            subjects.clone(),
            1,
            Publisher::new(Some(network)),
            mesh_rx,
            cancel.clone(),
        ));
        // the children subscription exists once the handshake is out
        ready.next().await.unwrap();

        bus.publish(subjects.children.clone(), b"garbage".to_vec())
            .await
            .unwrap();
        bus.publish(subjects.children.clone(), add_message().to_bytes().unwrap())
            .await
            .unwrap();

        match commands.recv().await {
            Some(NetworkCommand::Publish(data)) => {
                assert_eq!(Message::from_bytes(&data).unwrap(), add_message());
            }
            other => panic!("unexpected network command: {other:?}"),
        }
        assert!(commands.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_parent_applies_child_mutations() {
        let bus = Arc::new(TestBus::default());
        let subjects = Subjects::new("ipc.test");
        let directory = Arc::new(MemoryDirectory::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(relay_parent(
            bus.clone(),
            subjects.clone(),
            directory.clone(),
            MessageRegistry::default(),
            cancel.clone(),
        ));
        // let the relay subscribe before publishing
        while bus.subscribers.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        bus.publish(subjects.parent.clone(), b"garbage".to_vec())
            .await
            .unwrap();
        bus.publish(subjects.parent.clone(), add_message().to_bytes().unwrap())
            .await
            .unwrap();

        for _ in 0..100 {
            if !directory.list("k").unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(directory.list("k").unwrap(), vec!["v"]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
