use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use uuid::Uuid;

use crate::error::ChatError;
use crate::messages::Message;
use crate::store::Store;

const SEEN_CAPACITY: usize = 4096;

/// What travels over a peer link, one frame per WebSocket text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PeerFrame {
    Hello { name: String },
    Message { message: Message },
}

struct Link {
    label: String,
    peer_name: Option<String>,
    outbox: mpsc::UnboundedSender<WsMessage>,
}

type Links = Arc<RwLock<HashMap<String, Link>>>;

/// Bounded memory of message ids already relayed.
#[derive(Default)]
struct Seen {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl Seen {
    /// Returns false if the id was seen before.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

/// Links this node to other nodes and floods messages between them.
#[derive(Clone)]
pub struct Relay {
    name: String,
    links: Links,
    seen: Arc<Mutex<Seen>>,
    store: Arc<Store>,
    inbound: mpsc::UnboundedSender<Message>,
}

impl Relay {
    /// Messages arriving from peers come out of the returned receiver.
    pub fn new(
        name: impl Into<String>,
        store: Arc<Store>,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let relay = Relay {
            name: name.into(),
            links: Arc::new(RwLock::new(HashMap::new())),
            seen: Arc::new(Mutex::new(Seen::default())),
            store,
            inbound,
        };
        (relay, inbound_rx)
    }

    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, ChatError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        log::info!("Peer relay listening on {local}");

        let relay = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let relay = relay.clone();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => {
                                    log::info!("Incoming peer connection from {remote}");
                                    relay.attach(ws, remote.to_string()).await;
                                }
                                Err(e) => log::error!("Failed peer handshake from {remote}: {e}"),
                            }
                        });
                    }
                    Err(e) => log::error!("Error accepting peer connection: {e}"),
                }
            }
        });
        Ok(local)
    }

    /// Dials `remote`, given as `host:port` or a `ws://` URL.
    pub async fn connect(&self, remote: &str) -> Result<(), ChatError> {
        let url = if remote.starts_with("ws://") || remote.starts_with("wss://") {
            remote.to_string()
        } else {
            format!("ws://{remote}")
        };
        let (ws, _) = connect_async(url.as_str()).await?;
        log::info!("Connected to peer {remote}");
        self.attach(ws, remote.to_string()).await;
        Ok(())
    }

    pub async fn peer_names(&self) -> Vec<String> {
        let links = self.links.read().await;
        links
            .values()
            .map(|link| link.peer_name.clone().unwrap_or_else(|| link.label.clone()))
            .collect()
    }

    /// Sends a locally published message to every peer; returns how many
    /// links took it.
    pub async fn broadcast(&self, message: &Message) -> usize {
        self.seen.lock().await.insert(&message.id);
        self.forward(None, message).await
    }

    async fn forward(&self, origin: Option<&str>, message: &Message) -> usize {
        let frame = match encode(&PeerFrame::Message {
            message: message.clone(),
        }) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Error encoding message {}: {e}", message.id);
                return 0;
            }
        };

        let links = self.links.read().await;
        let mut sent = 0;
        for (id, link) in links.iter() {
            if Some(id.as_str()) == origin {
                continue;
            }
            if link.outbox.send(WsMessage::text(frame.clone())).is_ok() {
                sent += 1;
            } else {
                log::warn!("Error forwarding message to {}", link.label);
            }
        }
        sent
    }

    async fn attach<S>(&self, ws: WebSocketStream<S>, label: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let link_id = Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        {
            let mut links = self.links.write().await;
            links.insert(
                link_id.clone(),
                Link {
                    label: label.clone(),
                    peer_name: None,
                    outbox: tx.clone(),
                },
            );
        }

        let writer_label = label.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = ws_tx.send(frame).await {
                    log::error!("Failed to write to peer {writer_label}: {e}");
                    break;
                }
            }
        });

        match encode(&PeerFrame::Hello {
            name: self.name.clone(),
        }) {
            Ok(hello) => {
                let _ = tx.send(WsMessage::text(hello));
            }
            Err(e) => log::error!("Error encoding hello frame: {e}"),
        }
        self.flush_undelivered(&tx, &label).await;

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                match result {
                    Ok(WsMessage::Close(_)) => break,
                    Ok(frame @ WsMessage::Text(_)) => match frame.to_text() {
                        Ok(text) => relay.handle_frame(&link_id, &label, text).await,
                        Err(e) => log::warn!("Unreadable frame from {label}: {e}"),
                    },
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Peer link {label} failed: {e}");
                        break;
                    }
                }
            }
            relay.links.write().await.remove(&link_id);
            log::info!("Peer {label} disconnected");
        });
    }

    async fn handle_frame(&self, link_id: &str, label: &str, text: &str) {
        let frame = match serde_json::from_str::<PeerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Error decoding frame from {label}: {e}");
                return;
            }
        };

        match frame {
            PeerFrame::Hello { name } => {
                log::info!("Peer {label} introduced itself as {name}");
                if let Some(link) = self.links.write().await.get_mut(link_id) {
                    link.peer_name = Some(name);
                }
            }
            PeerFrame::Message { message } => {
                if message.id.is_empty() {
                    log::warn!("Dropping message without id from {label}");
                    return;
                }
                if !self.seen.lock().await.insert(&message.id) {
                    return;
                }
                log::info!("[{label}] {message}");
                self.forward(Some(link_id), &message).await;
                if self.inbound.send(message).is_err() {
                    log::warn!("No local consumer for relayed messages");
                }
            }
        }
    }

    // Messages published while no peer was linked go out to the first
    // peer that shows up.
    async fn flush_undelivered(&self, tx: &mpsc::UnboundedSender<WsMessage>, label: &str) {
        let pending = match self.store.undelivered() {
            Ok(pending) => pending,
            Err(e) => {
                log::error!("Error retrieving offline messages: {e}");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        log::info!("Sending {} offline messages to {label}", pending.len());
        for message in pending {
            let frame = match encode(&PeerFrame::Message {
                message: message.clone(),
            }) {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Error encoding offline message: {e}");
                    continue;
                }
            };
            if tx.send(WsMessage::text(frame)).is_err() {
                return;
            }
            self.seen.lock().await.insert(&message.id);
            if let Err(e) = self.store.mark_delivered(&message.id) {
                log::error!("Error marking message {} delivered: {e}", message.id);
            }
        }
    }
}

fn encode(frame: &PeerFrame) -> Result<String, ChatError> {
    Ok(serde_json::to_string(frame)?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;

    fn relay(name: &str) -> (Relay, mpsc::UnboundedReceiver<Message>, Arc<Store>) {
        let store = Arc::new(Store::in_memory().unwrap());
        let (relay, rx) = Relay::new(name, store.clone());
        (relay, rx, store)
    }

    fn message(content: &str) -> Message {
        let mut msg = Message::chat("alice", content);
        msg.stamp(1);
        msg
    }

    async fn loopback(relay: &Relay) -> SocketAddr {
        relay.listen(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap()
    }

    async fn wait_for_links(relay: &Relay, count: usize) {
        timeout(Duration::from_secs(5), async {
            while relay.peer_names().await.len() < count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer links never came up");
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no relayed message")
            .expect("relay channel closed")
    }

    #[test]
    fn seen_set_is_bounded() {
        let mut seen = Seen::default();
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        for i in 0..SEEN_CAPACITY {
            seen.insert(&i.to_string());
        }
        assert_eq!(seen.order.len(), SEEN_CAPACITY);
        assert!(seen.insert("a"));
    }

    #[test]
    fn frames_are_tagged() {
        let json = encode(&PeerFrame::Hello {
            name: "peer1".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"hello","name":"peer1"}"#);
    }

    #[tokio::test]
    async fn broadcast_reaches_linked_peer() {
        let (a, mut a_rx, _) = relay("a");
        let (b, _b_rx, _) = relay("b");
        let addr = loopback(&a).await;

        b.connect(&addr.to_string()).await.unwrap();
        wait_for_links(&a, 1).await;

        let msg = message("hello a");
        assert_eq!(b.broadcast(&msg).await, 1);
        assert_eq!(next(&mut a_rx).await, msg);
    }

    #[tokio::test]
    async fn forwards_to_everyone_but_the_origin() {
        let (hub, mut hub_rx, _) = relay("hub");
        let (b, mut b_rx, _) = relay("b");
        let (c, mut c_rx, _) = relay("c");
        let addr = loopback(&hub).await;

        b.connect(&addr.to_string()).await.unwrap();
        c.connect(&format!("ws://{addr}")).await.unwrap();
        wait_for_links(&hub, 2).await;

        let msg = message("fan out");
        b.broadcast(&msg).await;
        assert_eq!(next(&mut hub_rx).await, msg);
        assert_eq!(next(&mut c_rx).await, msg);
        assert!(timeout(Duration::from_millis(200), b_rx.recv()).await.is_err());

        // Replays of a known id go nowhere.
        c.broadcast(&msg).await;
        assert!(timeout(Duration::from_millis(200), hub_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn offline_messages_flush_to_first_peer() {
        let (a, _a_rx, a_store) = relay("a");
        let (b, mut b_rx, _) = relay("b");
        let queued = message("while you were away");
        a_store.save_message(&queued, false).unwrap();
        let addr = loopback(&a).await;

        b.connect(&addr.to_string()).await.unwrap();
        assert_eq!(next(&mut b_rx).await, queued);
        timeout(Duration::from_secs(5), async {
            while !a_store.undelivered().unwrap().is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message never marked delivered");

        let names = a.peer_names().await;
        assert_eq!(names.len(), 1);
    }
}
