use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;
use warp::ws::{Message as WsMessage, WebSocket};

use crate::commands::{self, Command};
use crate::error::ChatError;
use crate::files::FileManager;
use crate::messages::{self, validate_topic, Message, MessageKind};
use crate::relay::Relay;
use crate::store::Store;

struct Session {
    username: Option<String>,
    topics: HashSet<String>,
    outbox: mpsc::UnboundedSender<Message>,
}

type Sessions = Arc<RwLock<HashMap<String, Session>>>;

/// The node's hub: live sessions, persistence and peer forwarding.
#[derive(Clone)]
pub struct Server {
    node_name: String,
    sessions: Sessions,
    store: Arc<Store>,
    relay: Relay,
    pub file_manager: Arc<FileManager>,
}

impl Server {
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<Store>,
        relay: Relay,
        file_manager: Arc<FileManager>,
    ) -> Self {
        Server {
            node_name: node_name.into(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
            relay,
            file_manager,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Accepts a message from a local client or the console, stores it and
    /// fans it out. Returns the message as stored.
    pub async fn publish(&self, message: Message) -> Result<Message, ChatError> {
        self.publish_from(message, None).await
    }

    /// Like `publish`, but the originating session always gets its own
    /// message back, named or not.
    async fn publish_from(
        &self,
        mut message: Message,
        origin: Option<&str>,
    ) -> Result<Message, ChatError> {
        if message.sender.trim().is_empty() {
            message.sender.clone_from(&self.node_name);
        }
        if message.kind == MessageKind::Chat {
            let command = message.content.as_deref().map(commands::parse);
            if let Some(Ok(Some(Command::Topic { topic, text }))) = command {
                message.topic = Some(topic);
                message.content = Some(text);
            }
        }
        message.validate()?;
        message.stamp(messages::now());

        self.store.save_message(&message, false)?;
        self.deliver(&message, origin).await;
        if self.relay.broadcast(&message).await > 0 {
            self.store.mark_delivered(&message.id)?;
        }
        Ok(message)
    }

    /// Takes a message relayed by a peer. Already known ids are ignored.
    pub async fn accept_remote(&self, message: Message) -> Result<(), ChatError> {
        message.validate()?;
        if self.store.save_message(&message, true)? {
            self.deliver(&message, None).await;
        }
        Ok(())
    }

    /// Drains messages arriving from the relay until it shuts down.
    pub async fn run_inbound(self, mut inbound: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = inbound.recv().await {
            if let Err(e) = self.accept_remote(message).await {
                log::warn!("Dropping relayed message: {e}");
            }
        }
    }

    pub async fn subscribe(&self, username: &str, topic: &str) -> Result<String, ChatError> {
        let topic = validate_topic(topic)?.to_string();
        self.store.save_subscription(username, &topic)?;
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut() {
            if session.username.as_deref() == Some(username) {
                session.topics.insert(topic.clone());
            }
        }
        log::info!("{username} subscribed to {topic}");
        Ok(topic)
    }

    pub async fn unsubscribe(&self, username: &str, topic: &str) -> Result<String, ChatError> {
        let topic = validate_topic(topic)?.to_string();
        self.store.remove_subscription(username, &topic)?;
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut() {
            if session.username.as_deref() == Some(username) {
                session.topics.remove(&topic);
            }
        }
        log::info!("{username} unsubscribed from {topic}");
        Ok(topic)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn handle_connection(&self, ws: WebSocket, username: Option<String>) {
        let (session_id, mut outbox) = match self.open_session(username).await {
            Ok(session) => session,
            Err(e) => {
                log::error!("Failed to open session: {e}");
                return;
            }
        };
        let (mut ws_tx, mut ws_rx) = ws.split();

        tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode message: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::text(text)).await {
                    log::error!("Failed to send WebSocket message: {e}");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) => {
                    if msg.is_close() {
                        break;
                    }
                    if let Ok(text) = msg.to_str() {
                        self.handle_input(&session_id, text).await;
                    }
                }
                Err(e) => {
                    log::error!("WebSocket error: {e}");
                    break;
                }
            }
        }

        self.close_session(&session_id).await;
    }

    /// Messages visible to `username`, for server-sent events and the node
    /// console.
    pub async fn event_stream(&self, username: String) -> Result<EventStream, ChatError> {
        let (session_id, outbox) = self.open_session(Some(username)).await?;
        Ok(EventStream {
            outbox,
            session_id,
            server: self.clone(),
        })
    }

    async fn open_session(
        &self,
        username: Option<String>,
    ) -> Result<(String, mpsc::UnboundedReceiver<Message>), ChatError> {
        let topics = match &username {
            Some(name) => self.store.subscriptions(name)?.into_iter().collect(),
            None => HashSet::new(),
        };
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let welcome = match &username {
            Some(name) => format!("welcome, {name}"),
            None => format!("connected to {}", self.node_name),
        };
        let _ = tx.send(self.notification(welcome));

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                session_id.clone(),
                Session {
                    username: username.clone(),
                    topics,
                    outbox: tx,
                },
            );
        }

        if let Some(name) = username {
            log::info!("{name} connected ({session_id})");
            let dead = self
                .announce(&format!("{name} joined"), Some(&session_id))
                .await;
            self.close_sessions(dead).await;
        } else {
            log::info!("anonymous session connected ({session_id})");
        }
        Ok((session_id, rx))
    }

    async fn close_session(&self, session_id: &str) {
        self.close_sessions(vec![session_id.to_string()]).await;
    }

    // Announcing a departure can turn up more dead sessions; those are
    // closed in the same pass.
    async fn close_sessions(&self, mut pending: Vec<String>) {
        while let Some(session_id) = pending.pop() {
            let removed = self.sessions.write().await.remove(&session_id);
            match removed {
                Some(Session {
                    username: Some(name),
                    ..
                }) => {
                    log::info!("{name} disconnected ({session_id})");
                    let dead = self.announce(&format!("{name} left"), None).await;
                    pending.extend(dead);
                }
                Some(_) => log::info!("anonymous session disconnected ({session_id})"),
                None => {}
            }
        }
    }

    async fn handle_input(&self, session_id: &str, text: &str) {
        let mut message = match Message::decode(text) {
            Ok(message) => message,
            Err(e) => {
                self.reply(session_id, format!("invalid message: {e}")).await;
                return;
            }
        };

        let username = {
            let sessions = self.sessions.read().await;
            match sessions.get(session_id) {
                Some(session) => session.username.clone(),
                None => return,
            }
        };
        // A named session always speaks as itself.
        if let Some(name) = &username {
            message.sender.clone_from(name);
        }

        if message.kind == MessageKind::Chat {
            let command = match message.content.as_deref().map(commands::parse) {
                Some(Ok(command)) => command,
                Some(Err(e)) => {
                    self.reply(session_id, e.to_string()).await;
                    return;
                }
                None => None,
            };
            match command {
                Some(Command::Subscribe(topic)) => {
                    self.subscribe_session(session_id, username.as_deref(), &topic, true)
                        .await;
                    return;
                }
                Some(Command::Unsubscribe(topic)) => {
                    self.subscribe_session(session_id, username.as_deref(), &topic, false)
                        .await;
                    return;
                }
                Some(Command::Exit) => {
                    self.reply(session_id, "close the connection to leave".to_string())
                        .await;
                    return;
                }
                Some(Command::Topic { .. } | Command::Say(_)) | None => {}
            }
        }

        if let Err(e) = self.publish_from(message, Some(session_id)).await {
            self.reply(session_id, e.to_string()).await;
        }
    }

    async fn subscribe_session(
        &self,
        session_id: &str,
        username: Option<&str>,
        topic: &str,
        subscribe: bool,
    ) {
        let outcome = match (username, subscribe) {
            (Some(name), true) => self.subscribe(name, topic).await,
            (Some(name), false) => self.unsubscribe(name, topic).await,
            (None, _) => match validate_topic(topic) {
                Ok(topic) => {
                    let mut sessions = self.sessions.write().await;
                    if let Some(session) = sessions.get_mut(session_id) {
                        if subscribe {
                            session.topics.insert(topic.to_string());
                        } else {
                            session.topics.remove(topic);
                        }
                    }
                    Ok(topic.to_string())
                }
                Err(e) => Err(e),
            },
        };

        let reply = match outcome {
            Ok(topic) if subscribe => format!("Subscribed to {topic}"),
            Ok(topic) => format!("Unsubscribed from {topic}"),
            Err(e) => e.to_string(),
        };
        self.reply(session_id, reply).await;
    }

    fn notification(&self, content: String) -> Message {
        let mut message = Message::notification(self.node_name.clone(), content);
        message.stamp(messages::now());
        message
    }

    async fn reply(&self, session_id: &str, content: String) {
        let message = self.notification(content);
        let sessions = self.sessions.read().await;
        if let Some(session) = sessions.get(session_id) {
            let _ = session.outbox.send(message);
        }
    }

    /// Sends a notification to every session but one. Returns the sessions
    /// whose outbox has gone away.
    async fn announce(&self, content: &str, except_session: Option<&str>) -> Vec<String> {
        let message = self.notification(content.to_string());
        let sessions = self.sessions.read().await;
        let mut dead = Vec::new();
        for (id, session) in sessions.iter() {
            if Some(id.as_str()) == except_session {
                continue;
            }
            if session.outbox.send(message.clone()).is_err() {
                dead.push(id.clone());
            }
        }
        dead
    }

    async fn deliver(&self, message: &Message, origin: Option<&str>) {
        let mut dead = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                let echo = origin == Some(id.as_str());
                if !echo && !message.is_visible_to(session.username.as_deref(), &session.topics) {
                    continue;
                }
                if session.outbox.send(message.clone()).is_err() {
                    dead.push(id.clone());
                }
            }
        }
        self.close_sessions(dead).await;
    }
}

/// Feed of one named session. Dropping it closes the session.
pub struct EventStream {
    outbox: mpsc::UnboundedReceiver<Message>,
    session_id: String,
    server: Server,
}

impl Stream for EventStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.outbox.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.outbox.close();
        let server = self.server.clone();
        let session_id = std::mem::take(&mut self.session_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { server.close_session(&session_id).await });
        }
    }
}
