//! WebSocket broker client
//!
//! `RemoteConnector` implements the broker client seam against a server
//! started with `start_websocket_server`. Each producer and each consumer gets
//! its own connection (`Link`), which multiplexes requests by `request_id`:
//! - a writer task drains an outgoing channel into the socket
//! - a reader task routes every reply to the oneshot waiting for its id
//! - when the socket goes away, every waiter is released with `Unavailable`
//!
//! Refused connections and lost links surface as `Unavailable`, requests that
//! get no reply as `Timeout`; both are retriable. A producer whose link has
//! dropped reconnects on its next send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{
    BrokerConnector, ConsumerEvent, ConsumerOptions, ConsumerTransport, Delivery, OutgoingRecord,
    ProducerTransport, TopicPartition,
};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::BrokerError;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>>;

fn lost() -> BrokerError {
    BrokerError::Unavailable("connection to broker lost".to_string())
}

fn unexpected(reply: &ServerMessage) -> BrokerError {
    BrokerError::Protocol(format!("unexpected reply: {reply:?}"))
}

#[derive(Debug, Clone)]
pub struct RemoteConnector {
    url: String,
    request_timeout: Duration,
}

impl RemoteConnector {
    pub fn new(url: &str, request_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            request_timeout,
        }
    }
}

#[async_trait]
impl BrokerConnector for RemoteConnector {
    async fn producer(&self) -> Result<Box<dyn ProducerTransport>, BrokerError> {
        let link = Link::connect(&self.url, self.request_timeout).await?;
        Ok(Box::new(RemoteProducer {
            url: self.url.clone(),
            request_timeout: self.request_timeout,
            link: tokio::sync::Mutex::new(Some(Arc::new(link))),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consumer(
        &self,
        group: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn ConsumerTransport>, BrokerError> {
        let link = Link::connect(&self.url, self.request_timeout).await?;
        Ok(Box::new(RemoteConsumer {
            link,
            group: group.to_string(),
            options,
            member: None,
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        format!("broker at {}", self.url)
    }
}

/// One WebSocket connection to the broker.
struct Link {
    outgoing: mpsc::UnboundedSender<WsMessage>,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl Link {
    async fn connect(url: &str, request_timeout: Duration) -> Result<Self, BrokerError> {
        let (ws_stream, _response) = timeout(request_timeout, connect_async(url))
            .await
            .map_err(|_| BrokerError::Timeout(request_timeout.as_millis() as u64))?
            .map_err(|e| BrokerError::Unavailable(format!("cannot connect to {url}: {e}")))?;
        debug!(url, "Connected to broker");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader = {
            let pending = pending.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                while let Some(Ok(msg)) = ws_receiver.next().await {
                    if msg.is_close() {
                        break;
                    }
                    if !msg.is_text() {
                        continue;
                    }
                    let Ok(text) = msg.to_text() else {
                        continue;
                    };
                    match serde_json::from_str::<ServerMessage>(text) {
                        Ok(reply) => route(&pending, reply),
                        Err(e) => warn!("Invalid server message: {e}"),
                    }
                }
                connected.store(false, Ordering::SeqCst);
                // Dropping the senders wakes every waiter.
                pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
                debug!("Broker connection closed");
            })
        };

        Ok(Self {
            outgoing: tx,
            pending,
            next_id: AtomicU64::new(1),
            connected,
            request_timeout,
            reader,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientMessage,
    ) -> Result<ServerMessage, BrokerError> {
        self.request_within(build, self.request_timeout).await
    }

    async fn request_within(
        &self,
        build: impl FnOnce(u64) -> ClientMessage,
        limit: Duration,
    ) -> Result<ServerMessage, BrokerError> {
        if !self.is_connected() {
            return Err(lost());
        }
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let text = serde_json::to_string(&build(request_id))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, tx);

        if self.outgoing.send(WsMessage::Text(text.into())).is_err() {
            self.forget(request_id);
            return Err(lost());
        }

        match timeout(limit, rx).await {
            Ok(Ok(ServerMessage::Error { error, .. })) => Err(error),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(lost()),
            Err(_) => {
                self.forget(request_id);
                Err(BrokerError::Timeout(limit.as_millis() as u64))
            }
        }
    }

    fn forget(&self, request_id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
    }

    fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.outgoing.send(WsMessage::Close(None));
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // The writer task ends once `outgoing` is dropped with us.
        self.reader.abort();
    }
}

fn route(pending: &Pending, reply: ServerMessage) {
    let Some(request_id) = reply.request_id() else {
        warn!(reply = ?reply, "Broker reported an error for an unknown request");
        return;
    };
    let waiter = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&request_id);
    match waiter {
        Some(waiter) => {
            let _ = waiter.send(reply);
        }
        None => debug!(request_id, "Reply for a request nobody is waiting on"),
    }
}

pub struct RemoteProducer {
    url: String,
    request_timeout: Duration,
    link: tokio::sync::Mutex<Option<Arc<Link>>>,
    closed: AtomicBool,
}

impl RemoteProducer {
    /// The current link, reconnecting if the previous one dropped.
    async fn link(&self) -> Result<Arc<Link>, BrokerError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if link.is_connected() {
                return Ok(link.clone());
            }
        }
        warn!(url = %self.url, "Broker link lost; reconnecting");
        let link = Arc::new(Link::connect(&self.url, self.request_timeout).await?);
        *guard = Some(link.clone());
        Ok(link)
    }
}

#[async_trait]
impl ProducerTransport for RemoteProducer {
    async fn produce(&self, record: OutgoingRecord) -> Result<Delivery, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let link = self.link().await?;
        match link
            .request(|request_id| ClientMessage::Produce { request_id, record })
            .await?
        {
            ServerMessage::Produced { delivery, .. } => Ok(delivery),
            other => Err(unexpected(&other)),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(link) = self.link.lock().await.take() {
            link.shutdown();
        }
        Ok(())
    }
}

pub struct RemoteConsumer {
    link: Link,
    group: String,
    options: ConsumerOptions,
    member: Option<String>,
    closed: bool,
}

impl RemoteConsumer {
    fn require_member(&self) -> Result<String, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.member
            .clone()
            .ok_or_else(|| BrokerError::Protocol("consumer is not subscribed".to_string()))
    }

    async fn describe_member(
        &self,
    ) -> Result<(Vec<TopicPartition>, Vec<(TopicPartition, u64)>), BrokerError> {
        let member_id = self.require_member()?;
        match self
            .link
            .request(|request_id| ClientMessage::Describe {
                request_id,
                member_id,
            })
            .await?
        {
            ServerMessage::Described {
                assignment,
                positions,
                ..
            } => Ok((assignment, positions)),
            other => Err(unexpected(&other)),
        }
    }
}

#[async_trait]
impl ConsumerTransport for RemoteConsumer {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let topics = topics.to_vec();
        match self.member.clone() {
            Some(member_id) => match self
                .link
                .request(|request_id| ClientMessage::Subscribe {
                    request_id,
                    member_id,
                    topics,
                })
                .await?
            {
                ServerMessage::Ok { .. } => Ok(()),
                other => Err(unexpected(&other)),
            },
            None => {
                let group = self.group.clone();
                let offset_reset = self.options.offset_reset;
                let auto_commit_interval_ms = self.options.auto_commit_interval.as_millis() as u64;
                match self
                    .link
                    .request(|request_id| ClientMessage::Join {
                        request_id,
                        group,
                        topics,
                        offset_reset,
                        auto_commit_interval_ms,
                    })
                    .await?
                {
                    ServerMessage::Joined { member_id, .. } => {
                        debug!(member = %member_id, "Joined consumer group remotely");
                        self.member = Some(member_id);
                        Ok(())
                    }
                    other => Err(unexpected(&other)),
                }
            }
        }
    }

    async fn poll(&mut self, wait: Duration) -> Result<Option<ConsumerEvent>, BrokerError> {
        let member_id = self.require_member()?;
        let max_wait_ms = wait.as_millis() as u64;
        let limit = wait + self.link.request_timeout;
        let reply = self
            .link
            .request_within(
                |request_id| ClientMessage::Fetch {
                    request_id,
                    member_id,
                    max_wait_ms,
                },
                limit,
            )
            .await;
        // The membership died with the socket; retrying the fetch cannot help.
        if reply.is_err() && !self.link.is_connected() {
            return Err(BrokerError::ConnectionLost);
        }
        match reply? {
            ServerMessage::Event { event, .. } => Ok(event),
            other => Err(unexpected(&other)),
        }
    }

    async fn commit(&mut self) -> Result<(), BrokerError> {
        let member_id = self.require_member()?;
        match self
            .link
            .request(|request_id| ClientMessage::Commit {
                request_id,
                member_id,
            })
            .await?
        {
            ServerMessage::Ok { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError> {
        Ok(self.describe_member().await?.0)
    }

    async fn positions(&self) -> Result<Vec<(TopicPartition, u64)>, BrokerError> {
        Ok(self.describe_member().await?.1)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // A dropped link has already made the server leave the group.
        let result = match self.member.take() {
            Some(member_id) if self.link.is_connected() => self
                .link
                .request(|request_id| ClientMessage::Leave {
                    request_id,
                    member_id,
                })
                .await
                .map(|_| ()),
            _ => Ok(()),
        };
        self.link.shutdown();
        result
    }
}
