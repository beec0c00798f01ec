//! WebSocket broker server
//!
//! Exposes a `SharedBroker` to remote clients. Responsibilities:
//! - Accept TCP/WebSocket connections, one task per connection
//! - Decode `ClientMessage` frames and answer each with a `ServerMessage`
//!   carrying the same `request_id`
//! - Own the consumer-group memberships created over a connection, and
//!   leave every one of them when the connection goes away
//!
//! Requests on one connection are handled in order. The remote client opens
//! one connection per producer or consumer, so a long-polling fetch only
//! holds up its own consumer.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::local::{LocalConsumer, LocalProducer};
use crate::broker::{ConsumerOptions, ConsumerTransport, ProducerTransport, SharedBroker};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::BrokerError;

/// Upper bound on how long a single fetch may park on the server.
pub const MAX_FETCH_WAIT_MS: u64 = 30_000;

pub async fn start_websocket_server(addr: String, broker: SharedBroker) -> Result<(), BrokerError> {
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| BrokerError::Unavailable(format!("cannot bind {addr}: {e}")))?;

    info!("WebSocket broker listening on ws://{addr}");
    serve(listener, broker).await
}

/// Accept connections on an already bound listener until accepting fails.
pub async fn serve(listener: TcpListener, broker: SharedBroker) -> Result<(), BrokerError> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("accept failed: {e}")))?;
        debug!(%peer, "Accepted TCP connection");
        spawn(handle_connection(stream, broker.clone()));
    }
}

async fn handle_connection(stream: TcpStream, broker: SharedBroker) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut connection = Connection::new(broker);
    let connection_id = connection.id.clone();
    info!(connection = %connection_id, "Client connected");

    let send_loop = {
        let connection_id = connection_id.clone();
        spawn(async move {
            while let Some(reply) = rx.recv().await {
                let text = match serde_json::to_string(&reply) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(connection = %connection_id, "Failed to encode reply: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                    debug!(connection = %connection_id, "Failed to send reply: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        })
    };

    while let Some(frame) = ws_receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(connection = %connection_id, "Read error: {e}");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else {
            continue;
        };

        let reply = match serde_json::from_str::<ClientMessage>(text) {
            Ok(request) => connection.handle(request).await,
            Err(e) => {
                warn!(
                    connection = %connection_id,
                    "Invalid client message: {e} | {}",
                    text.chars().take(100).collect::<String>()
                );
                ServerMessage::error(None, BrokerError::Protocol(e.to_string()))
            }
        };
        if tx.send(reply).is_err() {
            break;
        }
    }

    connection.close().await;
    drop(tx);
    let _ = send_loop.await;
    info!(connection = %connection_id, "Client disconnected");
}

/// Broker state owned by one connection.
struct Connection {
    id: String,
    broker: SharedBroker,
    producer: LocalProducer,
    consumers: HashMap<String, LocalConsumer>,
}

impl Connection {
    fn new(broker: SharedBroker) -> Self {
        Self {
            id: format!("conn-{}", Uuid::new_v4()),
            producer: LocalProducer::new(broker.clone()),
            broker,
            consumers: HashMap::new(),
        }
    }

    async fn handle(&mut self, request: ClientMessage) -> ServerMessage {
        let request_id = request.request_id();
        match self.dispatch(request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(connection = %self.id, request_id, error = %e, "Request failed");
                ServerMessage::error(Some(request_id), e)
            }
        }
    }

    async fn dispatch(&mut self, request: ClientMessage) -> Result<ServerMessage, BrokerError> {
        match request {
            ClientMessage::Produce { request_id, record } => {
                let delivery = self.producer.produce(record).await?;
                Ok(ServerMessage::Produced {
                    request_id,
                    delivery,
                })
            }
            ClientMessage::Join {
                request_id,
                group,
                topics,
                offset_reset,
                auto_commit_interval_ms,
            } => {
                let options = ConsumerOptions {
                    offset_reset,
                    auto_commit_interval: Duration::from_millis(auto_commit_interval_ms),
                };
                let mut consumer = LocalConsumer::new(self.broker.clone(), &group, options);
                consumer.subscribe(&topics).await?;
                let member_id = consumer
                    .member_id()
                    .map(str::to_string)
                    .ok_or_else(|| BrokerError::Protocol("join produced no member".to_string()))?;
                info!(connection = %self.id, group = %group, member = %member_id, "Remote member joined");
                self.consumers.insert(member_id.clone(), consumer);
                Ok(ServerMessage::Joined {
                    request_id,
                    member_id,
                })
            }
            ClientMessage::Subscribe {
                request_id,
                member_id,
                topics,
            } => {
                self.consumer(&member_id)?.subscribe(&topics).await?;
                Ok(ServerMessage::Ok { request_id })
            }
            ClientMessage::Fetch {
                request_id,
                member_id,
                max_wait_ms,
            } => {
                let wait = Duration::from_millis(max_wait_ms.min(MAX_FETCH_WAIT_MS));
                let event = self.consumer(&member_id)?.poll(wait).await?;
                Ok(ServerMessage::Event { request_id, event })
            }
            ClientMessage::Commit {
                request_id,
                member_id,
            } => {
                self.consumer(&member_id)?.commit().await?;
                Ok(ServerMessage::Ok { request_id })
            }
            ClientMessage::Describe {
                request_id,
                member_id,
            } => {
                let consumer = self.consumer(&member_id)?;
                Ok(ServerMessage::Described {
                    request_id,
                    assignment: consumer.assignment().await?,
                    positions: consumer.positions().await?,
                })
            }
            ClientMessage::Leave {
                request_id,
                member_id,
            } => {
                if let Some(mut consumer) = self.consumers.remove(&member_id) {
                    consumer.close().await?;
                }
                Ok(ServerMessage::Ok { request_id })
            }
        }
    }

    fn consumer(&mut self, member_id: &str) -> Result<&mut LocalConsumer, BrokerError> {
        self.consumers
            .get_mut(member_id)
            .ok_or_else(|| BrokerError::UnknownMember(member_id.to_string()))
    }

    /// Leave every group joined over this connection.
    async fn close(&mut self) {
        for (member_id, mut consumer) in self.consumers.drain() {
            if let Err(e) = consumer.close().await {
                warn!(connection = %self.id, member = %member_id, error = %e, "Failed to leave group");
            }
        }
        if let Err(e) = self.producer.close().await {
            debug!(connection = %self.id, error = %e, "Failed to close producer");
        }
    }
}
