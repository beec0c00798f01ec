//! Chat session
//!
//! One user in one room. A session owns a `Publisher` and a `Subscriber`
//! built from the same connector and drives them through
//! `Disconnected -> Connecting -> Connected -> Disconnected`.
//!
//! Incoming envelopes pass through an `EchoFilter` (and a `DedupFilter` when
//! `chat.dedup_capacity > 0`) before reaching the display sink; the user's own
//! messages are shown once, locally, when they are sent.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{BrokerConnector, ConsumerOptions, Delivery};
use crate::chat::envelope::Envelope;
use crate::chat::publisher::{Publisher, PublisherStats, topic_for_room};
use crate::chat::sink::{DedupFilter, DispatchSink, EchoFilter};
use crate::chat::subscriber::{Subscriber, SubscriberState, SubscriberStats};
use crate::config::Settings;
use crate::utils::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub username: String,
    pub room: String,
    pub state: SessionState,
    pub broker: String,
    pub publisher: PublisherStats,
    pub subscriber: SubscriberStats,
}

pub fn join_notice(username: &str, room: &str) -> String {
    format!("{username} has joined the chat room '{room}'")
}

pub fn leave_notice(username: &str, room: &str) -> String {
    format!("{username} has left the chat room '{room}'")
}

pub struct Session {
    username: String,
    current_room: String,
    connector: Arc<dyn BrokerConnector>,
    display: Arc<dyn DispatchSink>,
    settings: Settings,
    state: SessionState,
    publisher: Option<Publisher>,
    subscriber: Option<Subscriber>,
}

impl Session {
    pub fn new(
        username: &str,
        room: &str,
        connector: Arc<dyn BrokerConnector>,
        display: Arc<dyn DispatchSink>,
        settings: Settings,
    ) -> Result<Self, ChatError> {
        let username = username.trim();
        let room = room.trim();
        if username.is_empty() {
            return Err(ChatError::InvalidArgument(
                "username must not be empty".to_string(),
            ));
        }
        if room.is_empty() {
            return Err(ChatError::InvalidArgument(
                "room must not be empty".to_string(),
            ));
        }

        Ok(Self {
            username: username.to_string(),
            current_room: room.to_string(),
            connector,
            display,
            settings,
            state: SessionState::Disconnected,
            publisher: None,
            subscriber: None,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn current_room(&self) -> &str {
        &self.current_room
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connected, and the consume loop is still running.
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected && self.subscriber_running()
    }

    /// Build the publisher and subscriber, join the room and announce it.
    ///
    /// Either both clients come up or neither does. A failed join notice is
    /// reported to the display but leaves the session connected.
    pub async fn connect(&mut self) -> Result<(), ChatError> {
        if self.state == SessionState::Connected {
            if self.subscriber_running() {
                debug!(username = %self.username, "Already connected");
                return Ok(());
            }
            // The consume loop died underneath us; start over.
            if let Err(e) = self.teardown().await {
                debug!(error = %e, "Teardown before reconnect failed");
            }
        }
        self.state = SessionState::Connecting;
        info!(
            username = %self.username,
            room = %self.current_room,
            broker = %self.connector.describe(),
            "Connecting"
        );

        match self.build_clients().await {
            Ok((publisher, subscriber)) => {
                self.publisher = Some(publisher);
                self.subscriber = Some(subscriber);
                self.state = SessionState::Connected;
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                self.display
                    .report_error(&format!("Failed to connect: {e}"));
                return Err(e);
            }
        }

        let room = self.current_room.clone();
        self.announce(&join_notice(&self.username, &room), &room).await;
        Ok(())
    }

    /// Send `text` to the current room and show it locally once acknowledged.
    pub async fn send_message(&mut self, text: &str) -> Result<Delivery, ChatError> {
        let publisher = self.live_publisher().await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let envelope = Envelope::user(&self.username, text, &self.current_room);
        let delivery = publisher.send(&envelope).await?;
        self.display.deliver(envelope);
        Ok(delivery)
    }

    /// Leave the current room and join `new_room`.
    ///
    /// The leave notice goes to the old room before the subscription moves and
    /// the join notice goes to the new room after it. If the subscription cannot
    /// be moved the session is torn down.
    pub async fn change_room(&mut self, new_room: &str) -> Result<(), ChatError> {
        self.live_publisher().await?;
        let new_room = new_room.trim();
        if new_room.is_empty() {
            return Err(ChatError::InvalidArgument(
                "room must not be empty".to_string(),
            ));
        }
        if new_room == self.current_room {
            self.display
                .report_status(&format!("Already in room '{new_room}'"));
            return Ok(());
        }

        let old_room = self.current_room.clone();
        self.announce(&leave_notice(&self.username, &old_room), &old_room)
            .await;

        let topics = vec![self.topic_for(new_room)];
        let resubscribed = match self.subscriber.as_mut() {
            Some(subscriber) => subscriber.resubscribe(&topics).await,
            None => Err(ChatError::NotConnected),
        };
        if let Err(e) = resubscribed {
            self.display
                .report_error(&format!("Failed to switch to room '{new_room}': {e}"));
            self.teardown().await;
            return Err(e);
        }

        self.current_room = new_room.to_string();
        info!(username = %self.username, from = %old_room, to = %new_room, "Changed room");
        self.announce(&join_notice(&self.username, new_room), new_room)
            .await;
        Ok(())
    }

    /// Announce the departure, stop the subscriber and close the publisher.
    ///
    /// Calling it on a disconnected session does nothing. Failures along the
    /// way are reported; the session ends up disconnected regardless.
    pub async fn disconnect(&mut self) -> Result<(), ChatError> {
        if self.state == SessionState::Disconnected {
            return Ok(());
        }

        let room = self.current_room.clone();
        self.announce(&leave_notice(&self.username, &room), &room).await;
        let result = self.teardown().await;
        info!(username = %self.username, "Disconnected");
        result
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            username: self.username.clone(),
            room: self.current_room.clone(),
            state: self.state,
            broker: self.connector.describe(),
            publisher: self
                .publisher
                .as_ref()
                .map(Publisher::stats)
                .unwrap_or_default(),
            subscriber: self
                .subscriber
                .as_ref()
                .map(Subscriber::stats)
                .unwrap_or_default(),
        }
    }

    fn topic_for(&self, room: &str) -> String {
        topic_for_room(&self.settings.chat.topic_prefix, room)
    }

    fn publisher(&self) -> Result<Publisher, ChatError> {
        match (&self.state, &self.publisher) {
            (SessionState::Connected, Some(publisher)) => Ok(publisher.clone()),
            _ => Err(ChatError::NotConnected),
        }
    }

    fn subscriber_running(&self) -> bool {
        self.subscriber
            .as_ref()
            .is_some_and(|s| s.state() == SubscriberState::Running)
    }

    /// Like `publisher`, but a consume loop that stopped on its own takes the
    /// session down first.
    async fn live_publisher(&mut self) -> Result<Publisher, ChatError> {
        if self.state == SessionState::Connected && !self.subscriber_running() {
            warn!(username = %self.username, "Consume loop stopped; disconnecting");
            self.display
                .report_error("Lost the connection to the broker; disconnected");
            if let Err(e) = self.teardown().await {
                debug!(error = %e, "Teardown after consumer loss failed");
            }
            return Err(ChatError::NotConnected);
        }
        self.publisher()
    }

    fn incoming_sink(&self) -> Arc<dyn DispatchSink> {
        let capacity = self.settings.chat.dedup_capacity;
        let inner: Arc<dyn DispatchSink> = if capacity > 0 {
            Arc::new(DedupFilter::new(capacity, self.display.clone()))
        } else {
            self.display.clone()
        };
        Arc::new(EchoFilter::new(&self.username, inner))
    }

    async fn build_clients(&self) -> Result<(Publisher, Subscriber), ChatError> {
        let producer = self.connector.producer().await?;
        let publisher = Publisher::new(
            producer,
            &self.settings.chat.topic_prefix,
            self.settings.producer.clone(),
        );

        let group = format!("{}{}", self.settings.consumer.group_prefix, self.username);
        let consumer = match self
            .connector
            .consumer(&group, ConsumerOptions::from(&self.settings.consumer))
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                close_quietly(&publisher).await;
                return Err(e.into());
            }
        };

        let mut subscriber = Subscriber::new(consumer, self.incoming_sink(), &self.settings.consumer);
        let topics = vec![self.topic_for(&self.current_room)];
        let started = match subscriber.subscribe(&topics).await {
            Ok(()) => subscriber.start(),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            if let Err(stop_err) = subscriber.stop().await {
                debug!(error = %stop_err, "Failed to stop subscriber after connect failure");
            }
            close_quietly(&publisher).await;
            return Err(e);
        }

        Ok((publisher, subscriber))
    }

    /// Publish a system notice; failures are reported, not returned.
    async fn announce(&self, text: &str, room: &str) {
        let Some(publisher) = self.publisher.as_ref() else {
            return;
        };
        if let Err(e) = publisher.send(&Envelope::system(text, room)).await {
            warn!(room, error = %e, "Failed to publish notice");
            self.display
                .report_error(&format!("Failed to announce in '{room}': {e}"));
        }
    }

    async fn teardown(&mut self) -> Result<(), ChatError> {
        let mut first_error = None;

        if let Some(mut subscriber) = self.subscriber.take() {
            if let Err(e) = subscriber.stop().await {
                self.display
                    .report_error(&format!("Failed to stop subscriber: {e}"));
                first_error.get_or_insert(e);
            }
        }
        if let Some(publisher) = self.publisher.take() {
            if let Err(e) = publisher.close().await {
                self.display
                    .report_error(&format!("Failed to close publisher: {e}"));
                first_error.get_or_insert(e);
            }
        }

        self.state = SessionState::Disconnected;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Disconnected {
            warn!(username = %self.username, "Session dropped without disconnect");
        }
    }
}

async fn close_quietly(publisher: &Publisher) {
    if let Err(e) = publisher.close().await {
        debug!(error = %e, "Failed to close publisher");
    }
}
