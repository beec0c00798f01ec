//! In-process broker client.
//!
//! `LocalConnector` hands out producers and consumers that call straight into
//! a `SharedBroker`. Consumers long-poll on the broker's `data_ready`
//! notifier and commit their positions on the auto-commit cadence, on close,
//! and as a last resort when dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::client::{
    BrokerConnector, ConsumerOptions, ConsumerTransport, ProducerTransport,
};
use crate::broker::engine::{SharedBroker, lock};
use crate::broker::group::MemberId;
use crate::broker::message::{ConsumerEvent, Delivery, OutgoingRecord, TopicPartition};
use crate::utils::BrokerError;

#[derive(Clone)]
pub struct LocalConnector {
    broker: SharedBroker,
}

impl LocalConnector {
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> SharedBroker {
        self.broker.clone()
    }
}

#[async_trait]
impl BrokerConnector for LocalConnector {
    async fn producer(&self) -> Result<Box<dyn ProducerTransport>, BrokerError> {
        Ok(Box::new(LocalProducer::new(self.broker.clone())))
    }

    async fn consumer(
        &self,
        group: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn ConsumerTransport>, BrokerError> {
        Ok(Box::new(LocalConsumer::new(
            self.broker.clone(),
            group,
            options,
        )))
    }

    fn describe(&self) -> String {
        "in-process broker".to_string()
    }
}

pub struct LocalProducer {
    broker: SharedBroker,
    closed: AtomicBool,
}

impl LocalProducer {
    pub fn new(broker: SharedBroker) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ProducerTransport for LocalProducer {
    async fn produce(&self, record: OutgoingRecord) -> Result<Delivery, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        lock(&self.broker).produce(record)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct LocalConsumer {
    broker: SharedBroker,
    group: String,
    options: ConsumerOptions,
    member: Option<MemberId>,
    last_commit: Instant,
}

impl LocalConsumer {
    pub fn new(broker: SharedBroker, group: &str, options: ConsumerOptions) -> Self {
        Self {
            broker,
            group: group.to_string(),
            options,
            member: None,
            last_commit: Instant::now(),
        }
    }

    pub fn member_id(&self) -> Option<&str> {
        self.member.as_deref()
    }

    fn require_member(&self) -> Result<MemberId, BrokerError> {
        self.member
            .clone()
            .ok_or_else(|| BrokerError::Protocol("consumer is not subscribed".to_string()))
    }

    fn maybe_auto_commit(&mut self, member: &str) -> Result<(), BrokerError> {
        if self.last_commit.elapsed() >= self.options.auto_commit_interval {
            lock(&self.broker).commit(member)?;
            self.last_commit = Instant::now();
            debug!(member, "Auto-committed positions");
        }
        Ok(())
    }

    fn leave(&mut self) -> Result<(), BrokerError> {
        match self.member.take() {
            Some(member) => lock(&self.broker).leave_group(&member),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ConsumerTransport for LocalConsumer {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        let mut broker = lock(&self.broker);
        match &self.member {
            Some(member) => broker.subscribe(member, topics),
            None => {
                let member = broker.join_group(&self.group, topics, self.options.offset_reset)?;
                self.member = Some(member);
                Ok(())
            }
        }
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumerEvent>, BrokerError> {
        let member = self.require_member()?;
        let deadline = Instant::now() + timeout;

        loop {
            let data_ready = lock(&self.broker).data_ready();
            let notified = data_ready.notified();
            tokio::pin!(notified);
            // Register before checking so an append between fetch and await is not missed.
            notified.as_mut().enable();

            let event = lock(&self.broker).fetch(&member)?;
            self.maybe_auto_commit(&member)?;
            if event.is_some() {
                return Ok(event);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self) -> Result<(), BrokerError> {
        let member = self.require_member()?;
        lock(&self.broker).commit(&member)?;
        self.last_commit = Instant::now();
        Ok(())
    }

    async fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError> {
        let member = self.require_member()?;
        lock(&self.broker).assignment(&member)
    }

    async fn positions(&self) -> Result<Vec<(TopicPartition, u64)>, BrokerError> {
        let member = self.require_member()?;
        lock(&self.broker).positions(&member)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.leave()
    }
}

impl Drop for LocalConsumer {
    fn drop(&mut self) {
        if let Some(member) = self.member.clone() {
            warn!(member = %member, "Consumer dropped without close; leaving group");
            if let Err(e) = self.leave() {
                warn!(member = %member, error = %e, "Failed to leave group on drop");
            }
        }
    }
}

