use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes the broker server, the broker client (producer/consumer) and the chat layer.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub chat: ChatSettings,
}

/// Configuration settings for the WebSocket broker server.
///
/// Defines the host and port `popchat serve` will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Configuration settings for the broker itself.
///
/// `url` selects a remote broker; without it the chat client runs an in-process broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub url: Option<String>,
    pub default_partitions: u32,
    pub data_dir: Option<String>,
    pub retention_secs: Option<i64>,
    pub max_records_per_partition: Option<usize>,
}

/// Send-path settings: acknowledgment wait, bounded retries and flush budget.
#[derive(Debug, Deserialize, Clone)]
pub struct ProducerSettings {
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub delivery_timeout_ms: u64,
    pub flush_timeout_ms: u64,
}

/// Consume-loop settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerSettings {
    pub group_prefix: String,
    pub poll_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub auto_commit_interval_ms: u64,
    pub offset_reset: OffsetReset,
}

/// Where a consumer starts reading a partition it has no committed offset for.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

/// Chat-level settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ChatSettings {
    pub default_room: String,
    pub topic_prefix: String,
    pub dedup_capacity: usize,
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9092,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: None,
            default_partitions: 3,
            data_dir: None,
            retention_secs: Some(7 * 24 * 3600),
            max_records_per_partition: Some(100_000),
        }
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            max_retries: 3,
            retry_backoff_ms: 1000,
            delivery_timeout_ms: 10_000,
            flush_timeout_ms: 10_000,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group_prefix: "chat-group-".to_string(),
            poll_timeout_ms: 250,
            stop_grace_ms: 5000,
            auto_commit_interval_ms: 5000,
            offset_reset: OffsetReset::Latest,
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            default_room: "general".to_string(),
            topic_prefix: "chat-".to_string(),
            dedup_capacity: 1024,
            log_level: "warn".to_string(),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub producer: Option<PartialProducerSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub chat: Option<PartialChatSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub url: Option<String>,
    pub default_partitions: Option<u32>,
    pub data_dir: Option<String>,
    pub retention_secs: Option<i64>,
    pub max_records_per_partition: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialProducerSettings {
    pub request_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub delivery_timeout_ms: Option<u64>,
    pub flush_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub group_prefix: Option<String>,
    pub poll_timeout_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub auto_commit_interval_ms: Option<u64>,
    pub offset_reset: Option<OffsetReset>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialChatSettings {
    pub default_room: Option<String>,
    pub topic_prefix: Option<String>,
    pub dedup_capacity: Option<usize>,
    pub log_level: Option<String>,
}

impl PartialSettings {
    /// Merge whatever was provided over `Settings::default()`.
    pub fn merge_with_defaults(self) -> Settings {
        let default = Settings::default();
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let producer = self.producer.unwrap_or_default();
        let consumer = self.consumer.unwrap_or_default();
        let chat = self.chat.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            broker: BrokerSettings {
                url: broker.url.or(default.broker.url),
                default_partitions: broker
                    .default_partitions
                    .unwrap_or(default.broker.default_partitions),
                data_dir: broker.data_dir.or(default.broker.data_dir),
                retention_secs: broker.retention_secs.or(default.broker.retention_secs),
                max_records_per_partition: broker
                    .max_records_per_partition
                    .or(default.broker.max_records_per_partition),
            },
            producer: ProducerSettings {
                request_timeout_ms: producer
                    .request_timeout_ms
                    .unwrap_or(default.producer.request_timeout_ms),
                max_retries: producer.max_retries.unwrap_or(default.producer.max_retries),
                retry_backoff_ms: producer
                    .retry_backoff_ms
                    .unwrap_or(default.producer.retry_backoff_ms),
                delivery_timeout_ms: producer
                    .delivery_timeout_ms
                    .unwrap_or(default.producer.delivery_timeout_ms),
                flush_timeout_ms: producer
                    .flush_timeout_ms
                    .unwrap_or(default.producer.flush_timeout_ms),
            },
            consumer: ConsumerSettings {
                group_prefix: consumer
                    .group_prefix
                    .unwrap_or(default.consumer.group_prefix),
                poll_timeout_ms: consumer
                    .poll_timeout_ms
                    .unwrap_or(default.consumer.poll_timeout_ms),
                stop_grace_ms: consumer
                    .stop_grace_ms
                    .unwrap_or(default.consumer.stop_grace_ms),
                auto_commit_interval_ms: consumer
                    .auto_commit_interval_ms
                    .unwrap_or(default.consumer.auto_commit_interval_ms),
                offset_reset: consumer
                    .offset_reset
                    .unwrap_or(default.consumer.offset_reset),
            },
            chat: ChatSettings {
                default_room: chat.default_room.unwrap_or(default.chat.default_room),
                topic_prefix: chat.topic_prefix.unwrap_or(default.chat.topic_prefix),
                dedup_capacity: chat.dedup_capacity.unwrap_or(default.chat.dedup_capacity),
                log_level: chat.log_level.unwrap_or(default.chat.log_level),
            },
        }
    }
}
