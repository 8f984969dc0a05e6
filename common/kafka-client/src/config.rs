use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::ClientConfig;
use thiserror::Error;

use crate::partitioner::PartitionAlgorithm;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown kafka auth type: {0} (expected none, plain, scram-sha-256 or scram-sha-512)")]
    UnknownAuthType(String),
    #[error("auth type {0} requires both a username and a password")]
    MissingCredentials(AuthMode),
    #[error("delivery timeout ({delivery_timeout_ms}ms) must exceed linger time ({linger_ms}ms)")]
    DeliveryTimeoutTooShort {
        delivery_timeout_ms: u32,
        linger_ms: u32,
    },
    #[error("unknown kafka log level: {0}")]
    UnknownLogLevel(String),
    #[error("unknown partition algorithm: {0}")]
    UnknownPartitioner(String),
    #[error("seek timeout must be non-zero")]
    ZeroSeekTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Plain,
    ScramSha256,
    ScramSha512,
}

impl AuthMode {
    /// Value for librdkafka's `sasl.mechanisms`, `None` when SASL is off
    pub fn sasl_mechanism(&self) -> Option<&'static str> {
        match self {
            AuthMode::None => None,
            AuthMode::Plain => Some("PLAIN"),
            AuthMode::ScramSha256 => Some("SCRAM-SHA-256"),
            AuthMode::ScramSha512 => Some("SCRAM-SHA-512"),
        }
    }
}

impl FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(AuthMode::None),
            "plain" => Ok(AuthMode::Plain),
            "scram-sha-256" => Ok(AuthMode::ScramSha256),
            "scram-sha-512" => Ok(AuthMode::ScramSha512),
            _ => Err(ConfigError::UnknownAuthType(s.to_string())),
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMode::None => "none",
            AuthMode::Plain => "plain",
            AuthMode::ScramSha256 => "scram-sha-256",
            AuthMode::ScramSha512 => "scram-sha-512",
        };
        f.write_str(name)
    }
}

/// Maps our log level names onto librdkafka's syslog-style verbosity
pub fn parse_log_level(level: &str) -> Result<RDKafkaLogLevel, ConfigError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" | "debug" => Ok(RDKafkaLogLevel::Debug),
        "info" => Ok(RDKafkaLogLevel::Info),
        "notice" => Ok(RDKafkaLogLevel::Notice),
        "warn" | "warning" => Ok(RDKafkaLogLevel::Warning),
        "error" => Ok(RDKafkaLogLevel::Error),
        "critical" => Ok(RDKafkaLogLevel::Critical),
        _ => Err(ConfigError::UnknownLogLevel(level.to_string())),
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "none")]
    pub kafka_auth_type: String, // none, plain, scram-sha-256, scram-sha-512

    pub kafka_username: Option<String>,

    pub kafka_password: Option<String>,

    pub kafka_ca_file: Option<String>, // PEM bundle used to verify the brokers

    #[envconfig(default = "info")]
    pub kafka_log_level: String, // librdkafka's own verbosity

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

impl KafkaConfig {
    pub fn auth_mode(&self) -> Result<AuthMode, ConfigError> {
        self.kafka_auth_type.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka_message_timeout_ms <= self.kafka_producer_linger_ms {
            return Err(ConfigError::DeliveryTimeoutTooShort {
                delivery_timeout_ms: self.kafka_message_timeout_ms,
                linger_ms: self.kafka_producer_linger_ms,
            });
        }

        let auth = self.auth_mode()?;
        if auth != AuthMode::None {
            let has_username = self.kafka_username.as_deref().is_some_and(|u| !u.is_empty());
            let has_password = self.kafka_password.as_deref().is_some_and(|p| !p.is_empty());
            if !has_username || !has_password {
                return Err(ConfigError::MissingCredentials(auth));
            }
        }

        parse_log_level(&self.kafka_log_level)?;
        Ok(())
    }

    /// Connection settings shared by consumers and producers
    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        self.validate()?;

        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.kafka_hosts);

        let auth = self.auth_mode()?;
        let verify_with_ca = self.kafka_ca_file.is_some();
        match auth.sasl_mechanism() {
            Some(mechanism) => {
                let protocol = if self.kafka_tls || verify_with_ca {
                    "sasl_ssl"
                } else {
                    "sasl_plaintext"
                };
                client_config
                    .set("security.protocol", protocol)
                    .set("sasl.mechanisms", mechanism)
                    .set("sasl.username", self.kafka_username.as_deref().unwrap_or_default())
                    .set("sasl.password", self.kafka_password.as_deref().unwrap_or_default());
            }
            None => {
                if self.kafka_tls || verify_with_ca {
                    client_config.set("security.protocol", "ssl");
                }
            }
        }

        match &self.kafka_ca_file {
            Some(ca_file) => {
                client_config.set("ssl.ca.location", ca_file);
            }
            None if self.kafka_tls => {
                client_config.set("enable.ssl.certificate.verification", "false");
            }
            None => {}
        }

        client_config.set_log_level(parse_log_level(&self.kafka_log_level)?);

        Ok(client_config)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Upper bound of a single poll; cancellation is observed independently of it
    #[envconfig(default = "60000")]
    pub kafka_consumer_poll_timeout_ms: u64,
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_poll_timeout_ms)
    }

    pub(crate) fn apply(&self, client_config: &mut ClientConfig) {
        client_config
            .set("group.id", &self.kafka_consumer_group)
            .set("auto.offset.reset", &self.kafka_consumer_offset_reset)
            // Offsets move only through explicit commits
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ProducerConfig {
    pub kafka_producer_topic: String,

    // librdkafka partitioner used for messages without an explicit partition
    pub kafka_producer_partitioner: Option<String>,

    // Extra time on top of the linger we allow close() to flush buffered messages
    #[envconfig(default = "5000")]
    pub kafka_producer_flush_grace_ms: u64,
}

impl ProducerConfig {
    pub fn partition_algorithm(&self) -> Result<Option<PartitionAlgorithm>, ConfigError> {
        self.kafka_producer_partitioner
            .as_deref()
            .map(|name| {
                name.parse()
                    .map_err(|_| ConfigError::UnknownPartitioner(name.to_string()))
            })
            .transpose()
    }

    pub(crate) fn apply(
        &self,
        common: &KafkaConfig,
        client_config: &mut ClientConfig,
    ) -> Result<(), ConfigError> {
        client_config
            .set("linger.ms", common.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                common.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                common.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (common.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                common.kafka_producer_queue_messages.to_string(),
            );

        if let Some(algorithm) = self.partition_algorithm()? {
            match algorithm.librdkafka_name() {
                Some(name) => {
                    client_config.set("partitioner", name);
                }
                None => {
                    // librdkafka has no equivalent, callers must pick partitions with get_partition
                    tracing::warn!(
                        "partitioner {algorithm} is not native to librdkafka, keeping the client default"
                    );
                }
            }
        }

        Ok(())
    }

    pub fn flush_timeout(&self, common: &KafkaConfig) -> Duration {
        Duration::from_millis(u64::from(common.kafka_producer_linger_ms))
            + Duration::from_millis(self.kafka_producer_flush_grace_ms)
    }
}
