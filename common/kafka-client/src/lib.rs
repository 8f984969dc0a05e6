pub mod classify;
pub mod config;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod message;
pub mod partitioner;
pub mod rebalance;
pub mod test;

pub use classify::{classify_error, BrokerErrorExt};
pub use config::{AuthMode, ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig};
pub use kafka_consumer::{ConsumerError, KafkaConsumer};
pub use kafka_producer::{KafkaProducer, ProducerError};
pub use message::{BrokerMessage, OFFSET_UNSET, PARTITION_ANY};
pub use partitioner::{get_partition, try_get_partition, PartitionAlgorithm, PartitionError};
pub use rebalance::{InitialOffsetHandler, RebalanceHandler};

// Re-exported so callers can name offsets without depending on rdkafka directly
pub use rdkafka::Offset;
