use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::mocking::MockCluster;
use rdkafka::producer::DefaultProducerContext;
use rdkafka::ClientConfig;

use crate::config::{ConsumerConfig, KafkaConfig, ProducerConfig};

pub fn kafka_config(kafka_hosts: &str) -> KafkaConfig {
    KafkaConfig {
        kafka_hosts: kafka_hosts.to_string(),
        kafka_tls: false,
        kafka_auth_type: "none".to_string(),
        kafka_username: None,
        kafka_password: None,
        kafka_ca_file: None,
        kafka_log_level: "warn".to_string(),
        kafka_producer_linger_ms: 0,
        kafka_producer_queue_mib: 50,
        kafka_producer_queue_messages: 1000,
        kafka_message_timeout_ms: 5000,
        kafka_compression_codec: "none".to_string(),
    }
}

pub fn consumer_config(topic: &str, group: &str) -> ConsumerConfig {
    ConsumerConfig {
        kafka_consumer_group: group.to_string(),
        kafka_consumer_topic: topic.to_string(),
        kafka_consumer_offset_reset: "earliest".to_string(),
        kafka_consumer_poll_timeout_ms: 1000,
    }
}

pub fn producer_config(topic: &str) -> ProducerConfig {
    ProducerConfig {
        kafka_producer_topic: topic.to_string(),
        kafka_producer_partitioner: None,
        kafka_producer_flush_grace_ms: 1000,
    }
}

/// Single-broker in-process cluster with `topic` already created, plus a
/// config pointing at it. Dropping the cluster shuts the broker down.
pub fn create_mock_kafka(
    topic: &str,
    partitions: i32,
) -> (MockCluster<'static, DefaultProducerContext>, KafkaConfig) {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    cluster
        .create_topic(topic, partitions, 1)
        .expect("failed to create mock topic");

    let config = kafka_config(&cluster.bootstrap_servers());
    (cluster, config)
}

/// High watermark of `topic`:`partition`, i.e. how many messages were ever written to it
pub fn high_watermark(bootstrap_servers: &str, topic: &str, partition: i32) -> i64 {
    let consumer: BaseConsumer = ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .set("group.id", "watermarks")
        .create()
        .expect("failed to create watermark consumer");
    let (_, high) = consumer
        .fetch_watermarks(topic, partition, Duration::from_secs(30))
        .expect("failed to fetch watermarks");
    high
}
