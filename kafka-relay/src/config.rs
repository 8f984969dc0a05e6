use std::time::Duration;

use common_kafka_client::{
    ConfigError, ConsumerConfig, KafkaConfig, Offset, PartitionAlgorithm, ProducerConfig,
};
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "kafka-relay")]
    pub kafka_consumer_group: String,

    pub kafka_source_topic: String,

    pub kafka_destination_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "5000")]
    pub kafka_producer_flush_grace_ms: u64,

    #[envconfig(default = "murmur2_random")]
    pub relay_partition_algorithm: String,

    // Start of the first assignment, overriding committed offsets. Unset keeps them
    pub relay_start_offset: Option<i64>,

    #[envconfig(default = "10000")]
    pub relay_metadata_timeout_ms: u64,

    // Liveness is reported at least this often, even when the source topic is idle
    #[envconfig(default = "5000")]
    pub relay_heartbeat_interval_ms: u64,

    #[envconfig(default = "0.0.0.0:8080")]
    pub bind_address: String,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,
}

impl Config {
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            kafka_consumer_group: self.kafka_consumer_group.clone(),
            kafka_consumer_topic: self.kafka_source_topic.clone(),
            kafka_consumer_offset_reset: self.kafka_consumer_offset_reset.clone(),
            kafka_consumer_poll_timeout_ms: self.relay_heartbeat_interval_ms,
        }
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            kafka_producer_topic: self.kafka_destination_topic.clone(),
            // Partitions are computed by the relay, librdkafka's partitioner is never used
            kafka_producer_partitioner: None,
            kafka_producer_flush_grace_ms: self.kafka_producer_flush_grace_ms,
        }
    }

    pub fn partition_algorithm(&self) -> Result<PartitionAlgorithm, ConfigError> {
        self.relay_partition_algorithm
            .parse()
            .map_err(|_| ConfigError::UnknownPartitioner(self.relay_partition_algorithm.clone()))
    }

    pub fn start_offset(&self) -> Option<Offset> {
        self.relay_start_offset.map(Offset::Offset)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_metadata_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.relay_heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(overrides: &[(&str, &str)]) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = [
            ("KAFKA_SOURCE_TOPIC", "clickhouse_events_json"),
            ("KAFKA_DESTINATION_TOPIC", "events_by_distinct_id"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in overrides {
            env.insert(k.to_string(), v.to_string());
        }
        env
    }

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&env(&[])).unwrap();

        assert_eq!(config.kafka.kafka_hosts, "localhost:9092");
        assert_eq!(config.kafka_consumer_group, "kafka-relay");
        assert_eq!(
            config.partition_algorithm().unwrap(),
            PartitionAlgorithm::Murmur2Random
        );
        assert_eq!(config.start_offset(), None);
        assert!(!config.export_prometheus);
    }

    #[test]
    fn test_derived_client_configs() {
        let config = Config::init_from_hashmap(&env(&[
            ("KAFKA_HOSTS", "kafka:9092"),
            ("KAFKA_CONSUMER_GROUP", "relay-v2"),
            ("RELAY_START_OFFSET", "1200"),
        ]))
        .unwrap();

        let consumer = config.consumer_config();
        assert_eq!(consumer.kafka_consumer_group, "relay-v2");
        assert_eq!(consumer.kafka_consumer_topic, "clickhouse_events_json");
        assert_eq!(consumer.poll_timeout(), config.heartbeat_interval());

        let producer = config.producer_config();
        assert_eq!(producer.kafka_producer_topic, "events_by_distinct_id");
        assert_eq!(producer.kafka_producer_partitioner, None);

        assert_eq!(config.kafka.kafka_hosts, "kafka:9092");
        assert_eq!(config.start_offset(), Some(Offset::Offset(1200)));
    }

    #[test]
    fn test_unknown_partition_algorithm() {
        let config =
            Config::init_from_hashmap(&env(&[("RELAY_PARTITION_ALGORITHM", "round_robin")]))
                .unwrap();

        assert_eq!(
            config.partition_algorithm(),
            Err(ConfigError::UnknownPartitioner("round_robin".to_string()))
        );
    }

    #[test]
    fn test_missing_topics_fail() {
        let env: HashMap<String, String> = HashMap::new();
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
