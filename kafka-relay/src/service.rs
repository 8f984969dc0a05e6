use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use common_kafka_client::{
    get_partition, BrokerMessage, ConsumerError, KafkaConsumer, KafkaProducer, PartitionAlgorithm,
    OFFSET_UNSET,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::health::Liveness;

const RELAY_MESSAGES_CONSUMED: &str = "relay_messages_consumed_total";
const RELAY_MESSAGES_RELAYED: &str = "relay_messages_relayed_total";

/// Copies `message` to `topic`, placed on the partition its key hashes to.
pub fn route(
    message: &BrokerMessage,
    topic: &str,
    partitions: &[i32],
    algorithm: PartitionAlgorithm,
) -> BrokerMessage {
    BrokerMessage {
        topic: topic.to_string(),
        partition: get_partition(message.key(), partitions, algorithm),
        offset: OFFSET_UNSET,
        key: message.key.clone(),
        value: message.value.clone(),
        timestamp: message.timestamp,
        headers: message.headers.clone(),
    }
}

pub struct RelayService {
    consumer: KafkaConsumer,
    producer: KafkaProducer,
    destination_topic: String,
    partitions: Vec<i32>,
    algorithm: PartitionAlgorithm,
    heartbeat_interval: Duration,
    liveness: Arc<Liveness>,
}

impl RelayService {
    pub fn new(config: &Config, liveness: Arc<Liveness>) -> Result<Self> {
        let algorithm = config.partition_algorithm()?;

        let producer = KafkaProducer::new(&config.kafka, &config.producer_config())
            .context("Failed to create Kafka producer")?;

        // Destination partitions are looked up once, a repartitioned topic needs a restart
        let partitions = producer
            .topic_partitions(&config.kafka_destination_topic, config.metadata_timeout())
            .context("Failed to fetch destination topic metadata")?;
        if partitions.is_empty() {
            bail!(
                "Destination topic {} has no partitions",
                config.kafka_destination_topic
            );
        }

        let consumer = KafkaConsumer::new(&config.kafka, &config.consumer_config())
            .context("Failed to create Kafka consumer")?;
        if let Some(offset) = config.start_offset() {
            consumer
                .set_initial_offset(offset)
                .context("Failed to set start offset")?;
        }

        info!(
            "Relay initialized: consuming from '{}', producing to '{}' over {} partitions with {}",
            config.kafka_source_topic,
            config.kafka_destination_topic,
            partitions.len(),
            algorithm
        );

        Ok(Self {
            consumer,
            producer,
            destination_topic: config.kafka_destination_topic.clone(),
            partitions,
            algorithm,
            heartbeat_interval: config.heartbeat_interval(),
            liveness,
        })
    }

    /// Relays until `cancel` fires or a fatal error occurs, then closes both clients.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let result = self.relay(&cancel).await;
        self.liveness.report_stopped();

        if let Err(e) = &result {
            error!("Relay loop failed: {:#}", e);
        }

        info!("Graceful shutdown: closing consumer and producer");
        let consumer_closed = self.consumer.close().await;
        let producer_closed = self.producer.close();

        result?;
        consumer_closed.context("Failed to close consumer")?;
        producer_closed.context("Failed to flush producer")?;
        info!("Graceful shutdown: completed");
        Ok(())
    }

    async fn relay(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            self.liveness.report_healthy();

            let fetched =
                tokio::time::timeout(self.heartbeat_interval, self.consumer.fetch_message(cancel))
                    .await;
            let message = match fetched {
                Err(_idle) => continue,
                Ok(Err(ConsumerError::Cancelled)) => {
                    info!("Relay cancelled, stopping");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e).context("Failed to fetch from source topic"),
                Ok(Ok(message)) => message,
            };
            metrics::counter!(RELAY_MESSAGES_CONSUMED).increment(1);

            let routed = route(
                &message,
                &self.destination_topic,
                &self.partitions,
                self.algorithm,
            );
            self.producer
                .produce(cancel, [routed])
                .await
                .with_context(|| {
                    format!(
                        "Failed to relay {}:{} offset {}",
                        message.topic, message.partition, message.offset
                    )
                })?;

            // A cancelled produce may not have been confirmed, leave it uncommitted
            if cancel.is_cancelled() {
                info!("Relay cancelled, stopping");
                return Ok(());
            }

            self.consumer
                .commit_message(&message)
                .context("Failed to commit relayed message")?;
            metrics::counter!(RELAY_MESSAGES_RELAYED).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_kafka_client::PARTITION_ANY;

    fn source(key: Option<&str>) -> BrokerMessage {
        BrokerMessage {
            topic: "clickhouse_events_json".to_string(),
            partition: 5,
            offset: 981,
            key: key.map(|k| k.as_bytes().to_vec()),
            value: Some(b"{\"event\":\"$pageview\"}".to_vec()),
            timestamp: Some(1_700_000_000_000),
            headers: vec![("token".to_string(), b"phc_abc".to_vec())],
        }
    }

    #[test]
    fn test_route_keeps_payload_and_resets_position() {
        let message = source(Some("user-1"));
        let routed = route(&message, "events_by_user", &[0, 1, 2], PartitionAlgorithm::Murmur2);

        assert_eq!(routed.topic, "events_by_user");
        assert_eq!(routed.offset, OFFSET_UNSET);
        assert_eq!(routed.key, message.key);
        assert_eq!(routed.value, message.value);
        assert_eq!(routed.timestamp, message.timestamp);
        assert_eq!(routed.header("token"), Some(b"phc_abc".as_slice()));
    }

    #[test]
    fn test_route_uses_hashed_partition() {
        let partitions = [10, 11, 12, 13];
        for key in ["user-1", "user-2", "user-3", "team-42"] {
            let routed = route(&source(Some(key)), "out", &partitions, PartitionAlgorithm::Murmur2);
            assert_eq!(
                routed.partition,
                get_partition(Some(key.as_bytes()), &partitions, PartitionAlgorithm::Murmur2)
            );
            assert!(partitions.contains(&routed.partition));
        }
    }

    #[test]
    fn test_route_same_key_same_partition() {
        let partitions = [0, 1, 2, 3, 4, 5, 6, 7];
        let first = route(&source(Some("user-9")), "out", &partitions, PartitionAlgorithm::Fnv1a);
        let second = route(&source(Some("user-9")), "out", &partitions, PartitionAlgorithm::Fnv1a);
        assert_eq!(first.partition, second.partition);
    }

    #[test]
    fn test_route_null_key() {
        let routed = route(&source(None), "out", &[3, 4], PartitionAlgorithm::Murmur2);
        assert_eq!(routed.partition, 3);

        let routed = route(&source(None), "out", &[], PartitionAlgorithm::Murmur2);
        assert_eq!(routed.partition, PARTITION_ANY);
    }
}
