use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, KafkaConfig, ProducerConfig};
use crate::message::BrokerMessage;

pub const KAFKA_MESSAGES_PRODUCED: &str = "kafka_producer_messages_produced_total";
pub const KAFKA_PRODUCER_ERRORS: &str = "kafka_producer_errors_total";

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("invalid producer configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("kafka client constructor panicked: {0}")]
    Construction(String),
    #[error("failed to produce to {topic}:{partition}: {source}")]
    ProduceFailed {
        topic: String,
        partition: i32,
        source: KafkaError,
    },
    #[error("topic {0} not found in cluster metadata")]
    UnknownTopic(String),
}

/// Runs a client constructor, turning a panic inside it into an error.
///
/// The native client can abort construction in ways rdkafka surfaces as a panic
/// rather than an `Err`, and a producer that fails to build must never take the
/// process down with it.
pub fn guarded_create<T>(
    create: impl FnOnce() -> Result<T, KafkaError>,
) -> Result<T, ProducerError> {
    match catch_unwind(AssertUnwindSafe(create)) {
        Ok(created) => created.map_err(ProducerError::Kafka),
        Err(panic) => {
            let reason = panic_reason(panic.as_ref());
            error!("kafka client constructor panicked: {}", reason);
            Err(ProducerError::Construction(reason))
        }
    }
}

/// Partition to pin a record to. Any negative id leaves placement to librdkafka's
/// partitioner; zero and above are explicit targets.
fn target_partition(partition: i32) -> Option<i32> {
    (partition >= 0).then_some(partition)
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        reason.to_string()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Producer that confirms every message before moving on to the next one.
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    flush_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(
        common_config: &KafkaConfig,
        producer_config: &ProducerConfig,
    ) -> Result<Self, ProducerError> {
        let mut client_config = common_config.client_config()?;
        producer_config.apply(common_config, &mut client_config)?;

        let producer: FutureProducer = guarded_create(|| client_config.create())?;

        info!(
            "Created producer for {} (default topic {})",
            common_config.kafka_hosts, producer_config.kafka_producer_topic
        );

        Ok(Self {
            producer,
            topic: producer_config.kafka_producer_topic.clone(),
            flush_timeout: producer_config.flush_timeout(common_config),
        })
    }

    pub fn default_topic(&self) -> &str {
        &self.topic
    }

    /// Sends `messages` one by one, waiting for each delivery report.
    ///
    /// Messages without a topic go to the default topic, and a negative partition
    /// leaves placement to librdkafka's partitioner. The first failed delivery
    /// stops the batch; earlier messages stay written. Cancellation returns
    /// `Ok(())` right away without sending what is left. A delivery channel that
    /// closes without a report counts as delivered.
    pub async fn produce(
        &self,
        cancel: &CancellationToken,
        messages: impl IntoIterator<Item = BrokerMessage>,
    ) -> Result<(), ProducerError> {
        for message in messages {
            if cancel.is_cancelled() {
                debug!("Produce cancelled, skipping the rest of the batch");
                return Ok(());
            }

            let topic = if message.topic.is_empty() {
                self.topic.as_str()
            } else {
                message.topic.as_str()
            };
            let partition = target_partition(message.partition);

            let headers = (!message.headers.is_empty()).then(|| {
                message.headers.iter().fold(
                    OwnedHeaders::new_with_capacity(message.headers.len()),
                    |headers, (key, value)| {
                        headers.insert(Header {
                            key,
                            value: Some(value.as_slice()),
                        })
                    },
                )
            });

            let record: FutureRecord<'_, [u8], [u8]> = FutureRecord {
                topic,
                partition,
                payload: message.value(),
                key: message.key(),
                timestamp: message.timestamp,
                headers,
            };

            let produce_failed = |source| {
                metrics::counter!(KAFKA_PRODUCER_ERRORS).increment(1);
                ProducerError::ProduceFailed {
                    topic: topic.to_string(),
                    partition: message.partition,
                    source,
                }
            };

            let delivery = self
                .producer
                .send_result(record)
                .map_err(|(e, _)| produce_failed(e))?;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Produce cancelled while waiting for delivery to {}", topic);
                    return Ok(());
                }

                report = delivery => match report {
                    Ok(Ok(_)) => {
                        metrics::counter!(KAFKA_MESSAGES_PRODUCED).increment(1);
                    }
                    Ok(Err((e, _))) => {
                        error!("Failed to produce to {}: {}", topic, e);
                        return Err(produce_failed(e));
                    }
                    Err(_) => {
                        // The report channel closed without a result
                        warn!("Delivery report for {} was dropped, assuming delivered", topic);
                    }
                }
            }
        }

        Ok(())
    }

    /// Partition ids of `topic`, sorted, as passed to `get_partition`
    pub fn topic_partitions(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Vec<i32>, ProducerError> {
        let metadata = self.producer.client().fetch_metadata(Some(topic), timeout)?;

        let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
            return Err(ProducerError::UnknownTopic(topic.to_string()));
        };

        if let Some(err) = topic_metadata.error() {
            return Err(KafkaError::MetadataFetch(RDKafkaErrorCode::from(err)).into());
        }

        let mut partitions: Vec<i32> = topic_metadata.partitions().iter().map(|p| p.id()).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer.flush(timeout)?;
        Ok(())
    }

    /// Flushes buffered messages, bounded by the linger time plus a grace period,
    /// then drops the connection.
    pub fn close(self) -> Result<(), ProducerError> {
        info!("Flushing producer for {} before close", self.topic);
        if let Err(e) = self.producer.flush(self.flush_timeout) {
            warn!("Failed to flush producer on close: {}", e);
            metrics::counter!(KAFKA_PRODUCER_ERRORS, "error" => "flush").increment(1);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PARTITION_ANY;
    use crate::test::{create_mock_kafka, high_watermark, kafka_config, producer_config};

    #[test]
    fn test_panicking_constructor_is_an_error() {
        let result = guarded_create::<FutureProducer>(|| panic!("constructor blew up"));

        match result {
            Err(ProducerError::Construction(reason)) => {
                assert_eq!(reason, "constructor blew up")
            }
            Err(other) => panic!("expected a construction error, got {other:?}"),
            Ok(_) => panic!("expected a construction error, got a producer"),
        }
    }

    #[test]
    fn test_formatted_panic_reason() {
        let id = 7;
        let result = guarded_create::<FutureProducer>(|| panic!("broker {id} refused"));

        assert!(matches!(
            result,
            Err(ProducerError::Construction(reason)) if reason == "broker 7 refused"
        ));
    }

    #[test]
    fn test_invalid_client_configuration() {
        let mut common = kafka_config("127.0.0.1:1");
        common.kafka_compression_codec = "definitely-not-a-codec".to_string();

        let result = KafkaProducer::new(&common, &producer_config("events"));
        assert!(matches!(result, Err(ProducerError::Kafka(_))));
    }

    #[test]
    fn test_invalid_kafka_config_is_rejected_before_connecting() {
        let mut common = kafka_config("127.0.0.1:1");
        common.kafka_auth_type = "plain".to_string();

        let result = KafkaProducer::new(&common, &producer_config("events"));
        assert!(matches!(
            result,
            Err(ProducerError::Config(ConfigError::MissingCredentials(_)))
        ));
    }

    #[test]
    fn test_unknown_partitioner_is_rejected() {
        let mut config = producer_config("events");
        config.kafka_producer_partitioner = Some("round-robin".to_string());

        let result = KafkaProducer::new(&kafka_config("127.0.0.1:1"), &config);
        assert!(matches!(
            result,
            Err(ProducerError::Config(ConfigError::UnknownPartitioner(_)))
        ));
    }

    #[test]
    fn test_target_partition() {
        assert_eq!(target_partition(PARTITION_ANY), None);
        assert_eq!(target_partition(-7), None);
        assert_eq!(target_partition(0), Some(0));
        assert_eq!(target_partition(3), Some(3));
    }

    #[tokio::test]
    async fn test_cancelled_produce_sends_nothing() {
        let (cluster, config) = create_mock_kafka("events", 1);
        let producer = KafkaProducer::new(&config, &producer_config("events")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let messages = vec![
            BrokerMessage::new(None, Some(b"one".to_vec())).with_partition(0),
            BrokerMessage::new(None, Some(b"two".to_vec())).with_partition(0),
        ];
        producer.produce(&cancel, messages).await.unwrap();
        producer.close().unwrap();

        assert_eq!(high_watermark(&cluster.bootstrap_servers(), "events", 0), 0);
    }
}
