use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{classify_error, BrokerErrorExt};
use crate::config::{ConfigError, ConsumerConfig, KafkaConfig};
use crate::message::BrokerMessage;
use crate::rebalance::{InitialOffsetHandler, RebalanceContext, RebalanceHandler};

pub const KAFKA_MESSAGES_FETCHED: &str = "kafka_consumer_messages_fetched_total";

// Upper bound on how long `close` waits for the group to take partitions back
const CLOSE_REVOKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid consumer configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("consumer already subscribed to {0}, the rebalance handler can only be changed before the first fetch")]
    AlreadySubscribed(String),
    #[error("failed to commit offset {offset} for {topic}:{partition}: {source}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        source: KafkaError,
    },
    #[error("seek timed out: {0}")]
    SeekTimedOut(KafkaError),
    #[error("seek failed: {0}")]
    Seek(KafkaError),
    #[error("no partitions of {0} are assigned to this consumer")]
    NoAssignment(String),
    #[error("cannot commit past offset {offset} of {topic}:{partition}")]
    InvalidOffset {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

/// A group consumer bound to a single topic.
///
/// Subscription happens lazily on the first `fetch_message`, which leaves room to
/// install a rebalance handler (see `set_initial_offset`) before the group is joined.
/// `close` consumes the consumer, so it cannot race with in-flight fetches.
pub struct KafkaConsumer {
    consumer: StreamConsumer<RebalanceContext>,
    topic: String,
    group_id: String,
    poll_timeout: Duration,
    subscribed: OnceCell<()>,
}

impl KafkaConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, ConsumerError> {
        Self::with_client_overrides(common_config, consumer_config, &[])
    }

    /// Like `new`, with extra librdkafka settings applied last
    pub fn with_client_overrides(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        overrides: &[(&str, &str)],
    ) -> Result<Self, ConsumerError> {
        let mut client_config = common_config.client_config()?;
        consumer_config.apply(&mut client_config);
        for (key, value) in overrides {
            client_config.set(*key, *value);
        }

        Self::from_client_config(
            &client_config,
            &consumer_config.kafka_consumer_topic,
            consumer_config.poll_timeout(),
        )
    }

    pub fn from_client_config(
        client_config: &ClientConfig,
        topic: &str,
        poll_timeout: Duration,
    ) -> Result<Self, ConsumerError> {
        let consumer: StreamConsumer<RebalanceContext> =
            client_config.create_with_context(RebalanceContext::new())?;

        let group_id = client_config.get("group.id").unwrap_or_default().to_string();

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            group_id,
            poll_timeout,
            subscribed: OnceCell::new(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.get().is_some()
    }

    /// Start consuming from `offset` on every partition of the first assignment.
    ///
    /// Later rebalances in the same session keep the coordinator's offsets. Must be
    /// called before the first `fetch_message`: once the consumer has subscribed this
    /// returns `ConsumerError::AlreadySubscribed` and leaves the handler unchanged.
    pub fn set_initial_offset(&self, offset: Offset) -> Result<(), ConsumerError> {
        self.set_rebalance_handler(Arc::new(InitialOffsetHandler::new(offset)))
    }

    /// Safe to call concurrently with the first `fetch_message`: the handler is
    /// either in place before the group is joined or rejected.
    pub fn set_rebalance_handler(
        &self,
        handler: Arc<dyn RebalanceHandler>,
    ) -> Result<(), ConsumerError> {
        if !self.consumer.context().install(handler) {
            return Err(ConsumerError::AlreadySubscribed(self.topic.clone()));
        }
        Ok(())
    }

    fn ensure_subscribed(&self) -> Result<(), ConsumerError> {
        self.subscribed.get_or_try_init(|| {
            // A failed subscribe also closes the handler slot
            self.consumer.context().seal();
            self.consumer.subscribe(&[self.topic.as_str()])?;
            info!(
                "Subscribed to {} as part of group {}",
                self.topic, self.group_id
            );
            Ok::<(), ConsumerError>(())
        })?;
        Ok(())
    }

    /// Waits for the next message, subscribing first if needed.
    ///
    /// Errors librdkafka retries by itself are logged and polling continues; fatal
    /// ones are returned. Cancelling `cancel` returns `ConsumerError::Cancelled`
    /// straight away, even in the middle of a poll, and leaves the consumer usable.
    pub async fn fetch_message(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BrokerMessage, ConsumerError> {
        self.ensure_subscribed()?;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return Err(ConsumerError::Cancelled);
                }

                polled = tokio::time::timeout(self.poll_timeout, self.consumer.recv()) => {
                    match polled {
                        Err(_elapsed) => {
                            debug!("No message on {} within {:?}", self.topic, self.poll_timeout);
                        }
                        Ok(Ok(message)) => {
                            metrics::counter!(KAFKA_MESSAGES_FETCHED).increment(1);
                            return Ok(BrokerMessage::from(&message));
                        }
                        Ok(Err(e)) if e.is_timeout() => {}
                        Ok(Err(e)) => {
                            if let Some(e) = classify_error(e) {
                                return Err(ConsumerError::Kafka(e));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Synchronously commits `message` as processed.
    ///
    /// Kafka stores the offset of the next message to read, so `message.offset + 1`
    /// is committed, and a message at `i64::MAX` is rejected. Failures are always
    /// returned.
    pub fn commit_message(&self, message: &BrokerMessage) -> Result<(), ConsumerError> {
        let next_offset = message
            .offset
            .checked_add(1)
            .ok_or_else(|| ConsumerError::InvalidOffset {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
            })?;
        let commit_error = |source| ConsumerError::Commit {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            source,
        };

        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&message.topic, message.partition, Offset::Offset(next_offset))
            .map_err(commit_error)?;

        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(commit_error)?;

        debug!(
            "Committed {}:{} at offset {}",
            message.topic, message.partition, next_offset
        );
        Ok(())
    }

    /// Moves every assigned partition of the topic to `offset`.
    ///
    /// `timeout` must be non-zero: a zero timeout would make librdkafka seek
    /// asynchronously and drop any error. Timeouts come back as
    /// `ConsumerError::SeekTimedOut` so callers can retry.
    pub fn seek(&self, offset: Offset, timeout: Duration) -> Result<(), ConsumerError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroSeekTimeout.into());
        }

        let mut list = TopicPartitionList::new();
        for elem in self.consumer.assignment()?.elements() {
            if elem.topic() == self.topic {
                list.add_partition_offset(elem.topic(), elem.partition(), offset)?;
            }
        }

        if list.count() == 0 {
            return Err(ConsumerError::NoAssignment(self.topic.clone()));
        }

        let result = self
            .consumer
            .seek_partitions(list, timeout)
            .map_err(seek_error)?;

        for elem in result.elements() {
            elem.error().map_err(seek_error)?;
        }

        info!(
            "Seeked {} partitions of {} to {:?}",
            result.count(),
            self.topic,
            offset
        );
        Ok(())
    }

    /// Currently assigned (topic, partition) pairs
    pub fn assignment(&self) -> Result<Vec<(String, i32)>, ConsumerError> {
        Ok(self
            .consumer
            .assignment()?
            .elements()
            .iter()
            .map(|elem| (elem.topic().to_string(), elem.partition()))
            .collect())
    }

    /// Leaves the group (if it was ever joined) and drops the connection.
    ///
    /// Waits, up to a bound, for the revocation triggered by leaving to be served so
    /// the group can hand the partitions to another member right away instead of
    /// after the session timeout. Messages still buffered are dropped uncommitted.
    pub async fn close(self) -> Result<(), ConsumerError> {
        if self.is_subscribed() {
            self.consumer.unsubscribe();
            self.drain_revocation().await?;
        }
        info!("Closed consumer for {}", self.topic);
        Ok(())
    }

    async fn drain_revocation(&self) -> Result<(), ConsumerError> {
        let deadline = tokio::time::Instant::now() + CLOSE_REVOKE_TIMEOUT;

        // Rebalance callbacks only run while the consumer is polled
        while self.consumer.assignment()?.count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Closing consumer for {} with partitions still assigned after {:?}",
                    self.topic, CLOSE_REVOKE_TIMEOUT
                );
                break;
            }

            match tokio::time::timeout(CLOSE_POLL_INTERVAL, self.consumer.recv()).await {
                Err(_elapsed) => {}
                Ok(Ok(_)) => debug!("Dropping buffered message from {} on close", self.topic),
                Ok(Err(e)) => debug!("Ignoring consumer error on close: {}", e),
            }
        }
        Ok(())
    }
}

fn seek_error(e: KafkaError) -> ConsumerError {
    if e.is_timeout() {
        ConsumerError::SeekTimedOut(e)
    } else {
        ConsumerError::Seek(e)
    }
}
