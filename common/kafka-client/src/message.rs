use rdkafka::message::{BorrowedMessage, Headers, Message};

/// Lets librdkafka's partitioner pick the partition on produce
pub const PARTITION_ANY: i32 = -1;

/// Offset of a message that has not been written yet
pub const OFFSET_UNSET: i64 = -1001;

/// An owned Kafka record, as handed to `KafkaProducer::produce` or returned by
/// `KafkaConsumer::fetch_message`.
///
/// `key: None` and `key: Some(vec![])` are different keys for partitioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<i64>, // milliseconds since the epoch
    pub headers: Vec<(String, Vec<u8>)>,
}

impl BrokerMessage {
    /// Message for the producer's default topic, partitioned by librdkafka
    pub fn new(key: Option<Vec<u8>>, value: Option<Vec<u8>>) -> Self {
        Self {
            topic: String::new(),
            partition: PARTITION_ANY,
            offset: OFFSET_UNSET,
            key,
            value,
            timestamp: None,
            headers: Vec::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }
}

impl From<&BorrowedMessage<'_>> for BrokerMessage {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        (
                            header.key.to_string(),
                            header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().map(<[u8]>::to_vec),
            timestamp: message.timestamp().to_millis(),
            headers,
        }
    }
}
