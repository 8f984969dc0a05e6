use std::fmt::Display;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tracing::{debug, error};

pub const KAFKA_CLIENT_ERRORS: &str = "kafka_client_errors_total";

/// Capabilities we need from an error surfaced by the broker client to decide
/// whether it is ours to handle or librdkafka's to retry.
pub trait BrokerErrorExt {
    /// False for errors that did not come from the broker client (e.g. cancellation)
    fn is_broker_error(&self) -> bool;

    /// "Nothing available yet", never worth logging
    fn is_timeout(&self) -> bool;

    /// Non-recoverable, the session has to be abandoned
    fn is_fatal(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NonBroker,
    Timeout,
    Transient,
    Fatal,
}

pub fn error_class<E: BrokerErrorExt>(err: &E) -> ErrorClass {
    if !err.is_broker_error() {
        ErrorClass::NonBroker
    } else if err.is_timeout() {
        ErrorClass::Timeout
    } else if err.is_fatal() {
        ErrorClass::Fatal
    } else {
        ErrorClass::Transient
    }
}

/// Returns the errors the caller has to see and swallows the ones the client
/// library already retries with its own backoff.
pub fn classify_error<E: BrokerErrorExt + Display>(err: E) -> Option<E> {
    match error_class(&err) {
        ErrorClass::NonBroker => Some(err),
        ErrorClass::Timeout => {
            debug!("broker client timed out: {}", err);
            None
        }
        ErrorClass::Fatal => {
            error!("fatal broker error, no retry will take place: {}", err);
            metrics::counter!(KAFKA_CLIENT_ERRORS, "level" => "fatal").increment(1);
            Some(err)
        }
        ErrorClass::Transient => {
            error!("broker error, a retry will take place: {}", err);
            metrics::counter!(KAFKA_CLIENT_ERRORS, "level" => "transient").increment(1);
            None
        }
    }
}

impl BrokerErrorExt for KafkaError {
    fn is_broker_error(&self) -> bool {
        !matches!(self, KafkaError::Canceled)
    }

    fn is_timeout(&self) -> bool {
        if matches!(self, KafkaError::PartitionEOF(_)) {
            return true;
        }
        matches!(
            self.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::OperationTimedOut
                    | RDKafkaErrorCode::RequestTimedOut
                    | RDKafkaErrorCode::PartitionEOF
            )
        )
    }

    fn is_fatal(&self) -> bool {
        match self {
            KafkaError::MessageConsumptionFatal(_) => true,
            KafkaError::Transaction(err) => err.is_fatal(),
            _ => matches!(
                self.rdkafka_error_code(),
                Some(
                    RDKafkaErrorCode::Fatal
                        | RDKafkaErrorCode::Authentication
                        | RDKafkaErrorCode::SaslAuthenticationFailed
                )
            ),
        }
    }
}
