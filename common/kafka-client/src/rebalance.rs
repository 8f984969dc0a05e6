use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, RebalanceProtocol};
use rdkafka::error::KafkaResult;
use rdkafka::types::RDKafkaRespErr;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

pub const KAFKA_REBALANCE_ERRORS: &str = "kafka_consumer_rebalance_errors_total";

/// Strategy run by librdkafka's callback thread when group membership changes.
///
/// Both hooks run synchronously inside the rebalance callback, before the new
/// assignment is applied or the old one dropped, so they must be fast.
pub trait RebalanceHandler: Send + Sync {
    /// May rewrite the offsets the coordinator proposed for `partitions`
    fn on_assign(&self, partitions: &mut TopicPartitionList) -> KafkaResult<()>;

    fn on_revoke(&self, _partitions: &TopicPartitionList) {}
}

/// Starts consumption from a fixed offset on the first non-empty assignment and
/// accepts the coordinator's offsets on every later one, so progress made in the
/// session is never rewound by a rebalance.
pub struct InitialOffsetHandler {
    offset: Offset,
    pending: AtomicBool,
}

impl InitialOffsetHandler {
    pub fn new(offset: Offset) -> Self {
        Self {
            offset,
            pending: AtomicBool::new(true),
        }
    }

    /// True once the override has been applied to an assignment
    pub fn is_spent(&self) -> bool {
        !self.pending.load(Ordering::Acquire)
    }
}

impl RebalanceHandler for InitialOffsetHandler {
    fn on_assign(&self, partitions: &mut TopicPartitionList) -> KafkaResult<()> {
        // Cooperative-sticky sends empty assignments, they must not use up the override
        if partitions.count() == 0 {
            return Ok(());
        }

        if self
            .pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                "Keeping coordinator offsets for {} assigned partitions",
                partitions.count()
            );
            return Ok(());
        }

        partitions.set_all_offsets(self.offset)?;
        info!(
            "Overrode starting offset to {:?} for {} assigned partitions",
            self.offset,
            partitions.count()
        );
        Ok(())
    }
}

#[derive(Default)]
struct HandlerSlot {
    handler: Option<Arc<dyn RebalanceHandler>>,
    sealed: bool,
}

/// Consumer context that routes rebalance callbacks to the installed handler.
///
/// The handler slot has its own lock, which is only held long enough to clone
/// the handler out, so installing a handler never contends with a poll. Once
/// sealed the slot refuses new handlers, and sealing happens under the same lock
/// as installing, so an install either lands before the seal or is rejected.
#[derive(Default)]
pub struct RebalanceContext {
    slot: Mutex<HandlerSlot>,
}

impl RebalanceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false, leaving the current handler in place, if the slot is sealed
    pub fn install(&self, handler: Arc<dyn RebalanceHandler>) -> bool {
        let mut slot = self.slot.lock();
        if slot.sealed {
            return false;
        }
        slot.handler = Some(handler);
        true
    }

    pub fn seal(&self) {
        self.slot.lock().sealed = true;
    }

    pub fn has_handler(&self) -> bool {
        self.slot.lock().handler.is_some()
    }

    fn current_handler(&self) -> Option<Arc<dyn RebalanceHandler>> {
        self.slot.lock().handler.clone()
    }

    /// Lets the installed handler adjust an assignment before it is applied.
    /// A failing handler leaves the coordinator's assignment untouched.
    pub fn prepare_assignment(&self, partitions: &mut TopicPartitionList) {
        let Some(handler) = self.current_handler() else {
            return;
        };

        let original = partitions.clone();
        if let Err(e) = handler.on_assign(partitions) {
            error!("Rebalance handler failed on assignment, using coordinator offsets: {e}");
            metrics::counter!(KAFKA_REBALANCE_ERRORS, "event_type" => "assign").increment(1);
            *partitions = original;
        }
    }

    fn assign(&self, base_consumer: &BaseConsumer<Self>, partitions: &mut TopicPartitionList) {
        self.prepare_assignment(partitions);

        let result = match base_consumer.rebalance_protocol() {
            RebalanceProtocol::Cooperative => base_consumer.incremental_assign(partitions),
            _ => base_consumer.assign(partitions),
        };
        report_rebalance("assign", partitions.count(), result);
    }

    fn revoke(&self, base_consumer: &BaseConsumer<Self>, partitions: &TopicPartitionList) {
        if let Some(handler) = self.current_handler() {
            handler.on_revoke(partitions);
        }

        let result = match base_consumer.rebalance_protocol() {
            RebalanceProtocol::Cooperative => base_consumer.incremental_unassign(partitions),
            _ => base_consumer.unassign(),
        };
        report_rebalance("revoke", partitions.count(), result);
    }
}

/// Logs how applying a rebalance went and returns whether it was applied.
/// A failure fails this callback only, the session keeps going.
fn report_rebalance(event_type: &'static str, count: usize, result: KafkaResult<()>) -> bool {
    match result {
        Ok(()) => {
            info!("Rebalance {event_type} applied to {count} partitions");
            true
        }
        Err(e) => {
            error!("Failed to {event_type} {count} partitions: {e}");
            metrics::counter!(KAFKA_REBALANCE_ERRORS, "event_type" => event_type).increment(1);
            false
        }
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn rebalance(
        &self,
        base_consumer: &BaseConsumer<Self>,
        err: RDKafkaRespErr,
        tpl: &mut TopicPartitionList,
    ) {
        match err {
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS => self.assign(base_consumer, tpl),
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS => self.revoke(base_consumer, tpl),
            _ => {
                error!("Rebalance error: {:?}", err);
                metrics::counter!(KAFKA_REBALANCE_ERRORS, "event_type" => "error").increment(1);
                self.revoke(base_consumer, tpl);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}
