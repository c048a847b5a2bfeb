//! Identity validation of reporting workers.
//!
//! Every heartbeat schedules at most one validation attempt: the head node
//! dials the advertised host back and asks the worker which nodename it
//! believes it is. Unreachable workers retry with exponential backoff capped
//! at 60 seconds; a worker answering with the wrong nodename is poisoned
//! until it times out and reports fresh, so a misconfigured host cannot
//! ping-pong between `Error` and `Ready`.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::registry::{HeartbeatAck, NodeRegistry, ValidationTicket};
use crate::worker::WorkerClient;

#[derive(Clone)]
pub struct Validator {
    registry: Arc<NodeRegistry>,
    worker: Arc<dyn WorkerClient>,
    settings: Arc<Settings>,
}

impl Validator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        worker: Arc<dyn WorkerClient>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            registry,
            worker,
            settings,
        }
    }

    /// Fire one validation attempt for a freshly reported node.
    pub fn spawn(&self, ack: HeartbeatAck) {
        let validator = self.clone();
        tokio::spawn(async move {
            validator.validate(ack).await;
        });
    }

    /// Run the validation state machine for one heartbeat.
    pub async fn validate(&self, ack: HeartbeatAck) {
        let failures = match self.registry.begin_validation(&ack.display_name) {
            ValidationTicket::First => 0,
            ValidationTicket::Retry { failures } => {
                tokio::time::sleep(backoff(failures)).await;
                failures
            }
            ValidationTicket::InFlight | ValidationTicket::Settled => return,
        };

        tracing::info!(node = %ack.display_name, "Start validating clusnode");
        let result = match self.worker.dial(&ack.host, None).await {
            Ok(mut conn) => conn.validate(&self.settings.node_host, &ack.host).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(claimed) => {
                let claimed = claimed.to_uppercase();
                if claimed == ack.nodename {
                    tracing::info!(
                        node = %ack.display_name,
                        host = %ack.host,
                        "Clusnode validated"
                    );
                    self.registry.mark_ready(&ack.display_name);
                } else {
                    tracing::error!(
                        expected = %ack.nodename,
                        replied = %claimed,
                        "Validation failed: nodename mismatch"
                    );
                    self.registry.mark_mismatch(&ack.display_name);
                }
            }
            Err(e) => {
                tracing::error!(node = %ack.display_name, error = %e, "Validation failed");
                self.registry.mark_failed(&ack.display_name, failures + 1);
            }
        }
    }
}

/// Doubles per consecutive failure, capped at 60 seconds.
fn backoff(failures: u32) -> Duration {
    Duration::from_secs((1u64 << failures.min(6)).min(60))
}
