//! Consumer supervision: the single task that owns ledger state transitions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vaultbridge_bus::{BusError, InMemoryBus, MessageSubscriber};

use crate::ledger::Ledger;

/// How long the subscriber stays paused after an infrastructure failure.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Drives the ledger from the message channel.
///
/// One instance owns one subscription; messages are processed strictly in
/// arrival order. Per-event failures are absorbed inside the ledger; an
/// infrastructure failure (database/bus outage surfacing from
/// `handle_message`) pauses the subscription, waits, and resumes.
pub struct ConsumerService {
    bus: Arc<InMemoryBus>,
    channel: String,
    ledger: Arc<Ledger>,
}

impl ConsumerService {
    /// Create the service.
    pub fn new(bus: Arc<InMemoryBus>, channel: impl Into<String>, ledger: Arc<Ledger>) -> Self {
        Self {
            bus,
            channel: channel.into(),
            ledger,
        }
    }

    /// Run until `shutdown` fires or the bus closes for good.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut subscription = MessageSubscriber::subscribe(self.bus.as_ref(), &self.channel)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to subscribe: {e}"))?;

        info!(channel = %self.channel, "Consumer subscribed");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown received, stopping consumer");
                    break;
                }
                message = subscription.recv() => {
                    match message {
                        Ok(message) => {
                            if let Err(e) = self.ledger.handle_message(&message).await {
                                // Infrastructure failure: pause, back off,
                                // resume. Messages published meanwhile are
                                // not replayed; the dedup keys absorb the
                                // producer's own recovery re-publishes.
                                error!(error = format!("{e:#}"), "Message handling failed, pausing subscriber");
                                subscription.pause();
                                tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                                }
                                subscription.resume(&self.bus);
                                info!("Subscriber resumed after backoff");
                            }
                        }
                        Err(BusError::Closed) => {
                            warn!("Message bus closed, consumer stopping");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Subscription receive failed");
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
