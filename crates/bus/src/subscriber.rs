//! Subscription side of the message bus.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::message::ChainMessage;
use crate::publisher::InMemoryBus;

/// Trait for subscribing to messages from the bus.
#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    /// Open a subscription on a channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Whether the transport is currently connected.
    fn connected(&self) -> bool;
}

#[async_trait]
impl MessageSubscriber for InMemoryBus {
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        if !MessageSubscriber::connected(self) {
            return Err(BusError::NotConnected);
        }
        Ok(Subscription::new(
            channel.to_string(),
            self.subscribe_channel(channel),
        ))
    }

    fn connected(&self) -> bool {
        crate::publisher::MessagePublisher::connected(self)
    }
}

/// A single-channel subscription handle.
///
/// `pause()` drops the underlying receiver while keeping the handle (and the
/// transport connection) alive; messages published while paused are not
/// re-delivered after `resume()`; downstream dedup keys absorb any producer
/// re-publishes.
pub struct Subscription {
    /// Channel name, kept for re-subscription on resume.
    channel: String,

    /// The live receiver; `None` while paused.
    receiver: Option<broadcast::Receiver<ChainMessage>>,
}

impl Subscription {
    /// Create a new subscription from a broadcast receiver.
    pub(crate) fn new(channel: String, receiver: broadcast::Receiver<ChainMessage>) -> Self {
        Self {
            channel,
            receiver: Some(receiver),
        }
    }

    /// The channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the subscription is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.receiver.is_none()
    }

    /// Receive the next message.
    ///
    /// # Returns
    ///
    /// - `Ok(message)` - the next message on the channel
    /// - `Err(BusError::Closed)` - the bus was dropped, or this subscription
    ///   is paused
    ///
    /// A lagged receiver (slow consumer) logs the dropped count and keeps
    /// receiving from the oldest retained message.
    pub async fn recv(&mut self) -> Result<ChainMessage> {
        let receiver = self.receiver.as_mut().ok_or(BusError::Closed)?;

        loop {
            match receiver.recv().await {
                Ok(message) => return Ok(message),
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    debug!(channel = %self.channel, lagged = count, "Subscriber lagged, messages dropped");
                    continue;
                }
            }
        }
    }

    /// Try to receive without blocking.
    ///
    /// Returns `Ok(None)` when no message is ready.
    pub fn try_recv(&mut self) -> Result<Option<ChainMessage>> {
        let receiver = self.receiver.as_mut().ok_or(BusError::Closed)?;

        loop {
            match receiver.try_recv() {
                Ok(message) => return Ok(Some(message)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => return Err(BusError::Closed),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Stop receiving while holding the connection.
    pub fn pause(&mut self) {
        if self.receiver.take().is_some() {
            debug!(channel = %self.channel, "Subscription paused");
        }
    }

    /// Resume a paused subscription on the given bus.
    ///
    /// Messages published during the pause are not replayed.
    pub fn resume(&mut self, bus: &InMemoryBus) {
        if self.receiver.is_none() {
            self.receiver = Some(bus.subscribe_channel(&self.channel));
            debug!(channel = %self.channel, "Subscription resumed");
        }
    }
}
