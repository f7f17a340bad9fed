//! Publishing side of the message bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{BusError, Result};
use crate::message::ChainMessage;
use crate::DEFAULT_CHANNEL_CAPACITY;

/// Trait for publishing messages to the bus.
///
/// This is the interface the block indexer uses to emit matched transactions
/// for consumption by the ownership and ledger services.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Establish the transport connection.
    async fn connect(&self) -> Result<()>;

    /// Tear the transport connection down.
    async fn disconnect(&self);

    /// Whether the transport is currently connected.
    fn connected(&self) -> bool;

    /// Publish a single message to a channel.
    ///
    /// Returns the number of active subscribers that received it.
    async fn publish(&self, channel: &str, message: ChainMessage) -> Result<usize>;

    /// Publish a batch, sorted ascending by message timestamp before sending.
    ///
    /// The batch succeeds or fails as a whole; partial sends surface as an
    /// error so the caller can retry the block.
    async fn publish_batch(&self, channel: &str, messages: Vec<ChainMessage>) -> Result<usize>;

    /// Total messages published over the lifetime of this publisher.
    fn messages_published(&self) -> u64;
}

/// In-process implementation of the message bus.
///
/// Uses `tokio::sync::broadcast` per channel for multi-producer,
/// multi-consumer semantics. Suitable for single-node operation; distributed
/// deployments would put a networked transport behind the same traits.
pub struct InMemoryBus {
    /// Broadcast sender per channel name.
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ChainMessage>>>>,

    /// Whether connect() has been called (and disconnect() has not).
    connected: AtomicBool,

    /// Total messages published.
    messages_published: AtomicU64,

    /// Per-channel capacity.
    capacity: usize,
}

impl InMemoryBus {
    /// Create a new bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new bus with the given per-channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            connected: AtomicBool::new(false),
            messages_published: AtomicU64::new(0),
            capacity,
        }
    }

    /// Get (or lazily create) the sender for a channel.
    fn sender(&self, channel: &str) -> broadcast::Sender<ChainMessage> {
        if let Ok(map) = self.channels.read() {
            if let Some(sender) = map.get(channel) {
                return sender.clone();
            }
        }

        let mut map = self.channels.write().unwrap_or_else(|e| e.into_inner());
        map.entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to a channel, receiving messages published after this call.
    pub fn subscribe_channel(&self, channel: &str) -> broadcast::Receiver<ChainMessage> {
        self.sender(channel).subscribe()
    }

    /// Number of active subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.sender(channel).receiver_count()
    }

    /// The per-channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBus {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        debug!("In-memory bus connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        debug!("In-memory bus disconnected");
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, channel: &str, message: ChainMessage) -> Result<usize> {
        if !self.connected() {
            return Err(BusError::NotConnected);
        }

        self.messages_published.fetch_add(1, Ordering::Relaxed);

        match self.sender(channel).send(message) {
            Ok(receiver_count) => {
                debug!(channel, receivers = receiver_count, "Message published");
                Ok(receiver_count)
            }
            Err(e) => {
                // No receivers - message is dropped, but the publish itself
                // succeeded from the producer's point of view
                warn!(channel, error = %e, "Message dropped (no receivers)");
                Ok(0)
            }
        }
    }

    async fn publish_batch(&self, channel: &str, mut messages: Vec<ChainMessage>) -> Result<usize> {
        if !self.connected() {
            return Err(BusError::NotConnected);
        }
        if messages.is_empty() {
            return Ok(0);
        }

        // Stable sort keeps (blockNumber, logIndex) publish order for
        // messages sharing a timestamp.
        messages.sort_by_key(|m| m.timestamp);

        let mut delivered = 0;
        for message in messages {
            delivered = self.publish(channel, message).await?;
        }
        Ok(delivered)
    }

    fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }
}
