//! The narrow publish/subscribe interface the core consumes (spec §6).
//! The core never assumes a particular transport; [`crate::redis_bus::RedisBus`]
//! is the one real implementation shipped here (spec §9 Open Question: a
//! scaling feature that doesn't actually scale must not be offered).

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{error::Result, message::PubSubMessage};

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publishes `message` on `channel`, returning the number of
    /// subscribers that received it. Returns `0` (never an error) when the
    /// message had to be queued for later delivery because the publisher
    /// connection is currently down (spec §4.7.3).
    async fn publish(&self, channel: &str, message: PubSubMessage) -> Result<u64>;

    /// Subscribes to `channel`, returning a receiver of decoded messages.
    /// The returned channel stays open for the bus's lifetime; dropping it
    /// is the caller's way of unsubscribing.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<PubSubMessage>>;
}
