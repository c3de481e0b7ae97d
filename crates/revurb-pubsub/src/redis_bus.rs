//! A [`Bus`] backed by Redis pub/sub. Maintains the two logical
//! connections the spec calls for (§6): a `ConnectionManager` for
//! publishing (auto-reconnects and retries transient errors on its own)
//! and a dedicated subscriber connection per `subscribe` call.
//!
//! Outbound publishes made while the manager's connection is down are
//! queued in-process and flushed by a background task on reconnect
//! (spec §4.7.3: "must not be silently dropped").

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::{Mutex, mpsc};

use crate::{bus::Bus, error::Result, message::PubSubMessage};

struct Queued {
    channel: String,
    payload: String,
}

pub struct RedisBus {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
    outbox: Arc<Mutex<VecDeque<Queued>>>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        let outbox = Arc::new(Mutex::new(VecDeque::new()));

        let flush_manager = manager.clone();
        let flush_outbox = outbox.clone();
        tokio::spawn(async move {
            flush_loop(flush_manager, flush_outbox).await;
        });

        Ok(Self { client, manager, outbox })
    }
}

async fn flush_loop(mut manager: redis::aio::ConnectionManager, outbox: Arc<Mutex<VecDeque<Queued>>>) {
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let next = outbox.lock().await.pop_front();
        let Some(item) = next else { continue };
        match manager.publish::<_, _, u64>(&item.channel, &item.payload).await {
            Ok(_) => {},
            Err(error) => {
                tracing::warn!(%error, "redis publish retry failed, re-queueing");
                outbox.lock().await.push_front(item);
            },
        }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, message: PubSubMessage) -> Result<u64> {
        let payload = serde_json::to_string(&message)?;
        let mut manager = self.manager.clone();
        match manager.publish::<_, _, u64>(channel, &payload).await {
            Ok(count) => Ok(count),
            Err(error) => {
                tracing::warn!(%error, %channel, "redis publish failed, queueing");
                self.outbox.lock().await.push_back(Queued {
                    channel: channel.to_string(),
                    payload,
                });
                Ok(0)
            },
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<PubSubMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            subscribe_loop(client, channel, tx).await;
        });
        Ok(rx)
    }
}

/// Reconnects with backoff whenever the subscriber connection drops
/// (spec §4.7.3, "Transient bus errors... recovered locally by queueing
/// and reconnecting; never surfaced to clients").
async fn subscribe_loop(client: redis::Client, channel: String, tx: mpsc::UnboundedSender<PubSubMessage>) {
    use futures::StreamExt;

    loop {
        let pubsub = client.get_async_pubsub().await;
        let mut pubsub = match pubsub {
            Ok(p) => p,
            Err(error) => {
                tracing::warn!(%error, %channel, "redis subscribe connection failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            },
        };
        if let Err(error) = pubsub.subscribe(&channel).await {
            tracing::warn!(%error, %channel, "redis subscribe failed, retrying");
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let Ok(payload) = msg.get_payload::<String>() else {
                continue;
            };
            match serde_json::from_str::<PubSubMessage>(&payload) {
                Ok(decoded) => {
                    if tx.send(decoded).is_err() {
                        return; // receiver dropped, no point reconnecting
                    }
                },
                Err(error) => tracing::warn!(%error, %channel, "dropping malformed bus message"),
            }
        }
        tracing::warn!(%channel, "redis subscriber stream ended, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
