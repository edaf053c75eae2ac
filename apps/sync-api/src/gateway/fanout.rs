//! Fan-out of registry deliveries to connection tasks.
//!
//! Every connection task subscribes to one local `tokio::sync::broadcast`
//! channel and filters envelopes itself. The Redis backend additionally
//! mirrors each envelope to the other instances over pub/sub.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use retro_common::ServerEvent;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::events::{Envelope, Outbound, Target};
use super::registry::RoomRegistry;
use crate::config::{Config, FanoutStrategy};

/// Capacity of the local broadcast channel. Slow receivers that fall behind
/// skip envelopes (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Fanout: Send + Sync {
    /// Backend name reported by the health endpoint.
    fn name(&self) -> &'static str;

    /// Deliver to every connection task on every instance.
    async fn publish(&self, outbound: Outbound);

    fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

pub struct MemoryFanout {
    instance_id: String,
    sender: broadcast::Sender<Arc<Envelope>>,
}

impl MemoryFanout {
    pub fn new(instance_id: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            instance_id: instance_id.into(),
            sender,
        }
    }
}

#[async_trait]
impl Fanout for MemoryFanout {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, outbound: Outbound) {
        // Err only means nobody is subscribed.
        let _ = self.sender.send(Arc::new(Envelope {
            origin: self.instance_id.clone(),
            outbound,
        }));
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Redis pub/sub backend
// ---------------------------------------------------------------------------

/// Delivers locally first, then publishes to Redis. A relay task feeds
/// envelopes from other instances into the same local channel.
pub struct RedisFanout {
    instance_id: String,
    channel: String,
    redis: ConnectionManager,
    local: broadcast::Sender<Arc<Envelope>>,
    relay: JoinHandle<()>,
}

impl RedisFanout {
    pub async fn connect(
        url: &str,
        channel: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Result<Self, FanoutError> {
        let channel = channel.into();
        let instance_id = instance_id.into();

        let client = redis::Client::open(url)?;
        let pubsub = subscribe(&client, &channel).await?;
        let redis = ConnectionManager::new(client.clone()).await?;

        let (local, _) = broadcast::channel(BROADCAST_CAPACITY);
        let relay = tokio::spawn(relay(
            payloads(pubsub),
            {
                let channel = channel.clone();
                move || resubscribe(client.clone(), channel.clone())
            },
            instance_id.clone(),
            local.clone(),
        ));

        tracing::info!(%channel, "redis fan-out subscribed");
        Ok(Self {
            instance_id,
            channel,
            redis,
            local,
            relay,
        })
    }

    async fn publish_remote(&self, envelope: &Envelope) -> Result<(), FanoutError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(&self.channel, payload).await?;
        Ok(())
    }
}

type PayloadStream = BoxStream<'static, String>;

async fn subscribe(client: &redis::Client, channel: &str) -> Result<PubSub, FanoutError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

fn payloads(pubsub: PubSub) -> PayloadStream {
    pubsub
        .into_on_message()
        .filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable fan-out message");
                    None
                }
            }
        })
        .boxed()
}

/// Retry every [`RESUBSCRIBE_DELAY`] until the channel is subscribed again.
async fn resubscribe(client: redis::Client, channel: String) -> PayloadStream {
    loop {
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        match subscribe(&client, &channel).await {
            Ok(pubsub) => {
                tracing::info!(%channel, "redis fan-out resubscribed");
                return payloads(pubsub);
            }
            Err(e) => tracing::warn!(error = %e, %channel, "resubscribe failed"),
        }
    }
}

/// Feed envelopes from other instances into `local`. When the subscription
/// stream ends, `reopen` provides the next one.
async fn relay<F, Fut>(
    mut stream: PayloadStream,
    mut reopen: F,
    instance_id: String,
    local: broadcast::Sender<Arc<Envelope>>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = PayloadStream>,
{
    loop {
        while let Some(payload) = stream.next().await {
            match serde_json::from_str::<Envelope>(&payload) {
                Ok(env) if env.origin == instance_id => {}
                Ok(env) => {
                    let _ = local.send(Arc::new(env));
                }
                Err(e) => tracing::warn!(error = %e, "undecodable fan-out envelope"),
            }
        }
        tracing::error!("redis fan-out subscription ended, resubscribing");
        stream = reopen().await;
    }
}

#[async_trait]
impl Fanout for RedisFanout {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, outbound: Outbound) {
        let envelope = Arc::new(Envelope {
            origin: self.instance_id.clone(),
            outbound,
        });
        let _ = self.local.send(envelope.clone());
        if let Err(e) = self.publish_remote(&envelope).await {
            tracing::error!(
                error = %e,
                session_id = %envelope.outbound.session_id,
                "fan-out publish failed, delivered locally only"
            );
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.local.subscribe()
    }
}

impl Drop for RedisFanout {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

/// Build the configured backend. An unreachable Redis falls back to memory.
pub async fn select(config: &Config) -> Arc<dyn Fanout> {
    match &config.fanout {
        FanoutStrategy::Memory => Arc::new(MemoryFanout::new(config.instance_id.clone())),
        FanoutStrategy::Redis { url } => {
            match RedisFanout::connect(url, config.fanout_channel.clone(), config.instance_id.clone())
                .await
            {
                Ok(fanout) => Arc::new(fanout),
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "redis fan-out unavailable, falling back to memory (no cross-instance delivery)"
                    );
                    Arc::new(MemoryFanout::new(config.instance_id.clone()))
                }
            }
        }
    }
}

/// Mirror room-wide `session-update` envelopes produced by other instances
/// into the local cache, so late joiners here get the latest snapshot.
pub fn spawn_cache_follower(
    mut rx: broadcast::Receiver<Arc<Envelope>>,
    instance_id: String,
    registry: Arc<RoomRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(env) => {
                    if env.origin == instance_id {
                        continue;
                    }
                    if let (Target::Room { .. }, ServerEvent::SessionUpdate(snapshot)) =
                        (&env.outbound.target, &env.outbound.event)
                    {
                        registry.store_snapshot(&env.outbound.session_id, snapshot.clone());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "snapshot cache follower lagged behind fan-out");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
