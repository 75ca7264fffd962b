//! Redis backend.
//!
//! One multiplexed connection carries every non-blocking command. Each
//! queue receiver and each subscription opens its own connection: a
//! parked BRPOP would otherwise hold up every reply queued behind it.
//!
//! Queues are Redis lists: LPUSH onto the head, BRPOP from the tail.

use super::{Inbound, InboundKind, KvStore, PubSubStore, QueueReceiver, QueueStore, Subscription, Topic};
use crate::error::{Error, Result};
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client, Msg};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{debug, info};

/// Redis-backed store.
pub struct RedisStore {
    client: Client,
    con: MultiplexedConnection,
    block_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis at `url` (`redis://[:password@]host:port/db`).
    ///
    /// `block_timeout` bounds each server-side BRPOP; receivers re-issue
    /// the pop until a message arrives.
    pub async fn connect(url: &SecretString, block_timeout: Duration) -> Result<Self> {
        let client = Client::open(url.expose_secret())?;
        let con = client.get_multiplexed_async_connection().await?;
        info!(block_timeout_secs = block_timeout.as_secs(), "connected to redis");
        Ok(Self {
            client,
            con,
            block_timeout,
        })
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<()> {
        let mut con = self.con.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.set(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut con = self.con.clone();
        let value: Option<Vec<u8>> = con.get(key).await?;
        Ok(value)
    }

    async fn mset(&self, items: &[(String, Vec<u8>)]) -> Result<()> {
        let mut con = self.con.clone();
        let mut cmd = ::redis::cmd("MSET");
        for (key, value) in items {
            cmd.arg(key).arg(value.as_slice());
        }
        let _: () = cmd.query_async(&mut con).await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        // Always MGET, even for one key, so the reply is an array.
        let mut con = self.con.clone();
        let values: Vec<Option<Vec<u8>>> = ::redis::cmd("MGET").arg(keys).query_async(&mut con).await?;
        Ok(values)
    }

    async fn flush_all(&self) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = ::redis::cmd("FLUSHALL").query_async(&mut con).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut con = self.con.clone();
        let _: i64 = con.lpush(queue, payload).await?;
        Ok(())
    }

    async fn receiver(&self, queue: &str) -> Result<Box<dyn QueueReceiver>> {
        let con = self.client.get_multiplexed_async_connection().await?;
        debug!(queue, "opened dedicated receiver connection");
        Ok(Box::new(RedisReceiver {
            con,
            queue: queue.to_string(),
            block_secs: self.block_timeout.as_secs().max(1),
        }))
    }
}

struct RedisReceiver {
    con: MultiplexedConnection,
    queue: String,
    block_secs: u64,
}

#[async_trait]
impl QueueReceiver for RedisReceiver {
    async fn pop(&mut self) -> Result<Vec<u8>> {
        loop {
            let popped: Option<(String, Vec<u8>)> = ::redis::cmd("BRPOP")
                .arg(&self.queue)
                .arg(self.block_secs)
                .query_async(&mut self.con)
                .await?;
            // Reply is (list name, value); the name is ours.
            if let Some((_, payload)) = popped {
                return Ok(payload);
            }
        }
    }
}

#[async_trait]
impl PubSubStore for RedisStore {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize> {
        let mut con = self.con.clone();
        let receivers: usize = con.publish(channel, payload).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Box<dyn Subscription>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        match topic {
            Topic::Channel(name) => pubsub.subscribe(name).await?,
            Topic::Pattern(pattern) => pubsub.psubscribe(pattern).await?,
        }
        debug!(%topic, "subscribed");
        Ok(Box::new(RedisSubscription {
            topic: topic.clone(),
            messages: pubsub.into_on_message().boxed(),
            pending_ack: true,
        }))
    }
}

/// The redis crate consumes (p)subscribe replies internally; the ack is
/// synthesized once the subscribe command has succeeded.
struct RedisSubscription {
    topic: Topic,
    messages: BoxStream<'static, Msg>,
    pending_ack: bool,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_inbound(&mut self) -> Result<Option<Inbound>> {
        if self.pending_ack {
            self.pending_ack = false;
            return Ok(Some(Inbound::ack(InboundKind::SubscribeAck, &self.topic)));
        }
        match self.messages.next().await {
            Some(msg) => classify(&msg).map(Some),
            None => Ok(None),
        }
    }
}

fn classify(msg: &Msg) -> Result<Inbound> {
    let (kind, pattern) = if msg.from_pattern() {
        let pattern: String = msg
            .get_pattern()
            .map_err(|e| Error::Other(format!("bad pattern in pmessage: {e}")))?;
        (InboundKind::PatternMessage, Some(pattern))
    } else {
        (InboundKind::Message, None)
    };
    Ok(Inbound {
        kind,
        channel: msg.get_channel_name().to_string(),
        pattern,
        payload: msg.get_payload_bytes().to_vec(),
    })
}
