//! Queue consumption contract and the Redis list transport behind it.
//!
//! The producer LPUSHes JSON job envelopes onto a list; each dispatcher
//! instance BRPOPs with a bounded wait, so the list behaves as a FIFO with
//! exclusive delivery of every item to exactly one consumer.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// One raw envelope handed to a dispatcher by the queue transport.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub raw: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(#[from] redis::RedisError),
}

/// Blocking-poll consumption of the job queue.
///
/// Implementations must wait at most `timeout` per call and return `None`
/// when nothing arrived, so the dispatcher loop never busy-spins and stays
/// responsive to shutdown.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueueItem>, QueueError>;
}

pub struct RedisJobQueue {
    client: redis::Client,
    key: String,
}

impl RedisJobQueue {
    pub fn new(client: redis::Client, key: String) -> Self {
        Self { client, key }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueueItem>, QueueError> {
        // A dedicated connection per poll: BRPOP parks the connection, and
        // sharing one between dispatcher instances would serialise them.
        let mut conn = self.client.get_async_connection().await?;

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.key)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(popped.map(|(_list, raw)| QueueItem { raw }))
    }
}
