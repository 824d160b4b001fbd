//! Per-job status records.
//!
//! Each job has one hash record keyed by its id. The producer writes the
//! initial `queued` entry; from then on only the dispatcher instance that
//! dequeued the job touches it, with exactly one write per transition:
//! `processing`, then either `done` (with the serialized result) or `error`
//! (with the failure cause).

use async_trait::async_trait;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::domain::job::JobStatus;

#[derive(Debug, Error)]
pub enum StatusStoreError {
    #[error("status transport error: {0}")]
    Transport(#[from] redis::RedisError),
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Record that a dequeued job has begun processing.
    async fn mark_processing(&self, job_id: &str, kind: &str) -> Result<(), StatusStoreError>;

    /// Record the terminal `done` state with the job's result.
    async fn complete(
        &self,
        job_id: &str,
        result: &serde_json::Value,
    ) -> Result<(), StatusStoreError>;

    /// Record the terminal `error` state with a human-readable cause.
    async fn fail(&self, job_id: &str, message: &str) -> Result<(), StatusStoreError>;
}

pub struct RedisStatusStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStatusStore {
    pub fn new(client: redis::Client, prefix: String) -> Self {
        Self { client, prefix }
    }

    fn record_key(&self, job_id: &str) -> String {
        format!("{}{}", self.prefix, job_id)
    }

    async fn write_fields(
        &self,
        job_id: &str,
        fields: &[(&str, &str)],
    ) -> Result<(), StatusStoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.record_key(job_id));
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn mark_processing(&self, job_id: &str, kind: &str) -> Result<(), StatusStoreError> {
        let now = timestamp();
        self.write_fields(
            job_id,
            &[
                ("status", JobStatus::Processing.as_str()),
                ("kind", kind),
                ("updated_at", &now),
            ],
        )
        .await
    }

    async fn complete(
        &self,
        job_id: &str,
        result: &serde_json::Value,
    ) -> Result<(), StatusStoreError> {
        let now = timestamp();
        let result = result.to_string();
        self.write_fields(
            job_id,
            &[
                ("status", JobStatus::Done.as_str()),
                ("result", &result),
                ("updated_at", &now),
            ],
        )
        .await
    }

    async fn fail(&self, job_id: &str, message: &str) -> Result<(), StatusStoreError> {
        let now = timestamp();
        self.write_fields(
            job_id,
            &[
                ("status", JobStatus::Error.as_str()),
                ("error", message),
                ("updated_at", &now),
            ],
        )
        .await
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_carry_the_configured_prefix() {
        let client = redis::Client::open("redis://127.0.0.1:6379/0").expect("client");
        let store = RedisStatusStore::new(client, "job:".to_string());
        assert_eq!(store.record_key("abc-123"), "job:abc-123");
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let stamp = timestamp();
        assert!(OffsetDateTime::parse(&stamp, &Rfc3339).is_ok(), "{stamp}");
    }
}
