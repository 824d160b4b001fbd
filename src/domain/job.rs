//! Job model: wire envelope, closed request set, lifecycle states, results.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind tag for page render jobs, as written by the producer.
pub const RENDER_KIND: &str = "render";

/// Lifecycle of a job as recorded in the status store.
///
/// Transitions are forward-only: queued → processing → done | error. A
/// terminal state is never left, and only the dispatcher instance that
/// dequeued a job writes its transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// Wire envelope pushed by the producer onto the queue list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum JobParseError {
    #[error("unknown job kind `{0}`")]
    UnknownKind(String),
    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// The closed set of jobs this worker knows how to run.
///
/// The string `kind` tag only exists at the wire boundary; past
/// [`JobRequest::from_envelope`] every match is exhaustive and an
/// unrecognised tag has already been rejected.
#[derive(Debug, Clone)]
pub enum JobRequest {
    Render(RenderJobPayload),
}

impl JobRequest {
    pub fn from_envelope(envelope: &JobEnvelope) -> Result<Self, JobParseError> {
        match envelope.kind.as_str() {
            RENDER_KIND => serde_json::from_value(envelope.payload.clone())
                .map(Self::Render)
                .map_err(|source| JobParseError::Payload {
                    kind: RENDER_KIND,
                    source,
                }),
            other => Err(JobParseError::UnknownKind(other.to_string())),
        }
    }
}

/// Input for a page render job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJobPayload {
    /// Content hash of the source PDF bytes, computed by the producer.
    pub source_hash: String,
    /// Location of the stored source bytes.
    pub source_path: PathBuf,
    /// Resolution hint; the worker default applies when absent.
    #[serde(default)]
    pub dpi: Option<u32>,
    /// Resolved watermark text for the owning client; empty means none.
    #[serde(default)]
    pub watermark_text: Option<String>,
}

impl RenderJobPayload {
    /// The effective watermark text, with blank values normalised to none.
    pub fn watermark(&self) -> Option<&str> {
        self.watermark_text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// Output descriptor recorded when a render job completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJobResult {
    pub pages: u32,
    pub artifact: String,
    pub url: String,
    pub source_hash: String,
    pub elapsed_ms: u64,
}
