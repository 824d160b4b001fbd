//! Job-addressable output materialization.
//!
//! The output name is derived from the job id alone, so the producer's
//! file-serving path can be computed without a round-trip through the
//! status store. Content first lands under a temporary name and is renamed
//! into place: the final name only ever appears fully written. The shared
//! cache artifact is never mutated: it is hard-linked when the output tree
//! shares a filesystem with the cache, copied otherwise.

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to publish artifact: {0}")]
    Io(#[from] io::Error),
}

pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    /// Open the output tree rooted at `dir`, creating it if necessary.
    pub fn new(dir: PathBuf) -> Result<Self, OutputError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The deterministic artifact name for a job.
    pub fn artifact_name(job_id: &str) -> String {
        format!("{job_id}.webp")
    }

    /// Materialize the cache artifact under the job's output name.
    pub async fn publish(
        &self,
        job_id: &str,
        cache_artifact: &Path,
    ) -> Result<PathBuf, OutputError> {
        let name = Self::artifact_name(job_id);
        let target = self.dir.join(&name);
        let staging = self.dir.join(format!(".{name}.{}", Uuid::new_v4()));

        if fs::hard_link(cache_artifact, &staging).await.is_err() {
            fs::copy(cache_artifact, &staging).await?;
        }

        if let Err(err) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }

        Ok(target)
    }
}
