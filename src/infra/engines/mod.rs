//! Rasterization backends and the fallback chain over them.
//!
//! Different PDF producers trip different parser edge cases in different
//! renderers, so reliability over an uncurated corpus of client uploads
//! means never depending on a single engine. The chain tries each backend
//! in order with the same arguments; any failure (non-zero exit, spawn
//! error, timeout, missing output) moves on to the next, and only full
//! exhaustion surfaces to the job.

mod ghostscript;
mod mutool;
mod poppler;

pub use ghostscript::GhostscriptEngine;
pub use mutool::{MutoolEngine, page_count};
pub use poppler::PopplerEngine;

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RenderSettings;

use super::process::ProcessError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("engine produced no output at {}", .path.display())]
    MissingOutput { path: PathBuf },
    #[error("engine i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A single rasterization backend.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rasterize page 1 of `pdf` to a PNG at exactly `out`.
    ///
    /// Implementations that write under their own naming convention must
    /// normalise the produced file to `out` before returning success.
    async fn rasterize_first_page(
        &self,
        pdf: &Path,
        out: &Path,
        dpi: u32,
        timeout: Duration,
    ) -> Result<(), EngineError>;
}

/// Every backend failed; the per-engine causes were already logged.
#[derive(Debug, Error)]
#[error("all renderers failed or timed out")]
pub struct ChainExhausted;

pub struct RasterizerChain {
    engines: Vec<Box<dyn PageRasterizer>>,
    timeout: Duration,
}

impl RasterizerChain {
    pub fn new(engines: Vec<Box<dyn PageRasterizer>>, timeout: Duration) -> Self {
        Self { engines, timeout }
    }

    /// The deployed three-engine chain: mutool, then poppler, then Ghostscript.
    pub fn from_settings(render: &RenderSettings) -> Self {
        Self::new(
            vec![
                Box::new(MutoolEngine::new(render.mutool_path.clone())),
                Box::new(PopplerEngine::new(render.pdftoppm_path.clone())),
                Box::new(GhostscriptEngine::new(render.ghostscript_path.clone())),
            ],
            render.engine_timeout,
        )
    }

    pub async fn rasterize_first_page(
        &self,
        pdf: &Path,
        out: &Path,
        dpi: u32,
    ) -> Result<(), ChainExhausted> {
        for engine in &self.engines {
            match engine
                .rasterize_first_page(pdf, out, dpi, self.timeout)
                .await
            {
                Ok(()) => {
                    if tokio::fs::try_exists(out).await.unwrap_or(false) {
                        info!(
                            target = "infra::engines",
                            engine = engine.name(),
                            pdf = %pdf.display(),
                            dpi,
                            "page rasterized"
                        );
                        return Ok(());
                    }
                    warn!(
                        target = "infra::engines",
                        engine = engine.name(),
                        pdf = %pdf.display(),
                        expected = %out.display(),
                        "engine reported success but produced no output; trying next"
                    );
                }
                Err(err) => {
                    warn!(
                        target = "infra::engines",
                        engine = engine.name(),
                        pdf = %pdf.display(),
                        error = %err,
                        "renderer failed; trying next"
                    );
                }
            }
        }

        Err(ChainExhausted)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use tempfile::TempDir;

    use super::*;

    pub(super) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    /// An engine script that writes a marker file and then its output, so
    /// tests can count which backends actually ran.
    pub(super) fn rendering_mutool(dir: &Path, marker: &str) -> PathBuf {
        let body = format!(
            r#"#!/bin/sh
echo run >> "{marker}"
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-o" ]; then
    out="$arg"
  fi
  prev="$arg"
done
if [ -z "$out" ]; then
  exit 2
fi
printf 'PNG' > "$out"
"#,
            marker = dir.join(marker).display()
        );
        write_script(dir, "fake-mutool", &body)
    }

    pub(super) fn failing_engine(dir: &Path, name: &str, marker: &str) -> PathBuf {
        let body = format!(
            r#"#!/bin/sh
echo run >> "{marker}"
echo "cannot parse xref" >&2
exit 7
"#,
            marker = dir.join(marker).display()
        );
        write_script(dir, name, &body)
    }

    #[tokio::test]
    async fn chain_stops_at_the_first_successful_engine() {
        let dir = TempDir::new().expect("temp dir");
        let engine = MutoolEngine::new(rendering_mutool(dir.path(), "runs.log"));
        let chain = RasterizerChain::new(vec![Box::new(engine)], Duration::from_secs(5));

        let pdf = dir.path().join("doc.pdf");
        fs::write(&pdf, b"%PDF-1.4").expect("pdf");
        let out = dir.path().join("page-1.png");

        chain
            .rasterize_first_page(&pdf, &out, 200)
            .await
            .expect("chain");
        assert!(out.exists());
    }

    #[tokio::test]
    async fn chain_falls_through_to_the_next_engine() {
        let dir = TempDir::new().expect("temp dir");
        let first = MutoolEngine::new(failing_engine(dir.path(), "fake-broken", "first.log"));
        let second = MutoolEngine::new(rendering_mutool(dir.path(), "second.log"));
        let chain = RasterizerChain::new(
            vec![Box::new(first), Box::new(second)],
            Duration::from_secs(5),
        );

        let pdf = dir.path().join("doc.pdf");
        fs::write(&pdf, b"%PDF-1.4").expect("pdf");
        let out = dir.path().join("page-1.png");

        chain
            .rasterize_first_page(&pdf, &out, 200)
            .await
            .expect("second engine should succeed");
        assert!(dir.path().join("first.log").exists(), "first engine tried");
        assert!(dir.path().join("second.log").exists(), "second engine ran");
        assert!(out.exists());
    }

    #[tokio::test]
    async fn exhausted_chain_reports_the_aggregate_error() {
        let dir = TempDir::new().expect("temp dir");
        let first = MutoolEngine::new(failing_engine(dir.path(), "fake-a", "a.log"));
        let second = MutoolEngine::new(failing_engine(dir.path(), "fake-b", "b.log"));
        let chain = RasterizerChain::new(
            vec![Box::new(first), Box::new(second)],
            Duration::from_secs(5),
        );

        let pdf = dir.path().join("doc.pdf");
        fs::write(&pdf, b"%PDF-1.4").expect("pdf");
        let out = dir.path().join("page-1.png");

        let err = chain
            .rasterize_first_page(&pdf, &out, 200)
            .await
            .expect_err("all engines fail");
        assert_eq!(err.to_string(), "all renderers failed or timed out");
    }

    #[tokio::test]
    async fn a_hanging_engine_counts_as_failure_not_abort() {
        let dir = TempDir::new().expect("temp dir");
        let hanging = write_script(dir.path(), "fake-hang", "#!/bin/sh\nsleep 10\n");
        let first = MutoolEngine::new(hanging);
        let second = MutoolEngine::new(rendering_mutool(dir.path(), "runs.log"));
        let chain = RasterizerChain::new(
            vec![Box::new(first), Box::new(second)],
            Duration::from_millis(200),
        );

        let pdf = dir.path().join("doc.pdf");
        fs::write(&pdf, b"%PDF-1.4").expect("pdf");
        let out = dir.path().join("page-1.png");

        chain
            .rasterize_first_page(&pdf, &out, 200)
            .await
            .expect("timeout falls through to next engine");
        assert!(out.exists());
    }

    #[tokio::test]
    async fn success_without_output_is_treated_as_failure() {
        let dir = TempDir::new().expect("temp dir");
        let liar = write_script(dir.path(), "fake-liar", "#!/bin/sh\nexit 0\n");
        let chain = RasterizerChain::new(
            vec![Box::new(MutoolEngine::new(liar))],
            Duration::from_secs(5),
        );

        let pdf = dir.path().join("doc.pdf");
        fs::write(&pdf, b"%PDF-1.4").expect("pdf");
        let out = dir.path().join("page-1.png");

        chain
            .rasterize_first_page(&pdf, &out, 200)
            .await
            .expect_err("no output means failure");
    }
}
