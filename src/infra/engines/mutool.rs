//! MuPDF backend (`mutool draw`), plus the page-count probe.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::infra::process;

use super::{EngineError, PageRasterizer};

pub struct MutoolEngine {
    binary: PathBuf,
}

impl MutoolEngine {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl PageRasterizer for MutoolEngine {
    fn name(&self) -> &'static str {
        "mutool"
    }

    async fn rasterize_first_page(
        &self,
        pdf: &Path,
        out: &Path,
        dpi: u32,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("draw")
            .arg("-F")
            .arg("png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-o")
            .arg(out)
            .arg(pdf)
            .arg("1");

        process::run(command, timeout).await?;
        Ok(())
    }
}

/// Number of pages in `pdf`, read from the `pages N` line of
/// `mutool show <pdf> pages`. Probe failures fall back to `None`; the
/// caller decides on a default rather than failing the render.
pub async fn page_count(binary: &Path, pdf: &Path, timeout: Duration) -> Option<u32> {
    let mut command = Command::new(binary);
    command.arg("show").arg(pdf).arg("pages");

    match process::run_with_stdout(command, timeout).await {
        Ok(stdout) => stdout.lines().find_map(|line| {
            line.trim()
                .strip_prefix("pages")?
                .split_whitespace()
                .next()?
                .parse()
                .ok()
        }),
        Err(err) => {
            debug!(
                target = "infra::engines::mutool",
                pdf = %pdf.display(),
                error = %err,
                "page count probe failed"
            );
            None
        }
    }
}
