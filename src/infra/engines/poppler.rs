//! Poppler backend (`pdftoppm`).

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::infra::process;

use super::{EngineError, PageRasterizer};

pub struct PopplerEngine {
    binary: PathBuf,
}

impl PopplerEngine {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl PageRasterizer for PopplerEngine {
    fn name(&self) -> &'static str {
        "pdftoppm"
    }

    async fn rasterize_first_page(
        &self,
        pdf: &Path,
        out: &Path,
        dpi: u32,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        // pdftoppm takes an output *root* and appends its own `.png`, so the
        // produced file has to be normalised to the exact requested path.
        let root = out.with_extension("");

        let mut command = Command::new(&self.binary);
        command
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg("1")
            .arg("-l")
            .arg("1")
            .arg("-singlefile")
            .arg(pdf)
            .arg(&root);

        process::run(command, timeout).await?;

        let produced = root.with_extension("png");
        if produced != out {
            tokio::fs::rename(&produced, out).await?;
        }
        if !tokio::fs::try_exists(out).await? {
            return Err(EngineError::MissingOutput {
                path: out.to_path_buf(),
            });
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::super::tests::write_script;
    use super::*;

    fn fake_pdftoppm(dir: &Path) -> PathBuf {
        // Writes `<last-arg>.png`, mimicking pdftoppm's -singlefile naming.
        write_script(
            dir,
            "fake-pdftoppm",
            r#"#!/bin/sh
for arg in "$@"; do last="$arg"; done
printf 'PNG' > "$last.png"
"#,
        )
    }

    #[tokio::test]
    async fn produced_file_lands_at_the_requested_path() {
        let dir = TempDir::new().expect("temp dir");
        let engine = PopplerEngine::new(fake_pdftoppm(dir.path()));
        let pdf = dir.path().join("doc.pdf");
        fs::write(&pdf, b"%PDF-1.4").expect("pdf");

        let out = dir.path().join("page-1.png");
        engine
            .rasterize_first_page(&pdf, &out, 200, Duration::from_secs(5))
            .await
            .expect("rasterize");
        assert!(out.exists());
    }

    #[tokio::test]
    async fn foreign_extensions_are_normalised_by_rename() {
        let dir = TempDir::new().expect("temp dir");
        let engine = PopplerEngine::new(fake_pdftoppm(dir.path()));
        let pdf = dir.path().join("doc.pdf");
        fs::write(&pdf, b"%PDF-1.4").expect("pdf");

        let out = dir.path().join("page-1.raster");
        engine
            .rasterize_first_page(&pdf, &out, 200, Duration::from_secs(5))
            .await
            .expect("rasterize");
        assert!(out.exists(), "renamed to the requested path");
        assert!(
            !dir.path().join("page-1.png").exists(),
            "convention-named file does not linger"
        );
    }
}
