//! Ghostscript backend (`gs`).

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::infra::process;

use super::{EngineError, PageRasterizer};

pub struct GhostscriptEngine {
    binary: PathBuf,
}

impl GhostscriptEngine {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl PageRasterizer for GhostscriptEngine {
    fn name(&self) -> &'static str {
        "ghostscript"
    }

    async fn rasterize_first_page(
        &self,
        pdf: &Path,
        out: &Path,
        dpi: u32,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let mut output_arg = OsString::from("-sOutputFile=");
        output_arg.push(out);

        let mut command = Command::new(&self.binary);
        command
            .arg("-dSAFER")
            .arg("-dBATCH")
            .arg("-dNOPAUSE")
            .arg("-dQUIET")
            .arg("-sDEVICE=png16m")
            .arg(format!("-r{dpi}"))
            .arg("-dFirstPage=1")
            .arg("-dLastPage=1")
            .arg(output_arg)
            .arg(pdf);

        process::run(command, timeout).await?;
        Ok(())
    }
}
