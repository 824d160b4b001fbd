//! Render pipeline: cache lookup, rasterization, watermarking, encoding,
//! publication.

pub mod watermark;

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::{
    config::Settings,
    domain::job::{RenderJobPayload, RenderJobResult},
    infra::{
        cache::{CacheError, CacheKey, CacheMeta, RenderCache},
        encoder::WebpEncoder,
        engines::{self, ChainExhausted, RasterizerChain},
        error::InfraError,
        output::{OutputError, OutputStore},
        process::ProcessError,
    },
};

use self::watermark::{WatermarkCompositor, WatermarkError};

/// Pages defaulted when the count probe cannot read the document.
const FALLBACK_PAGE_COUNT: u32 = 1;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("source document not found at {}", .path.display())]
    MissingSource { path: PathBuf },
    #[error("source document at {} is empty", .path.display())]
    EmptySource { path: PathBuf },
    #[error(transparent)]
    Exhausted(#[from] ChainExhausted),
    #[error(transparent)]
    Watermark(#[from] WatermarkError),
    #[error("failed to encode artifact: {0}")]
    Encode(#[from] ProcessError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("compositor task failed: {0}")]
    Compositing(String),
    #[error("render i/o error: {0}")]
    Io(#[from] io::Error),
}

/// The worker's render pipeline with all collaborators injected once at
/// startup.
pub struct RenderService {
    chain: RasterizerChain,
    compositor: Arc<WatermarkCompositor>,
    encoder: WebpEncoder,
    cache: RenderCache,
    output: OutputStore,
    public_base_url: String,
    default_dpi: u32,
    mutool_path: PathBuf,
    page_count_timeout: Duration,
}

impl RenderService {
    pub fn new(settings: &Settings) -> Result<Self, InfraError> {
        let compositor = WatermarkCompositor::from_settings(&settings.watermark)
            .map_err(|err| InfraError::configuration(err.to_string()))?;

        let cache = RenderCache::new(settings.storage.cache_dir())
            .map_err(|err| InfraError::configuration(err.to_string()))?;
        let output = OutputStore::new(settings.storage.out_dir())
            .map_err(|err| InfraError::configuration(err.to_string()))?;

        Ok(Self {
            chain: RasterizerChain::from_settings(&settings.render),
            compositor: Arc::new(compositor),
            encoder: WebpEncoder::from_settings(&settings.render),
            cache,
            output,
            public_base_url: settings.storage.public_base_url.clone(),
            default_dpi: settings.render.dpi.get(),
            mutool_path: settings.render.mutool_path.clone(),
            page_count_timeout: settings.render.page_count_timeout,
        })
    }

    /// Run one render job to completion and describe its artifact.
    pub async fn execute(
        &self,
        job_id: &str,
        payload: &RenderJobPayload,
    ) -> Result<RenderJobResult, RenderError> {
        let started = Instant::now();

        let metadata =
            fs::metadata(&payload.source_path)
                .await
                .map_err(|_| RenderError::MissingSource {
                    path: payload.source_path.clone(),
                })?;
        if metadata.len() == 0 {
            return Err(RenderError::EmptySource {
                path: payload.source_path.clone(),
            });
        }

        let dpi = payload.dpi.unwrap_or(self.default_dpi);
        let watermark = payload.watermark();
        let key = CacheKey::derive(&payload.source_hash, dpi, watermark);

        let (cache_artifact, pages) = match self.cache.lookup(&key).await? {
            Some(hit) => {
                let pages = match self.cache.read_meta(&key).await {
                    Some(meta) => meta.pages,
                    None => self.probe_page_count(&payload.source_path).await,
                };
                info!(
                    target = "application::render",
                    job_id,
                    key = key.as_str(),
                    result = "cache_hit",
                    "render served from cache"
                );
                (hit, pages)
            }
            None => self.render_uncached(job_id, payload, dpi, watermark, &key).await?,
        };

        let published = self.output.publish(job_id, &cache_artifact).await?;
        let artifact = published
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| OutputStore::artifact_name(job_id));
        let url = format!("{}/{artifact}", self.public_base_url);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            target = "application::render",
            job_id,
            artifact,
            pages,
            elapsed_ms,
            "render complete"
        );

        Ok(RenderJobResult {
            pages,
            artifact,
            url,
            source_hash: payload.source_hash.clone(),
            elapsed_ms,
        })
    }

    async fn render_uncached(
        &self,
        job_id: &str,
        payload: &RenderJobPayload,
        dpi: u32,
        watermark: Option<&str>,
        key: &CacheKey,
    ) -> Result<(PathBuf, u32), RenderError> {
        let workdir = tempfile::tempdir()?;
        let raster = workdir.path().join("page-1.png");

        self.chain
            .rasterize_first_page(&payload.source_path, &raster, dpi)
            .await?;

        let pages = self.probe_page_count(&payload.source_path).await;

        let to_encode = match watermark {
            Some(text) if self.compositor.available() => {
                let stamped = workdir.path().join("page-1.stamped.png");
                let compositor = Arc::clone(&self.compositor);
                let raster_in = raster.clone();
                let stamped_out = stamped.clone();
                let text = text.to_string();
                tokio::task::spawn_blocking(move || {
                    compositor.stamp_file(&raster_in, &stamped_out, &text)
                })
                .await
                .map_err(|err| RenderError::Compositing(err.to_string()))??;
                stamped
            }
            Some(_) => {
                warn!(
                    target = "application::render",
                    job_id,
                    "watermark requested but no font is loaded; emitting unstamped page"
                );
                raster
            }
            None => raster,
        };

        let staged = self.cache.stage()?;
        self.encoder.encode(&to_encode, staged.path()).await?;
        let stored = self.cache.store(key, staged)?;
        self.cache.store_meta(key, &CacheMeta { pages })?;

        info!(
            target = "application::render",
            job_id,
            key = key.as_str(),
            dpi,
            pages,
            watermarked = watermark.is_some(),
            result = "rendered",
            "page rendered and cached"
        );

        Ok((stored, pages))
    }

    async fn probe_page_count(&self, pdf: &Path) -> u32 {
        engines::page_count(&self.mutool_path, pdf, self.page_count_timeout)
            .await
            .unwrap_or(FALLBACK_PAGE_COUNT)
    }
}
