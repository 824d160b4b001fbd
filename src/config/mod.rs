//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU8, NonZeroU32},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Parser, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "platemark";

const DEFAULT_QUEUE_URL: &str = "redis://127.0.0.1:6379/0";
const DEFAULT_QUEUE_KEY: &str = "jobs";
const DEFAULT_STATUS_PREFIX: &str = "job:";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_DISPATCHER_CONCURRENCY: u32 = 2;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://127.0.0.1:8080/files";

const DEFAULT_RENDER_DPI: u32 = 200;
const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_PAGE_COUNT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_WEBP_QUALITY: u8 = 90;
pub(crate) const DEFAULT_MUTOOL_PATH: &str = "mutool";
pub(crate) const DEFAULT_PDFTOPPM_PATH: &str = "pdftoppm";
pub(crate) const DEFAULT_GHOSTSCRIPT_PATH: &str = "gs";
pub(crate) const DEFAULT_CWEBP_PATH: &str = "cwebp";

const DEFAULT_WATERMARK_MAX_CHARS: u32 = 200;
const DEFAULT_WATERMARK_OPACITY: u8 = 64;
const DEFAULT_WATERMARK_ANGLE_DEGREES: f32 = 30.0;

/// Command-line arguments for the platemark worker binary.
#[derive(Debug, Parser, Default)]
#[command(name = "platemark", version, about = "platemark rendering worker")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "PLATEMARK_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the queue connection URL.
    #[arg(long = "queue-url", value_name = "URL")]
    pub queue_url: Option<String>,

    /// Override the queue list key jobs are popped from.
    #[arg(long = "queue-key", value_name = "KEY")]
    pub queue_key: Option<String>,

    /// Override the bounded queue-wait poll interval.
    #[arg(long = "queue-poll-interval-seconds", value_name = "SECONDS")]
    pub queue_poll_interval_seconds: Option<u64>,

    /// Override the number of dispatcher instances.
    #[arg(long = "queue-concurrency", value_name = "COUNT")]
    pub queue_concurrency: Option<u32>,

    /// Override the data directory holding the cache and output trees.
    #[arg(long = "storage-data-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub storage_data_dir: Option<PathBuf>,

    /// Override the base URL rendered artifacts are served under.
    #[arg(long = "storage-public-base-url", value_name = "URL")]
    pub storage_public_base_url: Option<String>,

    /// Override the default rasterization resolution.
    #[arg(long = "render-dpi", value_name = "DPI")]
    pub render_dpi: Option<u32>,

    /// Override the per-engine rasterization timeout.
    #[arg(long = "render-engine-timeout-seconds", value_name = "SECONDS")]
    pub render_engine_timeout_seconds: Option<u64>,

    /// Toggle lossless WEBP encoding.
    #[arg(
        long = "render-lossless",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub render_lossless: Option<bool>,

    /// Override the watermark font file.
    #[arg(long = "watermark-font-path", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub watermark_font_path: Option<PathBuf>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub queue: QueueSettings,
    pub storage: StorageSettings,
    pub render: RenderSettings,
    pub watermark: WatermarkSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub url: String,
    pub key: String,
    pub status_prefix: String,
    pub poll_interval: Duration,
    pub concurrency: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub public_base_url: String,
}

impl StorageSettings {
    /// Shared content-addressed cache tree.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Job-addressable output tree exposed by the file-serving front-end.
    pub fn out_dir(&self) -> PathBuf {
        self.data_dir.join("out")
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub dpi: NonZeroU32,
    pub engine_timeout: Duration,
    pub page_count_timeout: Duration,
    pub lossless: bool,
    pub quality: NonZeroU8,
    pub mutool_path: PathBuf,
    pub pdftoppm_path: PathBuf,
    pub ghostscript_path: PathBuf,
    pub cwebp_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WatermarkSettings {
    pub font_path: Option<PathBuf>,
    pub max_chars: u32,
    pub opacity: u8,
    pub angle_degrees: f32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse CLI arguments and load settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("PLATEMARK").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_cli_overrides(cli);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    queue: RawQueueSettings,
    storage: RawStorageSettings,
    render: RawRenderSettings,
    watermark: RawWatermarkSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    url: Option<String>,
    key: Option<String>,
    status_prefix: Option<String>,
    poll_interval_seconds: Option<u64>,
    concurrency: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    data_dir: Option<PathBuf>,
    public_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    dpi: Option<u32>,
    engine_timeout_seconds: Option<u64>,
    page_count_timeout_seconds: Option<u64>,
    lossless: Option<bool>,
    quality: Option<u8>,
    mutool_path: Option<PathBuf>,
    pdftoppm_path: Option<PathBuf>,
    ghostscript_path: Option<PathBuf>,
    cwebp_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWatermarkSettings {
    font_path: Option<PathBuf>,
    max_chars: Option<u32>,
    opacity: Option<u8>,
    angle_degrees: Option<f32>,
}

impl RawSettings {
    fn apply_cli_overrides(&mut self, cli: &CliArgs) {
        if let Some(level) = cli.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = cli.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = cli.queue_url.as_ref() {
            self.queue.url = Some(url.clone());
        }
        if let Some(key) = cli.queue_key.as_ref() {
            self.queue.key = Some(key.clone());
        }
        if let Some(seconds) = cli.queue_poll_interval_seconds {
            self.queue.poll_interval_seconds = Some(seconds);
        }
        if let Some(count) = cli.queue_concurrency {
            self.queue.concurrency = Some(count);
        }
        if let Some(dir) = cli.storage_data_dir.as_ref() {
            self.storage.data_dir = Some(dir.clone());
        }
        if let Some(url) = cli.storage_public_base_url.as_ref() {
            self.storage.public_base_url = Some(url.clone());
        }
        if let Some(dpi) = cli.render_dpi {
            self.render.dpi = Some(dpi);
        }
        if let Some(seconds) = cli.render_engine_timeout_seconds {
            self.render.engine_timeout_seconds = Some(seconds);
        }
        if let Some(lossless) = cli.render_lossless {
            self.render.lossless = Some(lossless);
        }
        if let Some(path) = cli.watermark_font_path.as_ref() {
            self.watermark.font_path = Some(path.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            queue,
            storage,
            render,
            watermark,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            queue: build_queue_settings(queue)?,
            storage: build_storage_settings(storage),
            render: build_render_settings(render)?,
            watermark: build_watermark_settings(watermark)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level.as_deref() {
        Some(value) => LevelFilter::from_str(value).map_err(|_| {
            LoadError::invalid(
                "logging.level",
                format!("`{value}` is not a recognised log level"),
            )
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let url = queue.url.unwrap_or_else(|| DEFAULT_QUEUE_URL.to_string());
    let key = queue.key.unwrap_or_else(|| DEFAULT_QUEUE_KEY.to_string());
    if key.is_empty() {
        return Err(LoadError::invalid("queue.key", "key must not be empty"));
    }

    let status_prefix = queue
        .status_prefix
        .unwrap_or_else(|| DEFAULT_STATUS_PREFIX.to_string());

    let poll_seconds = queue
        .poll_interval_seconds
        .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
    if poll_seconds == 0 {
        return Err(LoadError::invalid(
            "queue.poll_interval_seconds",
            "poll interval must be greater than zero",
        ));
    }

    let concurrency = NonZeroU32::new(queue.concurrency.unwrap_or(DEFAULT_DISPATCHER_CONCURRENCY))
        .ok_or_else(|| {
            LoadError::invalid(
                "queue.concurrency",
                "at least one dispatcher instance is required",
            )
        })?;

    Ok(QueueSettings {
        url,
        key,
        status_prefix,
        poll_interval: Duration::from_secs(poll_seconds),
        concurrency,
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> StorageSettings {
    let data_dir = storage
        .data_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let public_base_url = storage
        .public_base_url
        .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string())
        .trim_end_matches('/')
        .to_string();

    StorageSettings {
        data_dir,
        public_base_url,
    }
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let dpi = NonZeroU32::new(render.dpi.unwrap_or(DEFAULT_RENDER_DPI))
        .ok_or_else(|| LoadError::invalid("render.dpi", "resolution must be greater than zero"))?;

    let engine_timeout_seconds = render
        .engine_timeout_seconds
        .unwrap_or(DEFAULT_ENGINE_TIMEOUT_SECS);
    if engine_timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "render.engine_timeout_seconds",
            "engine timeout must be greater than zero",
        ));
    }

    let page_count_timeout_seconds = render
        .page_count_timeout_seconds
        .unwrap_or(DEFAULT_PAGE_COUNT_TIMEOUT_SECS);
    if page_count_timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "render.page_count_timeout_seconds",
            "page count timeout must be greater than zero",
        ));
    }

    let quality = render.quality.unwrap_or(DEFAULT_WEBP_QUALITY);
    if quality > 100 {
        return Err(LoadError::invalid(
            "render.quality",
            "quality must be between 1 and 100",
        ));
    }
    let quality = NonZeroU8::new(quality)
        .ok_or_else(|| LoadError::invalid("render.quality", "quality must be between 1 and 100"))?;

    Ok(RenderSettings {
        dpi,
        engine_timeout: Duration::from_secs(engine_timeout_seconds),
        page_count_timeout: Duration::from_secs(page_count_timeout_seconds),
        lossless: render.lossless.unwrap_or(true),
        quality,
        mutool_path: render
            .mutool_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MUTOOL_PATH)),
        pdftoppm_path: render
            .pdftoppm_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PDFTOPPM_PATH)),
        ghostscript_path: render
            .ghostscript_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_GHOSTSCRIPT_PATH)),
        cwebp_path: render
            .cwebp_path
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CWEBP_PATH)),
    })
}

fn build_watermark_settings(
    watermark: RawWatermarkSettings,
) -> Result<WatermarkSettings, LoadError> {
    let max_chars = watermark.max_chars.unwrap_or(DEFAULT_WATERMARK_MAX_CHARS);
    if max_chars == 0 {
        return Err(LoadError::invalid(
            "watermark.max_chars",
            "maximum watermark length must be greater than zero",
        ));
    }

    let opacity = watermark.opacity.unwrap_or(DEFAULT_WATERMARK_OPACITY);
    if opacity == 0 {
        return Err(LoadError::invalid(
            "watermark.opacity",
            "an opacity of zero would render the watermark invisible",
        ));
    }

    Ok(WatermarkSettings {
        font_path: watermark.font_path,
        max_chars,
        opacity,
        angle_degrees: watermark
            .angle_degrees
            .unwrap_or(DEFAULT_WATERMARK_ANGLE_DEGREES),
    })
}
