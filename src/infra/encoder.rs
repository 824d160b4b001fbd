//! Final artifact encoding via `cwebp`.

use std::{
    num::NonZeroU8,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::process::Command;

use crate::config::RenderSettings;

use super::process::{self, ProcessError};

pub struct WebpEncoder {
    binary: PathBuf,
    lossless: bool,
    quality: NonZeroU8,
    timeout: Duration,
}

impl WebpEncoder {
    pub fn from_settings(render: &RenderSettings) -> Self {
        Self {
            binary: render.cwebp_path.clone(),
            lossless: render.lossless,
            quality: render.quality,
            timeout: render.engine_timeout,
        }
    }

    /// Encode a PNG page into a WEBP artifact at `out`.
    pub async fn encode(&self, png: &Path, out: &Path) -> Result<(), ProcessError> {
        let mut command = Command::new(&self.binary);
        if self.lossless {
            command.arg("-z").arg("9").arg("-lossless");
        } else {
            command.arg("-q").arg(self.quality.to_string());
        }
        command.arg(png).arg("-o").arg(out);

        process::run(command, self.timeout).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use tempfile::TempDir;

    use super::*;

    fn fake_cwebp(dir: &Path, args_log: &Path) -> PathBuf {
        let path = dir.join("fake-cwebp");
        let body = format!(
            r#"#!/bin/sh
echo "$@" > "{args}"
inp=""
out=""
prev=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then
    inp="$prev"
    shift
    out="$1"
  fi
  prev="$1"
  shift
done
cp "$inp" "$out"
"#,
            args = args_log.display()
        );
        fs::write(&path, body).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    fn settings(binary: PathBuf, lossless: bool) -> RenderSettings {
        RenderSettings {
            dpi: 200.try_into().expect("dpi"),
            engine_timeout: Duration::from_secs(5),
            page_count_timeout: Duration::from_secs(5),
            lossless,
            quality: 90.try_into().expect("quality"),
            mutool_path: PathBuf::from("mutool"),
            pdftoppm_path: PathBuf::from("pdftoppm"),
            ghostscript_path: PathBuf::from("gs"),
            cwebp_path: binary,
        }
    }

    #[tokio::test]
    async fn lossless_mode_passes_the_lossless_flags() {
        let dir = TempDir::new().expect("temp dir");
        let args_log = dir.path().join("args.log");
        let encoder = WebpEncoder::from_settings(&settings(
            fake_cwebp(dir.path(), &args_log),
            true,
        ));

        let png = dir.path().join("page-1.png");
        fs::write(&png, b"PNG").expect("png");
        let out = dir.path().join("page-1.webp");

        encoder.encode(&png, &out).await.expect("encode");

        let args = fs::read_to_string(&args_log).expect("args");
        assert!(args.starts_with("-z 9 -lossless"), "args: {args}");
        assert_eq!(fs::read(&out).expect("read"), b"PNG");
    }

    #[tokio::test]
    async fn lossy_mode_passes_the_quality_flag() {
        let dir = TempDir::new().expect("temp dir");
        let args_log = dir.path().join("args.log");
        let encoder = WebpEncoder::from_settings(&settings(
            fake_cwebp(dir.path(), &args_log),
            false,
        ));

        let png = dir.path().join("page-1.png");
        fs::write(&png, b"PNG").expect("png");
        let out = dir.path().join("page-1.webp");

        encoder.encode(&png, &out).await.expect("encode");

        let args = fs::read_to_string(&args_log).expect("args");
        assert!(args.starts_with("-q 90"), "args: {args}");
    }
}
