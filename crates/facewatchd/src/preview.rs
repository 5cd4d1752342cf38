//! Display sink: keeps a JPEG of the latest annotated frame on disk.
//!
//! Writes run on the blocking pool. A frame offered while the previous one is
//! still being written is dropped, so the sink never queues.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const PREVIEW_QUALITY: u8 = 80;

pub struct PreviewSink {
    path: Arc<PathBuf>,
    busy: Arc<AtomicBool>,
    dropped: AtomicU64,
}

impl PreviewSink {
    pub fn new(path: PathBuf) -> Self {
        tracing::info!(path = %path.display(), "preview sink enabled");
        Self {
            path: Arc::new(path),
            busy: Arc::new(AtomicBool::new(false)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Hand a frame to the sink. Returns `false` if it was dropped.
    pub fn offer(&self, frame: RgbImage) -> bool {
        if self.busy.swap(true, Ordering::AcqRel) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let path = Arc::clone(&self.path);
        let busy = Arc::clone(&self.busy);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = write_preview(&frame, &path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to write preview");
            }
            busy.store(false, Ordering::Release);
        });
        true
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Encode next to `path`, then rename so readers never see a partial file.
pub fn write_preview(frame: &RgbImage, path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("jpg.tmp");
    let result = (|| {
        let mut writer = BufWriter::new(std::fs::File::create(&tmp)?);
        JpegEncoder::new_with_quality(&mut writer, PREVIEW_QUALITY)
            .encode_image(frame)
            .map_err(std::io::Error::other)?;
        writer.flush()?;
        drop(writer);
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}
