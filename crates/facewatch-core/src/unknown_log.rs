//! Unknown-face audit trail.
//!
//! Each event is a JPEG of the annotated frame plus one line in an append-only
//! text log:
//!
//! ```text
//! 2026-10-19_14-03-22.125 - Unknown detected - saved to unknown_logs/unknown_2026-10-19_14-03-22.125.jpg
//! ```
//!
//! The image is in place before its line is appended, and every append or
//! delete holds an exclusive `flock` on the log file for its duration, so the
//! live logger and audit tooling can share the directory.

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const LOG_FILE_NAME: &str = "unknown_log.txt";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S%.3f";
const LINE_MARKER: &str = " - Unknown detected - saved to ";
const JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("encoding {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
}

fn io_error<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> LogError + 'a {
    move |source| LogError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// One persisted unknown-face event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEvent {
    pub timestamp: String,
    pub image_path: PathBuf,
    /// Exact log line, without the trailing newline.
    pub log_line: String,
}

impl UnknownEvent {
    fn new(timestamp: String, image_path: PathBuf) -> Self {
        let log_line = format!("{timestamp}{LINE_MARKER}{}", image_path.display());
        Self {
            timestamp,
            image_path,
            log_line,
        }
    }

    /// Parse one log line; `None` for lines that are not event records.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (timestamp, path) = line.split_once(LINE_MARKER)?;
        let (timestamp, path) = (timestamp.trim(), path.trim());
        if timestamp.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self {
            timestamp: timestamp.to_string(),
            image_path: PathBuf::from(path),
            log_line: line.to_string(),
        })
    }
}

/// The event directory: log file plus image artifacts.
#[derive(Debug, Clone)]
pub struct UnknownLog {
    dir: PathBuf,
}

impl UnknownLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    /// Every event record in file order (oldest first). A missing log is empty.
    pub fn entries(&self) -> Result<Vec<UnknownEvent>, LogError> {
        let path = self.log_path();
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("opening", &path)(e)),
        };
        let mut file = lock(file, FlockArg::LockShared, &path)?;

        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(io_error("reading", &path))?;

        Ok(contents.lines().filter_map(UnknownEvent::parse).collect())
    }

    /// Entries whose image still exists, as an audit viewer would list them.
    pub fn entries_with_existing_images(&self) -> Result<Vec<UnknownEvent>, LogError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.image_path.exists())
            .collect())
    }

    /// Remove an event's log line and its image.
    ///
    /// Returns `false` when the line was not in the log (the image is still
    /// removed if present).
    pub fn delete(&self, event: &UnknownEvent) -> Result<bool, LogError> {
        let path = self.log_path();
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => Some(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_error("opening", &path)(e)),
        };

        let mut removed = false;
        // Held until the image is gone too.
        let _guard = match file {
            Some(file) => {
                let mut file = lock(file, FlockArg::LockExclusive, &path)?;
                let mut contents = String::new();
                file.read_to_string(&mut contents).map_err(io_error("reading", &path))?;

                let mut kept = String::with_capacity(contents.len());
                for line in contents.lines() {
                    if line.trim() == event.log_line {
                        removed = true;
                    } else {
                        kept.push_str(line);
                        kept.push('\n');
                    }
                }

                if removed {
                    file.set_len(0).map_err(io_error("truncating", &path))?;
                    file.seek(SeekFrom::Start(0)).map_err(io_error("rewinding", &path))?;
                    file.write_all(kept.as_bytes()).map_err(io_error("rewriting", &path))?;
                    file.sync_data().map_err(io_error("syncing", &path))?;
                }
                Some(file)
            }
            None => None,
        };

        match std::fs::remove_file(&event.image_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("removing", &event.image_path)(e)),
        }

        tracing::info!(timestamp = %event.timestamp, removed, "unknown event deleted");
        Ok(removed)
    }

    fn append(&self, line: &str) -> Result<(), LogError> {
        let path = self.log_path();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error("opening", &path))?;
        let mut file = lock(file, FlockArg::LockExclusive, &path)?;
        writeln!(file, "{line}").map_err(io_error("appending to", &path))?;
        file.sync_data().map_err(io_error("syncing", &path))
    }
}

fn lock(file: File, mode: FlockArg, path: &Path) -> Result<Flock<File>, LogError> {
    Flock::lock(file, mode).map_err(|(_, errno)| io_error("locking", path)(io::Error::from(errno)))
}

/// Rate-limited writer of unknown events.
///
/// The cool-down is global for the session and measured from the last event
/// that was actually persisted. Callers pass one fully annotated frame per
/// video frame, so several unknown faces in one frame yield a single event.
pub struct UnknownEventLogger {
    log: UnknownLog,
    cooldown: Duration,
    last_logged: Option<DateTime<Local>>,
}

impl UnknownEventLogger {
    pub fn new(dir: impl Into<PathBuf>, cooldown: Duration) -> Self {
        Self {
            log: UnknownLog::new(dir),
            cooldown,
            last_logged: None,
        }
    }

    pub fn log(&self) -> &UnknownLog {
        &self.log
    }

    /// Persist `annotated` unless the cool-down since the last event is still running.
    ///
    /// Returns `Ok(None)` when suppressed. On error nothing was recorded and
    /// the cool-down is not restarted.
    pub fn maybe_log(&mut self, annotated: &RgbImage, now: DateTime<Local>) -> Result<Option<UnknownEvent>, LogError> {
        if let Some(last) = self.last_logged {
            // Millisecond resolution matches the timestamp text, which must strictly increase.
            if now.timestamp_millis() <= last.timestamp_millis() {
                return Ok(None);
            }
            match (now - last).to_std() {
                Ok(elapsed) if elapsed >= self.cooldown => {}
                _ => return Ok(None),
            }
        }

        let event = self.record(annotated, now)?;
        self.last_logged = Some(now);
        tracing::info!(path = %event.image_path.display(), "unknown face logged");
        Ok(Some(event))
    }

    fn record(&self, annotated: &RgbImage, now: DateTime<Local>) -> Result<UnknownEvent, LogError> {
        let dir = self.log.dir();
        std::fs::create_dir_all(dir).map_err(io_error("creating", dir))?;

        let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
        let event = UnknownEvent::new(timestamp.clone(), artifact_path(dir, &timestamp));

        write_jpeg(annotated, &event.image_path)?;

        if let Err(e) = self.log.append(&event.log_line) {
            // No line, no image.
            let _ = std::fs::remove_file(&event.image_path);
            return Err(e);
        }
        Ok(event)
    }
}

fn artifact_path(dir: &Path, timestamp: &str) -> PathBuf {
    dir.join(format!("unknown_{timestamp}.jpg"))
}

/// Encode to a hidden temporary file next to `path`, then rename into place.
fn write_jpeg(image: &RgbImage, path: &Path) -> Result<(), LogError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let result = encode_to(image, &tmp).and_then(|()| {
        std::fs::rename(&tmp, path).map_err(io_error("renaming into", path))
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn encode_to(image: &RgbImage, path: &Path) -> Result<(), LogError> {
    let file = File::create(path).map_err(io_error("creating", path))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|source| LogError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
    writer.flush().map_err(io_error("writing", path))
}
