//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use crate::source::{CaptureError, VideoSource};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUEST_WIDTH: u32 = 640;
const REQUEST_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
    /// Packed 24-bit RGB.
    Rgb3,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpg),
            b"RGB3" => Some(Self::Rgb3),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// V4L2 camera with a persistent memory-mapped capture stream.
///
/// The stream is created once on open and released when the camera is dropped.
pub struct Camera {
    stream: MmapStream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
    frames: u64,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let (width, height, pixel_format) = negotiate(&device)?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        tracing::info!(width, height, format = ?pixel_format, "negotiated format");

        Ok(Self {
            stream,
            width,
            height,
            device_path: device_path.to_string(),
            pixel_format,
            frames: 0,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Dequeue one buffer and convert it to RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let image = convert(self.pixel_format, buf, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(format!("seq {}: {e}", meta.sequence)))?;

        self.frames += 1;
        Ok(Frame::new(image, self.frames))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, frames = self.frames, "camera released");
    }
}

/// Ask for YUYV at 640x480, then fall back to MJPG; accept whatever supported
/// format the driver settles on.
fn negotiate(device: &Device) -> Result<(u32, u32, PixelFormat), CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;

    for fourcc in [b"YUYV", b"MJPG"] {
        fmt.fourcc = FourCC::new(fourcc);
        fmt.width = REQUEST_WIDTH;
        fmt.height = REQUEST_HEIGHT;

        match device.set_format(&fmt) {
            Ok(negotiated) => {
                if let Some(format) = PixelFormat::from_fourcc(negotiated.fourcc) {
                    return Ok((negotiated.width, negotiated.height, format));
                }
                tracing::debug!(requested = ?fmt.fourcc, got = ?negotiated.fourcc, "driver chose an unsupported format");
            }
            Err(e) => tracing::debug!(requested = ?fmt.fourcc, error = %e, "set_format rejected"),
        }
    }

    let current = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
    PixelFormat::from_fourcc(current.fourcc)
        .map(|format| (current.width, current.height, format))
        .ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, RGB3, or GREY)",
                current.fourcc
            ))
        })
}

fn convert(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<image::RgbImage, FrameError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
        PixelFormat::Mjpg => frame::mjpg_to_rgb(buf),
        PixelFormat::Rgb3 => frame::rgb24_to_rgb(buf, width, height),
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
    }
}

impl VideoSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        self.capture_frame().map_err(|e| match e {
            // A vanished node means the device was unplugged.
            CameraError::CaptureFailed(_) if !Path::new(&self.device_path).exists() => {
                CaptureError::DeviceLost(format!("{} disappeared", self.device_path))
            }
            other => CaptureError::NoFrame(other.to_string()),
        })
    }

    fn describe(&self) -> String {
        format!("camera {} ({}x{} {:?})", self.device_path, self.width, self.height, self.pixel_format)
    }
}
