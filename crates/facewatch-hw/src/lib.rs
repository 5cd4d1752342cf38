//! facewatch-hw — frame acquisition.
//!
//! Provides V4L2 camera capture with conversion to RGB, and replay of a
//! directory of still images, behind the [`VideoSource`] trait.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{open_source, CaptureError, ImageSequence, SourceError, VideoSource};
