//! emarge-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access behind the [`FrameSource`] trait,
//! plus the frame type, annotation drawing, and JPEG encoding the
//! capture sessions stream to consumers.

pub mod annotate;
pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::Frame;
