//! hardhat-hw — frame sources for the attendance station.
//!
//! Provides V4L2-based camera capture and a replay source over recorded
//! still images, both implementing `hardhat_core::FrameSource`.

pub mod camera;
pub mod frame;
pub mod replay;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use replay::{ImageDirSource, ReplayError};
