//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, FrameError};
use hardhat_core::source::{CaptureError, Frame, FrameSource};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
const DARK_FRAME_THRESHOLD: f32 = 0.95;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Conversion(#[from] FrameError),
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
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// 8-bit grayscale, replicated to RGB.
    Grey,
    /// 16-bit little-endian grayscale, reduced to 8 bits.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }
}

/// A queue of filled capture buffers.
trait BufferStream: Send {
    fn next_buffer(&mut self) -> Result<&[u8], CameraError>;
}

impl BufferStream for MmapStream<'static> {
    fn next_buffer(&mut self) -> Result<&[u8], CameraError> {
        let (buf, meta) = self
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        tracing::trace!(seq = meta.sequence, "dequeued buffer");
        Ok(buf)
    }
}

/// Decodes frames from one long-lived buffer stream.
struct FrameReader {
    stream: Box<dyn BufferStream>,
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    sequence: u64,
}

impl FrameReader {
    fn read(&mut self) -> Result<Frame, CameraError> {
        let buf = self.stream.next_buffer()?;
        let image = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)?,
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height)?,
            PixelFormat::Y16 => frame::y16_to_rgb(buf, self.width, self.height)?,
        };
        self.sequence += 1;
        Ok(Frame::new(image, self.sequence))
    }
}

/// V4L2 camera, exclusively owned by the recognition loop.
///
/// Streaming starts on the first capture and stays on until the camera is
/// dropped, which also releases the device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    reader: Option<FrameReader>,
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

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format,
            reader: None,
        })
    }

    /// Capture a single RGB frame from the camera's stream.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let reader = match self.reader.take() {
            Some(reader) => reader,
            None => self.start_stream()?,
        };
        self.reader.insert(reader).read()
    }

    fn start_stream(&self) -> Result<FrameReader, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        tracing::debug!(device = %self.device_path, buffers = STREAM_BUFFERS, "streaming started");
        Ok(FrameReader {
            stream: Box::new(stream),
            pixel_format: self.pixel_format,
            width: self.width,
            height: self.height,
            sequence: 0,
        })
    }

    /// Capture and throw away `count` frames while exposure settles.
    pub fn discard_warmup(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        tracing::info!(count, "discarding warmup frames");
        for _ in 0..count {
            if let Err(e) = self.capture_frame() {
                tracing::debug!(error = %e, "warmup capture failed");
            }
        }
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

impl FrameSource for Camera {
    /// Every camera failure is transient: the loop retries on the next tick.
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let frame = self
            .capture_frame()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
        if frame::is_dark_frame(&frame.image, DARK_FRAME_THRESHOLD) {
            return Err(CaptureError::Unavailable("dark frame".to_string()));
        }
        Ok(frame)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    /// Hands out numbered YUYV buffers and counts how many it was asked for.
    struct CountingStream {
        buffers: Vec<Vec<u8>>,
        dequeued: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl BufferStream for CountingStream {
        fn next_buffer(&mut self) -> Result<&[u8], CameraError> {
            let i = self.dequeued.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.buffers
                .get(i)
                .map(Vec::as_slice)
                .ok_or_else(|| CameraError::CaptureFailed("stream drained".into()))
        }
    }

    fn yuyv(luma: u8, width: u32, height: u32) -> Vec<u8> {
        [luma, 128].repeat((width * height) as usize)
    }

    #[test]
    fn test_reader_reuses_one_stream() {
        let dequeued = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let stream = CountingStream {
            buffers: vec![yuyv(60, 4, 2), yuyv(120, 4, 2), yuyv(200, 4, 2)],
            dequeued: dequeued.clone(),
        };
        let mut reader = FrameReader {
            stream: Box::new(stream),
            pixel_format: PixelFormat::Yuyv,
            width: 4,
            height: 2,
            sequence: 0,
        };

        let frames: Vec<Frame> = (0..3).map(|_| reader.read().unwrap()).collect();
        assert_eq!(dequeued.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(frames.iter().map(|f| f.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
        // Each frame comes from the next queued buffer, not a fresh stream.
        assert!(frames[0].image.get_pixel(0, 0)[0] < frames[1].image.get_pixel(0, 0)[0]);
        assert!(frames[1].image.get_pixel(0, 0)[0] < frames[2].image.get_pixel(0, 0)[0]);

        assert!(matches!(reader.read(), Err(CameraError::CaptureFailed(_))));
        assert_eq!(reader.sequence, 3);
    }

    #[test]
    fn test_reader_rejects_short_buffer() {
        let stream = CountingStream {
            buffers: vec![vec![0; 3]],
            dequeued: Default::default(),
        };
        let mut reader = FrameReader {
            stream: Box::new(stream),
            pixel_format: PixelFormat::Grey,
            width: 4,
            height: 2,
            sequence: 0,
        };
        assert!(matches!(reader.read(), Err(CameraError::Conversion(_))));
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/hardhat-no-such-camera").err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }
}
