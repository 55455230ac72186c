//! V4L2 capture via the `v4l` crate. One mmap stream stays open for the
//! lifetime of the [`Camera`].

use crate::convert::PixelFormat;
use moodwatch_core::{CaptureError, Frame, FrameSource};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),
    #[error("format negotiation failed: {0}")]
    Format(String),
    #[error("capture failed: {0}")]
    Capture(#[from] io::Error),
}

impl From<CameraError> for CaptureError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::Capture(io) if !device_gone(&io) => CaptureError::Dropped(io.to_string()),
            other => CaptureError::DeviceUnavailable(other.to_string()),
        }
    }
}

/// Errors after which the device will not recover without reopening.
fn device_gone(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENODEV) | Some(libc::ENXIO) | Some(libc::EIO) | Some(libc::EBADF)
    ) || e.kind() == io::ErrorKind::NotFound
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

pub struct Camera {
    stream: MmapStream<'static>,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Camera {
    /// Open `device_path` and start streaming at (close to) the requested size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(libc::EBUSY) => CameraError::DeviceBusy(device_path.to_string()),
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps()?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut wanted = device
            .format()
            .map_err(|e| CameraError::Format(format!("failed to read format: {e}")))?;
        wanted.fourcc = FourCC::new(b"YUYV");
        wanted.width = width;
        wanted.height = height;
        let negotiated = device
            .set_format(&wanted)
            .map_err(|e| CameraError::Format(format!("failed to set format: {e}")))?;

        let format = PixelFormat::from_fourcc(&negotiated.fourcc.repr).ok_or_else(|| {
            CameraError::Format(format!(
                "unsupported pixel format {:?} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            ?format,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)?;

        Ok(Self {
            stream,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            format,
        })
    }

    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next()?;
        let gray = self
            .format
            .to_grayscale(buf, self.width, self.height)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Frame::new(gray, self.width, self.height, meta.sequence))
    }

    /// Throw away the first frames while exposure settles.
    pub fn warm_up(&mut self, frames: usize) -> Result<(), CameraError> {
        for _ in 0..frames {
            let frame = self.capture()?;
            tracing::debug!(seq = frame.sequence, brightness = frame.avg_brightness(), "warmup frame");
        }
        Ok(())
    }

    /// Video capture devices among `/dev/video0` to `/dev/video15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        Ok(self.capture()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        match Camera::open("/dev/video-does-not-exist", 640, 480) {
            Err(CameraError::DeviceNotFound(path)) => assert_eq!(path, "/dev/video-does-not-exist"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("opened a missing device"),
        }
    }

    #[test]
    fn test_error_classification() {
        let gone: CaptureError = CameraError::Capture(io::Error::from_raw_os_error(libc::ENODEV)).into();
        assert!(matches!(gone, CaptureError::DeviceUnavailable(_)));

        let transient: CaptureError =
            CameraError::Capture(io::Error::from_raw_os_error(libc::EAGAIN)).into();
        assert!(matches!(transient, CaptureError::Dropped(_)));

        let short: CaptureError =
            CameraError::Capture(io::Error::new(io::ErrorKind::InvalidData, "short buffer")).into();
        assert!(matches!(short, CaptureError::Dropped(_)));

        let missing: CaptureError = CameraError::DeviceNotFound("/dev/video9".into()).into();
        assert!(matches!(missing, CaptureError::DeviceUnavailable(_)));
    }
}
