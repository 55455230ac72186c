//! Raw capture buffers to 8-bit grayscale.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConvertError {
    #[error("{format:?} buffer too short: expected {expected} bytes, got {actual}")]
    Truncated {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Pixel formats the camera may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2, `[Y0, U, Y1, V]` per two pixels.
    Yuyv,
    /// 8-bit luma.
    Grey,
    /// 16-bit little-endian luma.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Grey => 1,
            Self::Yuyv | Self::Y16 => 2,
        }
    }

    /// Luma plane of a `width` x `height` buffer in this format.
    pub fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
        let pixels = width as usize * height as usize;
        let expected = pixels * self.bytes_per_pixel();
        if buf.len() < expected {
            return Err(ConvertError::Truncated {
                format: self,
                expected,
                actual: buf.len(),
            });
        }
        let buf = &buf[..expected];
        Ok(match self {
            Self::Grey => buf.to_vec(),
            // Y is every even byte
            Self::Yuyv => buf.iter().step_by(2).copied().collect(),
            // keep the high byte
            Self::Y16 => buf.chunks_exact(2).map(|px| px[1]).collect(),
        })
    }
}
