//! Grayscale frame type shared by capture, models and the pipeline.

use crate::types::BoundingBox;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish()
    }
}

impl Frame {
    /// Wrap grayscale pixels, classifying the frame as dark or not.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_THRESHOLD);
        Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Copy the region under `bbox`, clamped to the frame bounds.
    ///
    /// Returns `None` when the clamped region is empty.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<Frame> {
        let w = self.width as usize;
        let h = self.height as usize;
        if self.data.len() < w * h {
            return None;
        }

        let left = (bbox.x.floor().max(0.0) as usize).min(w);
        let top = (bbox.y.floor().max(0.0) as usize).min(h);
        let right = ((bbox.x + bbox.width).ceil().max(0.0) as usize).min(w);
        let bottom = ((bbox.y + bbox.height).ceil().max(0.0) as usize).min(h);
        if left >= right || top >= bottom {
            return None;
        }

        let crop_w = right - left;
        let mut data = Vec::with_capacity(crop_w * (bottom - top));
        for y in top..bottom {
            data.extend_from_slice(&self.data[y * w + left..y * w + right]);
        }

        Some(Frame {
            data,
            width: crop_w as u32,
            height: (bottom - top) as u32,
            timestamp: self.timestamp,
            sequence: self.sequence,
            is_dark: false,
        })
    }
}

/// Check if a frame is dark: true if more than `threshold_pct` of pixels
/// fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, width: f32, height: f32) -> BoundingBox {
        BoundingBox { x, y, width, height, confidence: 1.0 }
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&[0u8; 1000], DARK_FRAME_THRESHOLD));
        assert!(is_dark_frame(&[], DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        // 94% dark, 6% bright
        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_new_classifies_darkness() {
        assert!(Frame::new(vec![0; 16], 4, 4, 0).is_dark);
        assert!(!Frame::new(vec![200; 16], 4, 4, 0).is_dark);
    }

    #[test]
    fn test_crop_inside() {
        // 4x4 frame with pixel value = index
        let frame = Frame::new((0..16).collect(), 4, 4, 7);
        let crop = frame.crop(&bbox(1.0, 1.0, 2.0, 2.0)).unwrap();
        assert_eq!((crop.width, crop.height), (2, 2));
        assert_eq!(crop.data, vec![5, 6, 9, 10]);
        assert_eq!(crop.sequence, 7);
    }

    #[test]
    fn test_crop_clamps_to_bounds() {
        let frame = Frame::new((0..16).collect(), 4, 4, 0);
        let crop = frame.crop(&bbox(-3.0, 2.0, 10.0, 10.0)).unwrap();
        assert_eq!((crop.width, crop.height), (4, 2));
        assert_eq!(crop.data, (8..16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_crop_outside_is_none() {
        let frame = Frame::new(vec![100; 16], 4, 4, 0);
        assert!(frame.crop(&bbox(10.0, 10.0, 5.0, 5.0)).is_none());
        assert!(frame.crop(&bbox(1.0, 1.0, 0.0, 2.0)).is_none());
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(vec![0, 100, 200, 100], 2, 2, 0);
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-6);
    }
}
