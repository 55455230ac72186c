//! Five-point face alignment onto the 112x112 ArcFace template.

use crate::detector::Landmarks;
use moodwatch_core::Frame;

pub const ALIGNED_SIZE: u32 = 112;

/// Landmark positions of a canonical face in a 112x112 crop.
const TEMPLATE: Landmarks = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Rotation + uniform scale + translation:
/// `x' = a*x - b*y + tx`, `y' = b*x + a*y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` onto `dst`. `None` when the source
    /// points collapse to a single location.
    fn estimate(src: &Landmarks, dst: &Landmarks) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &Landmarks| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy, dx, dy) = (sx - smx, sy - smy, dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-6 {
            return None;
        }

        let (a, b) = (dot / norm, cross / norm);
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

fn sample_bilinear(frame: &Frame, x: f32, y: f32) -> f32 {
    let (w, h) = (frame.width as i64, frame.height as i64);
    let px = |xi: i64, yi: i64| -> f32 {
        if (0..w).contains(&xi) && (0..h).contains(&yi) {
            frame.data[(yi * w + xi) as usize] as f32
        } else {
            0.0
        }
    };
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1) * (1.0 - fx) * fy
        + px(x0 + 1, y0 + 1) * fx * fy
}

/// Warp the face described by `landmarks` into a 112x112 crop. Pixels
/// falling outside the frame are black. `None` for degenerate landmarks.
pub fn align_face(frame: &Frame, landmarks: &Landmarks) -> Option<Frame> {
    let back = Similarity::estimate(landmarks, &TEMPLATE)?.inverse()?;
    let size = ALIGNED_SIZE as usize;
    let mut out = Vec::with_capacity(size * size);
    for oy in 0..size {
        for ox in 0..size {
            let (sx, sy) = back.apply((ox as f32, oy as f32));
            out.push(sample_bilinear(frame, sx, sy).round().clamp(0.0, 255.0) as u8);
        }
    }
    Some(Frame::new(out, ALIGNED_SIZE, ALIGNED_SIZE, frame.sequence))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32), tol: f32) -> bool {
        (a.0 - b.0).abs() < tol && (a.1 - b.1).abs() < tol
    }

    #[test]
    fn test_estimate_identity() {
        let t = Similarity::estimate(&TEMPLATE, &TEMPLATE).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-2 && t.ty.abs() < 1e-2);
    }

    #[test]
    fn test_estimate_scaled_and_shifted() {
        let src: Landmarks = std::array::from_fn(|i| (TEMPLATE[i].0 * 2.0 + 30.0, TEMPLATE[i].1 * 2.0 + 10.0));
        let t = Similarity::estimate(&src, &TEMPLATE).unwrap();
        assert!((t.a - 0.5).abs() < 1e-3);
        for (s, d) in src.iter().zip(TEMPLATE.iter()) {
            assert!(close(t.apply(*s), *d, 1e-2));
        }
        let back = t.inverse().unwrap();
        assert!(close(back.apply(TEMPLATE[2]), src[2], 1e-2));
    }

    #[test]
    fn test_degenerate_landmarks() {
        let frame = Frame::new(vec![100; 64 * 64], 64, 64, 0);
        assert!(align_face(&frame, &[(10.0, 10.0); 5]).is_none());
    }

    #[test]
    fn test_align_moves_eye_to_template() {
        let (w, h) = (200u32, 200u32);
        let mut data = vec![0u8; (w * h) as usize];
        let src: Landmarks = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        for y in 58..=62 {
            for x in 78..=82 {
                data[y * w as usize + x] = 255;
            }
        }
        let aligned = align_face(&Frame::new(data, w, h, 7), &src).unwrap();
        assert_eq!((aligned.width, aligned.height, aligned.sequence), (112, 112, 7));

        let (ex, ey) = (TEMPLATE[0].0.round() as usize, TEMPLATE[0].1.round() as usize);
        let brightest = (ey - 1..=ey + 1)
            .flat_map(|y| (ex - 1..=ex + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.data[y * 112 + x])
            .max()
            .unwrap_or(0);
        assert!(brightest > 100, "eye patch not near template, max={brightest}");
    }
}
