//! SCRFD face detector: anchor-free decoding over three strides followed by
//! non-maximum suppression.

use crate::{gray_image, open_session, OnnxError};
use image::imageops::{self, FilterType};
use moodwatch_core::{BoundingBox, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

pub type Landmarks = [(f32, f32); 5];

/// One detected face in frame coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Eyes, nose tip, mouth corners.
    pub landmarks: Option<Landmarks>,
}

/// How the frame was fitted into the square network input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let (w, h) = scaled_dims(width, height, scale);
        Self {
            scale,
            pad_x: ((INPUT_SIZE - w) / 2) as f32,
            pad_y: ((INPUT_SIZE - h) / 2) as f32,
        }
    }

    fn to_frame(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

fn scaled_dims(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    (w, h)
}

/// Output slots (score, bbox, landmarks) for each stride.
type StrideOutputs = [(usize, usize, usize); 3];

pub struct FaceDetector {
    session: Session,
    outputs: StrideOutputs,
}

impl FaceDetector {
    pub fn load(path: &Path) -> Result<Self, OnnxError> {
        let session = open_session(path, "scrfd")?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(OnnxError::BadOutput(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let outputs = output_slots(&names);
        tracing::debug!(?outputs, "SCRFD output mapping");
        Ok(Self { session, outputs })
    }

    /// Faces in `frame`, highest confidence first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, OnnxError> {
        let (input, letterbox) = preprocess(frame)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut found = Vec::new();
        for (slot, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.outputs[slot];
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>()?;
            let (_, boxes) = outputs[bbox_idx].try_extract_tensor::<f32>()?;
            let (_, kps) = outputs[kps_idx].try_extract_tensor::<f32>()?;
            found.extend(decode_stride(
                StrideTensors { scores, boxes, kps },
                stride,
                &letterbox,
                SCORE_THRESHOLD,
            ));
        }

        Ok(nms(found, NMS_IOU))
    }
}

/// Letterbox a grayscale frame into a normalized 1x3x640x640 tensor.
fn preprocess(frame: &Frame) -> Result<(Array4<f32>, Letterbox), OnnxError> {
    let gray = gray_image(&frame.data, frame.width, frame.height).ok_or_else(|| {
        OnnxError::BadOutput(format!(
            "frame buffer of {} bytes does not match {}x{}",
            frame.data.len(),
            frame.width,
            frame.height
        ))
    })?;
    let letterbox = Letterbox::fit(frame.width, frame.height);
    let (w, h) = scaled_dims(frame.width, frame.height, letterbox.scale);
    let resized = imageops::resize(&gray, w, h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    // padding stays at 0.0, which is MEAN after normalization
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, px) in resized.enumerate_pixels() {
        let v = (px.0[0] as f32 - MEAN) / STD;
        for c in 0..3 {
            tensor[[0, c, oy + y as usize, ox + x as usize]] = v;
        }
    }
    Ok((tensor, letterbox))
}

/// Map output names like `score_8`/`bbox_16`/`kps_32` to stride slots,
/// falling back to the common positional export order.
fn output_slots(names: &[String]) -> StrideOutputs {
    let index_of = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let by_name: Option<Vec<(usize, usize, usize)>> = STRIDES
        .iter()
        .map(|&s| Some((index_of("score", s)?, index_of("bbox", s)?, index_of("kps", s)?)))
        .collect();

    match by_name {
        Some(slots) => [slots[0], slots[1], slots[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

struct StrideTensors<'a> {
    scores: &'a [f32],
    boxes: &'a [f32],
    kps: &'a [f32],
}

fn decode_stride(t: StrideTensors<'_>, stride: usize, letterbox: &Letterbox, threshold: f32) -> Vec<Detection> {
    let grid = INPUT_SIZE as usize / stride;
    let step = stride as f32;
    let anchors = grid * grid * ANCHORS_PER_CELL;

    (0..anchors.min(t.scores.len()))
        .filter(|&i| t.scores[i] > threshold)
        .filter_map(|i| {
            let cell = i / ANCHORS_PER_CELL;
            let (ax, ay) = ((cell % grid) as f32 * step, (cell / grid) as f32 * step);

            let d = t.boxes.get(i * 4..i * 4 + 4)?;
            let (x1, y1) = letterbox.to_frame((ax - d[0] * step, ay - d[1] * step));
            let (x2, y2) = letterbox.to_frame((ax + d[2] * step, ay + d[3] * step));

            let landmarks = t.kps.get(i * 10..i * 10 + 10).map(|k| {
                std::array::from_fn(|p| letterbox.to_frame((ax + k[p * 2] * step, ay + k[p * 2 + 1] * step)))
            });

            Some(Detection {
                bbox: BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: t.scores[i],
                },
                landmarks,
            })
        })
        .collect()
}

/// Greedy NMS; the result is sorted by confidence, highest first.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.bbox.confidence.total_cmp(&a.bbox.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept.iter().all(|k| iou(&k.bbox, &det.bbox) <= iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox { x, y, width: w, height: h, confidence },
            landmarks: None,
        }
    }

    #[test]
    fn test_iou() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0).bbox;
        let b = det(5.0, 0.0, 10.0, 10.0, 1.0).bbox;
        let far = det(50.0, 50.0, 10.0, 10.0, 1.0).bbox;
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&a, &far), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = nms(
            vec![
                det(5.0, 5.0, 100.0, 100.0, 0.8),
                det(200.0, 200.0, 50.0, 50.0, 0.7),
                det(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            NMS_IOU,
        );
        let confidences: Vec<f32> = kept.iter().map(|d| d.bbox.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
        assert!(nms(vec![], NMS_IOU).is_empty());
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let lb = Letterbox::fit(320, 240);
        assert_eq!(lb.scale, 2.0);
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 80.0));
        let (x, y) = lb.to_frame((100.0 * 2.0, 50.0 * 2.0 + 80.0));
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_output_slots() {
        let shuffled: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(output_slots(&shuffled), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);

        let numeric: Vec<String> = (0..9).map(|i| (400 + i).to_string()).collect();
        assert_eq!(output_slots(&numeric), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        let stride = 32;
        let grid = INPUT_SIZE as usize / stride;
        let anchors = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.0; anchors];
        let mut boxes = vec![0.0; anchors * 4];
        let kps = vec![0.0; anchors * 10];

        // anchor 0 of cell (1, 1): center (32, 32), box 1 stride each way
        let i = (grid + 1) * ANCHORS_PER_CELL;
        scores[i] = 0.9;
        boxes[i * 4..i * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let identity = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_stride(
            StrideTensors { scores: &scores, boxes: &boxes, kps: &kps },
            stride,
            &identity,
            SCORE_THRESHOLD,
        );
        assert_eq!(dets.len(), 1);
        let b = dets[0].bbox;
        assert_eq!((b.x, b.y, b.width, b.height), (0.0, 0.0, 64.0, 64.0));
        assert_eq!(dets[0].landmarks, Some([(32.0, 32.0); 5]));
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = Frame::new(vec![255; 320 * 240], 320, 240, 0);
        let (tensor, lb) = preprocess(&frame).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, lb.pad_y as usize + 10, 10]];
        assert!((inside - (255.0 - MEAN) / STD).abs() < 1e-5);
    }
}
