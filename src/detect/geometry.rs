use serde::{Deserialize, Serialize};

/// Axis-aligned box in source-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Inclusive point-in-box test.
    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.x2 > self.x1 && self.y2 > self.y1)
    }

    /// Clamp to `[0, width] x [0, height]`. Returns `None` when nothing is left.
    pub fn clip(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let w = width as f32;
        let h = height as f32;
        let clipped = BoundingBox {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        };
        if clipped.is_degenerate() {
            None
        } else {
            Some(clipped)
        }
    }

    pub fn scaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x1: self.x1 * factor,
            y1: self.y1 * factor,
            x2: self.x2 * factor,
            y2: self.y2 * factor,
        }
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        if ix2 <= ix1 || iy2 <= iy1 {
            return 0.0;
        }
        let intersection = (ix2 - ix1) * (iy2 - iy1);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Component-wise mean of a set of boxes.
    pub fn mean<'a, I>(boxes: I) -> Option<BoundingBox>
    where
        I: IntoIterator<Item = &'a BoundingBox>,
    {
        let mut sum = [0.0f32; 4];
        let mut count = 0usize;
        for b in boxes {
            sum[0] += b.x1;
            sum[1] += b.y1;
            sum[2] += b.x2;
            sum[3] += b.y2;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        let n = count as f32;
        Some(BoundingBox::new(sum[0] / n, sum[1] / n, sum[2] / n, sum[3] / n))
    }
}

/// Face box in `(top, right, bottom, left)` order, source-frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl FaceBox {
    pub fn new(top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.left + self.right) / 2.0, (self.top + self.bottom) / 2.0)
    }

    pub fn to_bbox(&self) -> BoundingBox {
        BoundingBox::new(self.left, self.top, self.right, self.bottom)
    }

    pub fn from_bbox(b: &BoundingBox) -> Self {
        Self::new(b.y1, b.x2, b.y2, b.x1)
    }

    pub fn scaled(&self, factor: f32) -> FaceBox {
        FaceBox::from_bbox(&self.to_bbox().scaled(factor))
    }

    pub fn clip(&self, width: u32, height: u32) -> Option<FaceBox> {
        self.to_bbox()
            .clip(width, height)
            .map(|b| FaceBox::from_bbox(&b))
    }
}

/// Greedy non-maximum suppression. Returns kept indices, highest score first.
pub fn non_max_suppression(boxes: &[BoundingBox], scores: &[f32], overlap: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len())).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order[pos + 1..] {
            if !suppressed[j] && boxes[i].iou(&boxes[j]) > overlap {
                suppressed[j] = true;
            }
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_half_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        // 50 / 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn clip_keeps_box_inside_frame() {
        let b = BoundingBox::new(-20.0, -5.0, 700.0, 300.0);
        let clipped = b.clip(640, 480).unwrap();
        assert_eq!(clipped, BoundingBox::new(0.0, 0.0, 640.0, 300.0));
        assert!(BoundingBox::new(700.0, 0.0, 800.0, 10.0)
            .clip(640, 480)
            .is_none());
    }

    #[test]
    fn face_box_round_trips_through_bbox() {
        let face = FaceBox::new(10.0, 40.0, 50.0, 20.0);
        assert_eq!(FaceBox::from_bbox(&face.to_bbox()), face);
        assert_eq!(face.center(), (30.0, 30.0));
    }

    #[test]
    fn nms_drops_overlapping_lower_scores() {
        let boxes = vec![
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(1.0, 1.0, 11.0, 11.0),
            BoundingBox::new(50.0, 50.0, 60.0, 60.0),
        ];
        let keep = non_max_suppression(&boxes, &[0.6, 0.9, 0.5], 0.4);
        assert_eq!(keep, vec![1, 2]);
    }
}
