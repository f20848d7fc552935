//! Temporal smoothing of per-frame detections.
//!
//! The primary class is grouped by overlap across a short window of
//! processed frames and carried forward with decay when the detector misses
//! it. Every other class is bucketed by a coarse label/position/size key.

use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};

use crate::detect::{BoundingBox, DetectionRecord};

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    /// Raw detections kept per frame, highest confidence first.
    pub max_detections_per_frame: usize,
    /// Primary-class detections kept per frame.
    pub max_primary_per_frame: usize,
    /// Processed frames retained for primary grouping.
    pub primary_history: usize,
    /// Processed frames retained for secondary bucketing.
    pub secondary_history: usize,
    /// A detection joins a group when IoU with the group mean exceeds this.
    pub group_iou: f32,
    pub max_groups: usize,
    /// Member detections a primary group needs to be emitted.
    pub min_group_members: usize,
    /// Distinct frames a primary group must span to be emitted.
    pub min_group_frames: usize,
    pub primary_min_confidence: f32,
    /// Multiplier applied to carried primary detections on a miss frame.
    pub decay_factor: f32,
    /// Carried detections below this confidence are dropped.
    pub decay_floor: f32,
    /// Quantization step (pixels) of the secondary grouping key.
    pub secondary_bucket_px: f32,
    pub secondary_min_observations: usize,
    pub secondary_min_confidence: f32,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            max_detections_per_frame: 20,
            max_primary_per_frame: 10,
            primary_history: 3,
            secondary_history: 2,
            group_iou: 0.3,
            max_groups: 15,
            min_group_members: 2,
            min_group_frames: 1,
            primary_min_confidence: 0.45,
            decay_factor: 0.8,
            decay_floor: 0.2,
            secondary_bucket_px: 50.0,
            secondary_min_observations: 2,
            secondary_min_confidence: 0.4,
        }
    }
}

/// Detections judged to be the same entity across the primary window.
struct TemporalGroup<'a> {
    members: Vec<&'a DetectionRecord>,
    frames: Vec<usize>,
    mean_box: BoundingBox,
}

impl<'a> TemporalGroup<'a> {
    fn start(frame: usize, det: &'a DetectionRecord) -> Self {
        Self {
            members: vec![det],
            frames: vec![frame],
            mean_box: det.bbox,
        }
    }

    fn join(&mut self, frame: usize, det: &'a DetectionRecord) {
        self.members.push(det);
        if !self.frames.contains(&frame) {
            self.frames.push(frame);
        }
        if let Some(mean) = BoundingBox::mean(self.members.iter().map(|m| &m.bbox)) {
            self.mean_box = mean;
        }
    }

    fn mean_confidence(&self) -> f32 {
        self.members.iter().map(|m| m.confidence).sum::<f32>() / self.members.len() as f32
    }

    fn merged(&self) -> DetectionRecord {
        // The strongest member lends its label and mask.
        let best = self
            .members
            .iter()
            .copied()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .unwrap_or(self.members[0]);
        DetectionRecord {
            label: best.label.clone(),
            confidence: self.mean_confidence(),
            bbox: self.mean_box,
            mask: best.mask.clone(),
        }
    }
}

type BucketKey = (String, i32, i32, i32, i32);

#[derive(Default)]
struct Bucket<'a> {
    members: Vec<&'a DetectionRecord>,
}

/// Stateful smoother; one per session.
pub struct DetectionStabilizer {
    config: StabilizerConfig,
    primary_window: VecDeque<Vec<DetectionRecord>>,
    secondary_window: VecDeque<Vec<DetectionRecord>>,
    last_primary: Vec<DetectionRecord>,
}

impl DetectionStabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            primary_window: VecDeque::with_capacity(config.primary_history + 1),
            secondary_window: VecDeque::with_capacity(config.secondary_history + 1),
            last_primary: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &StabilizerConfig {
        &self.config
    }

    /// Smooth one processed frame's fresh detections.
    ///
    /// Output order is unspecified.
    pub fn stabilize(&mut self, raw: Vec<DetectionRecord>) -> Vec<DetectionRecord> {
        let mut raw = raw;
        raw.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        raw.truncate(self.config.max_detections_per_frame);

        let (mut primary, secondary): (Vec<_>, Vec<_>) =
            raw.into_iter().partition(DetectionRecord::is_primary);
        primary.truncate(self.config.max_primary_per_frame);

        let mut stable = self.stabilize_primary(primary);
        stable.extend(self.stabilize_secondary(secondary));
        stable
    }

    /// Forget all history, e.g. after the source reconnects.
    pub fn reset(&mut self) {
        self.primary_window.clear();
        self.secondary_window.clear();
        self.last_primary.clear();
    }

    fn stabilize_primary(&mut self, fresh: Vec<DetectionRecord>) -> Vec<DetectionRecord> {
        // Only frames that saw the primary class enter the window.
        if fresh.is_empty() {
            let decay = self.config.decay_factor;
            let floor = self.config.decay_floor;
            for det in &mut self.last_primary {
                det.confidence *= decay;
            }
            self.last_primary.retain(|det| det.confidence >= floor);
            return self.last_primary.clone();
        }
        push_bounded(&mut self.primary_window, fresh, self.config.primary_history);

        let mut groups: Vec<TemporalGroup<'_>> = Vec::new();
        for (frame, detections) in self.primary_window.iter().enumerate() {
            for det in detections {
                let best = groups
                    .iter()
                    .enumerate()
                    .map(|(i, g)| (i, g.mean_box.iou(&det.bbox)))
                    .filter(|(_, iou)| *iou > self.config.group_iou)
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(i, _)| i);
                match best {
                    Some(i) => groups[i].join(frame, det),
                    None if groups.len() < self.config.max_groups => {
                        groups.push(TemporalGroup::start(frame, det))
                    }
                    None => {}
                }
            }
        }

        let stable: Vec<DetectionRecord> = groups
            .iter()
            .filter(|g| g.members.len() >= self.config.min_group_members)
            .filter(|g| g.frames.len() >= self.config.min_group_frames)
            .filter(|g| g.mean_confidence() > self.config.primary_min_confidence)
            .map(TemporalGroup::merged)
            .collect();
        self.last_primary = stable.clone();
        stable
    }

    fn stabilize_secondary(&mut self, fresh: Vec<DetectionRecord>) -> Vec<DetectionRecord> {
        push_bounded(&mut self.secondary_window, fresh, self.config.secondary_history);

        let step = self.config.secondary_bucket_px.max(1.0);
        let mut buckets: BTreeMap<BucketKey, Bucket<'_>> = BTreeMap::new();
        for det in self.secondary_window.iter().flatten() {
            buckets.entry(bucket_key(det, step)).or_default().members.push(det);
        }

        buckets
            .into_values()
            .filter(|b| b.members.len() >= self.config.secondary_min_observations)
            .filter_map(|b| {
                let count = b.members.len() as f32;
                let confidence = b.members.iter().map(|m| m.confidence).sum::<f32>() / count;
                if confidence <= self.config.secondary_min_confidence {
                    return None;
                }
                let bbox = BoundingBox::mean(b.members.iter().map(|m| &m.bbox))?;
                let newest = b.members.last()?;
                Some(DetectionRecord {
                    label: newest.label.clone(),
                    confidence,
                    bbox,
                    mask: newest.mask.clone(),
                })
            })
            .collect()
    }
}

fn push_bounded(window: &mut VecDeque<Vec<DetectionRecord>>, frame: Vec<DetectionRecord>, cap: usize) {
    window.push_back(frame);
    while window.len() > cap.max(1) {
        window.pop_front();
    }
}

fn bucket_key(det: &DetectionRecord, step: f32) -> BucketKey {
    let (cx, cy) = det.bbox.center();
    let q = |v: f32| (v / step).floor() as i32;
    (
        det.label.clone(),
        q(cx),
        q(cy),
        q(det.bbox.width()),
        q(det.bbox.height()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(x: f32, conf: f32) -> DetectionRecord {
        DetectionRecord::new("person", conf, BoundingBox::new(x, 100.0, x + 80.0, 300.0))
    }

    fn cup(x: f32, conf: f32) -> DetectionRecord {
        DetectionRecord::new("cup", conf, BoundingBox::new(x, 20.0, x + 30.0, 60.0))
    }

    fn stabilizer() -> DetectionStabilizer {
        DetectionStabilizer::new(StabilizerConfig::default())
    }

    #[test]
    fn person_seen_in_two_of_three_frames_is_emitted_once() {
        let mut s = stabilizer();
        assert!(s.stabilize(vec![person(100.0, 0.8)]).is_empty());
        // Nothing is carried yet: no stable set exists.
        assert!(s.stabilize(vec![]).is_empty());
        let out = s.stabilize(vec![person(104.0, 0.7)]);
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence - 0.75).abs() < 1e-6);
        assert!((out[0].bbox.x1 - 102.0).abs() < 1e-4);
    }

    #[test]
    fn single_frame_spurious_person_is_never_emitted() {
        let mut s = stabilizer();
        assert!(s.stabilize(vec![person(100.0, 0.9)]).is_empty());
        let out = s.stabilize(vec![person(600.0, 0.9)]);
        assert!(out.is_empty());
        let out = s.stabilize(vec![person(1000.0, 0.9)]);
        assert!(out.is_empty());
    }

    #[test]
    fn overlapping_boxes_in_one_frame_form_a_group() {
        let mut s = stabilizer();
        s.stabilize(vec![person(600.0, 0.9)]);
        let out = s.stabilize(vec![person(100.0, 0.9), person(115.0, 0.9)]);
        assert_eq!(out.len(), 1);
        assert!((out[0].bbox.x1 - 107.5).abs() < 1e-4);
    }

    #[test]
    fn frame_span_rule_rejects_single_frame_groups() {
        let config = StabilizerConfig {
            min_group_frames: 2,
            ..StabilizerConfig::default()
        };
        let mut s = DetectionStabilizer::new(config);
        let out = s.stabilize(vec![person(100.0, 0.9), person(115.0, 0.9)]);
        assert!(out.is_empty());
        let out = s.stabilize(vec![person(102.0, 0.9)]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn person_survives_misses_until_seen_again() {
        let mut s = stabilizer();
        s.stabilize(vec![person(100.0, 0.9)]);
        assert_eq!(s.stabilize(vec![person(100.0, 0.9)]).len(), 1);
        assert_eq!(s.stabilize(vec![]).len(), 1);
        assert_eq!(s.stabilize(vec![]).len(), 1);
        let out = s.stabilize(vec![person(102.0, 0.9)]);
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(s.stabilize(vec![person(104.0, 0.9)]).len(), 1);
    }

    #[test]
    fn reset_forgets_history() {
        let mut s = stabilizer();
        s.stabilize(vec![person(100.0, 0.9)]);
        assert_eq!(s.stabilize(vec![person(100.0, 0.9)]).len(), 1);
        s.reset();
        assert!(s.stabilize(vec![]).is_empty());
        assert!(s.stabilize(vec![person(100.0, 0.9)]).is_empty());
    }

    #[test]
    fn low_mean_confidence_group_is_suppressed() {
        let mut s = stabilizer();
        s.stabilize(vec![person(100.0, 0.4)]);
        assert!(s.stabilize(vec![person(100.0, 0.45)]).is_empty());
    }

    #[test]
    fn missed_person_decays_then_disappears() {
        let mut s = stabilizer();
        s.stabilize(vec![person(100.0, 0.5)]);
        let stable = s.stabilize(vec![person(100.0, 0.5)]);
        assert_eq!(stable.len(), 1);
        let c = stable[0].confidence;

        let out = s.stabilize(vec![]);
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence - 0.8 * c).abs() < 1e-6);
        let out = s.stabilize(vec![]);
        assert!((out[0].confidence - 0.64 * c).abs() < 1e-6);
        // 0.5 * 0.8^3 = 0.256, 0.5 * 0.8^4 = 0.2048, 0.5 * 0.8^5 < 0.2
        assert_eq!(s.stabilize(vec![]).len(), 1);
        assert_eq!(s.stabilize(vec![]).len(), 1);
        assert!(s.stabilize(vec![]).is_empty());
    }

    #[test]
    fn secondary_needs_two_observations_in_same_bucket() {
        let mut s = stabilizer();
        assert!(s.stabilize(vec![cup(210.0, 0.6)]).is_empty());
        let out = s.stabilize(vec![cup(212.0, 0.5)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "cup");
        assert!((out[0].confidence - 0.55).abs() < 1e-6);

        // Window of two: the first cup ages out on an empty frame.
        let out = s.stabilize(vec![]);
        assert!(out.is_empty());
    }

    #[test]
    fn secondary_buckets_separate_distant_objects() {
        let mut s = stabilizer();
        s.stabilize(vec![cup(10.0, 0.9)]);
        assert!(s.stabilize(vec![cup(400.0, 0.9)]).is_empty());
    }

    #[test]
    fn per_frame_cap_keeps_highest_confidence() {
        let config = StabilizerConfig {
            max_detections_per_frame: 1,
            ..StabilizerConfig::default()
        };
        let mut s = DetectionStabilizer::new(config);
        s.stabilize(vec![cup(10.0, 0.3), cup(400.0, 0.9)]);
        let out = s.stabilize(vec![cup(400.0, 0.9), cup(10.0, 0.3)]);
        assert_eq!(out.len(), 1);
        assert!((out[0].bbox.x1 - 400.0).abs() < 1e-6);
    }

    #[test]
    fn output_is_union_of_both_policies() {
        let mut s = stabilizer();
        s.stabilize(vec![person(100.0, 0.9), cup(500.0, 0.9)]);
        let out = s.stabilize(vec![person(102.0, 0.9), cup(501.0, 0.9)]);
        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|d| d.is_primary()));
        assert!(out.iter().any(|d| d.label == "cup"));
    }

    #[test]
    fn group_count_is_bounded() {
        let config = StabilizerConfig {
            max_groups: 2,
            ..StabilizerConfig::default()
        };
        let mut s = DetectionStabilizer::new(config);
        let frame: Vec<_> = (0..5).map(|i| person(i as f32 * 200.0, 0.9)).collect();
        s.stabilize(frame.clone());
        assert_eq!(s.stabilize(frame).len(), 2);
    }
}
