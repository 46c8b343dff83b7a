// Fusion strategies: turn per-detector detection lists into one consensus list.
//
// All strategies work on boxes normalized to [0, 1]; the ensemble converts to
// and from pixel space around them.

use crate::pipeline::types::{BBox, Detection, FusedDetection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionMethod {
    #[default]
    Wbf,
    Nms,
}

/// How multi-detector output is merged, and the thresholds for it
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub method: FusionMethod,
    /// Minimum IoU for a box to join an existing cluster (suppression
    /// threshold for NMS)
    pub iou_thr: f32,
    /// Input boxes scoring below this are ignored
    pub skip_box_thr: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            method: FusionMethod::Wbf,
            iou_thr: 0.5,
            skip_box_thr: 0.4,
        }
    }
}

impl FusionConfig {
    /// Strategy for ensembles with more than one detector.
    pub fn strategy(&self) -> Box<dyn FusionStrategy> {
        match self.method {
            FusionMethod::Wbf => Box::new(WeightedBoxesFusion::new(self.clone())),
            FusionMethod::Nms => Box::new(NonMaximumSuppression {
                iou_threshold: self.iou_thr,
                min_score: self.skip_box_thr,
            }),
        }
    }
}

/// A pure function from N detector outputs (plus their weights) to one list.
pub trait FusionStrategy {
    fn name(&self) -> &'static str;
    fn fuse(&self, lists: &[Vec<Detection>], weights: &[f32]) -> Vec<FusedDetection>;

    /// Factor applied to the score of a box that only the first detector
    /// reported. Score thresholds downstream of fusion scale by it.
    fn lone_score_scale(&self, _weights: &[f32]) -> f32 {
        1.0
    }
}

/// Weighted Boxes Fusion over all detector outputs.
#[derive(Clone, Debug, Default)]
pub struct WeightedBoxesFusion {
    pub config: FusionConfig,
}

impl WeightedBoxesFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }
}

impl FusionStrategy for WeightedBoxesFusion {
    fn name(&self) -> &'static str {
        "wbf"
    }

    fn fuse(&self, lists: &[Vec<Detection>], weights: &[f32]) -> Vec<FusedDetection> {
        weighted_boxes_fusion(lists, weights, &self.config)
    }

    /// A one-member cluster scores `score * w / sum(w)`.
    fn lone_score_scale(&self, weights: &[f32]) -> f32 {
        let sum: f32 = weights.iter().sum();
        match weights.first() {
            Some(&w) if w > 0.0 && sum > 0.0 && weights.iter().all(|w| *w > 0.0) => {
                (w / sum).min(1.0)
            }
            _ => 1.0,
        }
    }
}

/// Class-aware NMS over the concatenated lists.
#[derive(Clone, Debug)]
pub struct NonMaximumSuppression {
    pub iou_threshold: f32,
    pub min_score: f32,
}

impl Default for NonMaximumSuppression {
    fn default() -> Self {
        Self {
            iou_threshold: 0.5,
            min_score: 0.0,
        }
    }
}

impl FusionStrategy for NonMaximumSuppression {
    fn name(&self) -> &'static str {
        "nms"
    }

    fn fuse(&self, lists: &[Vec<Detection>], _weights: &[f32]) -> Vec<FusedDetection> {
        let all: Vec<Detection> = lists
            .iter()
            .flatten()
            .filter(|d| d.score >= self.min_score)
            .copied()
            .collect();
        nms(all, self.iou_threshold)
    }
}

/// Concatenates the lists unchanged. Used when only one detector runs.
#[derive(Clone, Debug, Default)]
pub struct Passthrough;

impl FusionStrategy for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn fuse(&self, lists: &[Vec<Detection>], _weights: &[f32]) -> Vec<FusedDetection> {
        lists.iter().flatten().copied().collect()
    }
}

/// A box admitted to clustering, with its score already scaled by the
/// detector weight.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    bbox: BBox,
    weighted_score: f32,
}

struct Cluster {
    members: Vec<Candidate>,
    fused: BBox,
}

impl Cluster {
    fn new(first: Candidate) -> Self {
        Self {
            fused: first.bbox,
            members: vec![first],
        }
    }

    fn push(&mut self, candidate: Candidate) {
        self.members.push(candidate);
        self.fused = self.weighted_box();
    }

    /// Member boxes averaged with their weighted scores as weights.
    fn weighted_box(&self) -> BBox {
        let total: f32 = self.members.iter().map(|m| m.weighted_score).sum();
        let n = self.members.len() as f32;
        let (mut x1, mut y1, mut x2, mut y2) = (0.0, 0.0, 0.0, 0.0);

        for m in &self.members {
            let w = if total > 0.0 {
                m.weighted_score / total
            } else {
                1.0 / n
            };
            x1 += m.bbox.x1 * w;
            y1 += m.bbox.y1 * w;
            x2 += m.bbox.x2 * w;
            y2 += m.bbox.y2 * w;
        }

        BBox { x1, y1, x2, y2 }
    }

    /// Mean weighted score, rescaled so that a cluster confirmed by every
    /// detector scores the weighted average of its members. Several boxes
    /// from one heavy detector can push this past 1, hence the cap.
    fn fused_score(&self, detector_count: usize, weight_sum: f32) -> f32 {
        let n = self.members.len();
        let mean = self.members.iter().map(|m| m.weighted_score).sum::<f32>() / n as f32;
        (mean * detector_count.min(n) as f32 / weight_sum).min(1.0)
    }
}

/// Clips a normalized box to [0, 1], fixes inverted corners and rejects
/// degenerate boxes.
fn sanitize(bbox: BBox) -> Option<BBox> {
    let clamp = |v: f32| v.clamp(0.0, 1.0);
    let (mut x1, mut y1, mut x2, mut y2) = (
        clamp(bbox.x1),
        clamp(bbox.y1),
        clamp(bbox.x2),
        clamp(bbox.y2),
    );
    if x2 < x1 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y2 < y1 {
        std::mem::swap(&mut y1, &mut y2);
    }

    let fixed = BBox { x1, y1, x2, y2 };
    if fixed.area() <= 0.0 {
        None
    } else {
        Some(fixed)
    }
}

fn by_score_desc(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Weighted Boxes Fusion.
///
/// `lists[i]` holds the normalized detections of detector `i` and
/// `weights[i]` its weight. Boxes are clustered per label: a box joins the
/// cluster whose current fused box overlaps it most, if that IoU reaches
/// `iou_thr`. The result is sorted by fused score, highest first.
pub fn weighted_boxes_fusion(
    lists: &[Vec<Detection>],
    weights: &[f32],
    config: &FusionConfig,
) -> Vec<FusedDetection> {
    if lists.is_empty() {
        return Vec::new();
    }

    let weights: Vec<f32> = if weights.len() == lists.len() && weights.iter().all(|w| *w > 0.0) {
        weights.to_vec()
    } else {
        tracing::warn!(
            "WBF: got {} weights for {} detector outputs, using equal weights",
            weights.len(),
            lists.len()
        );
        vec![1.0; lists.len()]
    };
    let weight_sum: f32 = weights.iter().sum();

    let mut by_label: BTreeMap<usize, Vec<Candidate>> = BTreeMap::new();
    for (list, &weight) in lists.iter().zip(&weights) {
        for det in list {
            if det.score < config.skip_box_thr {
                continue;
            }
            let Some(bbox) = sanitize(det.bbox) else {
                tracing::debug!("WBF: dropping degenerate box {:?}", det.bbox);
                continue;
            };
            by_label.entry(det.label).or_default().push(Candidate {
                bbox,
                weighted_score: det.score * weight,
            });
        }
    }

    let mut fused = Vec::new();

    for (label, mut candidates) in by_label {
        candidates.sort_by(|a, b| by_score_desc(a.weighted_score, b.weighted_score));

        let mut clusters: Vec<Cluster> = Vec::new();
        for candidate in candidates {
            let mut best: Option<(usize, f32)> = None;
            for (idx, cluster) in clusters.iter().enumerate() {
                let iou = cluster.fused.iou(&candidate.bbox);
                if iou >= config.iou_thr && best.map_or(true, |(_, b)| iou > b) {
                    best = Some((idx, iou));
                }
            }

            match best {
                Some((idx, _)) => clusters[idx].push(candidate),
                None => clusters.push(Cluster::new(candidate)),
            }
        }

        fused.extend(clusters.iter().map(|cluster| Detection {
            bbox: cluster.fused,
            score: cluster.fused_score(lists.len(), weight_sum),
            label,
        }));
    }

    fused.sort_by(|a, b| by_score_desc(a.score, b.score));
    fused
}

/// Apply class-aware Non-Maximum Suppression to remove duplicate detections
pub fn nms(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    let mut sorted = detections;
    sorted.sort_by(|a, b| by_score_desc(a.score, b.score));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }

        keep.push(sorted[i]);

        for j in (i + 1)..sorted.len() {
            if suppressed[j] || sorted[j].label != sorted[i].label {
                continue;
            }

            if sorted[i].bbox.iou(&sorted[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, score: f32, label: usize) -> Detection {
        Detection::new(BBox::new(x1, y1, x2, y2), score, label)
    }

    #[test]
    fn test_overlapping_pair_fuses_into_one() {
        let yolo = vec![det(0.10, 0.10, 0.30, 0.30, 0.9, 1)];
        let second = vec![det(0.11, 0.11, 0.31, 0.31, 0.6, 1)];
        assert!(yolo[0].bbox.iou(&second[0].bbox) > 0.5);

        let fused = weighted_boxes_fusion(&[yolo, second], &[2.0, 1.0], &FusionConfig::default());
        assert_eq!(fused.len(), 1);

        let expected = (2.0 * 0.9 + 1.0 * 0.6) / 3.0;
        assert!((fused[0].score - expected).abs() < 1e-5);
        assert_eq!(fused[0].label, 1);

        // The fused box sits between the two inputs, pulled towards the heavier one.
        let b = fused[0].bbox;
        assert!(b.x1 > 0.10 && b.x1 < 0.11);
        assert!((0.11 - b.x1) > (b.x1 - 0.10));
    }

    #[test]
    fn test_disjoint_boxes_with_different_labels_stay_separate() {
        let yolo = vec![det(0.05, 0.05, 0.20, 0.20, 0.9, 0)];
        let second = vec![det(0.60, 0.60, 0.80, 0.80, 0.9, 3)];

        let fused = weighted_boxes_fusion(&[yolo, second], &[2.0, 1.0], &FusionConfig::default());
        assert_eq!(fused.len(), 2);

        // Each single-detector box keeps its share of the total weight.
        assert!((fused[0].score - 0.9 * 2.0 / 3.0).abs() < 1e-5);
        assert_eq!(fused[0].label, 0);
        assert!((fused[1].score - 0.9 / 3.0).abs() < 1e-5);
        assert_eq!(fused[1].label, 3);
    }

    #[test]
    fn test_same_box_different_labels_not_fused() {
        let a = vec![det(0.1, 0.1, 0.4, 0.4, 0.8, 1)];
        let b = vec![det(0.1, 0.1, 0.4, 0.4, 0.8, 2)];
        let fused = weighted_boxes_fusion(&[a, b], &[1.0, 1.0], &FusionConfig::default());
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn test_low_scores_are_skipped_and_empty_is_valid() {
        let a = vec![det(0.1, 0.1, 0.4, 0.4, 0.3, 1)];
        let b: Vec<Detection> = Vec::new();
        let fused = weighted_boxes_fusion(&[a, b], &[2.0, 1.0], &FusionConfig::default());
        assert!(fused.is_empty());

        assert!(weighted_boxes_fusion(&[], &[], &FusionConfig::default()).is_empty());
    }

    #[test]
    fn test_out_of_range_boxes_are_clipped() {
        let a = vec![det(-0.2, 0.5, 0.3, 1.4, 0.9, 0)];
        let fused = weighted_boxes_fusion(&[a], &[1.0], &FusionConfig::default());
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].bbox, BBox::new(0.0, 0.5, 0.3, 1.0));

        let degenerate = vec![det(0.5, 0.5, 0.5, 0.9, 0.9, 0)];
        assert!(weighted_boxes_fusion(&[degenerate], &[1.0], &FusionConfig::default()).is_empty());
    }

    #[test]
    fn test_nms_basic() {
        let d1 = det(10.0, 10.0, 50.0, 50.0, 0.9, 0);
        let d2 = det(15.0, 15.0, 55.0, 55.0, 0.8, 0);
        let d3 = det(15.0, 15.0, 55.0, 55.0, 0.8, 1);
        let result = nms(vec![d1, d2, d3], 0.5);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].score, 0.9);
    }

    #[test]
    fn test_strategies_share_interface() {
        let lists = vec![
            vec![det(0.1, 0.1, 0.3, 0.3, 0.9, 1)],
            vec![det(0.1, 0.1, 0.3, 0.3, 0.8, 1)],
        ];
        let strategies: Vec<Box<dyn FusionStrategy>> = vec![
            Box::new(WeightedBoxesFusion::default()),
            Box::new(NonMaximumSuppression::default()),
            Box::new(Passthrough),
        ];
        let sizes: Vec<usize> = strategies
            .iter()
            .map(|s| s.fuse(&lists, &[2.0, 1.0]).len())
            .collect();
        assert_eq!(sizes, vec![1, 1, 2]);
    }

    #[test]
    fn test_lone_score_scale_matches_fused_score() {
        let wbf = WeightedBoxesFusion::default();
        let scale = wbf.lone_score_scale(&[2.0, 1.0]);
        assert!((scale - 2.0 / 3.0).abs() < 1e-6);

        let lists = vec![vec![det(0.1, 0.1, 0.3, 0.3, 0.7, 1)], vec![]];
        let fused = wbf.fuse(&lists, &[2.0, 1.0]);
        assert!((fused[0].score - 0.7 * scale).abs() < 1e-6);

        assert_eq!(wbf.lone_score_scale(&[1.0]), 1.0);
        assert_eq!(Passthrough.lone_score_scale(&[2.0, 1.0]), 1.0);
        assert_eq!(NonMaximumSuppression::default().lone_score_scale(&[2.0, 1.0]), 1.0);
    }

    #[test]
    fn test_config_selects_strategy() {
        assert_eq!(FusionConfig::default().strategy().name(), "wbf");

        let config: FusionConfig =
            serde_json::from_str(r#"{ "method": "nms", "skip_box_thr": 0.85 }"#).unwrap();
        let strategy = config.strategy();
        assert_eq!(strategy.name(), "nms");

        let lists = vec![
            vec![det(0.1, 0.1, 0.3, 0.3, 0.9, 1)],
            vec![det(0.5, 0.5, 0.7, 0.7, 0.8, 1)],
        ];
        assert_eq!(strategy.fuse(&lists, &[2.0, 1.0]).len(), 1);
    }

    proptest! {
        #[test]
        fn test_fused_scores_stay_in_unit_range(
            boxes in prop::collection::vec(
                (0.0f32..0.8, 0.0f32..0.8, 0.05f32..0.2, 0.05f32..0.2, 0.0f32..=1.0, 0usize..3, 0usize..2),
                0..40,
            )
        ) {
            let mut lists = vec![Vec::new(), Vec::new()];
            for (x, y, w, h, score, label, list) in boxes {
                lists[list].push(det(x, y, x + w, y + h, score, label));
            }
            let input_count: usize = lists.iter().map(|l| l.len()).sum();

            let fused = weighted_boxes_fusion(&lists, &[2.0, 1.0], &FusionConfig::default());
            prop_assert!(fused.len() <= input_count);
            for d in &fused {
                prop_assert!(d.score >= 0.0 && d.score <= 1.0 + 1e-5);
                prop_assert!(d.bbox.x1 >= -1e-5 && d.bbox.x2 <= 1.0 + 1e-5);
                prop_assert!(d.bbox.y1 >= -1e-5 && d.bbox.y2 <= 1.0 + 1e-5);
            }
            for pair in fused.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
