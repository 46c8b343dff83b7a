//! Multi-object tracking for fused detections.
//!
//! [`ByteTracker`] follows the ByteTrack association scheme: high-score
//! detections are matched first, low-score detections are then used to rescue
//! tracks that went unmatched, and only confident leftovers start new tracks.
//! Motion is a constant-velocity model on the box center and size.

use crate::pipeline::types::{BBox, Detection};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Detections at or above this take part in the first association round
    pub high_thresh: f32,
    /// Detections below this are ignored entirely
    pub low_thresh: f32,
    /// Unmatched detections at or above this start a new track
    pub new_track_thresh: f32,
    /// Minimum IoU for the first (high-score) association round
    pub match_iou: f32,
    /// Minimum IoU for the second (low-score) association round
    pub low_match_iou: f32,
    /// Frames a track may go unmatched before it is dropped
    pub track_buffer: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            high_thresh: 0.5,
            low_thresh: 0.1,
            new_track_thresh: 0.5,
            match_iou: 0.2,
            low_match_iou: 0.5,
            track_buffer: 30,
        }
    }
}

impl TrackerConfig {
    /// Same config with the score thresholds multiplied by `factor`, for
    /// detections whose scores were rescaled upstream.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            high_thresh: self.high_thresh * factor,
            low_thresh: self.low_thresh * factor,
            new_track_thresh: self.new_track_thresh * factor,
            ..self.clone()
        }
    }
}

/// A detection that the tracker attached to a persistent identity this frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackedDetection {
    pub track_id: u64,
    pub bbox: BBox,
    pub score: f32,
    pub label: usize,
}

/// Assigns persistent identities to per-frame detections.
pub trait Tracker {
    /// Consumes one frame of detections (pixel coordinates) and returns the
    /// tracks matched on that frame.
    fn update(&mut self, detections: &[Detection]) -> Vec<TrackedDetection>;

    /// Number of tracks currently alive (matched or coasting).
    fn active_tracks(&self) -> usize;
}

/// Constant-velocity state on (cx, cy, w, h) with exponentially smoothed
/// velocity.
#[derive(Clone, Debug)]
struct MotionModel {
    state: [f32; 4],
    velocity: [f32; 4],
    smoothing: f32,
}

impl MotionModel {
    fn new(bbox: &BBox) -> Self {
        Self {
            state: Self::measure(bbox),
            velocity: [0.0; 4],
            smoothing: 0.5,
        }
    }

    fn measure(bbox: &BBox) -> [f32; 4] {
        let (cx, cy) = bbox.center();
        [cx, cy, bbox.width(), bbox.height()]
    }

    fn predict(&mut self) {
        for i in 0..4 {
            self.state[i] += self.velocity[i];
        }
        // Size must not collapse while coasting.
        self.state[2] = self.state[2].max(1.0);
        self.state[3] = self.state[3].max(1.0);
    }

    fn update(&mut self, bbox: &BBox) {
        let measured = Self::measure(bbox);
        for i in 0..4 {
            let observed_velocity = measured[i] - self.state[i] + self.velocity[i];
            self.velocity[i] =
                self.smoothing * observed_velocity + (1.0 - self.smoothing) * self.velocity[i];
        }
        self.state = measured;
    }

    fn bbox(&self) -> BBox {
        let [cx, cy, w, h] = self.state;
        BBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }
}

#[derive(Clone, Debug)]
struct TrackSlot {
    id: u64,
    motion: MotionModel,
    frames_lost: u32,
}

pub struct ByteTracker {
    config: TrackerConfig,
    tracks: Vec<TrackSlot>,
    next_id: u64,
}

impl ByteTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Greedy IoU matching between `candidates` (indices into `detections`)
    /// and `track_indices`. Returns (detection index, track index) pairs.
    fn associate(
        &self,
        detections: &[Detection],
        candidates: &[usize],
        track_indices: &[usize],
        min_iou: f32,
    ) -> Vec<(usize, usize)> {
        if candidates.is_empty() || track_indices.is_empty() {
            return Vec::new();
        }

        let mut pairs = Vec::new();
        for &det_idx in candidates {
            for &track_idx in track_indices {
                let predicted = self.tracks[track_idx].motion.bbox();
                let iou = predicted.iou(&detections[det_idx].bbox);
                if iou >= min_iou {
                    pairs.push((iou, det_idx, track_idx));
                }
            }
        }

        pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut used_det = vec![false; detections.len()];
        let mut used_track = vec![false; self.tracks.len()];
        let mut assignments = Vec::new();

        for (_, det_idx, track_idx) in pairs {
            if !used_det[det_idx] && !used_track[track_idx] {
                used_det[det_idx] = true;
                used_track[track_idx] = true;
                assignments.push((det_idx, track_idx));
            }
        }

        assignments
    }
}

impl Default for ByteTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl Tracker for ByteTracker {
    fn update(&mut self, detections: &[Detection]) -> Vec<TrackedDetection> {
        for track in &mut self.tracks {
            track.motion.predict();
        }

        let (high, low): (Vec<usize>, Vec<usize>) = (0..detections.len())
            .filter(|&i| detections[i].score >= self.config.low_thresh)
            .partition(|&i| detections[i].score >= self.config.high_thresh);

        let all_tracks: Vec<usize> = (0..self.tracks.len()).collect();
        let mut matches = self.associate(detections, &high, &all_tracks, self.config.match_iou);

        let mut track_matched = vec![false; self.tracks.len()];
        for &(_, track_idx) in &matches {
            track_matched[track_idx] = true;
        }

        let remaining_tracks: Vec<usize> = all_tracks
            .iter()
            .copied()
            .filter(|&t| !track_matched[t])
            .collect();
        let rescued = self.associate(detections, &low, &remaining_tracks, self.config.low_match_iou);
        for &(_, track_idx) in &rescued {
            track_matched[track_idx] = true;
        }
        matches.extend(rescued);

        let mut det_matched = vec![false; detections.len()];
        let mut output = Vec::with_capacity(matches.len());

        for (det_idx, track_idx) in matches {
            det_matched[det_idx] = true;
            let det = &detections[det_idx];
            let track = &mut self.tracks[track_idx];
            track.motion.update(&det.bbox);
            track.frames_lost = 0;
            output.push(TrackedDetection {
                track_id: track.id,
                bbox: det.bbox,
                score: det.score,
                label: det.label,
            });
        }

        for (track, matched) in self.tracks.iter_mut().zip(&track_matched) {
            if !matched {
                track.frames_lost += 1;
            }
        }
        let buffer = self.config.track_buffer;
        self.tracks.retain(|t| t.frames_lost <= buffer);

        for &det_idx in &high {
            let det = &detections[det_idx];
            if det_matched[det_idx] || det.score < self.config.new_track_thresh {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            tracing::debug!("Tracker: new track {} at {:?}", id, det.bbox);
            self.tracks.push(TrackSlot {
                id,
                motion: MotionModel::new(&det.bbox),
                frames_lost: 0,
            });
            output.push(TrackedDetection {
                track_id: id,
                bbox: det.bbox,
                score: det.score,
                label: det.label,
            });
        }

        output
    }

    fn active_tracks(&self) -> usize {
        self.tracks.len()
    }
}
