// Per-track crossing state machine.
//
// Each track id gets a small record: which side of the baseline it started on
// and a bounded history of vertical centers. A track is counted at most once.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossingConfig {
    /// Number of vertical-center samples kept per track
    pub history_cap: usize,
    /// Consecutive samples on the far side needed to confirm a crossing
    pub confirm_window: usize,
}

impl Default for CrossingConfig {
    fn default() -> Self {
        Self {
            history_cap: 10,
            confirm_window: 3,
        }
    }
}

impl CrossingConfig {
    /// The window can never be wider than the history that feeds it.
    fn normalized(mut self) -> Self {
        self.history_cap = self.history_cap.max(1);
        self.confirm_window = self.confirm_window.clamp(1, self.history_cap);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossingState {
    Above,
    Below,
    Counted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone)]
pub struct TrackRecord {
    pub state: CrossingState,
    pub history: VecDeque<i32>,
}

/// Baseline y for a frame of the given height.
pub fn baseline_for_height(frame_height: i32, ratio: f32) -> i32 {
    (frame_height as f64 * ratio.clamp(0.0, 1.0) as f64).floor() as i32
}

pub struct CrossingCounter {
    baseline_y: i32,
    config: CrossingConfig,
    tracks: HashMap<u64, TrackRecord>,
    total_in: usize,
    total_out: usize,
}

impl CrossingCounter {
    pub fn new(baseline_y: i32, config: CrossingConfig) -> Self {
        Self {
            baseline_y,
            config: config.normalized(),
            tracks: HashMap::new(),
            total_in: 0,
            total_out: 0,
        }
    }

    pub fn baseline_y(&self) -> i32 {
        self.baseline_y
    }

    /// Feeds one vertical-center sample for a track and returns the crossing
    /// it completes, if any.
    ///
    /// Nothing is decided before the track has `confirm_window` samples,
    /// even if the first one is already on or past the baseline. A track's
    /// side is fixed by its first sample (on the baseline counts as below),
    /// so a track that appears on the line and then moves down is never
    /// counted as in.
    pub fn observe(&mut self, track_id: u64, center_y: i32) -> Option<Direction> {
        let baseline = self.baseline_y;
        let cap = self.config.history_cap;
        let window = self.config.confirm_window;

        let record = self.tracks.entry(track_id).or_insert_with(|| TrackRecord {
            state: if center_y < baseline {
                CrossingState::Above
            } else {
                CrossingState::Below
            },
            history: VecDeque::with_capacity(cap),
        });

        record.history.push_back(center_y);
        while record.history.len() > cap {
            record.history.pop_front();
        }

        if record.history.len() < window {
            return None;
        }
        let recent = record.history.iter().skip(record.history.len() - window);

        let direction = match record.state {
            CrossingState::Above if recent.clone().all(|&y| y >= baseline) => Direction::In,
            CrossingState::Below if recent.clone().all(|&y| y <= baseline) => Direction::Out,
            _ => return None,
        };

        record.state = CrossingState::Counted;
        match direction {
            Direction::In => self.total_in += 1,
            Direction::Out => self.total_out += 1,
        }
        Some(direction)
    }

    pub fn total_in(&self) -> usize {
        self.total_in
    }

    pub fn total_out(&self) -> usize {
        self.total_out
    }

    #[cfg(test)]
    pub fn track(&self, track_id: u64) -> Option<&TrackRecord> {
        self.tracks.get(&track_id)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Tracks that were seen but never completed a crossing. They stay in the
    /// map until the counter is dropped.
    pub fn uncounted_tracks(&self) -> usize {
        self.tracks
            .values()
            .filter(|t| t.state != CrossingState::Counted)
            .count()
    }
}
