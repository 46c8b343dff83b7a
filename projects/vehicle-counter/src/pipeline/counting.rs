// Per-video counting: detect, fuse, track, update crossing state, render.
//
// Frames are handled strictly in order on the calling thread.

use crate::error::PipelineError;
use crate::pipeline::crossing::{baseline_for_height, CrossingCounter};
use crate::pipeline::detection::class_name;
use crate::pipeline::ensemble::Ensemble;
use crate::pipeline::render;
use crate::pipeline::tracker::{ByteTracker, TrackedDetection, Tracker};
use crate::pipeline::types::Detection;
use crate::run_artifacts::{CountResult, CrossingRecord, PipelineSettings};
use crate::video::opencv_reader::OpencvReader;
use crate::video::processor::{process_video, VideoSession};
use crate::video::writer::OpencvWriter;
use crate::video::{FrameSink, VideoReader};
use anyhow::Result;
use opencv::core::Mat;
use std::collections::BTreeMap;
use std::path::Path;

pub struct VideoCounter<'a> {
    ensemble: &'a mut Ensemble,
    tracker: Box<dyn Tracker>,
    crossing: CrossingCounter,
    class_names: Vec<String>,
    frame_index: usize,
    events: Vec<CrossingRecord>,
}

impl<'a> VideoCounter<'a> {
    pub fn new(ensemble: &'a mut Ensemble, settings: &PipelineSettings, frame_height: i32) -> Self {
        let baseline_y = baseline_for_height(frame_height, settings.baseline_ratio);
        // Tracker thresholds are set for raw detector scores.
        let scale = ensemble.score_scale();
        if scale < 1.0 {
            tracing::debug!("Scaling tracker score thresholds by {:.3}", scale);
        }
        Self {
            ensemble,
            tracker: Box::new(ByteTracker::new(settings.tracker.scaled(scale))),
            crossing: CrossingCounter::new(baseline_y, settings.crossing.clone()),
            class_names: settings.class_names.clone(),
            frame_index: 0,
            events: Vec::new(),
        }
    }

    /// Runs the whole per-frame pipeline and draws the overlays onto `frame`.
    pub fn process_frame(&mut self, frame: &mut Mat) -> Result<()> {
        let detections = self.ensemble.detect(frame)?;
        let tracks = self.update(&detections);

        render::draw_baseline(frame, self.crossing.baseline_y())?;
        render::draw_tracks(frame, &tracks)?;
        render::draw_counts(frame, self.total_in(), self.total_out())?;
        Ok(())
    }

    /// Tracking and crossing update for one frame of fused pixel detections.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<TrackedDetection> {
        let tracks = self.tracker.update(detections);

        for track in &tracks {
            let (_, center_y) = track.bbox.to_pixels().center();
            if let Some(direction) = self.crossing.observe(track.track_id, center_y) {
                let name = class_name(&self.class_names, track.label).to_string();
                tracing::debug!(
                    "Frame {}: track {} ({}) crossed {:?}",
                    self.frame_index,
                    track.track_id,
                    name,
                    direction
                );
                self.events.push(CrossingRecord {
                    frame_index: self.frame_index,
                    track_id: track.track_id,
                    direction,
                    center_y,
                    class_name: name,
                });
            }
        }

        self.frame_index += 1;
        tracks
    }

    pub fn total_in(&self) -> usize {
        self.crossing.total_in()
    }

    pub fn total_out(&self) -> usize {
        self.crossing.total_out()
    }

    pub fn frames(&self) -> usize {
        self.frame_index
    }

    pub fn into_count(self) -> VideoCount {
        let uncounted = self.crossing.uncounted_tracks();
        if uncounted > 0 {
            tracing::info!(
                "{} of {} tracks never crossed the baseline ({} still tracked)",
                uncounted,
                self.crossing.track_count(),
                self.tracker.active_tracks()
            );
        }

        let mut per_class = BTreeMap::new();
        for event in &self.events {
            *per_class.entry(event.class_name.clone()).or_insert(0) += 1;
        }

        VideoCount {
            total_in: self.crossing.total_in(),
            total_out: self.crossing.total_out(),
            frames: self.frame_index,
            per_class,
            events: self.events,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoCount {
    pub total_in: usize,
    pub total_out: usize,
    pub frames: usize,
    /// Crossing events per class name
    pub per_class: BTreeMap<String, usize>,
    pub events: Vec<CrossingRecord>,
}

impl From<&VideoCount> for CountResult {
    fn from(count: &VideoCount) -> Self {
        CountResult::Video {
            total_in: count.total_in,
            total_out: count.total_out,
            frames: count.frames,
            per_class: count.per_class.clone(),
        }
    }
}

/// Counts one video end to end. The output keeps the input resolution and
/// frame rate.
pub fn count_video(
    input: &Path,
    output: &Path,
    ensemble: &mut Ensemble,
    settings: &PipelineSettings,
    show_progress: bool,
) -> Result<VideoCount> {
    let reader = OpencvReader::open(input)?;
    let (width, height) = reader.frame_size()?;
    let fps = reader.source_fps()?;
    let mut writer = OpencvWriter::create(output, fps, width, height)?;

    let session = if show_progress {
        VideoSession::new(Box::new(reader))?
    } else {
        VideoSession::quiet(Box::new(reader))
    };

    let count = match count_frames(input, session, &mut writer, ensemble, settings, height) {
        Ok(count) => count,
        Err(e) => {
            if writer.frames_written() == 0 {
                // Nothing was encoded; do not leave an empty result behind.
                if let Err(rm) = std::fs::remove_file(output) {
                    tracing::warn!("Could not remove empty output {:?}: {}", output, rm);
                }
            }
            return Err(e);
        }
    };
    tracing::info!(
        "Counted {:?}: in={}, out={} over {} frames",
        input,
        count.total_in,
        count.total_out,
        count.frames
    );
    Ok(count)
}

/// Frame loop shared by files and in-memory sources. A source that yields no
/// frame at all is unreadable; `source` names it in that error.
pub fn count_frames(
    source: &Path,
    session: VideoSession,
    sink: &mut dyn FrameSink,
    ensemble: &mut Ensemble,
    settings: &PipelineSettings,
    frame_height: i32,
) -> Result<VideoCount> {
    let mut counter = VideoCounter::new(ensemble, settings, frame_height);

    let stats = process_video(session, |mut frame: Mat| -> Result<()> {
        counter.process_frame(&mut frame)?;
        sink.write_frame(&frame)
    });
    // Whatever was written so far is still a valid video.
    sink.finish()?;
    let stats = stats?;
    if stats.processed_frames == 0 {
        return Err(PipelineError::unreadable(source, "no decodable frames").into());
    }

    tracing::debug!(
        "Processed {} frames in {:.1}s",
        counter.frames(),
        stats.duration.as_secs_f64()
    );
    Ok(counter.into_count())
}
