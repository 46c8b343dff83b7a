// Detector ensemble: N weighted detectors behind one swappable fusion strategy.
//
// Detectors report pixel boxes; fusion strategies work on normalized boxes.
// The ensemble owns that conversion and hands back integer-pixel detections.

use crate::error::PipelineError;
use crate::pipeline::detection::{Detector, UslsDetector};
use crate::pipeline::fusion::{FusionStrategy, Passthrough};
use crate::pipeline::types::{Detection, FusedDetection};
use crate::run_artifacts::PipelineSettings;
use anyhow::{anyhow, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DetectorMode {
    /// YOLO and RT-DETR fused with Weighted Boxes Fusion
    Fused,
    /// YOLO alone
    Single,
}

impl DetectorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorMode::Fused => "fused",
            DetectorMode::Single => "single",
        }
    }
}

struct Member {
    detector: Box<dyn Detector>,
    weight: f32,
}

pub struct Ensemble {
    members: Vec<Member>,
    strategy: Box<dyn FusionStrategy>,
}

impl Ensemble {
    pub fn new(strategy: Box<dyn FusionStrategy>) -> Self {
        Self {
            members: Vec::new(),
            strategy,
        }
    }

    /// One detector, no fusion.
    pub fn single(detector: Box<dyn Detector>) -> Self {
        Self::new(Box::new(Passthrough)).with_detector(detector, 1.0)
    }

    pub fn with_detector(mut self, detector: Box<dyn Detector>, weight: f32) -> Self {
        self.members.push(Member { detector, weight });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn describe(&self) -> String {
        let names: Vec<&str> = self.members.iter().map(|m| m.detector.name()).collect();
        format!("{} [{}]", self.strategy.name(), names.join(", "))
    }

    /// How much fusion shrinks the score of a box only the first detector
    /// saw. 1.0 when scores pass through unchanged.
    pub fn score_scale(&self) -> f32 {
        let weights: Vec<f32> = self.members.iter().map(|m| m.weight).collect();
        self.strategy.lone_score_scale(&weights)
    }

    /// Runs every detector on `frame` and returns the fused detections in
    /// integer pixel coordinates.
    pub fn detect(&mut self, frame: &Mat) -> Result<Vec<FusedDetection>> {
        let size = frame.size()?;
        if size.width <= 0 || size.height <= 0 {
            return Err(anyhow!("Cannot run detectors on an empty frame"));
        }
        if self.is_empty() {
            return Err(anyhow!("Ensemble has no detectors"));
        }

        let mut outputs = Vec::with_capacity(self.members.len());
        for member in &mut self.members {
            outputs.push(member.detector.infer(frame)?);
        }
        let weights: Vec<f32> = self.members.iter().map(|m| m.weight).collect();

        Ok(fuse_outputs(
            self.strategy.as_ref(),
            &outputs,
            &weights,
            size.width as f32,
            size.height as f32,
        ))
    }
}

/// Normalizes per-detector pixel outputs, fuses them and maps the result back
/// to truncated pixel coordinates of a `width` x `height` frame.
pub fn fuse_outputs(
    strategy: &dyn FusionStrategy,
    outputs: &[Vec<Detection>],
    weights: &[f32],
    width: f32,
    height: f32,
) -> Vec<FusedDetection> {
    let normalized: Vec<Vec<Detection>> = outputs
        .iter()
        .map(|list| {
            list.iter()
                .map(|d| Detection::new(d.bbox.normalized(width, height), d.score, d.label))
                .collect()
        })
        .collect();

    strategy
        .fuse(&normalized, weights)
        .into_iter()
        .map(|d| {
            let pixels = d.bbox.denormalized(width, height).to_pixels();
            Detection::new(pixels.to_bbox(), d.score, d.label)
        })
        .collect()
}

/// Everything needed to load an ensemble. Plain data, so it can be moved onto
/// a worker thread and the models loaded there.
#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    pub yolo_model: String,
    pub rtdetr_model: Option<String>,
    pub mode: DetectorMode,
    pub settings: PipelineSettings,
}

impl EnsembleConfig {
    /// Loads the model weights. Any failure here is a [`PipelineError::ModelLoad`].
    pub fn build(&self) -> Result<Ensemble> {
        let rtdetr_model = match self.mode {
            DetectorMode::Single => None,
            DetectorMode::Fused => Some(self.rtdetr_model.as_deref().ok_or_else(|| {
                PipelineError::ModelLoad {
                    model: "rtdetr".to_string(),
                    reason: "fused mode needs --rtdetr-model".to_string(),
                }
            })?),
        };

        let class_names: Vec<&str> = self.settings.class_names.iter().map(String::as_str).collect();
        let yolo = UslsDetector::yolo(&self.yolo_model, &class_names, self.settings.yolo_conf)?;

        let ensemble = match rtdetr_model {
            None => Ensemble::single(Box::new(yolo)),
            Some(rtdetr_model) => {
                let rtdetr =
                    UslsDetector::rtdetr(rtdetr_model, &class_names, self.settings.rtdetr_conf)?;

                let weight = |i: usize| self.settings.weights.get(i).copied().unwrap_or(1.0);
                Ensemble::new(self.settings.fusion.strategy())
                    .with_detector(Box::new(yolo), weight(0))
                    .with_detector(Box::new(rtdetr), weight(1))
            }
        };

        tracing::info!("Ensemble ready: {}", ensemble.describe());
        Ok(ensemble)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted per-frame outputs; an exhausted script yields nothing.
    pub struct ScriptedDetector {
        pub name: String,
        pub frames: VecDeque<Vec<Detection>>,
    }

    impl ScriptedDetector {
        pub fn new(name: &str, frames: Vec<Vec<Detection>>) -> Self {
            Self {
                name: name.to_string(),
                frames: frames.into(),
            }
        }

        /// Returns the same detections on every frame.
        pub fn constant(name: &str, detections: Vec<Detection>, frames: usize) -> Self {
            Self::new(name, vec![detections; frames])
        }
    }

    impl Detector for ScriptedDetector {
        fn name(&self) -> &str {
            &self.name
        }

        fn infer(&mut self, _frame: &Mat) -> Result<Vec<Detection>> {
            Ok(self.frames.pop_front().unwrap_or_default())
        }
    }

    pub fn blank_frame(width: i32, height: i32) -> Mat {
        Mat::new_rows_cols_with_default(
            height,
            width,
            opencv::core::CV_8UC3,
            opencv::core::Scalar::all(0.0),
        )
        .unwrap()
    }
}
