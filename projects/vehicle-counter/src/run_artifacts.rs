// Run artifact struct definitions
//
// Settings are read from an optional JSON file; summaries are written next to
// every produced output as `<stem>_result.json`.

use crate::pipeline::crossing::{CrossingConfig, Direction};
use crate::pipeline::detection::VEHICLE_CLASSES;
use crate::pipeline::fusion::FusionConfig;
use crate::pipeline::tracker::TrackerConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Tunables of one pipeline invocation. Every field has a default so a
/// settings file only needs the values it changes.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PipelineSettings {
    /// Confidence floor applied to the YOLO detector output
    pub yolo_conf: f32,
    /// Confidence floor applied to the RT-DETR detector output
    pub rtdetr_conf: f32,
    /// Fusion weight per detector, YOLO first
    pub weights: Vec<f32>,
    pub fusion: FusionConfig,
    pub tracker: TrackerConfig,
    pub crossing: CrossingConfig,
    /// Baseline position as a fraction of the frame height
    pub baseline_ratio: f32,
    pub class_names: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            yolo_conf: 0.5,
            rtdetr_conf: 0.8,
            weights: vec![2.0, 1.0],
            fusion: FusionConfig::default(),
            tracker: TrackerConfig::default(),
            crossing: CrossingConfig::default(),
            baseline_ratio: 0.5,
            class_names: VEHICLE_CLASSES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PipelineSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {:?}", path))?;
        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid settings file {:?}", path))?;
        Ok(settings)
    }

    /// Defaults when no file is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CountResult {
    Image {
        total: usize,
        per_class: BTreeMap<String, usize>,
    },
    Video {
        total_in: usize,
        total_out: usize,
        frames: usize,
        per_class: BTreeMap<String, usize>,
    },
}

impl CountResult {
    pub fn headline(&self) -> String {
        match self {
            CountResult::Image { total, .. } => format!("Total vehicles: {}", total),
            CountResult::Video {
                total_in,
                total_out,
                ..
            } => format!("In: {}, Out: {}", total_in, total_out),
        }
    }
}

/// JSON summary written next to an output file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CountSummary {
    pub input: PathBuf,
    pub output: PathBuf,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: CountResult,
}

impl CountSummary {
    /// Summary of a run that finishes now.
    pub fn finished(
        input: &Path,
        output: &Path,
        mode: &str,
        started_at: DateTime<Utc>,
        result: CountResult,
    ) -> Self {
        Self {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            mode: mode.to_string(),
            started_at,
            finished_at: Utc::now(),
            result,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write summary {:?}", path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// One line of the crossing-events CSV.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CrossingRecord {
    pub frame_index: usize,
    pub track_id: u64,
    pub direction: Direction,
    pub center_y: i32,
    pub class_name: String,
}

pub fn write_events_csv(path: &Path, events: &[CrossingRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create events file {:?}", path))?;
    for event in events {
        writer.serialize(event)?;
    }
    writer.flush()?;
    Ok(())
}
