use crate::error::PipelineError;
use crate::pipeline::ensemble::{DetectorMode, EnsembleConfig};
use crate::run_artifacts::PipelineSettings;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// YOLO detector weights (ONNX)
    #[arg(long, global = true, env = "VEHICLE_COUNTER_YOLO_MODEL")]
    pub yolo_model: Option<String>,

    /// RT-DETR detector weights (ONNX), needed in fused mode
    #[arg(long, global = true, env = "VEHICLE_COUNTER_RTDETR_MODEL")]
    pub rtdetr_model: Option<String>,

    /// Run both detectors and fuse their boxes, or YOLO alone
    #[arg(long, global = true, value_enum, default_value_t = DetectorMode::Fused, env = "VEHICLE_COUNTER_MODE")]
    pub mode: DetectorMode,

    /// JSON file overriding pipeline thresholds
    #[arg(long, global = true, env = "VEHICLE_COUNTER_SETTINGS")]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Count vehicles in one image
    Image {
        input: PathBuf,
        /// Defaults to `<input>_result.<ext>` next to the input
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Count vehicles crossing the baseline of one video
    Video {
        input: PathBuf,
        /// Defaults to `<input>_result.<ext>` next to the input
        #[arg(long)]
        output: Option<PathBuf>,
        /// Write every crossing event to this CSV file
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Process files and directories in the background, one at a time
    Batch {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long, env = "VEHICLE_COUNTER_OUTPUT_DIR")]
        output_dir: PathBuf,
        /// Save the last frame of the last processed video as a still
        #[arg(long)]
        preview: bool,
    },
    /// List previously produced results
    History {
        #[arg(long, env = "VEHICLE_COUNTER_OUTPUT_DIR")]
        output_dir: PathBuf,
    },
    /// Serve the HTTP API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,

        /// Port to bind to
        #[arg(long, default_value_t = 12206)]
        port: u16,

        #[arg(long, env = "VEHICLE_COUNTER_OUTPUT_DIR")]
        output_dir: PathBuf,
    },
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn load_settings(&self) -> Result<PipelineSettings> {
        PipelineSettings::load_or_default(self.settings.as_deref())
    }

    /// Model paths, mode and settings for building an ensemble.
    pub fn ensemble_config(&self) -> Result<EnsembleConfig> {
        let yolo_model = self.yolo_model.clone().ok_or_else(|| PipelineError::ModelLoad {
            model: "yolo".to_string(),
            reason: "no --yolo-model given".to_string(),
        })?;

        Ok(EnsembleConfig {
            yolo_model,
            rtdetr_model: self.rtdetr_model.clone(),
            mode: self.mode,
            settings: self.load_settings()?,
        })
    }
}
