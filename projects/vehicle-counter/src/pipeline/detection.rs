use crate::error::PipelineError;
use crate::pipeline::types::{BBox, Detection};
use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use usls::models::{RTDETR, YOLO};
use usls::{Config, Image};

/// Vehicle categories the detectors are trained on, in label order.
pub const VEHICLE_CLASSES: [&str; 8] = [
    "bicycle",
    "car",
    "van",
    "truck",
    "tricycle",
    "awning-tricycle",
    "bus",
    "motor",
];

/// Display name for a label, `unknown` when it is outside the list.
pub fn class_name(class_names: &[String], label: usize) -> &str {
    class_names
        .get(label)
        .map(String::as_str)
        .unwrap_or("unknown")
}

/// Anything that can turn a frame into a list of (box, score, label) in pixel
/// coordinates of that frame.
pub trait Detector {
    fn name(&self) -> &str;
    fn infer(&mut self, frame: &Mat) -> Result<Vec<Detection>>;
}

enum Backend {
    Yolo(YOLO),
    RtDetr(RTDETR),
}

/// A usls ONNX model behind the [`Detector`] interface. Handles BGR-to-RGB
/// conversion, confidence filtering and dropping labels outside the class
/// list.
pub struct UslsDetector {
    name: String,
    backend: Backend,
    min_conf: f32,
    num_classes: usize,
}

impl UslsDetector {
    /// Single-stage YOLO-family detector.
    pub fn yolo(model_path: &str, class_names: &[&str], min_conf: f32) -> Result<Self> {
        let config = Config::yolo_detect()
            .with_model_file(model_path)
            .with_class_names(class_names);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config
            .commit()
            .map_err(|e| model_load_error(model_path, e))?;
        let model = YOLO::new(config).map_err(|e| model_load_error(model_path, e))?;

        tracing::info!("Loaded YOLO detector from {}", model_path);
        Ok(Self {
            name: "yolo".to_string(),
            backend: Backend::Yolo(model),
            min_conf,
            num_classes: class_names.len(),
        })
    }

    /// RT-DETR detector, the second opinion of the ensemble.
    pub fn rtdetr(model_path: &str, class_names: &[&str], min_conf: f32) -> Result<Self> {
        let config = Config::default()
            .with_model_file(model_path)
            .with_class_names(class_names);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config
            .commit()
            .map_err(|e| model_load_error(model_path, e))?;
        let model = RTDETR::new(config).map_err(|e| model_load_error(model_path, e))?;

        tracing::info!("Loaded RT-DETR detector from {}", model_path);
        Ok(Self {
            name: "rtdetr".to_string(),
            backend: Backend::RtDetr(model),
            min_conf,
            num_classes: class_names.len(),
        })
    }

    fn forward(&mut self, image: Image) -> Result<Vec<usls::Hbb>> {
        let images = [image];
        let ys = match &mut self.backend {
            Backend::Yolo(model) => model.forward(&images)?,
            Backend::RtDetr(model) => model.forward(&images)?,
        };
        Ok(ys.into_iter().next().map(|y| y.hbbs).unwrap_or_default())
    }
}

fn model_load_error(model_path: &str, err: impl std::fmt::Display) -> anyhow::Error {
    PipelineError::ModelLoad {
        model: model_path.to_string(),
        reason: err.to_string(),
    }
    .into()
}

impl Detector for UslsDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn infer(&mut self, frame: &Mat) -> Result<Vec<Detection>> {
        let (x_corr, y_corr) = match self.backend {
            Backend::RtDetr(_) => rtdetr_correction(frame)?,
            Backend::Yolo(_) => (1.0, 1.0),
        };
        let image = Image::from(mat_to_dynamic_image(frame)?);
        let hbbs = self.forward(image)?;

        let detections: Vec<Detection> = hbbs
            .into_iter()
            .filter_map(|hbb| {
                let score = hbb.confidence().unwrap_or(0.0);
                let label = hbb.id()?;
                if score < self.min_conf || label >= self.num_classes {
                    return None;
                }
                let x = hbb.xmin() * x_corr;
                let y = hbb.ymin() * y_corr;
                let w = hbb.width() * x_corr;
                let h = hbb.height() * y_corr;
                Some(Detection::new(
                    BBox::new(x, y, x + w, y + h),
                    score,
                    label,
                ))
            })
            .collect();

        tracing::debug!("{}: {} detections", self.name, detections.len());
        Ok(detections)
    }
}

/// usls RT-DETR letterboxes non-square inputs but scales boxes back as if the
/// input was square; stretch the long side back out.
fn rtdetr_correction(frame: &Mat) -> Result<(f32, f32)> {
    let size = frame.size()?;
    let img_w = size.width as f32;
    let img_h = size.height as f32;

    Ok(if img_w > img_h {
        (img_w / img_h, 1.0)
    } else if img_h > img_w {
        (1.0, img_h / img_w)
    } else {
        (1.0, 1.0)
    })
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    let width = size.width as u32;
    let height = size.height as u32;

    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();

    let img_buffer = ImageBuffer::<Rgb<u8>, _>::from_vec(width, height, buffer)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}
