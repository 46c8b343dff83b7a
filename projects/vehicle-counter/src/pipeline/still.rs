use crate::error::PipelineError;
use crate::pipeline::detection::class_name;
use crate::pipeline::ensemble::Ensemble;
use crate::pipeline::render;
use crate::pipeline::types::Detection;
use crate::run_artifacts::CountResult;
use anyhow::Result;
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageCount {
    pub total: usize,
    pub per_class: BTreeMap<String, usize>,
}

impl From<ImageCount> for CountResult {
    fn from(count: ImageCount) -> Self {
        CountResult::Image {
            total: count.total,
            per_class: count.per_class,
        }
    }
}

/// Every detection that survived thresholds and fusion counts as one vehicle.
pub fn tally(detections: &[Detection], class_names: &[String]) -> ImageCount {
    let mut per_class = BTreeMap::new();
    for det in detections {
        let name = class_name(class_names, det.label);
        *per_class.entry(name.to_string()).or_insert(0) += 1;
    }
    ImageCount {
        total: detections.len(),
        per_class,
    }
}

/// Detects on `frame`, draws the result onto it and returns the tally.
pub fn annotate(
    frame: &mut Mat,
    ensemble: &mut Ensemble,
    class_names: &[String],
) -> Result<ImageCount> {
    let detections = ensemble.detect(frame)?;
    let boxes: Vec<_> = detections.iter().map(|d| d.bbox).collect();
    render::draw_detections(frame, &boxes)?;
    Ok(tally(&detections, class_names))
}

pub fn count_image(
    input: &Path,
    output: &Path,
    ensemble: &mut Ensemble,
    class_names: &[String],
) -> Result<ImageCount> {
    let input_str = input
        .to_str()
        .ok_or_else(|| PipelineError::unreadable(input, "path is not valid UTF-8"))?;
    let mut frame = imgcodecs::imread(input_str, imgcodecs::IMREAD_COLOR)
        .map_err(|e| PipelineError::unreadable(input, e))?;
    if frame.empty() {
        return Err(PipelineError::unreadable(input, "not a decodable image").into());
    }

    let count = annotate(&mut frame, ensemble, class_names)?;

    let output_str = output
        .to_str()
        .ok_or_else(|| PipelineError::encode(output, "path is not valid UTF-8"))?;
    let written = imgcodecs::imwrite(output_str, &frame, &Vector::new())
        .map_err(|e| PipelineError::encode(output, e))?;
    if !written {
        return Err(PipelineError::encode(output, "imwrite refused the image").into());
    }

    tracing::info!("Counted {} vehicles in {:?}", count.total, input);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ensemble::testing::{blank_frame, ScriptedDetector};
    use crate::pipeline::fusion::WeightedBoxesFusion;
    use crate::pipeline::types::BBox;
    use crate::run_artifacts::PipelineSettings;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, score: f32, label: usize) -> Detection {
        Detection::new(BBox::new(x1, y1, x2, y2), score, label)
    }

    #[test]
    fn test_tally_by_class_name() {
        let names = PipelineSettings::default().class_names;
        let dets = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.9, 1),
            det(20.0, 0.0, 30.0, 10.0, 0.8, 1),
            det(40.0, 0.0, 50.0, 10.0, 0.7, 6),
            det(60.0, 0.0, 70.0, 10.0, 0.7, 42),
        ];
        let count = tally(&dets, &names);
        assert_eq!(count.total, 4);
        assert_eq!(count.per_class.get("car"), Some(&2));
        assert_eq!(count.per_class.get("bus"), Some(&1));
        assert_eq!(count.per_class.get("unknown"), Some(&1));
    }

    #[test]
    fn test_fused_still_counts_consensus_boxes() {
        let names = PipelineSettings::default().class_names;
        let yolo = ScriptedDetector::constant(
            "yolo",
            vec![
                det(10.0, 10.0, 60.0, 40.0, 0.9, 1),
                det(100.0, 100.0, 150.0, 140.0, 0.8, 3),
            ],
            1,
        );
        let other =
            ScriptedDetector::constant("other", vec![det(11.0, 10.0, 61.0, 41.0, 0.9, 1)], 1);
        let mut ensemble = Ensemble::new(Box::new(WeightedBoxesFusion::default()))
            .with_detector(Box::new(yolo), 2.0)
            .with_detector(Box::new(other), 1.0);

        let mut frame = blank_frame(200, 200);
        let count = annotate(&mut frame, &mut ensemble, &names).unwrap();
        assert_eq!(count.total, 2);
        assert_eq!(count.per_class.get("truck"), Some(&1));
    }

    #[test]
    fn test_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("street.png");
        let output = dir.path().join("street_result.png");
        imgcodecs::imwrite(input.to_str().unwrap(), &blank_frame(80, 60), &Vector::new()).unwrap();

        let mut ensemble = Ensemble::single(Box::new(ScriptedDetector::constant(
            "yolo",
            vec![det(5.0, 5.0, 30.0, 30.0, 0.9, 0)],
            1,
        )));
        let names = PipelineSettings::default().class_names;
        let count = count_image(&input, &output, &mut ensemble, &names).unwrap();

        assert_eq!(count.total, 1);
        assert_eq!(count.per_class.get("bicycle"), Some(&1));
        let written = imgcodecs::imread(output.to_str().unwrap(), imgcodecs::IMREAD_COLOR).unwrap();
        assert_eq!((written.cols(), written.rows()), (80, 60));
    }

    #[test]
    fn test_unreadable_image_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("broken.jpg");
        std::fs::write(&input, b"definitely not a jpeg").unwrap();

        let mut ensemble = Ensemble::single(Box::new(ScriptedDetector::new("yolo", vec![])));
        let err = count_image(
            &input,
            &dir.path().join("broken_result.jpg"),
            &mut ensemble,
            &[],
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Unreadable { .. })
        ));
    }
}
