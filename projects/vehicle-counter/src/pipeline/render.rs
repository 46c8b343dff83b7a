use crate::pipeline::tracker::TrackedDetection;
use crate::pipeline::types::BBox;
use anyhow::Result;
use opencv::core::{Mat, Point, Rect, Scalar};
use opencv::imgproc::{line, put_text, rectangle, FONT_HERSHEY_SIMPLEX, LINE_8};
use opencv::prelude::*;

// BGR
fn green() -> Scalar {
    Scalar::new(0.0, 255.0, 0.0, 0.0)
}

fn red() -> Scalar {
    Scalar::new(0.0, 0.0, 255.0, 0.0)
}

fn yellow() -> Scalar {
    Scalar::new(0.0, 255.0, 255.0, 0.0)
}

fn draw_box(frame: &mut Mat, bbox: &BBox) -> Result<()> {
    let px = bbox.to_pixels();
    let rect = Rect::new(px.x1, px.y1, px.x2 - px.x1, px.y2 - px.y1);
    rectangle(frame, rect, green(), 2, LINE_8, 0)?;
    Ok(())
}

fn draw_label(frame: &mut Mat, text: &str, origin: Point, scale: f64, color: Scalar) -> Result<()> {
    put_text(
        frame,
        text,
        origin,
        FONT_HERSHEY_SIMPLEX,
        scale,
        color,
        2,
        LINE_8,
        false,
    )?;
    Ok(())
}

/// Full-width horizontal reference line.
pub fn draw_baseline(frame: &mut Mat, baseline_y: i32) -> Result<()> {
    let width = frame.cols();
    line(
        frame,
        Point::new(0, baseline_y),
        Point::new(width, baseline_y),
        red(),
        2,
        LINE_8,
        0,
    )?;
    Ok(())
}

/// Box plus `ID: n` above its top-left corner for every tracked vehicle.
pub fn draw_tracks(frame: &mut Mat, tracks: &[TrackedDetection]) -> Result<()> {
    for track in tracks {
        draw_box(frame, &track.bbox)?;
        let px = track.bbox.to_pixels();
        draw_label(
            frame,
            &format!("ID: {}", track.track_id),
            Point::new(px.x1, px.y1 - 10),
            0.5,
            yellow(),
        )?;
    }
    Ok(())
}

pub fn draw_counts(frame: &mut Mat, total_in: usize, total_out: usize) -> Result<()> {
    let lines = [format!("In: {}", total_in), format!("Out: {}", total_out)];
    let mut y_offset = 30;
    for text in &lines {
        draw_label(frame, text, Point::new(20, y_offset), 0.7, red())?;
        y_offset += 30;
    }
    Ok(())
}

/// Still-image overlay: every box and the total in the top-left corner.
pub fn draw_detections(frame: &mut Mat, boxes: &[BBox]) -> Result<()> {
    for bbox in boxes {
        draw_box(frame, bbox)?;
    }
    draw_label(
        frame,
        &format!("Total Vehicles: {}", boxes.len()),
        Point::new(20, 30),
        0.7,
        red(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ensemble::testing::blank_frame;
    use opencv::core::Vec3b;

    #[test]
    fn test_baseline_is_drawn_red_across_the_frame() {
        let mut frame = blank_frame(200, 100);
        draw_baseline(&mut frame, 50).unwrap();

        for x in [0, 100, 199] {
            let px = frame.at_2d::<Vec3b>(50, x).unwrap();
            assert_eq!((px[0], px[1], px[2]), (0, 0, 255));
        }
        let above = frame.at_2d::<Vec3b>(10, 100).unwrap();
        assert_eq!(above[2], 0);
    }

    #[test]
    fn test_track_box_outline_is_green() {
        let mut frame = blank_frame(200, 200);
        let track = TrackedDetection {
            track_id: 3,
            bbox: BBox::new(50.0, 60.0, 150.0, 160.0),
            score: 0.9,
            label: 1,
        };
        draw_tracks(&mut frame, &[track]).unwrap();

        let edge = frame.at_2d::<Vec3b>(110, 50).unwrap();
        assert_eq!((edge[0], edge[1], edge[2]), (0, 255, 0));
        let inside = frame.at_2d::<Vec3b>(110, 100).unwrap();
        assert_eq!((inside[0], inside[1], inside[2]), (0, 0, 0));
    }

    #[test]
    fn test_overlays_tolerate_boxes_at_the_border() {
        let mut frame = blank_frame(64, 48);
        let boxes = [BBox::new(0.0, 0.0, 64.0, 48.0), BBox::new(60.0, 2.0, 63.0, 5.0)];
        draw_detections(&mut frame, &boxes).unwrap();
        draw_counts(&mut frame, 1, 2).unwrap();
    }
}
