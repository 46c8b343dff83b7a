use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

/// Axis-aligned box in corner form, either in pixels or normalized to [0, 1].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Intersection over Union with another box in the same coordinate space.
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Pixel box -> coordinates relative to the frame size.
    pub fn normalized(&self, frame_width: f32, frame_height: f32) -> BBox {
        BBox {
            x1: self.x1 / frame_width,
            y1: self.y1 / frame_height,
            x2: self.x2 / frame_width,
            y2: self.y2 / frame_height,
        }
    }

    /// Normalized box -> pixel coordinates of a frame of the given size.
    pub fn denormalized(&self, frame_width: f32, frame_height: f32) -> BBox {
        BBox {
            x1: self.x1 * frame_width,
            y1: self.y1 * frame_height,
            x2: self.x2 * frame_width,
            y2: self.y2 * frame_height,
        }
    }

    /// Truncates to integer pixels.
    pub fn to_pixels(&self) -> PixelBox {
        PixelBox {
            x1: self.x1 as i32,
            y1: self.y1 as i32,
            x2: self.x2 as i32,
            y2: self.y2 as i32,
        }
    }
}

/// Integer pixel box as handed to the tracker and the renderer.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl PixelBox {
    /// Center with floor division, matching integer pixel arithmetic.
    pub fn center(&self) -> (i32, i32) {
        (
            (self.x1 + self.x2).div_euclid(2),
            (self.y1 + self.y2).div_euclid(2),
        )
    }

    pub fn to_bbox(&self) -> BBox {
        BBox::new(
            self.x1 as f32,
            self.y1 as f32,
            self.x2 as f32,
            self.y2 as f32,
        )
    }
}

/// One box produced by a detector (or by fusion) for one frame.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub score: f32,
    pub label: usize,
}

impl Detection {
    pub fn new(bbox: BBox, score: f32, label: usize) -> Self {
        Self { bbox, score, label }
    }
}

/// Consensus detection produced by a fusion strategy.
pub type FusedDetection = Detection;

#[derive(Debug, Serialize, Clone)]
pub struct ItemFailure {
    pub item: String,
    pub error: String,
}

/// Progress of one batch run, shared between the worker thread and whoever
/// is watching it (terminal, HTTP handlers).
#[derive(Debug)]
pub struct ProcessingState {
    pub job_id: String,
    pub total_items: usize,
    /// Run flag; cleared to request cancellation between items.
    pub is_active: AtomicBool,
    pub is_complete: AtomicBool,
    pub completed_items: AtomicUsize,
    pub current_item: RwLock<Option<String>>,
    pub outputs: RwLock<Vec<PathBuf>>,
    pub failures: RwLock<Vec<ItemFailure>>,
    pub error: RwLock<Option<String>>,
    pub start_time: std::time::Instant,
}

impl ProcessingState {
    pub fn new(job_id: String, total_items: usize) -> Self {
        Self {
            job_id,
            total_items,
            is_active: AtomicBool::new(true),
            is_complete: AtomicBool::new(false),
            completed_items: AtomicUsize::new(0),
            current_item: RwLock::new(None),
            outputs: RwLock::new(Vec::new()),
            failures: RwLock::new(Vec::new()),
            error: RwLock::new(None),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn should_continue(&self) -> bool {
        self.is_active.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.is_active.store(false, Ordering::Relaxed);
    }

    pub fn begin_item(&self, item: &str) {
        if let Ok(mut current) = self.current_item.write() {
            *current = Some(item.to_string());
        }
    }

    /// Marks one more item as done and returns the number of items done so far.
    pub fn complete_item(&self) -> usize {
        self.completed_items.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_output(&self, output: PathBuf) {
        if let Ok(mut outputs) = self.outputs.write() {
            outputs.push(output);
        }
    }

    pub fn record_failure(&self, item: &str, error: &anyhow::Error) {
        if let Ok(mut failures) = self.failures.write() {
            failures.push(ItemFailure {
                item: item.to_string(),
                error: format!("{:#}", error),
            });
        }
    }

    pub fn set_error(&self, error: &anyhow::Error) {
        if let Ok(mut slot) = self.error.write() {
            *slot = Some(format!("{:#}", error));
        }
    }

    pub fn finish(&self) {
        if let Ok(mut current) = self.current_item.write() {
            *current = None;
        }
        self.is_complete.store(true, Ordering::Relaxed);
        self.is_active.store(false, Ordering::Relaxed);
    }

    pub fn outputs(&self) -> Vec<PathBuf> {
        self.outputs.read().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn failures(&self) -> Vec<ItemFailure> {
        self.failures.read().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let completed = self.completed_items.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let items_per_sec = if elapsed > 0.0 {
            completed as f64 / elapsed
        } else {
            0.0
        };

        serde_json::json!({
            "job_id": self.job_id,
            "total_items": self.total_items,
            "completed_items": completed,
            "current_item": self.current_item.read().ok().and_then(|c| c.clone()),
            "is_active": self.is_active.load(Ordering::Relaxed),
            "is_complete": self.is_complete.load(Ordering::Relaxed),
            "outputs": self.outputs(),
            "failures": self.failures(),
            "error": self.error.read().ok().and_then(|e| e.clone()),
            "items_per_sec": items_per_sec,
        })
    }
}
