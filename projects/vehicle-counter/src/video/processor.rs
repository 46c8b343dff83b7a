use crate::video::VideoReader;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use opencv::core::Mat;
use std::time::{Duration, Instant};

pub struct ProcessingStats {
    pub processed_frames: usize,
    pub duration: Duration,
}

/// A trait for handling video frames. This separates the "how to process"
/// from the "how to read and orchestrate" logic.
pub trait FrameProcessor {
    fn process(&mut self, frame: Mat) -> Result<()>;
}

/// Blanket implementation so any closure with the right signature
/// automatically implements FrameProcessor.
impl<F> FrameProcessor for F
where
    F: FnMut(Mat) -> Result<()>,
{
    fn process(&mut self, frame: Mat) -> Result<()> {
        self(frame)
    }
}

pub struct VideoSession {
    pub reader: Box<dyn VideoReader>,
    pub pb: ProgressBar,
    pub start_time: Instant,
    pub processed_frames: usize,
}

impl VideoSession {
    /// Session with a terminal progress bar sized from the container metadata.
    pub fn new(reader: Box<dyn VideoReader>) -> Result<Self> {
        let total_frames = reader.frame_count()?;

        let pb = ProgressBar::new(total_frames as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} fps, {eta})")?
                .progress_chars("#>-"),
        );

        Ok(Self::with_progress(reader, pb))
    }

    /// Session without terminal output, for background batches.
    pub fn quiet(reader: Box<dyn VideoReader>) -> Self {
        Self::with_progress(reader, ProgressBar::hidden())
    }

    fn with_progress(reader: Box<dyn VideoReader>, pb: ProgressBar) -> Self {
        Self {
            reader,
            pb,
            start_time: Instant::now(),
            processed_frames: 0,
        }
    }
}

/// Feeds frames to `processor` in decode order until the reader stops
/// producing them. A frame that fails to decode ends the run; errors from the
/// processor are returned.
pub fn process_video<P>(mut session: VideoSession, mut processor: P) -> Result<ProcessingStats>
where
    P: FrameProcessor,
{
    let expected = session.reader.frame_count().unwrap_or(0);

    loop {
        let frame = match session.reader.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                if session.processed_frames < expected {
                    tracing::warn!(
                        "Stopped after {} of {} frames: {:#}",
                        session.processed_frames,
                        expected,
                        e
                    );
                } else {
                    tracing::debug!("End of stream after {} frames", session.processed_frames);
                }
                break;
            }
        };
        processor.process(frame)?;
        session.processed_frames += 1;
        session.pb.inc(1);
    }

    session.pb.finish_with_message("Done");

    Ok(ProcessingStats {
        processed_frames: session.processed_frames,
        duration: session.start_time.elapsed(),
    })
}
