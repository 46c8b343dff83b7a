// Batch runner: processes a list of images/videos sequentially on a
// background thread.
//
// Progress is reported after every item, the run flag is checked between
// items, and jobs are kept in a process-wide registry so HTTP handlers can
// look them up.

use crate::error::{is_fatal, PipelineError};
use crate::pipeline::counting::count_video;
use crate::pipeline::ensemble::Ensemble;
use crate::pipeline::still::count_image;
use crate::pipeline::types::{ItemFailure, ProcessingState};
use crate::run_artifacts::{CountResult, CountSummary, PipelineSettings};
use crate::run_context::{preview_path, summary_path, InputSet, MediaKind, ResultNames};
use crate::video::preview::extract_last_frame;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

// Global registry of batch jobs. Running jobs always stay; only the newest
// MAX_FINISHED_JOBS finished ones are kept for status queries.
lazy_static::lazy_static! {
    static ref JOB_REGISTRY: RwLock<HashMap<String, Arc<ProcessingState>>> =
        RwLock::new(HashMap::new());
}

static JOB_COUNTER: AtomicUsize = AtomicUsize::new(0);

const MAX_FINISHED_JOBS: usize = 64;

pub fn new_job_id() -> String {
    let seq = JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("job-{}-{}", Utc::now().format("%Y%m%d%H%M%S"), seq)
}

pub fn get_job(job_id: &str) -> Option<Arc<ProcessingState>> {
    JOB_REGISTRY.read().ok()?.get(job_id).cloned()
}

fn register_job(state: Arc<ProcessingState>) {
    tracing::info!("Registering batch job {}", state.job_id);
    if let Ok(mut registry) = JOB_REGISTRY.write() {
        prune_finished(&mut registry, MAX_FINISHED_JOBS);
        registry.insert(state.job_id.clone(), state);
    }
}

/// Drops the oldest finished jobs until at most `keep` remain.
fn prune_finished(registry: &mut HashMap<String, Arc<ProcessingState>>, keep: usize) {
    let mut finished: Vec<(std::time::Instant, String)> = registry
        .values()
        .filter(|s| s.is_complete.load(Ordering::Relaxed))
        .map(|s| (s.start_time, s.job_id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, job_id) in finished.into_iter().take(excess) {
        tracing::debug!("Forgetting finished batch job {}", job_id);
        registry.remove(&job_id);
    }
}

/// Clears the run flag of a job. The item in flight still finishes.
pub fn cancel_job(job_id: &str) -> bool {
    match get_job(job_id) {
        Some(state) => {
            tracing::info!("Cancelling batch job {}", job_id);
            state.cancel();
            true
        }
        None => false,
    }
}

/// Turns one input into one output.
pub trait ItemProcessor {
    fn process(&mut self, input: &Path, output: &Path) -> Result<CountResult>;
}

impl<F> ItemProcessor for F
where
    F: FnMut(&Path, &Path) -> Result<CountResult>,
{
    fn process(&mut self, input: &Path, output: &Path) -> Result<CountResult> {
        self(input, output)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Outputs produced, in input order
    pub outputs: Vec<PathBuf>,
    pub results: Vec<CountResult>,
    pub failures: Vec<ItemFailure>,
    pub cancelled: bool,
}

fn item_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Runs `items` in order. Item failures are logged and skipped; a fatal
/// failure (model load) stops the batch and is returned. `on_progress`
/// receives the number of items attempted so far and the item name.
pub fn run_batch<P, F>(
    items: &[PathBuf],
    output_dir: &Path,
    mode: &str,
    state: &ProcessingState,
    mut processor: P,
    mut on_progress: F,
) -> Result<BatchReport>
where
    P: ItemProcessor,
    F: FnMut(usize, &str),
{
    let mut report = BatchReport::default();
    let mut names = ResultNames::new(output_dir);

    for input in items {
        if !state.should_continue() {
            tracing::info!(
                "Batch {} cancelled with {} of {} items done",
                state.job_id,
                state.completed_items.load(Ordering::Relaxed),
                state.total_items
            );
            report.cancelled = true;
            break;
        }

        let name = item_name(input);
        state.begin_item(&name);
        let output = names.next(input);
        let started_at = Utc::now();

        match processor.process(input, &output) {
            Ok(result) => {
                let summary =
                    CountSummary::finished(input, &output, mode, started_at, result.clone());
                if let Err(e) = summary.save(&summary_path(&output)) {
                    tracing::warn!("No summary for {}: {:#}", name, e);
                }
                tracing::info!("{}: {}", name, result.headline());
                state.record_output(output.clone());
                report.outputs.push(output);
                report.results.push(result);
            }
            Err(e) if is_fatal(&e) => {
                tracing::error!("Batch {} aborted on {}: {:#}", state.job_id, name, e);
                state.set_error(&e);
                state.finish();
                return Err(e);
            }
            Err(e) => {
                tracing::warn!("Skipping {}: {:#}", name, e);
                state.record_failure(&name, &e);
                report.failures.push(ItemFailure {
                    item: name.clone(),
                    error: format!("{:#}", e),
                });
            }
        }

        let done = state.complete_item();
        on_progress(done, &name);
    }

    state.finish();
    Ok(report)
}

/// Counts one image or video according to its extension.
pub fn count_item(
    input: &Path,
    output: &Path,
    ensemble: &mut Ensemble,
    settings: &PipelineSettings,
) -> Result<CountResult> {
    match MediaKind::from_path(input) {
        Some(MediaKind::Image) => {
            Ok(count_image(input, output, ensemble, &settings.class_names)?.into())
        }
        Some(MediaKind::Video) => {
            let count = count_video(input, output, ensemble, settings, false)?;
            Ok(CountResult::from(&count))
        }
        None => Err(PipelineError::Unsupported(input.to_path_buf()).into()),
    }
}

/// What a background batch works on.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub job_id: String,
    pub inputs: InputSet,
    pub output_dir: PathBuf,
    pub settings: PipelineSettings,
    pub mode: String,
    /// Save the last frame of the last produced video as a still
    pub preview: bool,
}

impl BatchJob {
    /// Images first, then videos.
    pub fn items(&self) -> Vec<PathBuf> {
        self.inputs
            .images
            .iter()
            .chain(&self.inputs.videos)
            .cloned()
            .collect()
    }
}

/// Starts `job` on a worker thread and registers it. The ensemble is built on
/// that thread by `build`; a build failure ends the job with an error and an
/// empty report. `on_complete` always runs exactly once.
pub fn spawn_batch<B, P, C>(
    job: BatchJob,
    build: B,
    on_progress: P,
    on_complete: C,
) -> Result<(Arc<ProcessingState>, JoinHandle<()>)>
where
    B: FnOnce() -> Result<Ensemble> + Send + 'static,
    P: FnMut(usize, &str) + Send + 'static,
    C: FnOnce(BatchReport) + Send + 'static,
{
    std::fs::create_dir_all(&job.output_dir)?;

    let items = job.items();
    let state = Arc::new(ProcessingState::new(job.job_id.clone(), items.len()));
    register_job(state.clone());

    let worker_state = state.clone();
    let handle = thread::Builder::new()
        .name(format!("batch-{}", job.job_id))
        .spawn(move || {
            tracing::info!(
                "Batch {} started: {} images, {} videos",
                job.job_id,
                job.inputs.images.len(),
                job.inputs.videos.len()
            );

            let mut ensemble = match build() {
                Ok(ensemble) => ensemble,
                Err(e) => {
                    tracing::error!("Batch {} could not load models: {:#}", job.job_id, e);
                    worker_state.set_error(&e);
                    worker_state.finish();
                    on_complete(BatchReport::default());
                    return;
                }
            };

            let settings = &job.settings;
            let result = run_batch(
                &items,
                &job.output_dir,
                &job.mode,
                &worker_state,
                |input: &Path, output: &Path| count_item(input, output, &mut ensemble, settings),
                on_progress,
            );

            let report = match result {
                Ok(report) => report,
                Err(_) => BatchReport {
                    outputs: worker_state.outputs(),
                    failures: worker_state.failures(),
                    ..BatchReport::default()
                },
            };

            if job.preview {
                save_preview(&report.outputs);
            }

            tracing::info!(
                "Batch {} finished: {} outputs, {} failures",
                job.job_id,
                report.outputs.len(),
                report.failures.len()
            );
            on_complete(report);
        })?;

    Ok((state, handle))
}

fn save_preview(outputs: &[PathBuf]) {
    let Some(last_video) = outputs
        .iter()
        .rev()
        .find(|p| MediaKind::from_path(p) == Some(MediaKind::Video))
    else {
        return;
    };

    let still = preview_path(last_video);
    if let Err(e) = extract_last_frame(last_video, &still) {
        tracing::warn!("Frame extraction failed for {:?}: {:#}", last_video, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ensemble::testing::{blank_frame, ScriptedDetector};
    use crate::pipeline::types::{BBox, Detection};
    use crossbeam::channel;
    use opencv::core::Vector;
    use opencv::imgcodecs;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn ok_result() -> CountResult {
        CountResult::Image {
            total: 1,
            per_class: BTreeMap::new(),
        }
    }

    fn five_items() -> Vec<PathBuf> {
        (1..=5).map(|i| PathBuf::from(format!("img{}.jpg", i))).collect()
    }

    #[test]
    fn test_registry_forgets_oldest_finished_jobs() {
        let base = std::time::Instant::now();
        let mut registry = HashMap::new();
        for i in 0..5u64 {
            let mut state = ProcessingState::new(format!("job{}", i), 1);
            state.start_time = base + Duration::from_millis(i);
            // job1 is still running
            state.is_complete.store(i != 1, Ordering::Relaxed);
            registry.insert(state.job_id.clone(), Arc::new(state));
        }

        prune_finished(&mut registry, 2);

        let mut left: Vec<&String> = registry.keys().collect();
        left.sort();
        assert_eq!(left, vec!["job1", "job3", "job4"]);

        prune_finished(&mut registry, 2);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_failed_item_is_skipped_and_batch_continues() {
        let dir = tempfile::tempdir().unwrap();
        let state = ProcessingState::new("t1".to_string(), 5);
        let mut progress = Vec::new();

        let report = run_batch(
            &five_items(),
            dir.path(),
            "single",
            &state,
            |input: &Path, _output: &Path| -> Result<CountResult> {
                if input == Path::new("img3.jpg") {
                    Err(PipelineError::unreadable(input, "corrupt").into())
                } else {
                    Ok(ok_result())
                }
            },
            |done, name: &str| progress.push((done, name.to_string())),
        )
        .unwrap();

        assert_eq!(report.outputs.len(), 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item, "img3.jpg");
        assert!(!report.cancelled);
        assert!(!report.outputs.contains(&dir.path().join("img3_result.jpg")));

        let counts: Vec<usize> = progress.iter().map(|(n, _)| *n).collect();
        assert_eq!(counts, vec![1, 2, 3, 4, 5]);
        assert_eq!(progress[2].1, "img3.jpg");

        assert!(state.is_complete.load(Ordering::Relaxed));
        assert_eq!(state.outputs().len(), 4);
        assert!(dir.path().join("img1_result.json").exists());
    }

    #[test]
    fn test_cancel_stops_after_item_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let state = ProcessingState::new("t2".to_string(), 5);

        let report = run_batch(
            &five_items(),
            dir.path(),
            "single",
            &state,
            |input: &Path, _output: &Path| -> Result<CountResult> {
                if input == Path::new("img2.jpg") {
                    state.cancel();
                }
                Ok(ok_result())
            },
            |_, _: &str| {},
        )
        .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.outputs.len(), 2);
        assert_eq!(state.completed_items.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_model_load_failure_aborts_batch() {
        let dir = tempfile::tempdir().unwrap();
        let state = ProcessingState::new("t3".to_string(), 5);

        let result = run_batch(
            &five_items(),
            dir.path(),
            "fused",
            &state,
            |input: &Path, _output: &Path| -> Result<CountResult> {
                if input == Path::new("img2.jpg") {
                    Err(PipelineError::ModelLoad {
                        model: "yolo".to_string(),
                        reason: "gone".to_string(),
                    }
                    .into())
                } else {
                    Ok(ok_result())
                }
            },
            |_, _: &str| {},
        );

        assert!(result.is_err());
        assert_eq!(state.outputs().len(), 1);
        assert!(state.is_complete.load(Ordering::Relaxed));
        assert!(state.to_progress_json()["error"].is_string());
    }

    fn write_images(dir: &Path, corrupt: usize) -> Vec<PathBuf> {
        (1..=5)
            .map(|i| {
                let path = dir.join(format!("img{}.png", i));
                if i == corrupt {
                    std::fs::write(&path, b"not an image").unwrap();
                } else {
                    imgcodecs::imwrite(path.to_str().unwrap(), &blank_frame(40, 30), &Vector::new())
                        .unwrap();
                }
                path
            })
            .collect()
    }

    fn car_ensemble() -> Result<Ensemble> {
        let car = Detection::new(BBox::new(2.0, 2.0, 20.0, 20.0), 0.9, 1);
        Ok(Ensemble::single(Box::new(ScriptedDetector::constant(
            "yolo",
            vec![car],
            10,
        ))))
    }

    #[test]
    fn test_background_batch_with_corrupt_image() {
        let input_dir = tempfile::tempdir().unwrap();
        let output_dir = tempfile::tempdir().unwrap();
        let images = write_images(input_dir.path(), 3);

        let job = BatchJob {
            job_id: new_job_id(),
            inputs: InputSet {
                images,
                ..InputSet::default()
            },
            output_dir: output_dir.path().to_path_buf(),
            settings: PipelineSettings::default(),
            mode: "single".to_string(),
            preview: false,
        };
        let job_id = job.job_id.clone();

        let (progress_tx, progress_rx) = channel::unbounded();
        let (done_tx, done_rx) = channel::bounded(1);
        let (state, handle) = spawn_batch(
            job,
            car_ensemble,
            move |done, name: &str| {
                let _ = progress_tx.send((done, name.to_string()));
            },
            move |report| {
                let _ = done_tx.send(report);
            },
        )
        .unwrap();

        let report = done_rx.recv_timeout(Duration::from_secs(30)).unwrap();
        handle.join().unwrap();

        assert_eq!(report.outputs.len(), 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item, "img3.png");
        for output in &report.outputs {
            assert!(output.exists());
        }
        assert_eq!(progress_rx.try_iter().count(), 5);

        let registered = get_job(&job_id).unwrap();
        assert!(Arc::ptr_eq(&registered, &state));
        assert!(registered.is_complete.load(Ordering::Relaxed));
        assert!(!cancel_job("job-that-never-ran"));
    }

    #[test]
    fn test_background_batch_model_failure_reports_empty() {
        let output_dir = tempfile::tempdir().unwrap();
        let job = BatchJob {
            job_id: new_job_id(),
            inputs: InputSet {
                images: vec![PathBuf::from("a.png")],
                ..InputSet::default()
            },
            output_dir: output_dir.path().to_path_buf(),
            settings: PipelineSettings::default(),
            mode: "fused".to_string(),
            preview: false,
        };

        let (done_tx, done_rx) = channel::bounded(1);
        let (state, handle) = spawn_batch(
            job,
            || -> Result<Ensemble> {
                Err(PipelineError::ModelLoad {
                    model: "rtdetr".to_string(),
                    reason: "missing".to_string(),
                }
                .into())
            },
            |_, _: &str| {},
            move |report| {
                let _ = done_tx.send(report);
            },
        )
        .unwrap();

        let report = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        handle.join().unwrap();
        assert!(report.outputs.is_empty());
        assert!(state.to_progress_json()["error"].is_string());
        assert!(state.is_complete.load(Ordering::Relaxed));
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(new_job_id(), new_job_id());
    }
}
