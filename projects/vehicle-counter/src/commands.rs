// Blocking CLI subcommands. `serve` lives in `web::server`.

use crate::cli::Args;
use crate::pipeline::batch::{new_job_id, spawn_batch, BatchJob, BatchReport};
use crate::pipeline::counting::count_video;
use crate::pipeline::still::count_image;
use crate::run_artifacts::{write_events_csv, CountResult, CountSummary};
use crate::run_context::{collect_inputs, list_history, result_path, summary_path, HistoryEntry};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam::channel;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

fn save_summary(
    input: &Path,
    output: &Path,
    mode: &str,
    started_at: DateTime<Utc>,
    result: &CountResult,
) {
    let summary = CountSummary::finished(input, output, mode, started_at, result.clone());
    if let Err(e) = summary.save(&summary_path(output)) {
        tracing::warn!("Could not write summary for {:?}: {:#}", output, e);
    }
}

pub fn image(args: &Args, input: &Path, output: Option<PathBuf>) -> Result<()> {
    let config = args.ensemble_config()?;
    let mut ensemble = config.build()?;
    let output = output.unwrap_or_else(|| result_path(input));

    let started_at = Utc::now();
    let count = count_image(input, &output, &mut ensemble, &config.settings.class_names)?;
    let result = CountResult::from(count);
    save_summary(input, &output, config.mode.as_str(), started_at, &result);

    println!("{}", result.headline());
    if let CountResult::Image { per_class, .. } = &result {
        for (name, n) in per_class {
            println!("  {}: {}", name, n);
        }
    }
    println!("Result saved to {}", output.display());
    Ok(())
}

pub fn video(
    args: &Args,
    input: &Path,
    output: Option<PathBuf>,
    events: Option<PathBuf>,
) -> Result<()> {
    let config = args.ensemble_config()?;
    let mut ensemble = config.build()?;
    let output = output.unwrap_or_else(|| result_path(input));

    let started_at = Utc::now();
    let count = count_video(input, &output, &mut ensemble, &config.settings, true)?;
    let result = CountResult::from(&count);
    save_summary(input, &output, config.mode.as_str(), started_at, &result);

    if let Some(events_path) = events {
        write_events_csv(&events_path, &count.events)?;
        println!(
            "{} crossing events written to {}",
            count.events.len(),
            events_path.display()
        );
    }

    println!("Done | In: {}, Out: {}", count.total_in, count.total_out);
    println!("Result saved to {}", output.display());
    Ok(())
}

enum BatchEvent {
    Progress(usize, String),
    Complete(BatchReport),
}

pub fn batch(args: &Args, paths: &[PathBuf], output_dir: &Path, preview: bool) -> Result<()> {
    let inputs = collect_inputs(paths);
    if inputs.is_empty() {
        bail!("No supported images or videos found in {:?}", paths);
    }
    let config = args.ensemble_config()?;

    let job = BatchJob {
        job_id: new_job_id(),
        inputs,
        output_dir: output_dir.to_path_buf(),
        settings: config.settings.clone(),
        mode: config.mode.as_str().to_string(),
        preview,
    };
    let total = job.items().len();

    let (tx, rx) = channel::unbounded();
    let progress_tx = tx.clone();
    let (state, handle) = spawn_batch(
        job,
        move || config.build(),
        move |done, name: &str| {
            let _ = progress_tx.send(BatchEvent::Progress(done, name.to_string()));
        },
        move |report| {
            let _ = tx.send(BatchEvent::Complete(report));
        },
    )?;

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut report = None;
    for event in rx.iter() {
        match event {
            BatchEvent::Progress(done, name) => {
                pb.set_position(done as u64);
                pb.set_message(name);
            }
            BatchEvent::Complete(r) => {
                report = Some(r);
                break;
            }
        }
    }
    pb.finish_and_clear();
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("Batch worker panicked"))?;

    let report = report.context("Batch worker exited without a report")?;
    if let Some(error) = state.error.read().ok().and_then(|e| e.clone()) {
        bail!("Batch aborted: {}", error);
    }

    for (output, result) in report.outputs.iter().zip(&report.results) {
        println!("{}: {}", output.display(), result.headline());
    }
    for failure in &report.failures {
        println!("FAILED {}: {}", failure.item, failure.error);
    }
    println!(
        "{} of {} items processed{}",
        report.outputs.len(),
        total,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

fn print_entries(title: &str, entries: &[HistoryEntry]) {
    println!("{} ({})", title, entries.len());
    for entry in entries {
        let when = entry
            .modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let headline = entry
            .result
            .as_ref()
            .map(|r| r.headline())
            .unwrap_or_default();
        println!("  {:<40} {:<16} {}", entry.name, when, headline);
    }
}

pub fn history(output_dir: &Path) -> Result<()> {
    let history = list_history(output_dir)?;
    print_entries("Images", &history.images);
    print_entries("Videos", &history.videos);
    Ok(())
}
