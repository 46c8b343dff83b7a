use crate::run_artifacts::{CountResult, CountSummary};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const VIDEO_EXTENSIONS: [&str; 2] = ["mp4", "avi"];
const RESULT_SUFFIX: &str = "_result";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classifies by extension, case-insensitively.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

fn stem_and_ext(input: &Path) -> (String, String) {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string();
    let ext = input
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    (stem, ext)
}

fn with_suffix(dir: &Path, stem: &str, suffix: &str, ext: &str) -> PathBuf {
    if ext.is_empty() {
        dir.join(format!("{}{}", stem, suffix))
    } else {
        dir.join(format!("{}{}.{}", stem, suffix, ext))
    }
}

/// `dir/name.ext` -> `dir/name_result.ext`
pub fn result_path(input: &Path) -> PathBuf {
    let dir = input.parent().unwrap_or_else(|| Path::new(""));
    result_path_in(input, dir)
}

/// `name.ext` -> `output_dir/name_result.ext`
pub fn result_path_in(input: &Path, output_dir: &Path) -> PathBuf {
    let (stem, ext) = stem_and_ext(input);
    with_suffix(output_dir, &stem, RESULT_SUFFIX, &ext)
}

/// Output paths for one batch. Inputs that would share a `<stem>_result`
/// name get `_2`, `_3`, ... appended to the stem, whatever their directory
/// or extension, so no output or summary overwrites another.
#[derive(Debug)]
pub struct ResultNames {
    output_dir: PathBuf,
    taken: HashSet<String>,
}

impl ResultNames {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            taken: HashSet::new(),
        }
    }

    pub fn next(&mut self, input: &Path) -> PathBuf {
        let (stem, ext) = stem_and_ext(input);
        let mut candidate = stem.clone();
        let mut n = 2;
        // Case-folded for case-insensitive file systems
        while !self.taken.insert(candidate.to_lowercase()) {
            candidate = format!("{}_{}", stem, n);
            n += 1;
        }
        if candidate != stem {
            tracing::warn!(
                "{}{} already used in this batch, writing {:?} as {}{}",
                stem,
                RESULT_SUFFIX,
                input,
                candidate,
                RESULT_SUFFIX
            );
        }
        with_suffix(&self.output_dir, &candidate, RESULT_SUFFIX, &ext)
    }
}

/// JSON summary sitting next to an output: `name_result.json`.
pub fn summary_path(output: &Path) -> PathBuf {
    output.with_extension("json")
}

/// Still of the last frame of an output video: `name_result_last.jpg`.
pub fn preview_path(output: &Path) -> PathBuf {
    let (stem, _) = stem_and_ext(output);
    let dir = output.parent().unwrap_or_else(|| Path::new(""));
    with_suffix(dir, &stem, "_last", "jpg")
}

fn is_result_file(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.ends_with(RESULT_SUFFIX))
        .unwrap_or(false)
}

/// Inputs of a batch, split by media kind.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InputSet {
    pub images: Vec<PathBuf>,
    pub videos: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

impl InputSet {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty()
    }

    fn push(&mut self, path: PathBuf) {
        match MediaKind::from_path(&path) {
            Some(MediaKind::Image) => self.images.push(path),
            Some(MediaKind::Video) => self.videos.push(path),
            None => self.skipped.push(path),
        }
    }
}

/// Expands directories recursively and sorts files into images and videos.
/// Files already carrying the `_result` suffix are left out of directory
/// walks; explicitly listed files are always kept.
pub fn collect_inputs(paths: &[PathBuf]) -> InputSet {
    let mut set = InputSet::default();

    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path().to_path_buf())
                .filter(|p| MediaKind::from_path(p).is_some() && !is_result_file(p))
                .collect();
            found.sort();
            for file in found {
                set.push(file);
            }
        } else {
            set.push(path.clone());
        }
    }

    for skipped in &set.skipped {
        tracing::warn!("Skipping unsupported input {:?}", skipped);
    }
    set
}

#[derive(Serialize, Debug, Clone)]
pub struct HistoryEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: MediaKind,
    pub modified: Option<DateTime<Utc>>,
    pub result: Option<CountResult>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct History {
    pub images: Vec<HistoryEntry>,
    pub videos: Vec<HistoryEntry>,
}

/// Previously produced `_result` files directly under `output_root`, newest
/// first, with their summaries when present.
pub fn list_history(output_root: &Path) -> Result<History> {
    let mut history = History::default();

    if !output_root.exists() {
        return Ok(history);
    }

    for entry in fs::read_dir(output_root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || !is_result_file(&path) {
            continue;
        }
        let Some(kind) = MediaKind::from_path(&path) else {
            continue;
        };

        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let result = CountSummary::load(&summary_path(&path))
            .ok()
            .map(|s| s.result);

        let item = HistoryEntry {
            name,
            path,
            kind,
            modified,
            result,
        };
        match kind {
            MediaKind::Image => history.images.push(item),
            MediaKind::Video => history.videos.push(item),
        }
    }

    for list in [&mut history.images, &mut history.videos] {
        list.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
    }

    Ok(history)
}
