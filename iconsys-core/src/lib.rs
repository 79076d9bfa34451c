use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub mod title;
pub mod title_cfg;

pub use title::{LayoutError, TitleError, TitleLayout};

pub const ICON_SYS_NAME: &str = "icon.sys";

#[derive(Debug, Error)]
pub enum IconSysError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid layout file: {0}")]
    Layout(#[from] serde_json::Error),
    #[error(transparent)]
    Title(#[from] TitleError),
    #[error("encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, IconSysError>;

#[derive(Debug, Clone)]
pub struct TitleSettings {
    pub root: PathBuf,
    pub layout: TitleLayout,
    pub backup: bool,
}

#[derive(Debug, Clone)]
pub struct CfgSettings {
    pub root: PathBuf,
    pub backup: bool,
}

/// Per-batch counters reported once every file has been visited.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub found: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Source of user answers and sink for what the user should see.
pub trait Prompter {
    fn show(&mut self, text: &str);

    /// Ask a question. Returns the answer without its line terminator, or
    /// `None` once input is exhausted.
    fn ask(&mut self, question: &str) -> Option<String>;
}

/// Prompter fed from a fixed list of answers; everything shown is kept.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    pub transcript: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            transcript: Vec::new(),
        }
    }
}

impl Prompter for ScriptedPrompter {
    fn show(&mut self, text: &str) {
        self.transcript.push(text.to_string());
    }

    fn ask(&mut self, question: &str) -> Option<String> {
        self.transcript.push(question.to_string());
        self.answers.pop_front()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitlePreview {
    pub path: PathBuf,
    pub split: u8,
    pub line1: String,
    pub line2: String,
}

fn ensure_dir(root: &Path) -> Result<()> {
    if !root.is_dir() {
        return Err(IconSysError::Config(format!(
            "Root path is not a directory: {}",
            root.display()
        )));
    }
    Ok(())
}

fn resolve_root(root: &Path) -> Result<PathBuf> {
    ensure_dir(root)?;
    Ok(fs::canonicalize(root)?)
}

fn relative<'a>(root: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}

/// Every regular file under `root` whose name matches `file_name`,
/// ignoring ASCII case. Sorted so batches visit files in a stable order.
pub fn find_files(root: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
    ensure_dir(root)?;

    let mut found = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable entry: {err}");
                continue;
            }
        };
        if entry
            .file_name()
            .to_string_lossy()
            .eq_ignore_ascii_case(file_name)
            && entry.path().is_file()
        {
            found.push(entry.into_path());
        }
    }
    found.sort();
    debug!("found {} {} file(s) under {}", found.len(), file_name, root.display());
    Ok(found)
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Copy `path` to `path.bak` unless a backup already exists. Returns the
/// backup path when one was written.
pub fn backup_once(path: &Path) -> Result<Option<PathBuf>> {
    let bak = backup_path(path);
    if bak.exists() {
        debug!("backup already present: {}", bak.display());
        return Ok(None);
    }
    fs::copy(path, &bak)?;
    info!("backed up {} to {}", path.display(), bak.display());
    Ok(Some(bak))
}

pub fn read_preview(path: &Path, layout: &TitleLayout) -> Result<TitlePreview> {
    let data = fs::read(path)?;
    let (line1, line2) = title::decode_titles(&data, layout);
    Ok(TitlePreview {
        path: path.to_path_buf(),
        split: title::read_split(&data, layout),
        line1,
        line2,
    })
}

/// Patch the title of the icon.sys at `path`. The backup is only taken once
/// the new title has validated, so a rejected title never leaves a `.bak`.
pub fn write_titles(
    path: &Path,
    line1: &str,
    line2: &str,
    layout: &TitleLayout,
    backup: bool,
) -> Result<()> {
    let mut data = fs::read(path)?;
    title::encode_and_patch(&mut data, line1, line2, layout)?;
    if backup {
        backup_once(path)?;
    }
    fs::write(path, &data)?;
    info!("wrote title to {}", path.display());
    Ok(())
}

/// Walk `settings.root` for icon.sys files and let the user retitle each.
pub fn run_titles(settings: &TitleSettings, prompter: &mut dyn Prompter) -> Result<BatchSummary> {
    settings
        .layout
        .validate()
        .map_err(|e| IconSysError::Config(e.to_string()))?;
    let root = resolve_root(&settings.root)?;
    let layout = &settings.layout;

    prompter.show(&format!("Root: {}", root.display()));
    let icons = find_files(&root, ICON_SYS_NAME)?;
    prompter.show(&format!("Found {} icon.sys files.", icons.len()));

    let mut summary = BatchSummary {
        found: icons.len(),
        ..BatchSummary::default()
    };
    if icons.is_empty() {
        prompter.show("Nothing to do.");
        return Ok(summary);
    }

    for (i, path) in icons.iter().enumerate() {
        prompter.show(&format!(
            "[{}/{}] {}",
            i + 1,
            icons.len(),
            relative(&root, path).display()
        ));

        let current = match read_preview(path, layout) {
            Ok(preview) => preview,
            Err(err) => {
                warn!("failed to read {}: {err}", path.display());
                prompter.show(&format!("  ERROR reading: {err}"));
                summary.failed += 1;
                continue;
            }
        };
        prompter.show(&format!(
            "  Current split @{:#04X}: {}",
            layout.split_offset, current.split
        ));
        prompter.show(&format!("  Current Line1: '{}'", current.line1));
        prompter.show(&format!("  Current Line2: '{}'", current.line2));

        let Some(answer1) =
            prompter.ask("  New Line 1 (blank=keep, 's'=skip file, 'q'=quit all): ")
        else {
            prompter.show("Quit requested.");
            break;
        };
        if answer1.eq_ignore_ascii_case("q") {
            prompter.show("Quit requested.");
            break;
        }
        if answer1.eq_ignore_ascii_case("s") {
            prompter.show("  Skipped.");
            summary.skipped += 1;
            continue;
        }
        let answer2 = prompter.ask("  New Line 2 (blank=keep): ").unwrap_or_default();

        let line1 = if answer1.is_empty() { current.line1 } else { answer1 };
        let line2 = if answer2.is_empty() { current.line2 } else { answer2 };

        match write_titles(path, &line1, &line2, layout, settings.backup) {
            Ok(()) => {
                prompter.show("  Written.");
                summary.written += 1;
            }
            Err(IconSysError::Title(err)) => {
                warn!("rejected title for {}: {err}", path.display());
                prompter.show(&format!("  ERROR: {err}. Skipping."));
                summary.failed += 1;
            }
            Err(err) => {
                warn!("failed to write {}: {err}", path.display());
                prompter.show(&format!("  ERROR writing: {err}"));
                summary.failed += 1;
            }
        }
    }

    prompter.show("Done.");
    Ok(summary)
}
