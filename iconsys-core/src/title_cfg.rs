//! Interactive editor for the `key=value` pairs in `title.cfg` files.
//!
//! Every saved file has its pairs normalized to `key=value` and trailing
//! spaces/tabs removed from every line. Comments, blank lines, line order,
//! newline style and text encoding are kept.

use encoding_rs::{SHIFT_JIS, WINDOWS_1252};
use log::{debug, info, warn};
use std::fs;
use std::path::Path;

use crate::{backup_once, find_files, resolve_root, relative};
use crate::{BatchSummary, CfgSettings, IconSysError, Prompter, Result};

pub const TITLE_CFG_NAME: &str = "title.cfg";

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Bytes windows-1252 leaves unassigned.
const CP1252_UNDEFINED: &[u8] = &[0x81, 0x8D, 0x8F, 0x90, 0x9D];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8Bom,
    Utf8,
    ShiftJis,
    Windows1252,
    Latin1,
}

impl TextEncoding {
    const CANDIDATES: [TextEncoding; 5] = [
        TextEncoding::Utf8Bom,
        TextEncoding::Utf8,
        TextEncoding::ShiftJis,
        TextEncoding::Windows1252,
        TextEncoding::Latin1,
    ];

    /// First candidate that decodes `raw` without errors. Latin-1 accepts
    /// anything, so detection always succeeds.
    pub fn detect(raw: &[u8]) -> Self {
        Self::CANDIDATES
            .into_iter()
            .find(|enc| enc.decode(raw).is_some())
            .unwrap_or(TextEncoding::Latin1)
    }

    pub fn name(self) -> &'static str {
        match self {
            TextEncoding::Utf8Bom => "utf-8-sig",
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::ShiftJis => "shift_jis",
            TextEncoding::Windows1252 => "cp1252",
            TextEncoding::Latin1 => "latin-1",
        }
    }

    /// Strict decode; `None` if `raw` is not valid in this encoding.
    pub fn decode(self, raw: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8Bom => {
                let body = raw.strip_prefix(UTF8_BOM)?;
                std::str::from_utf8(body).ok().map(str::to_owned)
            }
            TextEncoding::Utf8 => std::str::from_utf8(raw).ok().map(str::to_owned),
            TextEncoding::ShiftJis => SHIFT_JIS
                .decode_without_bom_handling_and_without_replacement(raw)
                .map(|text| text.into_owned()),
            TextEncoding::Windows1252 => {
                if raw.iter().any(|b| CP1252_UNDEFINED.contains(b)) {
                    return None;
                }
                let (text, _) = WINDOWS_1252.decode_without_bom_handling(raw);
                Some(text.into_owned())
            }
            TextEncoding::Latin1 => Some(raw.iter().map(|&b| char::from(b)).collect()),
        }
    }

    /// Strict encode; fails if `text` has characters this encoding lacks.
    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            TextEncoding::Utf8Bom => {
                let mut out = UTF8_BOM.to_vec();
                out.extend_from_slice(text.as_bytes());
                Ok(out)
            }
            TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            TextEncoding::ShiftJis | TextEncoding::Windows1252 => {
                let encoding = if self == TextEncoding::ShiftJis {
                    SHIFT_JIS
                } else {
                    WINDOWS_1252
                };
                let (bytes, _, had_errors) = encoding.encode(text);
                if had_errors {
                    return Err(IconSysError::Encoding(format!(
                        "text cannot be represented in {}",
                        self.name()
                    )));
                }
                Ok(bytes.into_owned())
            }
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).map_err(|_| {
                        IconSysError::Encoding(format!("{c:?} cannot be represented in latin-1"))
                    })
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Newline {
    Lf,
    CrLf,
}

impl Newline {
    pub fn detect(text: &str) -> Self {
        if text.contains("\r\n") && !text.ends_with('\r') {
            Newline::CrLf
        } else {
            Newline::Lf
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Newline::Lf => "\n",
            Newline::CrLf => "\r\n",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Newline::Lf => "LF",
            Newline::CrLf => "CRLF",
        }
    }
}

pub fn is_kv_line(line: &str) -> bool {
    let stripped = line.trim_start();
    !stripped.is_empty() && !stripped.starts_with(['#', ';']) && line.contains('=')
}

/// Split at the first `=` and trim both sides.
pub fn split_kv(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

pub fn normalize_kv(key: &str, value: &str) -> String {
    format!("{}={}", key.trim(), value.trim())
}

/// What the user wants done with one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgAnswer {
    Keep,
    Replace(String),
    /// Keep this key and leave the rest of the file unprompted.
    SkipRest,
    /// Like `SkipRest`, then stop the whole batch after this file.
    QuitAll,
}

impl CfgAnswer {
    /// End of input counts as keep.
    pub fn parse(input: Option<&str>) -> Self {
        match input {
            None | Some("") => CfgAnswer::Keep,
            Some(s) if s.eq_ignore_ascii_case("qa") => CfgAnswer::QuitAll,
            Some(s) if s.eq_ignore_ascii_case("q") => CfgAnswer::SkipRest,
            Some(s) => CfgAnswer::Replace(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgEdit {
    pub lines: Vec<String>,
    pub trailing_newline: bool,
    pub changed: bool,
    pub quit_all: bool,
}

impl CfgEdit {
    pub fn render(&self, newline: Newline) -> String {
        let nl = newline.as_str();
        let mut out = self.lines.join(nl);
        if self.trailing_newline {
            out.push_str(nl);
        }
        out
    }
}

/// Line boundaries besides `\r\n`: the ASCII breaks, the C0 separators
/// FS/GS/RS, NEL and the Unicode line and paragraph separators.
const LINE_BREAKS: &[char] = &[
    '\n', '\r', '\x0b', '\x0c', '\x1c', '\x1d', '\x1e', '\u{85}', '\u{2028}', '\u{2029}',
];

fn split_lines(text: &str) -> (Vec<String>, bool) {
    let normalized = text.replace("\r\n", "\n");
    let trailing = normalized.ends_with(LINE_BREAKS);
    let mut lines: Vec<String> = normalized.split(LINE_BREAKS).map(str::to_owned).collect();
    if trailing || normalized.is_empty() {
        lines.pop();
    }
    (lines, trailing)
}

/// Walk the lines of `text`, asking `answer(index, total, current)` for each
/// key/value line. `index` is 1-based, `current` the normalized pair.
pub fn edit_lines<F>(text: &str, mut answer: F) -> CfgEdit
where
    F: FnMut(usize, usize, &str) -> CfgAnswer,
{
    let (lines, trailing_newline) = split_lines(text);
    let total = lines.iter().filter(|l| is_kv_line(l)).count();

    let mut out = Vec::with_capacity(lines.len());
    let mut quit_all = false;
    let mut idx = 0;
    let mut rest = lines.iter();

    while let Some(raw) = rest.next() {
        let line = raw.trim_end_matches([' ', '\t']);
        let Some((key, value)) = split_kv(line).filter(|_| is_kv_line(line)) else {
            out.push(line.to_string());
            continue;
        };

        idx += 1;
        let current = normalize_kv(key, value);
        match answer(idx, total, &current) {
            CfgAnswer::Keep => out.push(current),
            CfgAnswer::Replace(new_value) => out.push(normalize_kv(key, &new_value)),
            stop @ (CfgAnswer::SkipRest | CfgAnswer::QuitAll) => {
                quit_all = stop == CfgAnswer::QuitAll;
                out.push(current);
                out.extend(rest.by_ref().map(|l| l.trim_end_matches([' ', '\t']).to_string()));
                break;
            }
        }
    }

    let changed = out.len() != lines.len() || out.iter().zip(&lines).any(|(new, old)| new != old);
    CfgEdit {
        lines: out,
        trailing_newline,
        changed,
        quit_all,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfgOutcome {
    pub saved: bool,
    pub quit_all: bool,
}

/// Edit one title.cfg in place. Nothing is written unless a line changed.
pub fn process_file(path: &Path, backup: bool, prompter: &mut dyn Prompter) -> Result<CfgOutcome> {
    let raw = fs::read(path)?;
    let encoding = TextEncoding::detect(&raw);
    let text = encoding
        .decode(&raw)
        .ok_or_else(|| IconSysError::Encoding(format!("not valid {}", encoding.name())))?;
    let newline = Newline::detect(&text);
    debug!("{}: {} / {}", path.display(), encoding.name(), newline.label());

    prompter.show(&format!(
        "Encoding: {}, Newline: {}",
        encoding.name(),
        newline.label()
    ));
    prompter.show("Editing existing keys. Blank = keep. 'q' = stop this file, 'qa' = quit all.");
    prompter.show("Formatting enforced: no spaces around '=', no trailing spaces.");

    let edit = edit_lines(&text, |idx, total, current| {
        prompter.show(&format!("  [{idx}/{total}] {current}"));
        let input = prompter.ask("     New value (blank=keep, q=skip file, qa=quit all): ");
        CfgAnswer::parse(input.as_deref())
    });

    if !edit.changed {
        prompter.show("  No changes.");
        return Ok(CfgOutcome {
            saved: false,
            quit_all: edit.quit_all,
        });
    }

    let bytes = encoding.encode(&edit.render(newline))?;
    if backup {
        backup_once(path)?;
    }
    fs::write(path, bytes)?;
    info!("saved {}", path.display());
    prompter.show("  Saved.");
    Ok(CfgOutcome {
        saved: true,
        quit_all: edit.quit_all,
    })
}

/// Walk `settings.root` for title.cfg files and edit each in turn.
pub fn run_cfg(settings: &CfgSettings, prompter: &mut dyn Prompter) -> Result<BatchSummary> {
    let root = resolve_root(&settings.root)?;
    prompter.show(&format!("Root: {}", root.display()));
    let files = find_files(&root, TITLE_CFG_NAME)?;
    prompter.show(&format!("Found {} title.cfg files.", files.len()));

    let mut summary = BatchSummary {
        found: files.len(),
        ..BatchSummary::default()
    };
    if files.is_empty() {
        prompter.show("Nothing to do.");
        return Ok(summary);
    }

    for (n, path) in files.iter().enumerate() {
        prompter.show(&format!(
            "[File {}/{}] {}",
            n + 1,
            files.len(),
            relative(&root, path).display()
        ));
        match process_file(path, settings.backup, prompter) {
            Ok(outcome) => {
                if outcome.saved {
                    summary.written += 1;
                } else {
                    summary.skipped += 1;
                }
                if outcome.quit_all {
                    prompter.show("Quit all requested. Exiting.");
                    break;
                }
            }
            Err(err) => {
                warn!("failed to edit {}: {err}", path.display());
                prompter.show(&format!("  ERROR: {err}"));
                summary.failed += 1;
            }
        }
    }

    prompter.show("Done.");
    Ok(summary)
}
