//! JSON-lines result files.
//!
//! Each loaded target opens a results file `<sheet>_<material>_<YYYYmmdd_HHMMSS>.json`
//! in the results directory; every telemetry sample for it is appended as one JSON
//! object per line. Sent commands go to `commands.jsonl` in the same directory. Write
//! failures are logged and otherwise ignored.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::collaborators::RecordSink;
use crate::protocol::{ControlCommand, TelemetrySample};
use crate::targets::Target;
use crate::{DoserError, Result};

/// Command log file name inside the results directory.
pub const COMMANDS_FILE: &str = "commands.jsonl";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const RESULT_EXTENSION: &str = "json";

/// Results file for `material`, stamped with `at`.
///
/// Characters that would break the name apart (path separators, `_`) are replaced by `-`
/// in the sheet and material parts.
pub fn result_file_name(sheet: &str, material: &str, at: DateTime<Local>) -> String {
    format!(
        "{}_{}_{}.{RESULT_EXTENSION}",
        sanitize(sheet),
        sanitize(material),
        at.format(TIMESTAMP_FORMAT)
    )
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '_' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect();
    if cleaned.is_empty() { "-".to_string() } else { cleaned }
}

/// A results file found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultFileInfo {
    pub path: PathBuf,
    pub sheet: String,
    pub material: String,
    pub created: NaiveDateTime,
    pub size: u64,
}

impl ResultFileInfo {
    /// Split a results file name into sheet, material and timestamp.
    pub fn parse_name(file_name: &str) -> Option<(String, String, NaiveDateTime)> {
        let stem = file_name.strip_suffix(RESULT_EXTENSION)?.strip_suffix('.')?;
        let mut parts = stem.rsplitn(4, '_');
        let time = parts.next()?;
        let date = parts.next()?;
        let material = parts.next()?;
        let sheet = parts.next()?;
        let created =
            NaiveDateTime::parse_from_str(&format!("{date}_{time}"), TIMESTAMP_FORMAT).ok()?;
        Some((sheet.to_string(), material.to_string(), created))
    }
}

/// Results files in `dir`, oldest first. Files not named like results are skipped.
pub fn list_results(dir: impl AsRef<Path>) -> Result<Vec<ResultFileInfo>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|e| DoserError::file_error(dir, e))?;

    let mut results = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DoserError::file_error(dir, e))?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some((sheet, material, created)) = ResultFileInfo::parse_name(&file_name) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        results.push(ResultFileInfo { path: entry.path(), sheet, material, created, size });
    }

    results.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.path.cmp(&b.path)));
    Ok(results)
}

#[derive(Serialize)]
struct CommandRecord<'a> {
    time: String,
    #[serde(flatten)]
    command: &'a ControlCommand,
}

/// [`RecordSink`] appending JSON lines to files in a results directory.
#[derive(Debug)]
pub struct JsonLinesSink {
    dir: PathBuf,
    sheet: String,
    /// Material and path of the file currently receiving samples.
    current: Option<(String, PathBuf)>,
}

impl JsonLinesSink {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, sheet: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| DoserError::file_error(&dir, e))?;
        info!(dir = %dir.display(), "Results directory ready");
        Ok(Self { dir, sheet: sheet.into(), current: None })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Name used as the first part of new results files.
    pub fn set_sheet(&mut self, sheet: impl Into<String>) {
        self.sheet = sheet.into();
    }

    /// File currently receiving samples, if any.
    pub fn current_file(&self) -> Option<&Path> {
        self.current.as_ref().map(|(_, path)| path.as_path())
    }

    pub fn commands_file(&self) -> PathBuf {
        self.dir.join(COMMANDS_FILE)
    }

    fn open_results(&mut self, material: &str) -> PathBuf {
        let path = self.dir.join(result_file_name(&self.sheet, material, Local::now()));
        info!(material, path = %path.display(), "New results file");
        self.current = Some((material.to_string(), path.clone()));
        path
    }

    fn results_path(&mut self, material: &str) -> PathBuf {
        match &self.current {
            Some((current, path)) if current == material => path.clone(),
            _ => self.open_results(material),
        }
    }
}

fn append_line(path: &Path, value: &impl Serialize) -> Result<()> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| DoserError::protocol("results record", e.to_string()))?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DoserError::file_error(path, e))?;
    file.write_all(line.as_bytes()).map_err(|e| DoserError::file_error(path, e))
}

impl RecordSink for JsonLinesSink {
    fn begin_sheet(&mut self, name: &str) {
        self.set_sheet(name);
        self.current = None;
    }

    fn begin_target(&mut self, row: usize, target: &Target) {
        debug!(row, material = %target.material, "Starting results for target");
        self.open_results(&target.material);
    }

    fn record(&mut self, material: &str, sample: &TelemetrySample) {
        let path = self.results_path(material);
        if let Err(e) = append_line(&path, sample) {
            error!(material, "Failed to save telemetry sample: {}", e);
        }
    }

    fn record_command(&mut self, command: &ControlCommand) {
        let record = CommandRecord { time: Local::now().to_rfc3339(), command };
        if let Err(e) = append_line(&self.commands_file(), &record) {
            error!("Failed to save command: {}", e);
        }
    }
}
