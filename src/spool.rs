use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tempfile::NamedTempFile;

use crate::types::{SpoolRecord, WorkItem};
use crate::{log_debug, log_warn};

/// Live spool file name inside the data directory.
pub const SPOOL_FILE: &str = "queue.jsonl";

/// The graceful-stop directive. A journaled text item carrying this
/// command (for a non-degenerate scope) becomes the restart barrier.
pub const STOP_DIRECTIVE: &str = "/restart";

// --- Stop directive detection ---

/// First command token of a text: leading/trailing space trimmed,
/// `@bot` suffix stripped from commands, lowercased.
fn normalize_command_token(text: &str) -> String {
    let tok = text.trim().split_whitespace().next().unwrap_or("");
    let tok = match tok.split_once('@') {
        Some((cmd, _)) if cmd.starts_with('/') => cmd,
        _ => tok,
    };
    tok.to_lowercase()
}

/// Whether this item is the graceful-stop directive.
///
/// Only text items addressed to a real scope qualify; a degenerate
/// scope must never be able to trigger a restart cycle.
pub fn is_stop_directive(item: &WorkItem) -> bool {
    if item.scope().is_degenerate() {
        return false;
    }
    match item.payload.text() {
        Some(text) => normalize_command_token(text) == STOP_DIRECTIVE,
        None => false,
    }
}

// --- Record validity ---

/// Parse one journal line. Returns None for anything a replay cannot
/// use: unparseable JSON (partial writes), unknown kinds, empty
/// payloads, degenerate scopes.
fn parse_record(line: &str) -> Option<SpoolRecord> {
    let s = line.trim();
    if s.is_empty() {
        return None;
    }
    let record: SpoolRecord = serde_json::from_str(s).ok()?;
    if record.item.scope().is_degenerate() {
        return None;
    }
    match &record.item.payload {
        crate::types::Payload::Text(p) => {
            if p.text.trim().is_empty() {
                return None;
            }
        }
        crate::types::Payload::Callback(p) => {
            if p.callback_id.trim().is_empty() {
                return None;
            }
        }
    }
    Some(record)
}

// --- Drain file ordering ---

/// Order drain files deterministically (oldest first): embedded unix
/// timestamp, then mtime, then name.
fn drain_sort_key(path: &Path) -> (u64, u128, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let ts = name
        .strip_suffix(".jsonl")
        .and_then(|s| s.rsplit('.').next())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let mtime = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    (ts, mtime, name)
}

/// Write lines to `path` atomically (temp file in the same directory,
/// sync, rename).
fn atomic_write_lines(path: &Path, lines: &[String]) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("Cannot determine parent directory of {}", path.display()))?;

    fs::create_dir_all(parent)
        .map_err(|e| format!("Failed to create directory {}: {}", parent.display(), e))?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|e| format!("Failed to create temp file in {}: {}", parent.display(), e))?;

    for line in lines {
        temp_file
            .write_all(line.as_bytes())
            .and_then(|_| temp_file.write_all(b"\n"))
            .map_err(|e| format!("Failed to write temp file: {}", e))?;
    }

    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| format!("Failed to sync temp file: {}", e))?;

    temp_file
        .persist(path)
        .map_err(|e| format!("Failed to rename temp file to {}: {}", path.display(), e))?;

    Ok(())
}

// --- Spool ---

/// Append-only ingestion journal with reference-counted drain files.
///
/// Every inbound item is journaled to the live spool before it is
/// enqueued. At startup, `consolidate_for_startup` merges stale drain
/// files with the live spool into one fresh drain file (cut at the
/// restart barrier), which `load` reads and `release` reclaims as
/// items complete.
pub struct Spool {
    path: PathBuf,
    /// Shared by append and consolidation so a rotation never
    /// interleaves with a partial line write.
    file_lock: Mutex<()>,
    /// Remaining-record counts per drain file; a file is deleted when
    /// its count reaches zero.
    remaining: Mutex<HashMap<PathBuf, usize>>,
}

impl Spool {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SPOOL_FILE),
            file_lock: Mutex::new(()),
            remaining: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_guard(&self) -> MutexGuard<'_, ()> {
        self.file_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remaining_guard(&self) -> MutexGuard<'_, HashMap<PathBuf, usize>> {
        self.remaining.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Journal one item to the live spool.
    ///
    /// An I/O failure loses only this append; it is reported to the
    /// caller and must not poison the lock or the process.
    pub fn append(&self, item: &WorkItem) -> Result<(), String> {
        let record = SpoolRecord::new(item.clone());
        let line = serde_json::to_string(&record)
            .map_err(|e| format!("Failed to serialize spool record: {}", e))?;

        let _guard = self.file_guard();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory {}: {}", parent.display(), e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| format!("Failed to open spool {}: {}", self.path.display(), e))?;

        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| format!("Failed to append to spool {}: {}", self.path.display(), e))?;

        Ok(())
    }

    /// Stale drain files next to the live spool, oldest first.
    fn stale_drain_files(&self) -> Vec<PathBuf> {
        let Some(parent) = self.path.parent() else {
            return Vec::new();
        };
        let prefix = format!("{}.drain.", SPOOL_FILE);
        let mut drains: Vec<PathBuf> = match fs::read_dir(parent) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .map(|n| {
                            let name = n.to_string_lossy();
                            name.starts_with(&prefix) && name.ends_with(".jsonl")
                        })
                        .unwrap_or(false)
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        drains.sort_by_key(|p| drain_sort_key(p));
        drains
    }

    /// Merge stale drain files and the live spool into at most one
    /// fresh drain file plus an optional live-spool remainder.
    ///
    /// Records up to and including the first stop directive land in
    /// the drain file (returned for loading); records after it are
    /// rewritten to a new live spool for the next process generation.
    /// Invalid lines are dropped. If nothing valid remains, all
    /// sources are removed and None is returned.
    ///
    /// Idempotent: re-running over its own output yields the same
    /// prefix/remainder split.
    pub fn consolidate_for_startup(&self) -> Result<Option<PathBuf>, String> {
        let _guard = self.file_guard();

        let mut sources = self.stale_drain_files();
        if self.path.exists() {
            sources.push(self.path.clone());
        }
        if sources.is_empty() {
            return Ok(None);
        }

        let mut lines: Vec<String> = Vec::new();
        let mut barrier_idx: Option<usize> = None;
        for src in &sources {
            let raw = match fs::read_to_string(src) {
                Ok(raw) => raw,
                Err(e) => {
                    log_warn!("Skipping unreadable spool source {}: {}", src.display(), e);
                    continue;
                }
            };
            for line in raw.lines() {
                let Some(record) = parse_record(line) else {
                    continue;
                };
                if barrier_idx.is_none() && is_stop_directive(&record.item) {
                    barrier_idx = Some(lines.len());
                }
                lines.push(line.trim().to_string());
            }
        }

        if lines.is_empty() {
            for src in &sources {
                if let Err(e) = fs::remove_file(src) {
                    log_debug!("Failed to remove empty source {}: {}", src.display(), e);
                }
            }
            return Ok(None);
        }

        let (prefix, suffix) = match barrier_idx {
            None => (lines.as_slice(), &[] as &[String]),
            Some(idx) => lines.split_at(idx + 1),
        };

        let ts = chrono::Utc::now().timestamp();
        let drain_now = self
            .path
            .with_file_name(format!("{}.drain.{}.jsonl", SPOOL_FILE, ts));
        atomic_write_lines(&drain_now, prefix)?;

        if suffix.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log_warn!(
                    "Failed to remove consumed spool {}: {}",
                    self.path.display(),
                    e
                ),
            }
        } else {
            atomic_write_lines(&self.path, suffix)?;
        }

        for src in &sources {
            if *src == drain_now || *src == self.path {
                continue;
            }
            if let Err(e) = fs::remove_file(src) {
                log_warn!("Failed to remove stale source {}: {}", src.display(), e);
            }
        }

        Ok(Some(drain_now))
    }

    /// Read a drain file fully into memory and record its expected
    /// count for reference-counted deletion. Never deletes the file.
    pub fn load(&self, drain: &Path) -> Result<Vec<WorkItem>, String> {
        let raw = fs::read_to_string(drain)
            .map_err(|e| format!("Failed to read drain file {}: {}", drain.display(), e))?;

        let token = drain.display().to_string();
        let items: Vec<WorkItem> = raw
            .lines()
            .filter_map(parse_record)
            .map(|record| {
                let mut item = record.item;
                item.source_token = token.clone();
                item
            })
            .collect();

        if !items.is_empty() {
            self.remaining_guard()
                .insert(drain.to_path_buf(), items.len());
        }

        Ok(items)
    }

    /// Decrement the remaining count for a drain file; delete the file
    /// once it reaches zero. Safe across concurrent workers.
    pub fn release(&self, token: &str) {
        self.release_n(token, 1);
    }

    pub fn release_n(&self, token: &str, n: usize) {
        if token.is_empty() || n == 0 {
            return;
        }
        let path = PathBuf::from(token);
        let mut remaining = self.remaining_guard();
        let Some(count) = remaining.get(&path).copied() else {
            log_debug!("Release for untracked drain file {}", token);
            return;
        };
        let left = count.saturating_sub(n);
        if left > 0 {
            remaining.insert(path, left);
            return;
        }
        remaining.remove(&path);
        drop(remaining);
        match fs::remove_file(&path) {
            Ok(()) => log_debug!("Drain file {} fully processed, removed", token),
            Err(e) => log_warn!("Failed to remove drain file {}: {}", token, e),
        }
    }

    /// Remaining-record count for a drain file, if tracked.
    pub fn remaining_for(&self, drain: &Path) -> Option<usize> {
        self.remaining_guard().get(drain).copied()
    }
}
