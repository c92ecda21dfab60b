use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Append-only completion log. One line per completed step:
///
/// ```text
/// [2026-08-28 14:03:11] COMPLETED: SWAP_PROVISIONED
/// ```
///
/// Presence of an entry is a cache of a past successful verification, never
/// the source of truth about live system state. Entries are only removed by
/// an explicit `reset`. No locking: single operator, single run at a time.
#[derive(Debug, Clone)]
pub struct CheckpointLog {
    path: PathBuf,
}

const MARKER: &str = "COMPLETED: ";

impl CheckpointLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_done(&self, step: &str) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let data = fs::read_to_string(&self.path).map_err(|e| {
            Error::ctx(format!("failed to read checkpoint log {}", self.path.display()), e)
        })?;
        Ok(data.lines().any(|l| line_marks(l, step)))
    }

    pub fn mark_done(&self, step: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::ctx(format!("failed to create checkpoint dir {}", parent.display()), e)
            })?;
        }
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                Error::ctx(format!("failed to open checkpoint log {}", self.path.display()), e)
            })?;
        writeln!(f, "[{stamp}] {MARKER}{step}").map_err(|e| {
            Error::ctx(
                format!("failed to append to checkpoint log {}", self.path.display()),
                e,
            )
        })?;
        tracing::debug!(step, "checkpoint recorded");
        Ok(())
    }

    /// All recorded `(timestamp, step)` pairs, in file order.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path).map_err(|e| {
            Error::ctx(format!("failed to read checkpoint log {}", self.path.display()), e)
        })?;
        let mut out = Vec::new();
        for line in data.lines() {
            let Some((ts, step)) = parse_line(line) else {
                continue;
            };
            out.push((ts.to_string(), step.to_string()));
        }
        Ok(out)
    }

    /// Explicit cleanup. The only way checkpoint entries ever go away.
    pub fn reset(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        fs::remove_file(&self.path).map_err(|e| {
            Error::ctx(format!("failed to remove checkpoint log {}", self.path.display()), e)
        })
    }
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('[')?;
    let (ts, rest) = rest.split_once(']')?;
    let step = rest.trim_start().strip_prefix(MARKER)?;
    Some((ts, step.trim()))
}

fn line_marks(line: &str, step: &str) -> bool {
    // Exact step-name match; a marker for SWAP must not satisfy SWAP_PERSISTED.
    matches!(parse_line(line), Some((_, s)) if s == step)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log() -> (tempfile::TempDir, CheckpointLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::new(dir.path().join("state").join("checkpoints.log"));
        (dir, log)
    }

    #[test]
    fn mark_then_query() {
        let (_dir, log) = temp_log();
        assert!(!log.is_done("OS_CHECKED").unwrap());
        log.mark_done("OS_CHECKED").unwrap();
        assert!(log.is_done("OS_CHECKED").unwrap());
        assert!(!log.is_done("SWAP_PROVISIONED").unwrap());
    }

    #[test]
    fn step_names_do_not_prefix_match() {
        let (_dir, log) = temp_log();
        log.mark_done("SWAP").unwrap();
        assert!(!log.is_done("SWAP_PERSISTED").unwrap());
        log.mark_done("SWAP_PERSISTED").unwrap();
        assert!(log.is_done("SWAP").unwrap());
        assert!(log.is_done("SWAP_PERSISTED").unwrap());
    }

    #[test]
    fn entries_are_append_only_and_ordered() {
        let (_dir, log) = temp_log();
        log.mark_done("A").unwrap();
        log.mark_done("B").unwrap();
        let steps: Vec<String> = log.entries().unwrap().into_iter().map(|(_, s)| s).collect();
        assert_eq!(steps, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn reset_clears_everything() {
        let (_dir, log) = temp_log();
        log.mark_done("A").unwrap();
        log.reset().unwrap();
        assert!(!log.is_done("A").unwrap());
        assert!(log.entries().unwrap().is_empty());
        // resetting an absent log is fine
        log.reset().unwrap();
    }

    #[test]
    fn line_format_matches_grep_contract() {
        let (_dir, log) = temp_log();
        log.mark_done("NGINX_RELOADED").unwrap();
        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(raw.contains("COMPLETED: NGINX_RELOADED"), "raw: {raw}");
        assert!(raw.starts_with('['), "raw: {raw}");
    }
}
