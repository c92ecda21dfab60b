use std::fs::{self, OpenOptions};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use walkdir::WalkDir;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub ok: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            ok: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            ok: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Seam between steps and the machine they mutate. Steps never touch
/// `std::process` or the filesystem directly (the checkpoint log is the one
/// exception; it is the runner's own state, not probed system state).
/// Tests drive flows against a scripted implementation.
pub trait Host {
    /// Run a command, capturing sanitized output. A non-zero exit is not an
    /// `Err`; callers decide what failure means for their step.
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput>;

    /// Run a command wired to the operator's terminal. Used for the
    /// browser-based tunnel login and the foreground tunnel test; blocks with
    /// no timeout until the operator finishes or interrupts it.
    fn run_interactive(&self, program: &str, args: &[&str]) -> Result<bool>;

    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;
    fn append_file(&self, path: &Path, contents: &str) -> Result<()>;
    fn path_exists(&self, path: &Path) -> bool;
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    fn download(&self, url: &str, dest: &Path) -> Result<()>;

    /// Ask the operator a yes/no question. Implementations honouring
    /// `--assume-yes` answer true without prompting.
    fn confirm(&self, prompt: &str) -> Result<bool>;

    fn is_root(&self) -> bool;
}

pub struct LiveHost {
    pub assume_yes: bool,
}

impl LiveHost {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl Host for LiveHost {
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        tracing::debug!(program, ?args, "exec");
        let out = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::ctx(format!("failed to spawn {program}"), e))?;
        Ok(CmdOutput {
            ok: out.status.success(),
            code: out.status.code(),
            stdout: sanitize_output(&String::from_utf8_lossy(&out.stdout)),
            stderr: sanitize_output(&String::from_utf8_lossy(&out.stderr)),
        })
    }

    fn run_interactive(&self, program: &str, args: &[&str]) -> Result<bool> {
        tracing::debug!(program, ?args, "exec interactive");
        // Shield ourselves from the Ctrl+C the operator uses to stop a
        // foreground child; the signal still reaches the child.
        with_sigint_ignored(|| {
            let status = Command::new(program)
                .args(args)
                .status()
                .map_err(|e| Error::ctx(format!("failed to spawn {program}"), e))?;
            Ok(status.success())
        })
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path)
            .map_err(|e| Error::ctx(format!("failed to read {}", path.display()), e))
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::ctx(format!("failed to create dir {}", parent.display()), e))?;
        }
        fs::write(path, contents)
            .map_err(|e| Error::ctx(format!("failed to write {}", path.display()), e))
    }

    fn append_file(&self, path: &Path, contents: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::ctx(format!("failed to open {}", path.display()), e))?;
        f.write_all(contents.as_bytes())
            .map_err(|e| Error::ctx(format!("failed to append to {}", path.display()), e))
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(path).min_depth(1).max_depth(1) {
            let entry =
                entry.map_err(|e| Error::ctx(format!("failed to list {}", path.display()), e))?;
            out.push(entry.into_path());
        }
        out.sort();
        Ok(out)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        tracing::debug!(url, dest = %dest.display(), "download");
        let resp = reqwest::blocking::get(url)
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::ctx(format!("download of {url} failed"), e))?;
        let bytes = resp
            .bytes()
            .map_err(|e| Error::ctx(format!("download of {url} failed"), e))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::ctx(format!("failed to create dir {}", parent.display()), e))?;
        }
        fs::write(dest, &bytes)
            .map_err(|e| Error::ctx(format!("failed to write {}", dest.display()), e))
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        if self.assume_yes {
            println!("{prompt} [y/N] y (--assume-yes)");
            return Ok(true);
        }
        print!("{prompt} [y/N] ");
        std::io::stdout()
            .flush()
            .map_err(|e| Error::ctx("failed to flush stdout", e))?;
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| Error::ctx("failed to read confirmation", e))?;
        let answer = line.trim().to_ascii_lowercase();
        Ok(answer == "y" || answer == "yes")
    }

    fn is_root(&self) -> bool {
        #[cfg(unix)]
        {
            unsafe { libc::geteuid() == 0 }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

#[cfg(unix)]
fn with_sigint_ignored<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    unsafe {
        let prev = libc::signal(libc::SIGINT, libc::SIG_IGN);
        let r = f();
        libc::signal(libc::SIGINT, prev);
        r
    }
}

#[cfg(not(unix))]
fn with_sigint_ignored<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    f()
}

const MAX_OUTPUT_CHARS: usize = 64 * 1024;

/// Strip terminal escape sequences and control characters from captured
/// command output before it ever reaches a log line or an error message.
pub fn sanitize_output(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_OUTPUT_CHARS));
    let mut in_escape = false;
    let mut count = 0usize;
    for c in input.chars() {
        if in_escape {
            // CSI and friends end on a final byte in '@'..='~'.
            if ('@'..='~').contains(&c) {
                in_escape = false;
            }
            continue;
        }
        if c == '\x1b' {
            in_escape = true;
            continue;
        }
        if c == '\n' || c == '\t' {
            out.push(c);
        } else if c.is_control() {
            continue;
        } else {
            out.push(c);
        }
        count += 1;
        if count >= MAX_OUTPUT_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::sanitize_output;

    #[test]
    fn strips_ansi_colors() {
        let got = sanitize_output("ok \u{1b}[31mred\u{1b}[0m done");
        assert_eq!(got, "ok red done");
    }

    #[test]
    fn keeps_newlines_drops_other_controls() {
        let got = sanitize_output("a\nb\rc\x07d");
        assert_eq!(got, "a\nbcd");
    }
}
