// Not every test binary uses every helper.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use relay_provisioner::config::Settings;
use relay_provisioner::error::{Error, Result};
use relay_provisioner::executor::{EventSink, StepEvent};
use relay_provisioner::host::{CmdOutput, Host};

/// Event sink that swallows progress output during tests.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _ev: StepEvent) {}
}

/// Event sink that keeps step log lines for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub lines: RefCell<Vec<String>>,
}

impl EventSink for RecordingSink {
    fn emit(&self, ev: StepEvent) {
        if let StepEvent::StepLog { line, .. } = ev {
            self.lines.borrow_mut().push(line);
        }
    }
}

/// Scripted host. Files hold a queue of contents so a probe can observe one
/// state before a mutation and another after it; the last queued value is
/// sticky. Commands are matched by the longest registered prefix of
/// "program arg0 arg1 ..."; unmatched commands succeed with empty output.
/// Every call is recorded for no-mutation assertions.
#[derive(Default)]
pub struct FakeHost {
    files: RefCell<HashMap<PathBuf, Vec<String>>>,
    cmds: RefCell<HashMap<String, Vec<CmdOutput>>>,
    effects: RefCell<HashMap<String, Vec<(PathBuf, String)>>>,
    pub calls: RefCell<Vec<String>>,
    pub prompts: RefCell<Vec<String>>,
    pub confirm_answer: Cell<bool>,
}

impl FakeHost {
    pub fn new() -> Self {
        let h = Self::default();
        h.confirm_answer.set(true);
        h
    }

    pub fn seed_file(&self, path: &str, content: &str) {
        self.files
            .borrow_mut()
            .insert(PathBuf::from(path), vec![content.to_string()]);
    }

    /// Successive reads of `path` observe the given contents in order; the
    /// final one repeats.
    pub fn seed_file_seq(&self, path: &str, contents: &[&str]) {
        self.files.borrow_mut().insert(
            PathBuf::from(path),
            contents.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn on_cmd(&self, prefix: &str, outputs: &[CmdOutput]) {
        self.cmds
            .borrow_mut()
            .insert(prefix.to_string(), outputs.to_vec());
    }

    /// Running a command matching `prefix` drops a file into place, standing
    /// in for side effects like `cloudflared tunnel login` writing cert.pem.
    pub fn on_cmd_effect(&self, prefix: &str, path: &str, content: &str) {
        self.effects
            .borrow_mut()
            .entry(prefix.to_string())
            .or_default()
            .push((PathBuf::from(path), content.to_string()));
    }

    pub fn file_contents(&self, path: &str) -> Option<String> {
        self.files
            .borrow()
            .get(Path::new(path))
            .map(|q| q.last().cloned().unwrap_or_default())
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn assert_no_call(&self, prefix: &str) {
        let hits = self.calls_matching(prefix);
        assert!(hits.is_empty(), "unexpected calls matching '{prefix}': {hits:?}");
    }

    fn apply_effects(&self, call: &str) {
        let effects = self.effects.borrow();
        for (prefix, files) in effects.iter() {
            if call.starts_with(prefix.as_str()) {
                let mut map = self.files.borrow_mut();
                for (path, content) in files {
                    map.insert(path.clone(), vec![content.clone()]);
                }
            }
        }
    }

    fn scripted_output(&self, call: &str) -> CmdOutput {
        let mut cmds = self.cmds.borrow_mut();
        let best = cmds
            .keys()
            .filter(|k| call.starts_with(k.as_str()))
            .max_by_key(|k| k.len())
            .cloned();
        let Some(key) = best else {
            return CmdOutput::success("");
        };
        let queue = cmds.get_mut(&key).expect("key just found");
        if queue.len() > 1 {
            queue.remove(0)
        } else {
            queue.first().cloned().unwrap_or_else(|| CmdOutput::success(""))
        }
    }
}

impl Host for FakeHost {
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let call = format!("{program} {}", args.join(" "));
        self.calls.borrow_mut().push(call.clone());
        let out = self.scripted_output(&call);
        self.apply_effects(&call);
        Ok(out)
    }

    fn run_interactive(&self, program: &str, args: &[&str]) -> Result<bool> {
        let call = format!("interactive: {program} {}", args.join(" "));
        self.calls.borrow_mut().push(call.clone());
        self.apply_effects(&call);
        Ok(true)
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        let mut map = self.files.borrow_mut();
        let Some(queue) = map.get_mut(path) else {
            return Err(Error::msg(format!("no such file: {}", path.display())));
        };
        if queue.len() > 1 {
            Ok(queue.remove(0))
        } else {
            Ok(queue.first().cloned().unwrap_or_default())
        }
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("write {}", path.display()));
        self.files
            .borrow_mut()
            .insert(path.to_path_buf(), vec![contents.to_string()]);
        Ok(())
    }

    fn append_file(&self, path: &Path, contents: &str) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("append {}", path.display()));
        let mut map = self.files.borrow_mut();
        let queue = map.entry(path.to_path_buf()).or_insert_with(|| vec![String::new()]);
        if let Some(last) = queue.last_mut() {
            last.push_str(contents);
        }
        Ok(())
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.files.borrow().contains_key(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut out: Vec<PathBuf> = self
            .files
            .borrow()
            .keys()
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        out.sort();
        Ok(out)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("download {url} -> {}", dest.display()));
        self.files
            .borrow_mut()
            .insert(dest.to_path_buf(), vec!["<package-bytes>".to_string()]);
        Ok(())
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        self.prompts.borrow_mut().push(prompt.to_string());
        Ok(self.confirm_answer.get())
    }

    fn is_root(&self) -> bool {
        true
    }
}

pub const OS_RELEASE_NOBLE: &str = "ID=ubuntu\nVERSION_ID=\"24.04\"\nPRETTY_NAME=\"Ubuntu 24.04.1 LTS\"\n";

pub const SWAPS_EMPTY: &str = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n";

pub const SWAPS_ACTIVE: &str =
    "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n/swapfile file 2097148 0 -2\n";

/// Settings with the checkpoint log pointed into a temp dir.
pub fn test_settings(dir: &tempfile::TempDir) -> Settings {
    let mut s = Settings::default();
    s.backend.host = "10.0.1.55".into();
    s.checkpoint_file = dir
        .path()
        .join("checkpoints.log")
        .to_string_lossy()
        .into_owned();
    s
}
