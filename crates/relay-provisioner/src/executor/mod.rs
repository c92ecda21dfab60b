use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::checkpoint::CheckpointLog;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::host::{CmdOutput, Host};

/// A named unit of provisioning work, run at most meaningfully once.
///
/// `satisfied` and `verify` are both queries against live system state;
/// `satisfied` asks "is there anything to do", `verify` asks "did the
/// mutation take". They are separate because several steps accept looser
/// preconditions than what they verify after mutating (the swap provisioner
/// treats any pre-existing active swap file as satisfying the goal, but after
/// creating one it verifies that exact path is active).
pub trait Step {
    /// Checkpoint marker name, e.g. `SWAP_PROVISIONED`.
    fn name(&self) -> &'static str;
    fn label(&self) -> &'static str;

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool>;
    fn apply(&self, ctx: &mut StepCtx) -> Result<()>;
    fn verify(&self, ctx: &mut StepCtx) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Completion marker found in the checkpoint log.
    Checkpointed,
    /// Live system state already satisfies the step.
    Satisfied,
}

#[derive(Debug, Clone)]
pub enum StepEvent {
    StepStarted {
        name: String,
        label: String,
    },
    StepSkipped {
        name: String,
        reason: SkipReason,
    },
    StepLog {
        name: String,
        line: String,
    },
    StepFinished {
        name: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    FlowDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait EventSink {
    fn emit(&self, ev: StepEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    applied: usize,
    skipped_checkpoint: usize,
    skipped_satisfied: usize,
    failed: Vec<String>,
}

impl EventSink for StdoutSink {
    fn emit(&self, ev: StepEvent) {
        match ev {
            StepEvent::StepStarted { name, label } => {
                println!("STEP: {name}  {label}");
            }
            StepEvent::StepSkipped { name, reason } => {
                if let Ok(mut s) = self.state.lock() {
                    match reason {
                        SkipReason::Checkpointed => s.skipped_checkpoint += 1,
                        SkipReason::Satisfied => s.skipped_satisfied += 1,
                    }
                }
                match reason {
                    SkipReason::Checkpointed => println!("SKIP: {name} (checkpoint present)"),
                    SkipReason::Satisfied => println!("SKIP: {name} (already satisfied)"),
                }
            }
            StepEvent::StepLog { name, line } => {
                println!("[{name}] {line}");
            }
            StepEvent::StepFinished {
                name,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    if let Ok(mut s) = self.state.lock() {
                        s.applied += 1;
                    }
                    println!("DONE: {name} ({elapsed_ms}ms)");
                } else {
                    if let Ok(mut s) = self.state.lock() {
                        s.failed.push(name.clone());
                    }
                    println!("FAIL: {name} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
            }
            StepEvent::FlowDone { ok, error } => {
                let mut summary = String::from("SUMMARY:\n");
                if let Ok(mut s) = self.state.lock() {
                    summary.push_str(&format!(
                        "  status: {}\n",
                        if ok { "ok" } else { "failed" }
                    ));
                    summary.push_str(&format!(
                        "  steps: applied={} skipped_checkpoint={} skipped_satisfied={} failed={}\n",
                        s.applied,
                        s.skipped_checkpoint,
                        s.skipped_satisfied,
                        s.failed.len()
                    ));
                    if !s.failed.is_empty() {
                        summary.push_str(&format!("  failed_steps: {}\n", s.failed.join(", ")));
                    }
                    *s = StdoutSinkState::default();
                }
                print!("{summary}");
                if !ok && let Some(e) = error {
                    println!("  error: {e}");
                }
            }
        }
    }
}

pub struct StepCtx<'a> {
    pub settings: &'a Settings,
    pub host: &'a dyn Host,
    pub checkpoints: CheckpointLog,
    pub dry_run: bool,
    pub sink: &'a dyn EventSink,
    current_step: Option<&'static str>,
}

impl<'a> StepCtx<'a> {
    pub fn new(
        settings: &'a Settings,
        host: &'a dyn Host,
        sink: &'a dyn EventSink,
        dry_run: bool,
    ) -> Self {
        Self {
            settings,
            host,
            checkpoints: CheckpointLog::new(&settings.checkpoint_file),
            dry_run,
            sink,
            current_step: None,
        }
    }

    pub fn set_step(&mut self, name: &'static str) {
        self.current_step = Some(name);
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(StepEvent::StepLog {
            name: self.current_step.unwrap_or("<none>").to_string(),
            line: msg.to_string(),
        });
    }

    /// Run a command through the host and treat a non-zero exit as a step
    /// failure, labeled with the failing operation.
    pub fn run_checked(&self, what: &str, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let out = self.host.run(program, args)?;
        for line in out.stdout.lines().chain(out.stderr.lines()) {
            if !line.trim().is_empty() {
                self.log(line);
            }
        }
        if !out.ok {
            return Err(Error::msg(format!(
                "{what} failed (exit {}): {}",
                out.code.map(|c| c.to_string()).unwrap_or_else(|| "?".into()),
                out.stderr.trim()
            )));
        }
        Ok(out)
    }

    pub fn confirm_or_abort(&self, prompt: &str, declined: &str) -> Result<()> {
        if self.host.confirm(prompt)? {
            Ok(())
        } else {
            Err(Error::msg(declined.to_string()))
        }
    }
}

/// Execute a flow strictly in order. Per step: checkpoint gate, live-state
/// short circuit, mutation, independent verification, marker append. The
/// first failure aborts the run and leaves no marker for the failing step.
pub fn run_flow(steps: &[Box<dyn Step>], ctx: &mut StepCtx) -> Result<()> {
    for step in steps {
        let name = step.name();
        ctx.set_step(name);
        ctx.sink.emit(StepEvent::StepStarted {
            name: name.to_string(),
            label: step.label().to_string(),
        });

        if ctx.checkpoints.is_done(name)? {
            ctx.sink.emit(StepEvent::StepSkipped {
                name: name.to_string(),
                reason: SkipReason::Checkpointed,
            });
            continue;
        }

        let start = Instant::now();
        let res = run_step(step.as_ref(), ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(StepDisposition::Skipped) => {
                ctx.sink.emit(StepEvent::StepSkipped {
                    name: name.to_string(),
                    reason: SkipReason::Satisfied,
                });
            }
            Ok(StepDisposition::Applied) => {
                ctx.sink.emit(StepEvent::StepFinished {
                    name: name.to_string(),
                    ok: true,
                    error: None,
                    elapsed_ms,
                });
            }
            Ok(StepDisposition::DryRun) => {
                ctx.log("DRY-RUN: mutation and checkpoint skipped");
            }
            Err(e) => {
                ctx.sink.emit(StepEvent::StepFinished {
                    name: name.to_string(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                ctx.sink.emit(StepEvent::FlowDone {
                    ok: false,
                    error: Some(format!("step {name} failed: {e}")),
                });
                return Err(Error::msg(format!("step {name} failed: {e}")));
            }
        }
    }
    ctx.sink.emit(StepEvent::FlowDone {
        ok: true,
        error: None,
    });
    Ok(())
}

enum StepDisposition {
    Skipped,
    Applied,
    DryRun,
}

fn run_step(step: &dyn Step, ctx: &mut StepCtx) -> Result<StepDisposition> {
    if step.satisfied(ctx)? {
        // The log is only a cache of past verification; live state counts.
        if !ctx.dry_run {
            ctx.checkpoints.mark_done(step.name())?;
        }
        return Ok(StepDisposition::Skipped);
    }
    if ctx.dry_run {
        return Ok(StepDisposition::DryRun);
    }
    step.apply(ctx)?;
    if !step.verify(ctx)? {
        return Err(Error::msg(
            "verification failed: live state does not reflect the mutation",
        ));
    }
    ctx.checkpoints.mark_done(step.name())?;
    Ok(StepDisposition::Applied)
}

#[derive(Debug, Clone, Serialize)]
pub struct StepStatus {
    pub name: String,
    pub label: String,
    pub checkpointed: bool,
    pub satisfied: Option<bool>,
    pub probe_error: Option<String>,
}

/// Per-step report for `status`: the cached view (checkpoint log) next to the
/// live view (satisfied predicate). Probe failures are reported, not fatal.
pub fn flow_status(steps: &[Box<dyn Step>], ctx: &mut StepCtx) -> Result<Vec<StepStatus>> {
    let mut out = Vec::with_capacity(steps.len());
    for step in steps {
        ctx.set_step(step.name());
        let checkpointed = ctx.checkpoints.is_done(step.name())?;
        let (satisfied, probe_error) = match step.satisfied(ctx) {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e.to_string())),
        };
        out.push(StepStatus {
            name: step.name().to_string(),
            label: step.label().to_string(),
            checkpointed,
            satisfied,
            probe_error,
        });
    }
    Ok(out)
}
