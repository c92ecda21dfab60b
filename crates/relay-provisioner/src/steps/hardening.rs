use crate::error::Result;
use crate::executor::{Step, StepCtx};
use crate::host::CmdOutput;
use crate::probe::{self, UnitState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableOutcome {
    Disabled,
    NotPresent,
    Failed,
}

/// A unit missing from the image is expected, not an error; classify it so
/// the summary can report all three outcomes instead of swallowing them.
pub fn classify_disable(out: &CmdOutput) -> DisableOutcome {
    if out.ok {
        return DisableOutcome::Disabled;
    }
    let text = format!("{}\n{}", out.stdout, out.stderr);
    if text.contains("does not exist")
        || text.contains("No such file")
        || text.contains("not found")
        || text.contains("not-found")
    {
        DisableOutcome::NotPresent
    } else {
        DisableOutcome::Failed
    }
}

/// Disables the configured list of non-essential units, best effort. Each
/// disable is independent; failures are counted and reported but never abort
/// the step.
pub struct HardeningStep;

impl Step for HardeningStep {
    fn name(&self) -> &'static str {
        "SERVICES_TRIMMED"
    }

    fn label(&self) -> &'static str {
        "Disable non-essential services"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        for unit in &ctx.settings.hardening.services {
            match probe::unit_state(ctx.host, unit)? {
                UnitState::Disabled | UnitState::NotPresent => {}
                UnitState::Enabled | UnitState::Other => return Ok(false),
            }
        }
        Ok(true)
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        let mut disabled = 0usize;
        let mut not_present = 0usize;
        let mut failed = 0usize;

        for unit in &ctx.settings.hardening.services {
            let out = ctx.host.run("systemctl", &["disable", "--now", unit])?;
            match classify_disable(&out) {
                DisableOutcome::Disabled => {
                    disabled += 1;
                    ctx.log(&format!("disabled {unit}"));
                }
                DisableOutcome::NotPresent => {
                    not_present += 1;
                }
                DisableOutcome::Failed => {
                    failed += 1;
                    tracing::warn!(unit, stderr = %out.stderr.trim(), "failed to disable unit");
                    ctx.log(&format!("could not disable {unit}: {}", out.stderr.trim()));
                }
            }
        }

        ctx.log(&format!(
            "service trim: disabled={disabled} not_present={not_present} failed={failed}"
        ));
        Ok(())
    }

    fn verify(&self, _ctx: &mut StepCtx) -> Result<bool> {
        // Best-effort step: per-unit outcomes were already reported and a
        // unit that refuses to disable must not block provisioning.
        Ok(true)
    }
}
