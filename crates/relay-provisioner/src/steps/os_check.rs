use crate::error::{Error, Result};
use crate::executor::{Step, StepCtx};
use crate::probe::{self, SUPPORTED_OS_ID, SUPPORTED_OS_VERSION};

/// Rejects every distribution except the single supported one. A version
/// mismatch on the supported distribution is a warning the operator may
/// override; a distribution mismatch is always fatal.
pub struct OsCheckStep;

impl Step for OsCheckStep {
    fn name(&self) -> &'static str {
        "OS_CHECKED"
    }

    fn label(&self) -> &'static str {
        "Verify supported operating system"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        let os = probe::os_release(ctx.host)?;
        Ok(os.id == SUPPORTED_OS_ID && os.version_id == SUPPORTED_OS_VERSION)
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        let os = probe::os_release(ctx.host)?;
        if os.id != SUPPORTED_OS_ID {
            return Err(Error::msg(format!(
                "unsupported distribution '{}' ({}); only {} is supported",
                os.id, os.pretty_name, SUPPORTED_OS_ID
            )));
        }
        if os.version_id != SUPPORTED_OS_VERSION {
            ctx.log(&format!(
                "warning: {} {} detected, tested version is {}",
                SUPPORTED_OS_ID, os.version_id, SUPPORTED_OS_VERSION
            ));
            ctx.confirm_or_abort(
                &format!(
                    "Continue on untested {} {}?",
                    SUPPORTED_OS_ID, os.version_id
                ),
                "operator declined to continue on an untested version",
            )?;
        }
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        Ok(probe::os_release(ctx.host)?.id == SUPPORTED_OS_ID)
    }
}
