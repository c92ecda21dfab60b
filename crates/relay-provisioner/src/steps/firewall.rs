use crate::error::{Error, Result};
use crate::executor::{Step, StepCtx};

/// A ufw rule is listed by `ufw show added` even while the firewall itself is
/// inactive, which makes it a usable idempotency probe either way.
pub fn rule_present(added: &str, port: u16) -> bool {
    let needle = format!("{port}/tcp");
    added.lines().any(|l| l.contains(&needle))
}

/// Opens the relay listen port. Only adds the rule; enabling ufw on a remote
/// host is left to the operator.
pub struct FirewallStep;

impl Step for FirewallStep {
    fn name(&self) -> &'static str {
        "FIREWALL_RULE_ADDED"
    }

    fn label(&self) -> &'static str {
        "Allow relay port through the firewall"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        if !ctx.settings.firewall.enabled {
            return Ok(true);
        }
        match ctx.host.run("ufw", &["show", "added"]) {
            Ok(out) if out.ok => Ok(rule_present(&out.stdout, ctx.settings.proxy.listen_port)),
            _ => Ok(false),
        }
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        if !ctx.settings.firewall.enabled {
            return Ok(());
        }
        let rule = format!("{}/tcp", ctx.settings.proxy.listen_port);
        ctx.run_checked("firewall rule", "ufw", &["allow", &rule])?;
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        if !ctx.settings.firewall.enabled {
            return Ok(true);
        }
        let out = ctx.host.run("ufw", &["show", "added"])?;
        if !out.ok {
            return Err(Error::msg(format!(
                "ufw show added failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(rule_present(&out.stdout, ctx.settings.proxy.listen_port))
    }
}
