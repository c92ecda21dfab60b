use std::path::Path;

use crate::error::Result;
use crate::executor::{Step, StepCtx};
use crate::probe;

/// Target swap size as a function of installed RAM: double the RAM below
/// 2 GB, 1.5x at or above it. The boundary at exactly 2.0 GB takes the
/// >= branch.
pub fn swap_target_gb(ram_gb: f64) -> f64 {
    if ram_gb < 2.0 { 2.0 * ram_gb } else { 1.5 * ram_gb }
}

pub fn swap_size_label(ram_gb: f64) -> String {
    format!("{:.2}G", swap_target_gb(ram_gb))
}

pub fn ram_gb_from_kb(kb: u64) -> f64 {
    kb as f64 / (1024.0 * 1024.0)
}

/// Ensures a swap file exists, is formatted, and is active.
///
/// Policy: a file already present at the target path satisfies the goal
/// regardless of its size; it is activated but never resized. Resizing live
/// swap is disruptive, so a size mismatch is left to the operator.
pub struct SwapProvisionStep;

impl Step for SwapProvisionStep {
    fn name(&self) -> &'static str {
        "SWAP_PROVISIONED"
    }

    fn label(&self) -> &'static str {
        "Provision and activate swap file"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        probe::swap_active(ctx.host, &ctx.settings.swap.path)
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        let path = ctx.settings.swap.path.clone();

        if ctx.host.path_exists(Path::new(&path)) {
            ctx.log(&format!(
                "existing swap file at {path}; activating as-is, size is not reconciled"
            ));
            ctx.run_checked("swap activation", "swapon", &[&path])?;
            return Ok(());
        }

        let ram_kb = probe::mem_total_kb(ctx.host)?;
        let ram_gb = ram_gb_from_kb(ram_kb);
        let size = swap_size_label(ram_gb);
        ctx.log(&format!(
            "installed RAM {ram_gb:.2} GB; computed swap size {size}"
        ));
        ctx.confirm_or_abort(
            &format!("Create a {size} swap file at {path}?"),
            "operator declined swap creation",
        )?;

        ctx.run_checked("swap file allocation", "fallocate", &["-l", &size, &path])?;
        ctx.run_checked("swap file permissions", "chmod", &["600", &path])?;
        ctx.run_checked("swap formatting", "mkswap", &[&path])?;
        ctx.run_checked("swap activation", "swapon", &[&path])?;
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        probe::swap_active(ctx.host, &ctx.settings.swap.path)
    }
}

/// Persists the swap file across reboots and tunes swappiness.
pub struct SwapPersistStep;

fn fstab_entry(path: &str) -> String {
    format!("{path} none swap sw 0 0")
}

pub fn fstab_has_swap_entry(fstab: &str, path: &str) -> bool {
    fstab.lines().any(|l| {
        let l = l.split('#').next().unwrap_or("").trim();
        let mut fields = l.split_whitespace();
        // device, mount point, then the fs type column must say swap; a
        // substring check would false-positive on paths containing "swap"
        fields.next() == Some(path) && fields.nth(1) == Some("swap")
    })
}

pub fn sysctl_has_swappiness(conf: &str, value: u8) -> bool {
    let wanted = format!("vm.swappiness={value}");
    conf.lines().any(|l| {
        let l = l.split('#').next().unwrap_or("");
        l.split_whitespace().collect::<String>() == wanted
    })
}

impl Step for SwapPersistStep {
    fn name(&self) -> &'static str {
        "SWAP_PERSISTED"
    }

    fn label(&self) -> &'static str {
        "Persist swap in fstab and tune swappiness"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        let swap = &ctx.settings.swap;
        let fstab = ctx.host.read_to_string(Path::new(&swap.fstab))?;
        if !fstab_has_swap_entry(&fstab, &swap.path) {
            return Ok(false);
        }
        let sysctl = match ctx.host.read_to_string(Path::new(&swap.sysctl_conf)) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        Ok(sysctl_has_swappiness(&sysctl, swap.swappiness))
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        let swap = ctx.settings.swap.clone();

        let fstab = ctx.host.read_to_string(Path::new(&swap.fstab))?;
        if !fstab_has_swap_entry(&fstab, &swap.path) {
            let mut entry = String::new();
            if !fstab.ends_with('\n') {
                entry.push('\n');
            }
            entry.push_str(&fstab_entry(&swap.path));
            entry.push('\n');
            ctx.host.append_file(Path::new(&swap.fstab), &entry)?;
            ctx.log(&format!("added fstab entry for {}", swap.path));
        }

        let sysctl = ctx
            .host
            .read_to_string(Path::new(&swap.sysctl_conf))
            .unwrap_or_default();
        if !sysctl_has_swappiness(&sysctl, swap.swappiness) {
            let mut entry = String::new();
            if !sysctl.is_empty() && !sysctl.ends_with('\n') {
                entry.push('\n');
            }
            entry.push_str(&format!("vm.swappiness={}\n", swap.swappiness));
            ctx.host.append_file(Path::new(&swap.sysctl_conf), &entry)?;
        }
        ctx.run_checked(
            "swappiness tuning",
            "sysctl",
            &["-w", &format!("vm.swappiness={}", swap.swappiness)],
        )?;
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        let swap = &ctx.settings.swap;
        let fstab = ctx.host.read_to_string(Path::new(&swap.fstab))?;
        let sysctl = ctx.host.read_to_string(Path::new(&swap.sysctl_conf))?;
        Ok(fstab_has_swap_entry(&fstab, &swap.path)
            && sysctl_has_swappiness(&sysctl, swap.swappiness))
    }
}
