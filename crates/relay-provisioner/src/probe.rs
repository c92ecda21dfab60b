use std::path::Path;

use crate::error::{Error, Result};
use crate::host::Host;

pub const SUPPORTED_OS_ID: &str = "ubuntu";
pub const SUPPORTED_OS_VERSION: &str = "24.04";

#[derive(Debug, Clone, Default)]
pub struct OsRelease {
    pub id: String,
    pub version_id: String,
    pub pretty_name: String,
}

pub fn os_release(host: &dyn Host) -> Result<OsRelease> {
    let data = host.read_to_string(Path::new("/etc/os-release"))?;
    Ok(parse_os_release(&data))
}

pub fn parse_os_release(data: &str) -> OsRelease {
    let mut out = OsRelease::default();
    for line in data.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "ID" => out.id = value,
            "VERSION_ID" => out.version_id = value,
            "PRETTY_NAME" => out.pretty_name = value,
            _ => {}
        }
    }
    out
}

pub fn mem_total_kb(host: &dyn Host) -> Result<u64> {
    let data = host.read_to_string(Path::new("/proc/meminfo"))?;
    parse_mem_total_kb(&data)
}

pub fn parse_mem_total_kb(data: &str) -> Result<u64> {
    for line in data.lines() {
        let Some(rest) = line.strip_prefix("MemTotal:") else {
            continue;
        };
        let kb = rest
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::ctx(format!("unparsable MemTotal line '{line}'"), e))?;
        return Ok(kb);
    }
    Err(Error::msg("MemTotal not found in /proc/meminfo"))
}

/// Device paths with active swap, from `/proc/swaps`.
pub fn active_swap_devices(host: &dyn Host) -> Result<Vec<String>> {
    let data = host.read_to_string(Path::new("/proc/swaps"))?;
    Ok(parse_swap_devices(&data))
}

pub fn parse_swap_devices(data: &str) -> Vec<String> {
    data.lines()
        .skip(1) // header row
        .filter_map(|l| l.split_whitespace().next())
        .map(String::from)
        .collect()
}

pub fn swap_active(host: &dyn Host, path: &str) -> Result<bool> {
    Ok(active_swap_devices(host)?.iter().any(|d| d == path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Enabled,
    Disabled,
    NotPresent,
    Other,
}

/// `systemctl is-enabled` state for a unit. Exit codes are not reliable here
/// (disabled also exits non-zero), so classification goes by output text.
pub fn unit_state(host: &dyn Host, unit: &str) -> Result<UnitState> {
    let out = host.run("systemctl", &["is-enabled", unit])?;
    let text = format!("{}\n{}", out.stdout, out.stderr);
    let text = text.trim();
    if text.contains("No such file")
        || text.contains("not-found")
        || text.contains("does not exist")
        || text.contains("not found")
    {
        return Ok(UnitState::NotPresent);
    }
    match out.stdout.trim() {
        "enabled" | "enabled-runtime" | "static" | "indirect" | "alias" => Ok(UnitState::Enabled),
        "disabled" | "masked" | "masked-runtime" => Ok(UnitState::Disabled),
        _ => Ok(UnitState::Other),
    }
}

pub fn unit_active(host: &dyn Host, unit: &str) -> Result<bool> {
    let out = host.run("systemctl", &["is-active", unit])?;
    Ok(out.ok && out.stdout.trim() == "active")
}

/// Whether any process listens on the given TCP port, via `ss -H -ltn`.
pub fn port_listening(host: &dyn Host, port: u16) -> Result<bool> {
    let out = host.run("ss", &["-H", "-ltn"])?;
    if !out.ok {
        return Err(Error::msg(format!(
            "ss -ltn failed: {}",
            out.stderr.trim()
        )));
    }
    Ok(parse_listening_ports(&out.stdout).contains(&port))
}

pub fn parse_listening_ports(data: &str) -> Vec<u16> {
    let mut out = Vec::new();
    for line in data.lines() {
        // Local address is the 4th column, e.g. "0.0.0.0:3306" or "[::]:3306".
        let Some(local) = line.split_whitespace().nth(3) else {
            continue;
        };
        let Some((_, port)) = local.rsplit_once(':') else {
            continue;
        };
        if let Ok(p) = port.parse::<u16>() {
            out.push(p);
        }
    }
    out
}

pub fn command_available(host: &dyn Host, program: &str) -> bool {
    host.run(program, &["--version"]).map(|o| o.ok).unwrap_or(false)
}
