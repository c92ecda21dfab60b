use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Immutable run configuration. Loaded exactly once from a TOML file and
/// passed by reference into every step; steps never read the file themselves.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendConfig,
    pub proxy: ProxyConfig,
    pub swap: SwapConfig,
    pub firewall: FirewallConfig,
    pub hardening: HardeningConfig,
    pub tunnel: TunnelConfig,
    pub checkpoint_file: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            proxy: ProxyConfig::default(),
            swap: SwapConfig::default(),
            firewall: FirewallConfig::default(),
            hardening: HardeningConfig::default(),
            tunnel: TunnelConfig::default(),
            checkpoint_file: "/var/lib/relayctl/checkpoints.log".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 3306,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub upstream_name: String,
    pub connect_timeout_secs: u32,
    pub proxy_timeout_secs: u32,
    pub max_fails: u32,
    pub fail_timeout_secs: u32,
    pub main_conf: String,
    pub stream_conf_dir: String,
    pub stream_conf_name: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: 3306,
            upstream_name: "mysql_backend".into(),
            connect_timeout_secs: 10,
            proxy_timeout_secs: 600,
            max_fails: 3,
            fail_timeout_secs: 30,
            main_conf: "/etc/nginx/nginx.conf".into(),
            stream_conf_dir: "/etc/nginx/stream.conf.d".into(),
            stream_conf_name: "mysql-relay.conf".into(),
        }
    }
}

impl ProxyConfig {
    pub fn stream_conf_path(&self) -> PathBuf {
        Path::new(&self.stream_conf_dir).join(&self.stream_conf_name)
    }

    pub fn stream_include_glob(&self) -> String {
        format!("{}/*.conf", self.stream_conf_dir.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    pub path: String,
    pub swappiness: u8,
    pub fstab: String,
    pub sysctl_conf: String,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            path: "/swapfile".into(),
            swappiness: 10,
            fstab: "/etc/fstab".into(),
            sysctl_conf: "/etc/sysctl.conf".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub enabled: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardeningConfig {
    pub services: Vec<String>,
}

impl Default for HardeningConfig {
    fn default() -> Self {
        Self {
            services: default_trimmed_services(),
        }
    }
}

/// Units considered non-essential on a minimal single-purpose forwarder VM.
pub fn default_trimmed_services() -> Vec<String> {
    [
        "snapd.service",
        "snapd.socket",
        "snapd.seeded.service",
        "ModemManager.service",
        "udisks2.service",
        "getty@tty1.service",
        "serial-getty@ttyS0.service",
        "rpcbind.service",
        "rpcbind.socket",
        "polkit.service",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub name: String,
    pub hostname: String,
    pub config_path: String,
    pub credentials_dir: String,
    pub package_url: String,
    pub install_service: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            hostname: String::new(),
            config_path: "/etc/cloudflared/config.yml".into(),
            credentials_dir: "/root/.cloudflared".into(),
            package_url:
                "https://github.com/cloudflare/cloudflared/releases/latest/download/cloudflared-linux-amd64.deb"
                    .into(),
            install_service: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Proxy,
    Tunnel,
}

impl Flow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flow::Proxy => "proxy",
            Flow::Tunnel => "tunnel",
        }
    }
}

pub fn load(path: &Path) -> Result<Settings> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::ctx(format!("failed to read config {}", path.display()), e))?;
    let settings: Settings = toml::from_str(&data)
        .map_err(|e| Error::ctx(format!("TOML parse error in {}", path.display()), e))?;
    tracing::debug!(path = %path.display(), "loaded settings");
    Ok(settings)
}

impl Settings {
    /// Eager validation: every key the selected flow depends on must be
    /// non-empty before the first step runs.
    pub fn validate(&self, flow: Flow) -> Result<()> {
        let mut missing: Vec<&str> = Vec::new();

        if self.backend.host.trim().is_empty() {
            missing.push("backend.host");
        }
        if self.checkpoint_file.trim().is_empty() {
            missing.push("checkpoint_file");
        }

        match flow {
            Flow::Proxy => {
                if self.proxy.upstream_name.trim().is_empty() {
                    missing.push("proxy.upstream_name");
                }
                if self.proxy.main_conf.trim().is_empty() {
                    missing.push("proxy.main_conf");
                }
                if self.proxy.stream_conf_dir.trim().is_empty() {
                    missing.push("proxy.stream_conf_dir");
                }
                if self.swap.path.trim().is_empty() {
                    missing.push("swap.path");
                }
            }
            Flow::Tunnel => {
                if self.tunnel.name.trim().is_empty() {
                    missing.push("tunnel.name");
                }
                if self.tunnel.hostname.trim().is_empty() {
                    missing.push("tunnel.hostname");
                }
                if self.tunnel.config_path.trim().is_empty() {
                    missing.push("tunnel.config_path");
                }
                if self.tunnel.credentials_dir.trim().is_empty() {
                    missing.push("tunnel.credentials_dir");
                }
            }
        }

        if !missing.is_empty() {
            return Err(Error::msg(format!(
                "incomplete configuration for {} flow; missing or empty: {}",
                flow.as_str(),
                missing.join(", ")
            )));
        }
        Ok(())
    }
}
