use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::executor::{Step, StepCtx};
use crate::probe;
use crate::steps::nginx::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEntry {
    pub id: String,
    pub name: String,
}

fn list_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})\s+(\S+)",
        )
        .expect("static regex")
    })
}

/// Parse `cloudflared tunnel list` output into (id, name) pairs.
pub fn parse_tunnel_list(output: &str) -> Vec<TunnelEntry> {
    list_line_re()
        .captures_iter(output)
        .map(|c| TunnelEntry {
            id: c[1].to_string(),
            name: c[2].to_string(),
        })
        .collect()
}

/// Existence is keyed on the display name, not the tunnel id: the credential
/// lookup below also has to go through the name-based listing, so both sides
/// share the same (collision-prone) key. Reusing a tunnel name across
/// accounts will match the wrong tunnel.
pub fn find_tunnel(entries: &[TunnelEntry], name: &str) -> Option<TunnelEntry> {
    entries.iter().find(|e| e.name == name).cloned()
}

/// Render the ingress descriptor: the public hostname routes to the raw TCP
/// backend, and the mandatory catch-all closes the list.
pub fn render_tunnel_config(settings: &Settings, tunnel_id: &str, credentials: &Path) -> String {
    format!(
        "# Managed by relayctl. Regenerated from the relay configuration; do not edit.\n\
         tunnel: {id}\n\
         credentials-file: {creds}\n\
         \n\
         ingress:\n\
         \x20 - hostname: {hostname}\n\
         \x20   service: tcp://{host}:{port}\n\
         \x20 - service: http_status:404\n",
        id = tunnel_id,
        creds = credentials.display(),
        hostname = settings.tunnel.hostname,
        host = settings.backend.host,
        port = settings.backend.port,
    )
}

fn list_tunnels(ctx: &StepCtx) -> Result<Vec<TunnelEntry>> {
    let out = ctx.host.run("cloudflared", &["tunnel", "list"])?;
    if !out.ok {
        return Err(Error::msg(format!(
            "cloudflared tunnel list failed: {}",
            out.stderr.trim()
        )));
    }
    Ok(parse_tunnel_list(&out.stdout))
}

fn resolve_tunnel(ctx: &StepCtx) -> Result<TunnelEntry> {
    let name = &ctx.settings.tunnel.name;
    find_tunnel(&list_tunnels(ctx)?, name).ok_or_else(|| {
        Error::msg(format!(
            "tunnel '{name}' not found in the provider listing; create it first"
        ))
    })
}

fn credentials_file(ctx: &StepCtx, tunnel_id: &str) -> Result<PathBuf> {
    let dir = Path::new(&ctx.settings.tunnel.credentials_dir);
    let wanted = format!("{tunnel_id}.json");
    let entries = ctx.host.list_dir(dir)?;
    entries
        .into_iter()
        .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(wanted.as_str()))
        .ok_or_else(|| {
            Error::msg(format!(
                "credential file {wanted} not found under {}",
                dir.display()
            ))
        })
}

fn cert_path(settings: &Settings) -> PathBuf {
    Path::new(&settings.tunnel.credentials_dir).join("cert.pem")
}

/// Installs the cloudflared binary from the vendor package.
pub struct CloudflaredInstallStep;

impl Step for CloudflaredInstallStep {
    fn name(&self) -> &'static str {
        "CLOUDFLARED_INSTALLED"
    }

    fn label(&self) -> &'static str {
        "Install cloudflared"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        Ok(probe::command_available(ctx.host, "cloudflared"))
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        let url = ctx.settings.tunnel.package_url.clone();
        let tmp = tempfile::Builder::new()
            .prefix("cloudflared-")
            .suffix(".deb")
            .tempfile()
            .map_err(|e| Error::ctx("failed to create temp file", e))?;
        let deb = tmp.path().to_path_buf();
        ctx.log(&format!("downloading {url}"));
        ctx.host.download(&url, &deb)?;
        ctx.run_checked(
            "cloudflared package install",
            "dpkg",
            &["-i", &deb.display().to_string()],
        )?;
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        Ok(probe::command_available(ctx.host, "cloudflared"))
    }
}

/// One-time interactive browser login. Blocks until the operator completes
/// or interrupts it; the origin certificate on disk is the proof.
pub struct CloudflaredLoginStep;

impl Step for CloudflaredLoginStep {
    fn name(&self) -> &'static str {
        "CLOUDFLARED_AUTHENTICATED"
    }

    fn label(&self) -> &'static str {
        "Authenticate cloudflared (browser login)"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        Ok(ctx.host.path_exists(&cert_path(ctx.settings)))
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        ctx.log("opening browser-based login; complete it to continue");
        let ok = ctx.host.run_interactive("cloudflared", &["tunnel", "login"])?;
        if !ok {
            return Err(Error::msg("cloudflared tunnel login failed or was interrupted"));
        }
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        Ok(ctx.host.path_exists(&cert_path(ctx.settings)))
    }
}

/// Creates the named tunnel unless one with that name is already listed.
pub struct TunnelCreateStep;

impl Step for TunnelCreateStep {
    fn name(&self) -> &'static str {
        "TUNNEL_CREATED"
    }

    fn label(&self) -> &'static str {
        "Create named tunnel"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        let name = ctx.settings.tunnel.name.clone();
        let existing = find_tunnel(&list_tunnels(ctx)?, &name);
        if let Some(t) = &existing {
            ctx.log(&format!(
                "tunnel '{}' already listed as {} (matched by name)",
                name, t.id
            ));
        }
        Ok(existing.is_some())
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        let name = ctx.settings.tunnel.name.clone();
        ctx.run_checked("tunnel creation", "cloudflared", &["tunnel", "create", &name])?;
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        let name = ctx.settings.tunnel.name.clone();
        Ok(find_tunnel(&list_tunnels(ctx)?, &name).is_some())
    }
}

/// Renders the ingress descriptor for the created tunnel.
pub struct TunnelConfigRenderStep;

impl TunnelConfigRenderStep {
    fn render_current(&self, ctx: &StepCtx) -> Result<String> {
        let tunnel = resolve_tunnel(ctx)?;
        let creds = credentials_file(ctx, &tunnel.id)?;
        Ok(render_tunnel_config(ctx.settings, &tunnel.id, &creds))
    }
}

impl Step for TunnelConfigRenderStep {
    fn name(&self) -> &'static str {
        "TUNNEL_CONFIG_RENDERED"
    }

    fn label(&self) -> &'static str {
        "Render tunnel ingress config"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        let path = PathBuf::from(&ctx.settings.tunnel.config_path);
        if !ctx.host.path_exists(&path) {
            return Ok(false);
        }
        let existing = ctx.host.read_to_string(&path)?;
        let rendered = self.render_current(ctx)?;
        Ok(sha256_hex(&existing) == sha256_hex(&rendered))
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        let rendered = self.render_current(ctx)?;
        let path = PathBuf::from(&ctx.settings.tunnel.config_path);
        ctx.host.write_file(&path, &rendered)?;
        ctx.log(&format!(
            "wrote {} (sha256:{})",
            path.display(),
            sha256_hex(&rendered)
        ));
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        let path = PathBuf::from(&ctx.settings.tunnel.config_path);
        let existing = ctx.host.read_to_string(&path)?;
        let rendered = self.render_current(ctx)?;
        Ok(sha256_hex(&existing) == sha256_hex(&rendered))
    }
}

/// Foreground tunnel test. There is no live-state probe for "the operator
/// saw traffic flow", so only the checkpoint and the operator's answer gate
/// this step.
pub struct TunnelTestStep;

impl Step for TunnelTestStep {
    fn name(&self) -> &'static str {
        "TUNNEL_TESTED"
    }

    fn label(&self) -> &'static str {
        "Run foreground tunnel test"
    }

    fn satisfied(&self, _ctx: &mut StepCtx) -> Result<bool> {
        Ok(false)
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        let name = ctx.settings.tunnel.name.clone();
        let config_path = ctx.settings.tunnel.config_path.clone();
        ctx.log("starting foreground tunnel; test connectivity, then press Ctrl+C");
        // Interrupting the child is the normal way to end the test.
        let _ = ctx.host.run_interactive(
            "cloudflared",
            &["tunnel", "--config", &config_path, "run", &name],
        )?;
        ctx.confirm_or_abort(
            "Did the tunnel route traffic to the backend successfully?",
            "operator reported the tunnel test as failed",
        )
    }

    fn verify(&self, _ctx: &mut StepCtx) -> Result<bool> {
        Ok(true)
    }
}

/// Installs cloudflared as a systemd service so the tunnel survives reboots.
///
/// With `install_service = false` the step reports itself satisfied, so the
/// runner still records its marker; the marker then means "nothing to do by
/// configuration", not "service installed". A log line says which.
pub struct TunnelServiceStep;

impl Step for TunnelServiceStep {
    fn name(&self) -> &'static str {
        "TUNNEL_SERVICE_INSTALLED"
    }

    fn label(&self) -> &'static str {
        "Install cloudflared system service"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        if !ctx.settings.tunnel.install_service {
            ctx.log("service installation skipped by configuration (install_service = false)");
            return Ok(true);
        }
        probe::unit_active(ctx.host, "cloudflared")
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        ctx.confirm_or_abort(
            "Install and start cloudflared as a system service?",
            "operator declined service installation",
        )?;
        let config_path = ctx.settings.tunnel.config_path.clone();
        ctx.run_checked(
            "cloudflared service install",
            "cloudflared",
            &["--config", &config_path, "service", "install"],
        )?;
        ctx.run_checked(
            "cloudflared service start",
            "systemctl",
            &["enable", "--now", "cloudflared"],
        )?;
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        probe::unit_active(ctx.host, "cloudflared")
    }
}
