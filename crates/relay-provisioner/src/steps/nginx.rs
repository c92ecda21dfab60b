use std::path::Path;

use sha2::{Digest, Sha256};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::executor::{Step, StepCtx};
use crate::probe;

/// Render the layer-4 forwarding config. Pure function of the settings;
/// rendering twice with the same settings yields identical bytes.
pub fn render_stream_conf(settings: &Settings) -> String {
    let b = &settings.backend;
    let p = &settings.proxy;
    format!(
        "# Managed by relayctl. Regenerated from the relay configuration; do not edit.\n\
         upstream {upstream} {{\n\
         \x20   server {host}:{port} max_fails={max_fails} fail_timeout={fail_timeout}s;\n\
         }}\n\
         \n\
         server {{\n\
         \x20   listen {listen};\n\
         \x20   proxy_pass {upstream};\n\
         \x20   proxy_connect_timeout {connect}s;\n\
         \x20   proxy_timeout {timeout}s;\n\
         }}\n",
        upstream = p.upstream_name,
        host = b.host,
        port = b.port,
        max_fails = p.max_fails,
        fail_timeout = p.fail_timeout_secs,
        listen = p.listen_port,
        connect = p.connect_timeout_secs,
        timeout = p.proxy_timeout_secs,
    )
}

pub fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Byte span of the contents (between the braces) of the first `keyword { }`
/// block at brace depth zero. Comment-aware; a flat substring search would
/// match "stream" inside "upstream" or a commented-out block and lead to
/// double declarations.
pub fn top_level_block_span(conf: &str, keyword: &str) -> Option<(usize, usize)> {
    let bytes = conf.as_bytes();
    let kw = keyword.as_bytes();
    let mut depth: i32 = 0;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'{' => {
                depth += 1;
                i += 1;
            }
            b'}' => {
                depth -= 1;
                i += 1;
            }
            _ => {
                if depth == 0
                    && bytes[i..].starts_with(kw)
                    && (i == 0 || !is_ident_byte(bytes[i - 1]))
                    && bytes
                        .get(i + kw.len())
                        .map(|b| !is_ident_byte(*b))
                        .unwrap_or(true)
                {
                    let mut j = i + kw.len();
                    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if j < bytes.len() && bytes[j] == b'{' {
                        let start = j + 1;
                        let mut d: i32 = 1;
                        let mut k = start;
                        while k < bytes.len() {
                            match bytes[k] {
                                b'#' => {
                                    while k < bytes.len() && bytes[k] != b'\n' {
                                        k += 1;
                                    }
                                    continue;
                                }
                                b'{' => d += 1,
                                b'}' => {
                                    d -= 1;
                                    if d == 0 {
                                        return Some((start, k));
                                    }
                                }
                                _ => {}
                            }
                            k += 1;
                        }
                        return None; // unbalanced block
                    }
                }
                i += 1;
            }
        }
    }
    None
}

fn active_part(line: &str) -> &str {
    line.split('#').next().unwrap_or("").trim()
}

fn include_present(block: &str, include_glob: &str) -> bool {
    block.lines().any(|l| {
        let l = active_part(l);
        l.starts_with("include") && l.contains(include_glob)
    })
}

/// Whether the stream block exists and already includes the given glob.
/// Scoped to the block: an include in a comment or inside `http { }` does
/// not count.
pub fn stream_include_present(conf: &str, include_glob: &str) -> bool {
    match top_level_block_span(conf, "stream") {
        Some((start, end)) => include_present(&conf[start..end], include_glob),
        None => false,
    }
}

/// Ensure the main conf has a top-level stream block including the glob.
/// Returns the (possibly rewritten) conf and whether it changed.
pub fn ensure_stream_include(conf: &str, include_glob: &str) -> (String, bool) {
    if let Some((start, end)) = top_level_block_span(conf, "stream") {
        if include_present(&conf[start..end], include_glob) {
            return (conf.to_string(), false);
        }
        let mut out = String::with_capacity(conf.len() + include_glob.len() + 32);
        out.push_str(&conf[..start]);
        out.push_str(&format!("\n    include {include_glob};"));
        out.push_str(&conf[start..]);
        (out, true)
    } else {
        let mut out = conf.to_string();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("\nstream {{\n    include {include_glob};\n}}\n"));
        (out, true)
    }
}

fn is_vhost_include(line: &str) -> bool {
    let l = active_part(line);
    l.starts_with("include") && l.contains("sites-enabled")
}

/// True while the http block still pulls in virtual hosts.
pub fn http_vhosts_active(conf: &str) -> bool {
    match top_level_block_span(conf, "http") {
        Some((start, end)) => conf[start..end].lines().any(is_vhost_include),
        None => false,
    }
}

/// Comment out virtual-host includes inside the http block so the daemon
/// serves only the TCP forwarding role. Already-commented lines are left
/// alone, keeping the edit idempotent.
pub fn disable_http_vhost_includes(conf: &str) -> (String, bool) {
    let Some((start, end)) = top_level_block_span(conf, "http") else {
        return (conf.to_string(), false);
    };

    let block = &conf[start..end];
    let mut changed = false;
    let mut new_block = String::with_capacity(block.len() + 16);
    for (idx, line) in block.split('\n').enumerate() {
        if idx > 0 {
            new_block.push('\n');
        }
        if is_vhost_include(line) {
            changed = true;
            let indent_len = line.len() - line.trim_start().len();
            new_block.push_str(&line[..indent_len]);
            new_block.push_str("# ");
            new_block.push_str(line.trim_start());
        } else {
            new_block.push_str(line);
        }
    }

    if !changed {
        return (conf.to_string(), false);
    }
    let mut out = String::with_capacity(conf.len() + 16);
    out.push_str(&conf[..start]);
    out.push_str(&new_block);
    out.push_str(&conf[end..]);
    (out, true)
}

/// Installs nginx with the stream module.
pub struct NginxInstallStep;

impl Step for NginxInstallStep {
    fn name(&self) -> &'static str {
        "NGINX_INSTALLED"
    }

    fn label(&self) -> &'static str {
        "Install nginx and the stream module"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        let nginx_ok = match ctx.host.run("nginx", &["-v"]) {
            Ok(out) => out.ok,
            Err(_) => false,
        };
        if !nginx_ok {
            return Ok(false);
        }
        let module = ctx.host.run("dpkg", &["-s", "libnginx-mod-stream"])?;
        Ok(module.ok)
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        ctx.run_checked("package index refresh", "apt-get", &["update"])?;
        ctx.run_checked(
            "nginx installation",
            "apt-get",
            &["install", "-y", "nginx", "libnginx-mod-stream"],
        )?;
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        let nginx = ctx.host.run("nginx", &["-v"])?;
        let module = ctx.host.run("dpkg", &["-s", "libnginx-mod-stream"])?;
        Ok(nginx.ok && module.ok)
    }
}

/// One-time structural edits to the main nginx conf: stream include in, HTTP
/// virtual hosts out.
pub struct NginxStreamEnableStep;

impl Step for NginxStreamEnableStep {
    fn name(&self) -> &'static str {
        "NGINX_STREAM_ENABLED"
    }

    fn label(&self) -> &'static str {
        "Enable stream include in main nginx conf"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        let glob = ctx.settings.proxy.stream_include_glob();
        let conf = ctx
            .host
            .read_to_string(Path::new(&ctx.settings.proxy.main_conf))?;
        Ok(stream_include_present(&conf, &glob) && !http_vhosts_active(&conf))
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        let main_conf = ctx.settings.proxy.main_conf.clone();
        let glob = ctx.settings.proxy.stream_include_glob();
        let conf = ctx.host.read_to_string(Path::new(&main_conf))?;

        let (conf, added) = ensure_stream_include(&conf, &glob);
        if added {
            ctx.log(&format!("inserted stream include for {glob}"));
        }
        let (conf, disabled) = disable_http_vhost_includes(&conf);
        if disabled {
            ctx.log("commented out HTTP virtual-host includes");
        }
        if added || disabled {
            ctx.host.write_file(Path::new(&main_conf), &conf)?;
        }
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        let glob = ctx.settings.proxy.stream_include_glob();
        let conf = ctx
            .host
            .read_to_string(Path::new(&ctx.settings.proxy.main_conf))?;
        Ok(stream_include_present(&conf, &glob) && !http_vhosts_active(&conf))
    }
}

/// Renders the stream forwarding config into the include directory.
pub struct NginxStreamRenderStep;

impl NginxStreamRenderStep {
    fn on_disk_current(&self, ctx: &StepCtx) -> bool {
        let path = ctx.settings.proxy.stream_conf_path();
        if !ctx.host.path_exists(&path) {
            return false;
        }
        let Ok(existing) = ctx.host.read_to_string(&path) else {
            return false;
        };
        sha256_hex(&existing) == sha256_hex(&render_stream_conf(ctx.settings))
    }
}

impl Step for NginxStreamRenderStep {
    fn name(&self) -> &'static str {
        "NGINX_STREAM_RENDERED"
    }

    fn label(&self) -> &'static str {
        "Render MySQL stream proxy config"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        Ok(self.on_disk_current(ctx))
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        let rendered = render_stream_conf(ctx.settings);
        let path = ctx.settings.proxy.stream_conf_path();
        ctx.host.write_file(&path, &rendered)?;
        ctx.log(&format!(
            "wrote {} (sha256:{})",
            path.display(),
            sha256_hex(&rendered)
        ));
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        Ok(self.on_disk_current(ctx))
    }
}

/// Validates the config and restarts nginx; the forwarding port going live is
/// the verification.
pub struct NginxReloadStep;

impl Step for NginxReloadStep {
    fn name(&self) -> &'static str {
        "NGINX_RELOADED"
    }

    fn label(&self) -> &'static str {
        "Restart nginx and verify listen port"
    }

    fn satisfied(&self, ctx: &mut StepCtx) -> Result<bool> {
        probe::port_listening(ctx.host, ctx.settings.proxy.listen_port)
    }

    fn apply(&self, ctx: &mut StepCtx) -> Result<()> {
        ctx.run_checked("nginx config validation", "nginx", &["-t"])?;
        ctx.run_checked("nginx restart", "systemctl", &["restart", "nginx"])?;
        Ok(())
    }

    fn verify(&self, ctx: &mut StepCtx) -> Result<bool> {
        let port = ctx.settings.proxy.listen_port;
        if probe::port_listening(ctx.host, port)? {
            return Ok(true);
        }
        Err(Error::msg(format!(
            "nginx restarted but nothing listens on port {port}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    const UBUNTU_DEFAULT: &str = r#"
user www-data;
worker_processes auto;
pid /run/nginx.pid;
include /etc/nginx/modules-enabled/*.conf;

events {
    worker_connections 768;
}

http {
    sendfile on;
    include /etc/nginx/mime.types;
    include /etc/nginx/conf.d/*.conf;
    include /etc/nginx/sites-enabled/*;
}
"#;

    fn example_settings() -> Settings {
        let mut s = Settings::default();
        s.backend.host = "10.0.1.55".into();
        s.backend.port = 3306;
        s.proxy.listen_port = 3306;
        s
    }

    #[test]
    fn stream_render_routes_listen_port_to_backend() {
        let rendered = render_stream_conf(&example_settings());
        assert!(rendered.contains("listen 3306;"), "rendered: {rendered}");
        assert!(
            rendered.contains("server 10.0.1.55:3306 max_fails=3 fail_timeout=30s;"),
            "rendered: {rendered}"
        );
        assert!(rendered.contains("proxy_pass mysql_backend;"));
        // single upstream server entry
        assert_eq!(rendered.matches("server 10.0.1.55").count(), 1);
    }

    #[test]
    fn stream_render_is_byte_stable() {
        let s = example_settings();
        assert_eq!(render_stream_conf(&s), render_stream_conf(&s));
        assert_eq!(
            sha256_hex(&render_stream_conf(&s)),
            sha256_hex(&render_stream_conf(&s))
        );
    }

    #[test]
    fn missing_stream_block_is_appended() {
        let (out, changed) = ensure_stream_include(UBUNTU_DEFAULT, "/etc/nginx/stream.conf.d/*.conf");
        assert!(changed);
        assert!(stream_include_present(&out, "/etc/nginx/stream.conf.d/*.conf"));
        // applying again is a no-op
        let (again, changed2) = ensure_stream_include(&out, "/etc/nginx/stream.conf.d/*.conf");
        assert!(!changed2);
        assert_eq!(again, out);
    }

    #[test]
    fn include_inserted_into_existing_stream_block() {
        let conf = format!("{UBUNTU_DEFAULT}\nstream {{\n    tcp_nodelay on;\n}}\n");
        let (out, changed) = ensure_stream_include(&conf, "/etc/nginx/stream.conf.d/*.conf");
        assert!(changed);
        assert!(stream_include_present(&out, "/etc/nginx/stream.conf.d/*.conf"));
        assert_eq!(out.matches("stream {").count(), 1, "no double declaration");
    }

    #[test]
    fn include_in_http_block_or_comment_does_not_count() {
        // The glob appears in a comment and inside http, but there is no
        // stream block: a flat substring search would be fooled.
        let conf = "# include /etc/nginx/stream.conf.d/*.conf;\n\
                    http {\n    include /etc/nginx/stream.conf.d/*.conf;\n}\n";
        assert!(!stream_include_present(conf, "/etc/nginx/stream.conf.d/*.conf"));
        let (out, changed) = ensure_stream_include(conf, "/etc/nginx/stream.conf.d/*.conf");
        assert!(changed);
        assert!(stream_include_present(&out, "/etc/nginx/stream.conf.d/*.conf"));
    }

    #[test]
    fn upstream_keyword_is_not_mistaken_for_stream_block() {
        let conf = "upstream backend {\n    server 127.0.0.1:3306;\n}\n";
        assert!(top_level_block_span(conf, "stream").is_none());
        assert!(top_level_block_span(conf, "upstream").is_some());
    }

    #[test]
    fn vhost_includes_commented_once() {
        let (out, changed) = disable_http_vhost_includes(UBUNTU_DEFAULT);
        assert!(changed);
        assert!(!http_vhosts_active(&out));
        assert!(out.contains("# include /etc/nginx/sites-enabled/*;"));
        // mime.types include untouched
        assert!(out.contains("\n    include /etc/nginx/mime.types;"));
        let (again, changed2) = disable_http_vhost_includes(&out);
        assert!(!changed2);
        assert_eq!(again, out);
    }

    #[test]
    fn commented_http_block_is_ignored() {
        let conf = "# http { include /etc/nginx/sites-enabled/*; }\n";
        assert!(!http_vhosts_active(conf));
        let (_, changed) = disable_http_vhost_includes(conf);
        assert!(!changed);
    }
}
