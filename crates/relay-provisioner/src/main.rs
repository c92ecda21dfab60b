use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use relay_provisioner::checkpoint::CheckpointLog;
use relay_provisioner::config::{self, Flow};
use relay_provisioner::executor::{self, StdoutSink, StepCtx};
use relay_provisioner::host::{Host, LiveHost};
use relay_provisioner::steps;
use relay_provisioner::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FlowArg {
    /// Swap sizing, service trim, firewall, Nginx TCP stream proxy
    Proxy,
    /// Cloudflare tunnel install, auth, create, ingress, service
    Tunnel,
}

impl From<FlowArg> for Flow {
    fn from(f: FlowArg) -> Self {
        match f {
            FlowArg::Proxy => Flow::Proxy,
            FlowArg::Tunnel => Flow::Tunnel,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the ordered step sequence for a flow
    Plan {
        flow: FlowArg,
        /// Path to the relay settings TOML
        #[arg(long, default_value = "configs/relay.toml")]
        config: PathBuf,
    },
    /// Execute a flow against this host
    Run {
        flow: FlowArg,
        /// Path to the relay settings TOML
        #[arg(long, default_value = "configs/relay.toml")]
        config: PathBuf,
        /// Probe and report without mutating or checkpointing
        #[arg(long)]
        dry_run: bool,
        /// Answer yes to every confirmation prompt
        #[arg(long)]
        assume_yes: bool,
    },
    /// Report checkpoint and live-state status per step
    Status {
        flow: FlowArg,
        /// Path to the relay settings TOML
        #[arg(long, default_value = "configs/relay.toml")]
        config: PathBuf,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete the checkpoint log (the only way markers are ever pruned)
    Reset {
        /// Path to the relay settings TOML
        #[arg(long, default_value = "configs/relay.toml")]
        config: PathBuf,
        /// Answer yes to every confirmation prompt
        #[arg(long)]
        assume_yes: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Plan { flow, config } => cmd_plan(flow.into(), &config),
        Command::Run {
            flow,
            config,
            dry_run,
            assume_yes,
        } => cmd_run(flow.into(), &config, dry_run, assume_yes),
        Command::Status { flow, config, json } => cmd_status(flow.into(), &config, json),
        Command::Reset { config, assume_yes } => cmd_reset(&config, assume_yes),
    }
}

fn cmd_plan(flow: Flow, config: &PathBuf) -> Result<()> {
    let settings = config::load(config)?;
    settings.validate(flow)?;
    for (i, step) in steps::flow_steps(flow).iter().enumerate() {
        println!("{:>2}. {:<26} {}", i + 1, step.name(), step.label());
    }
    Ok(())
}

fn cmd_run(flow: Flow, config: &PathBuf, dry_run: bool, assume_yes: bool) -> Result<()> {
    let settings = config::load(config)?;
    settings.validate(flow)?;

    let host = LiveHost::new(assume_yes);
    if !dry_run && !host.is_root() {
        return Err(Error::msg("run requires root; re-run with sudo or use --dry-run"));
    }

    let sink = StdoutSink::default();
    let flow_steps = steps::flow_steps(flow);
    let mut ctx = StepCtx::new(&settings, &host, &sink, dry_run);
    executor::run_flow(&flow_steps, &mut ctx)
}

fn cmd_status(flow: Flow, config: &PathBuf, json: bool) -> Result<()> {
    let settings = config::load(config)?;
    settings.validate(flow)?;

    let host = LiveHost::new(true);
    let sink = QuietSink;
    let flow_steps = steps::flow_steps(flow);
    let mut ctx = StepCtx::new(&settings, &host, &sink, true);
    let report = executor::flow_status(&flow_steps, &mut ctx)?;

    if json {
        let s = serde_json::to_string_pretty(&report)?;
        println!("{s}");
        return Ok(());
    }
    for st in &report {
        let live = match (&st.satisfied, &st.probe_error) {
            (Some(true), _) => "satisfied",
            (Some(false), _) => "pending",
            (None, Some(_)) => "probe-error",
            (None, None) => "unknown",
        };
        println!(
            "{:<26} checkpoint={:<3} live={}",
            st.name,
            if st.checkpointed { "yes" } else { "no" },
            live
        );
        if let Some(e) = &st.probe_error {
            println!("{:<26}   {e}", "");
        }
    }
    Ok(())
}

fn cmd_reset(config: &PathBuf, assume_yes: bool) -> Result<()> {
    let settings = config::load(config)?;
    let host = LiveHost::new(assume_yes);
    let log = CheckpointLog::new(&settings.checkpoint_file);
    if log.entries()?.is_empty() {
        println!("checkpoint log {} is already empty", log.path().display());
        return Ok(());
    }
    if !host.confirm(&format!(
        "Delete checkpoint log {} ? Every step will re-probe on the next run.",
        log.path().display()
    ))? {
        return Err(Error::msg("reset declined"));
    }
    log.reset()?;
    println!("checkpoint log removed");
    Ok(())
}

/// Status probes should not chat on stdout; the report is the output.
struct QuietSink;

impl executor::EventSink for QuietSink {
    fn emit(&self, _ev: executor::StepEvent) {}
}
