use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use hpm_core::events::{HpmEvent, HpmObserver, TracingObserver};
use hpm_core::image::validate_device_compatibility;
use hpm_core::session::{EngineConfig, UpgradeOptions, UpgradeSession, load_image};
use hpm_core::transport::IpmitoolTransport;
use hpm_core::{FinalStatus, FirmwareImage, SystemClock, UpgradeReport};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "PICMG HPM.1 firmware upgrade tool", long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    channel: ChannelArgs,

    /// Never prompt; refuse anything that would need confirmation
    #[arg(short = 'y', long, global = true)]
    unattended: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long = "debug", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct ChannelArgs {
    /// ipmitool interface (open, lan, lanplus)
    #[arg(short = 'I', long, global = true)]
    interface: Option<String>,

    /// Remote host for LAN interfaces
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    #[arg(short = 'U', long, global = true)]
    user: Option<String>,

    #[arg(short = 'P', long, global = true)]
    password: Option<String>,

    /// Bridged IPMB target address
    #[arg(short = 't', long, global = true, value_parser = parse_u8)]
    target: Option<u8>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate an image; with no file, show the target's versions
    Check { file: Option<PathBuf> },
    /// Upload firmware from an image
    Upgrade {
        file: PathBuf,
        /// Restrict the upgrade to one component
        #[arg(long, value_parser = parse_u8)]
        component: Option<u8>,
        /// Upgrade regardless of versions and identity
        #[arg(long)]
        force: bool,
        /// Activate after upload
        #[arg(long)]
        activate: bool,
        /// Show what would be upgraded and stop
        #[arg(long)]
        preview: bool,
    },
    /// Compare image contents with the target's firmware
    Compare {
        file: PathBuf,
        #[arg(long, value_parser = parse_u8)]
        component: Option<u8>,
    },
    /// Activate uploaded firmware
    Activate {
        /// Ask the target not to roll back automatically
        #[arg(long)]
        norollback: bool,
    },
    /// Get Target Upgrade Capabilities
    Targetcap,
    /// Get Component Properties
    Compprop {
        #[arg(value_parser = parse_u8)]
        component: u8,
        #[arg(value_parser = parse_u8)]
        selector: u8,
    },
    /// Abort the upgrade in progress
    Abort,
    /// Get Upgrade Status
    Upgstatus,
    /// Manual firmware rollback
    Rollback,
    /// Query Rollback Status
    Rollbackstatus,
    /// Query Self-test Result
    Selftestresult,
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid byte '{}': {}", s, e))
}

/// Logs events and asks the operator on stdin.
struct CliObserver {
    inner: TracingObserver,
}

impl HpmObserver for CliObserver {
    fn on_event(&self, event: &HpmEvent) {
        self.inner.on_event(event);
    }

    fn confirm(&self, prompt: &str) -> bool {
        eprint!("{} [y/N] ", prompt);
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}

type CliSession = UpgradeSession<IpmitoolTransport, SystemClock, CliObserver>;

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let channel = &args.channel;
    if let Some(interface) = &channel.interface {
        config.transport.interface = interface.clone();
    }
    if channel.host.is_some() {
        config.transport.host = channel.host.clone();
    }
    if channel.user.is_some() {
        config.transport.user = channel.user.clone();
    }
    if channel.password.is_some() {
        config.transport.password = channel.password.clone();
    }
    if channel.target.is_some() {
        config.transport.target = channel.target;
    }
    Ok(config)
}

fn check_file(session: &mut CliSession, path: &Path) -> anyhow::Result<()> {
    let image = FirmwareImage::from_bytes(load_image(path)?)?;
    println!("{}", image.header());
    for record in image.action_records() {
        let record = record?;
        println!(
            "  {:<16} components {}",
            record.action_type().to_string(),
            record.components
        );
    }

    // Identity checks need a target; skip them when none answers.
    match session.target_summary() {
        Ok(summary) => {
            match validate_device_compatibility(image.header(), &summary.identity) {
                Ok(()) => info!("Image matches target {}", summary.identity),
                Err(issues) => {
                    for issue in issues {
                        warn!("{}", issue);
                    }
                }
            }
        }
        Err(e) => warn!("Target not queried: {}", e),
    }
    Ok(())
}

/// A comparison that found differences is a failed run.
fn ensure_match(report: &UpgradeReport) -> anyhow::Result<()> {
    if report.status == FinalStatus::ComparisonMismatch {
        anyhow::bail!("Firmware on the target differs from the image");
    }
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let transport = IpmitoolTransport::new(config.transport.clone());
    let observer = Arc::new(CliObserver {
        inner: TracingObserver,
    });
    let mut session = UpgradeSession::with_observer(transport, SystemClock::new(), config, observer);

    match &args.command {
        Command::Check { file: Some(path) } => check_file(&mut session, path)?,
        Command::Check { file: None } => {
            let summary = session.target_summary()?;
            println!("{}", summary.identity);
            println!("{}", summary.capabilities);
            for (id, info) in summary.versions.iter().filter(|(_, i)| i.active.is_some()) {
                println!(
                    "{:<3} {:<12} active {}",
                    id,
                    info.target_description.as_deref().unwrap_or(""),
                    info.active.map(|v| v.to_string()).unwrap_or_default()
                );
            }
        }
        Command::Upgrade {
            file,
            component,
            force,
            activate,
            preview,
        } => {
            let opts = UpgradeOptions {
                force: *force,
                activate: *activate,
                preview: *preview,
                component: *component,
                unattended: args.unattended,
                ..Default::default()
            };
            let report = session.upgrade_file(file, &opts)?;
            println!("{}", report);
        }
        Command::Compare { file, component } => {
            let opts = UpgradeOptions {
                compare: true,
                component: *component,
                unattended: args.unattended,
                ..Default::default()
            };
            let report = session.upgrade_file(file, &opts)?;
            println!("{}", report);
            ensure_match(&report)?;
        }
        Command::Activate { norollback } => {
            let outcome = session.activate(*norollback)?;
            info!(polls = outcome.polls, "Firmware activated");
        }
        Command::Targetcap => println!("{}", session.target_capabilities()?),
        Command::Compprop {
            component,
            selector,
        } => println!("{}", session.component_properties(*component, *selector)?),
        Command::Abort => session.abort()?,
        Command::Upgstatus => {
            let status = session.upgrade_status()?;
            println!(
                "command in progress: 0x{:02X}, last completion code: {}",
                status.command_in_progress, status.last_completion
            );
        }
        Command::Rollback => {
            session.manual_rollback()?;
        }
        Command::Rollbackstatus => println!("{}", session.rollback_status()?),
        Command::Selftestresult => {
            let result = session.selftest_result()?;
            println!(
                "self-test {}: result 0x{:02X} detail 0x{:02X}",
                if result.passed() { "passed" } else { "failed" },
                result.result,
                result.detail
            );
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting HPM.1 upgrade tool (ipmitool backend)...");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u8() {
        assert_eq!(parse_u8("0x20"), Ok(0x20));
        assert_eq!(parse_u8("7"), Ok(7));
        assert!(parse_u8("0x100").is_err());
    }

    #[test]
    fn test_compare_mismatch_fails() {
        let mut report = UpgradeReport {
            components: Vec::new(),
            update_mask: hpm_core::ComponentSet::single(1),
            final_state: hpm_core::UpgradeState::Uploaded,
            status: FinalStatus::Success,
            activation_polls: None,
        };
        assert!(ensure_match(&report).is_ok());
        report.status = FinalStatus::ComparisonMismatch;
        assert!(ensure_match(&report).is_err());
    }

    #[test]
    fn test_upgrade_args() {
        let args = Args::parse_from([
            "hpm", "-I", "lan", "-H", "10.0.0.5", "upgrade", "fw.hpm", "--component", "1",
            "--activate",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.transport.interface, "lan");
        assert_eq!(config.transport.host.as_deref(), Some("10.0.0.5"));
        match args.command {
            Command::Upgrade {
                component,
                activate,
                force,
                ..
            } => {
                assert_eq!(component, Some(1));
                assert!(activate);
                assert!(!force);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
