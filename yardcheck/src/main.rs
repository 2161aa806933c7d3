//! `yardcheck`: end-to-end verification of the dockyard provisioning tool on a
//! remote host.

use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use yardcheck::exit_codes;
use yardcheck::io::config::{HarnessConfig, HostKeyPolicy, load_config, render_config};
use yardcheck::io::remote::Connect;
use yardcheck::io::run_report::{RunReport, write_report};
use yardcheck::io::ssh::{ConnectionManager, SshTarget};
use yardcheck::logging;
use yardcheck::recorder::Recorder;
use yardcheck::suite::{SuiteContext, run_suite};

#[derive(Parser, Debug)]
#[command(
    name = "yardcheck",
    version,
    about = "End-to-end verification of dockyard on a remote host"
)]
struct Cli {
    /// Target host.
    #[arg(long, required_unless_present = "print_config")]
    host: Option<String>,
    /// Remote user (needs passwordless sudo).
    #[arg(long, required_unless_present = "print_config")]
    user: Option<String>,
    /// Private key to try (default: ~/.ssh/id_ed25519, ~/.ssh/id_rsa).
    #[arg(long)]
    key: Option<PathBuf>,
    /// Overall budget, checked between phases (e.g. `20m`, `90s`).
    #[arg(long, default_value = "20m")]
    timeout: humantime::Duration,
    /// Harness config file; a missing file means defaults.
    #[arg(long, default_value = "yardcheck.toml")]
    config: PathBuf,
    #[arg(long, value_enum)]
    host_key_policy: Option<HostKeyPolicy>,
    /// Pinned known_hosts file (implies nothing unless the policy is `pin`).
    #[arg(long)]
    known_hosts: Option<PathBuf>,
    /// Local provisioning tool to upload.
    #[arg(long)]
    artifact: Option<PathBuf>,
    /// Write a JSON run report here.
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
    /// Print the effective config as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(&cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::FAILED);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let deadline = Instant::now() + *cli.timeout;
    let mut config = load_config(&cli.config)?;
    apply_overrides(&mut config, cli);
    config.validate().context("invalid configuration")?;

    if cli.print_config {
        print!("{}", render_config(&config)?);
        return Ok(exit_codes::OK);
    }
    let (Some(host), Some(user)) = (cli.host.clone(), cli.user.clone()) else {
        bail!("--host and --user are required");
    };

    let target = SshTarget {
        host,
        user,
        port: config.port,
    };
    let connector = ConnectionManager::new(target.clone(), cli.key.clone(), &config);
    let started_at = Utc::now();
    let channel = connector
        .connect()
        .with_context(|| format!("connect to {}", target.destination()))?;
    info!(destination = %target.destination(), "channel established");

    let mut ctx = SuiteContext::new(connector, channel, config);
    let mut recorder = Recorder::new(io::stdout());
    let summary = run_suite(&mut ctx, &mut recorder, Some(deadline))?;

    if let Some(path) = &cli.report {
        let report = RunReport::new(
            &target.host,
            &target.user,
            started_at,
            Utc::now(),
            summary,
            recorder.results(),
        );
        if let Err(err) = write_report(path, &report) {
            warn!(error = %format!("{err:#}"), "run report not written");
        }
    }

    Ok(if summary.success() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn apply_overrides(config: &mut HarnessConfig, cli: &Cli) {
    if let Some(policy) = cli.host_key_policy {
        config.host_key_policy = policy;
    }
    if let Some(path) = &cli.known_hosts {
        config.known_hosts = Some(path.clone());
    }
    if let Some(path) = &cli.artifact {
        config.artifact_path = path.clone();
    }
}
