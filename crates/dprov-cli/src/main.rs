//! # dprov CLI entry point
//!
//! Parses arguments, resolves configuration, installs the tracing
//! subscriber and dispatches to the subcommand handlers.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dprov_cli::config::{FlagOverrides, ProvisionConfig};
use dprov_cli::env_check::{run_check_env, CheckEnvArgs};
use dprov_cli::register::{run_register, serial_channel, RegisterArgs};
use dprov_cli::signer::{run_signer, SignerArgs};
use dprov_cli::upload::{run_upload, UploadArgs};
use dprov_cli::{EXIT_ENVIRONMENT, EXIT_FAILURE};
use dprov_registry::AwsCliRegistry;

/// Device identity provisioning.
///
/// Generates a signer authority for the registry account, reads factory
/// device certificates over a serial link, writes signed manifests and
/// imports them into the cloud device registry.
#[derive(Parser, Debug)]
#[command(name = "dprov", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    /// Path to a YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session working directory.
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Registry region.
    #[arg(long, global = true)]
    region: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the registry CLI is installed and the account reachable.
    CheckEnv(CheckEnvArgs),

    /// Generate the signer authority for the registry account.
    Signer(SignerArgs),

    /// Read a device over its serial port and write its signed manifest.
    Register(RegisterArgs),

    /// Import manifests into the registry and validate the records.
    Upload(UploadArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let flags = FlagOverrides {
        work_dir: cli.work_dir.clone(),
        region: cli.region.clone(),
    };
    let config = match ProvisionConfig::load(cli.config.as_deref(), &flags) {
        Ok(config) => config,
        Err(e) => {
            println!("FAIL: configuration: {e}");
            return ExitCode::from(EXIT_ENVIRONMENT);
        }
    };
    tracing::debug!(work_dir = %config.work_dir.display(), region = %config.region, "dprov starting");

    let registry = AwsCliRegistry::new(config.aws_cli.clone(), config.region.clone());

    let result = match &cli.command {
        Commands::CheckEnv(args) => run_check_env(args, &config, &registry),
        Commands::Signer(args) => run_signer(args, &config, &registry),
        Commands::Register(args) => {
            let channel = serial_channel(&args.port, &config);
            run_register(args, &config, &registry, channel)
        }
        Commands::Upload(args) => run_upload(args, &config, &registry),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            println!("FAIL: {e:#}");
            tracing::error!("{e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
