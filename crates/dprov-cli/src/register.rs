//! # register Subcommand
//!
//! Provisions one device: confirms the signer authority is current for the
//! registry account, reads the device identity over the serial link, writes
//! the signed manifest and, with `--upload`, imports that manifest at once.

use anyhow::{Context, Result};
use clap::Args;

use dprov_core::WorkDir;
use dprov_crypto::{AuthorityError, SignerAuthority};
use dprov_device::{CommandChannel, DeviceEndpoint, EsptoolLoader, SerialOpener};
use dprov_manifest::ManifestBuilder;
use dprov_registry::{ImportOptions, Importer, Registry};

use crate::config::ProvisionConfig;
use crate::upload::print_report;
use crate::{now_unix, EXIT_ENVIRONMENT, EXIT_FAILURE, EXIT_OK};

/// Arguments for `dprov register`.
#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Serial port the device is attached to, e.g. `/dev/ttyUSB0` or `COM7`.
    #[arg(long)]
    pub port: String,

    /// Import the manifest into the registry right after building it.
    #[arg(long)]
    pub upload: bool,
}

/// A channel to real hardware on `port`, configured from `config`.
pub fn serial_channel(port: &str, config: &ProvisionConfig) -> CommandChannel {
    let endpoint = DeviceEndpoint {
        port: port.to_string(),
        baud: config.baud,
        stub_image: config.stub_image.clone(),
    };
    CommandChannel::new(
        endpoint,
        Box::new(EsptoolLoader::new(config.esptool.clone(), config.chip.clone())),
        Box::new(SerialOpener),
    )
    .with_timeouts(config.channel_timeouts())
}

/// Execute `dprov register` against the device behind `channel`.
pub fn run_register(
    args: &RegisterArgs,
    config: &ProvisionConfig,
    registry: &dyn Registry,
    channel: CommandChannel,
) -> Result<u8> {
    let work_dir = WorkDir::new(&config.work_dir);
    let authority = match SignerAuthority::load(&work_dir) {
        Ok(authority) => authority,
        Err(AuthorityError::Missing(path)) => {
            println!(
                "FAIL: no signer authority at {}; run `dprov signer` first",
                path.display()
            );
            return Ok(EXIT_FAILURE);
        }
        Err(e) => return Err(e).context("cannot load signer authority"),
    };

    let code = match registry.registration_code() {
        Ok(code) => code,
        Err(e) => {
            println!("FAIL: environment: {e}");
            return Ok(EXIT_ENVIRONMENT);
        }
    };
    if let Err(e) = authority.ensure_current(&code, now_unix()) {
        println!("FAIL: {e}; run `dprov signer` to regenerate");
        return Ok(EXIT_FAILURE);
    }

    let builder = ManifestBuilder::new(&authority, &work_dir)
        .with_ready_timeout(config.channel_timeouts().ready);
    let built = match builder.build(channel) {
        Ok(built) => built,
        Err(e) => {
            let serial = e.serial().map_or_else(|| "-".to_string(), ToString::to_string);
            println!(
                "FAIL: {} {serial} stage={} class={}: {e}",
                args.port,
                e.stage(),
                e.class()
            );
            return Ok(EXIT_FAILURE);
        }
    };
    println!(
        "OK: {} {}",
        built.identity.serial,
        built.manifest_ref.path.display()
    );

    if !args.upload {
        return Ok(EXIT_OK);
    }

    let importer = Importer::new(registry, authority.certificate()).with_options(ImportOptions {
        policy_name: config.policy_name.clone(),
        ..ImportOptions::default()
    });
    let report = importer
        .import_all(std::slice::from_ref(&built.manifest_ref))
        .context("upload aborted")?;
    Ok(print_report(&report))
}
