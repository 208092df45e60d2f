//! # check-env Subcommand
//!
//! Confirms the registry CLI is installed, authenticated and able to reach
//! the account's endpoint. `signer` runs the same check before generating
//! anything.

use anyhow::Result;
use clap::Args;

use dprov_registry::{Registry, RegistryError};

use crate::config::ProvisionConfig;
use crate::{EXIT_ENVIRONMENT, EXIT_OK};

/// Arguments for `dprov check-env`.
#[derive(Args, Debug, Default)]
pub struct CheckEnvArgs {}

/// Look up the data endpoint; success means the registry is usable.
pub fn verify_environment(registry: &dyn Registry) -> Result<String, RegistryError> {
    let endpoint = registry.endpoint()?;
    tracing::info!(endpoint = %endpoint, "registry reachable");
    Ok(endpoint)
}

/// Execute `dprov check-env`.
pub fn run_check_env(
    _args: &CheckEnvArgs,
    config: &ProvisionConfig,
    registry: &dyn Registry,
) -> Result<u8> {
    match verify_environment(registry) {
        Ok(endpoint) => {
            println!("OK: registry endpoint {endpoint} (region {})", config.region);
            Ok(EXIT_OK)
        }
        Err(e) => {
            println!("FAIL: environment: {e}");
            tracing::error!(class = %e.class(), error = %e, "environment check failed");
            Ok(EXIT_ENVIRONMENT)
        }
    }
}
