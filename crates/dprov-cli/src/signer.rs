//! # signer Subcommand
//!
//! Generates the signer authority for the registry account and persists it
//! into the working directory. An authority that is still current for the
//! account's registration code is kept unless `--force` is given.

use anyhow::{Context, Result};
use clap::Args;

use dprov_core::WorkDir;
use dprov_crypto::{AuthorityError, SignerAuthority};
use dprov_registry::Registry;

use crate::config::ProvisionConfig;
use crate::env_check::verify_environment;
use crate::{now_unix, EXIT_ENVIRONMENT, EXIT_OK};

/// Arguments for `dprov signer`.
#[derive(Args, Debug, Default)]
pub struct SignerArgs {
    /// Regenerate even if the existing authority is still current.
    #[arg(long)]
    pub force: bool,
}

/// Execute `dprov signer`.
pub fn run_signer(
    args: &SignerArgs,
    config: &ProvisionConfig,
    registry: &dyn Registry,
) -> Result<u8> {
    if let Err(e) = verify_environment(registry) {
        println!("FAIL: environment: {e}");
        return Ok(EXIT_ENVIRONMENT);
    }

    let work_dir = WorkDir::new(&config.work_dir);
    work_dir
        .ensure()
        .with_context(|| format!("cannot create {}", work_dir.root().display()))?;

    if !args.force {
        if let Some(current) = current_authority(&work_dir, registry)? {
            println!(
                "OK: keeping current signer authority {} (use --force to regenerate)",
                current.fingerprint()
            );
            return Ok(EXIT_OK);
        }
    }

    let authority = SignerAuthority::generate_with(|| registry.registration_code())
        .context("signer authority generation failed")?;
    authority
        .persist(&work_dir)
        .context("cannot persist signer authority")?;

    println!("OK: generated signer authority");
    println!("  Common name: {}", authority.registration_code());
    println!("  Fingerprint: {}", authority.fingerprint());
    println!("  Key:         {}", work_dir.signer_key_path().display());
    println!("  Certificate: {}", work_dir.signer_cert_path().display());
    Ok(EXIT_OK)
}

/// The persisted authority, if it is usable for the current registration code.
fn current_authority(
    work_dir: &WorkDir,
    registry: &dyn Registry,
) -> Result<Option<SignerAuthority>> {
    let existing = match SignerAuthority::load(work_dir) {
        Ok(existing) => existing,
        Err(AuthorityError::Missing(_)) => return Ok(None),
        Err(e) => {
            tracing::warn!(error = %e, "existing signer authority unusable; regenerating");
            return Ok(None);
        }
    };
    let code = registry
        .registration_code()
        .map_err(|e| AuthorityError::RegistrationCode(e.to_string()))?;
    match existing.ensure_current(&code, now_unix()) {
        Ok(()) => Ok(Some(existing)),
        Err(e) => {
            tracing::info!(reason = %e, "existing signer authority is not current; regenerating");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dprov_registry::InMemoryRegistry;

    fn config_in(dir: &std::path::Path) -> ProvisionConfig {
        ProvisionConfig {
            work_dir: dir.join("session"),
            ..ProvisionConfig::default()
        }
    }

    #[test]
    fn generates_and_persists_for_registration_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let registry = InMemoryRegistry::new("AB12CD34");

        let code = run_signer(&SignerArgs::default(), &config, &registry).unwrap();
        assert_eq!(code, EXIT_OK);

        let loaded = SignerAuthority::load(&WorkDir::new(&config.work_dir)).unwrap();
        assert_eq!(loaded.registration_code(), "AB12CD34");
    }

    #[test]
    fn keeps_current_authority_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let work_dir = WorkDir::new(&config.work_dir);
        let registry = InMemoryRegistry::new("AB12CD34");

        run_signer(&SignerArgs::default(), &config, &registry).unwrap();
        let first = SignerAuthority::load(&work_dir).unwrap().fingerprint();

        run_signer(&SignerArgs::default(), &config, &registry).unwrap();
        assert_eq!(SignerAuthority::load(&work_dir).unwrap().fingerprint(), first);

        run_signer(&SignerArgs { force: true }, &config, &registry).unwrap();
        assert_ne!(SignerAuthority::load(&work_dir).unwrap().fingerprint(), first);
    }

    #[test]
    fn stale_authority_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let work_dir = WorkDir::new(&config.work_dir);
        let registry = InMemoryRegistry::new("AB12CD34");

        run_signer(&SignerArgs::default(), &config, &registry).unwrap();
        registry.set_registration_code("EF56AB78");
        run_signer(&SignerArgs::default(), &config, &registry).unwrap();

        let loaded = SignerAuthority::load(&work_dir).unwrap();
        assert_eq!(loaded.registration_code(), "EF56AB78");
    }
}
