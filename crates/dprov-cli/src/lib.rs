//! # dprov-cli: Device Provisioning Command-Line Interface
//!
//! Drives the provisioning pipeline from a workstation with the device on a
//! serial port and the registry reachable through the `aws` CLI.
//!
//! ## Subcommands
//!
//! - `check-env`: registry CLI present, authenticated and reachable
//! - `signer`: generate and persist the signer authority
//! - `register`: read one device and write its signed manifest
//! - `upload`: import manifests and validate the registry records
//!
//! ## Crate Policy
//!
//! - Argument parsing lives in `main.rs`; handlers take parsed arguments,
//!   the resolved [`config::ProvisionConfig`] and the collaborators they use.
//! - Handlers return the process exit code. Operator-facing results are
//!   `OK:`/`FAIL:` lines on stdout; diagnostics go through `tracing`.
//! - Exit codes: [`EXIT_OK`], [`EXIT_FAILURE`] (including partial batch
//!   failure), [`EXIT_ENVIRONMENT`] (precondition or configuration failure).

pub mod config;
pub mod env_check;
pub mod register;
pub mod signer;
pub mod upload;

/// Every requested operation succeeded.
pub const EXIT_OK: u8 = 0;

/// At least one operation failed.
pub const EXIT_FAILURE: u8 = 1;

/// The environment or configuration is unusable.
pub const EXIT_ENVIRONMENT: u8 = 2;

/// Current time in unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
