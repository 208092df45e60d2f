//! # Provisioning Configuration
//!
//! Settings are layered, later layers winning:
//!
//! 1. built-in defaults
//! 2. the YAML file given with `--config`
//! 3. `DPROV_*` environment variables (`AWS_REGION` is honoured for the region)
//! 4. command-line flags
//!
//! Validation runs once, after all layers are applied.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dprov_core::ErrorClass;
use dprov_device::ChannelTimeouts;
use serde::{Deserialize, Serialize};

/// Resolved provisioning settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Session working directory.
    pub work_dir: PathBuf,
    /// Registry region.
    pub region: String,
    /// Registry CLI program.
    pub aws_cli: String,
    /// Stub loader program.
    pub esptool: String,
    /// Target chip passed to the loader.
    pub chip: String,
    /// Manufacturing firmware image uploaded to the device.
    pub stub_image: PathBuf,
    /// Serial baud rate.
    pub baud: u32,
    /// Seconds to wait for the command prompt.
    pub ready_timeout_secs: u64,
    /// Seconds to wait for one command response.
    pub command_timeout_secs: u64,
    /// Access policy attached to device certificates.
    pub policy_name: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("tmp"),
            region: dprov_registry::DEFAULT_REGION.to_string(),
            aws_cli: "aws".to_string(),
            esptool: "esptool.py".to_string(),
            chip: "esp32".to_string(),
            stub_image: PathBuf::from("sample_bins/secure_cert_mfg_esp32.bin"),
            baud: dprov_device::DeviceEndpoint::DEFAULT_BAUD,
            ready_timeout_secs: 10,
            command_timeout_secs: 5,
            policy_name: dprov_registry::DEFAULT_POLICY.to_string(),
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct FlagOverrides {
    /// `--work-dir`
    pub work_dir: Option<PathBuf>,
    /// `--region`
    pub region: Option<String>,
}

/// Configuration errors. All of them are environment failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for this schema.
    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        /// File path.
        path: PathBuf,
        /// YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A setting has an unusable value.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Setting or variable name.
        key: String,
        /// Offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Error classification.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Environment
    }
}

impl ProvisionConfig {
    /// Apply every layer using the process environment.
    pub fn load(file: Option<&Path>, flags: &FlagOverrides) -> Result<Self, ConfigError> {
        Self::load_with(file, flags, |key| std::env::var(key).ok())
    }

    /// Apply every layer, reading variables through `env`.
    pub fn load_with<F>(
        file: Option<&Path>,
        flags: &FlagOverrides,
        env: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.apply_flags(flags);
        config.validate()?;
        tracing::debug!(config = ?config, "configuration resolved");
        Ok(config)
    }

    /// Defaults overlaid with a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("DPROV_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = env("DPROV_REGION").or_else(|| env("AWS_REGION")) {
            self.region = v;
        }
        if let Some(v) = env("DPROV_AWS_CLI") {
            self.aws_cli = v;
        }
        if let Some(v) = env("DPROV_ESPTOOL") {
            self.esptool = v;
        }
        if let Some(v) = env("DPROV_CHIP") {
            self.chip = v;
        }
        if let Some(v) = env("DPROV_STUB_IMAGE") {
            self.stub_image = PathBuf::from(v);
        }
        if let Some(v) = env("DPROV_BAUD") {
            self.baud = parse_number("DPROV_BAUD", &v)?;
        }
        if let Some(v) = env("DPROV_READY_TIMEOUT_SECS") {
            self.ready_timeout_secs = parse_number("DPROV_READY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = env("DPROV_COMMAND_TIMEOUT_SECS") {
            self.command_timeout_secs = parse_number("DPROV_COMMAND_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = env("DPROV_POLICY") {
            self.policy_name = v;
        }
        Ok(())
    }

    fn apply_flags(&mut self, flags: &FlagOverrides) {
        if let Some(dir) = &flags.work_dir {
            self.work_dir.clone_from(dir);
        }
        if let Some(region) = &flags.region {
            self.region.clone_from(region);
        }
    }

    /// Reject values no run could succeed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String, reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
            reason: reason.to_string(),
        };
        if self.baud == 0 {
            return Err(invalid("baud", "0".into(), "must be positive"));
        }
        if self.ready_timeout_secs == 0 {
            return Err(invalid("ready_timeout_secs", "0".into(), "must be positive"));
        }
        if self.command_timeout_secs == 0 {
            return Err(invalid("command_timeout_secs", "0".into(), "must be positive"));
        }
        for (key, value) in [
            ("policy_name", &self.policy_name),
            ("region", &self.region),
            ("aws_cli", &self.aws_cli),
            ("esptool", &self.esptool),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(key, value.clone(), "must not be empty"));
            }
        }
        if self.work_dir.as_os_str().is_empty() {
            return Err(invalid("work_dir", String::new(), "must not be empty"));
        }
        Ok(())
    }

    /// Channel timing derived from the configured timeouts.
    pub fn channel_timeouts(&self) -> ChannelTimeouts {
        ChannelTimeouts {
            ready: Duration::from_secs(self.ready_timeout_secs),
            command: Duration::from_secs(self.command_timeout_secs),
            ..ChannelTimeouts::default()
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}
