//! # Stub Loader
//!
//! Before the secure element can be driven, the microcontroller must be
//! running the manufacturing command interpreter. [`StubLoader`] uploads that
//! image; [`EsptoolLoader`] does it by shelling out to `esptool.py` and
//! running the image from RAM, leaving flash untouched.

use std::path::PathBuf;
use std::process::Command;

use crate::error::LoaderError;

/// Where and how to reach one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    /// Serial port name, e.g. `/dev/ttyUSB0` or `COM7`.
    pub port: String,
    /// Line speed.
    pub baud: u32,
    /// Command-interpreter firmware image.
    pub stub_image: PathBuf,
}

impl DeviceEndpoint {
    /// Default line speed of the manufacturing stub.
    pub const DEFAULT_BAUD: u32 = 115_200;

    /// Endpoint at the default baud rate.
    pub fn new(port: impl Into<String>, stub_image: impl Into<PathBuf>) -> Self {
        Self {
            port: port.into(),
            baud: Self::DEFAULT_BAUD,
            stub_image: stub_image.into(),
        }
    }
}

/// Uploads the command-interpreter stub to a device.
pub trait StubLoader: Send + Sync {
    /// Upload and start the stub on `endpoint`.
    fn load(&self, endpoint: &DeviceEndpoint) -> Result<(), LoaderError>;
}

/// Loads the stub with `esptool.py load_ram`.
#[derive(Debug, Clone)]
pub struct EsptoolLoader {
    program: String,
    chip: String,
}

impl Default for EsptoolLoader {
    fn default() -> Self {
        Self::new("esptool.py", "esp32")
    }
}

impl EsptoolLoader {
    /// Loader invoking `program` for `chip`.
    pub fn new(program: impl Into<String>, chip: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            chip: chip.into(),
        }
    }

    /// The loader program.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments passed to the loader for `endpoint`.
    pub fn args(&self, endpoint: &DeviceEndpoint) -> Vec<String> {
        vec![
            "--chip".to_string(),
            self.chip.clone(),
            "--port".to_string(),
            endpoint.port.clone(),
            "--baud".to_string(),
            endpoint.baud.to_string(),
            "--no-stub".to_string(),
            "load_ram".to_string(),
            endpoint.stub_image.display().to_string(),
        ]
    }
}

impl StubLoader for EsptoolLoader {
    fn load(&self, endpoint: &DeviceEndpoint) -> Result<(), LoaderError> {
        if !endpoint.stub_image.is_file() {
            return Err(LoaderError::MissingImage(
                endpoint.stub_image.display().to_string(),
            ));
        }
        let args = self.args(endpoint);
        tracing::info!(port = %endpoint.port, image = %endpoint.stub_image.display(), "uploading command stub");
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| LoaderError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(LoaderError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
