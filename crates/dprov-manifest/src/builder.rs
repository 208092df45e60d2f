//! # Manifest Builder
//!
//! Drives one device from power-on to a manifest file:
//!
//! ```text
//! connect ─▶ wait_for_ready ─▶ init ─▶ read identity ─▶ close ─▶ sign ─▶ verify ─▶ write
//! ```
//!
//! The order is fixed. The channel is consumed and closed on every path,
//! before signing starts. The manifest file appears only after it has been
//! verified against the signer, and is written with temp-file-then-rename.

use std::time::Duration;

use dprov_core::{ManifestRef, Stage, WorkDir};
use dprov_crypto::SignerAuthority;
use dprov_device::{read_identity, ChannelError, CommandChannel, DeviceIdentity};

use crate::error::{BuildError, ManifestError};
use crate::manifest::SignedManifest;

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuiltManifest {
    /// What was read from the device.
    pub identity: DeviceIdentity,
    /// The signed document.
    pub manifest: SignedManifest,
    /// Where it was written.
    pub manifest_ref: ManifestRef,
}

/// Builds manifests for one signer into one working directory.
#[derive(Debug)]
pub struct ManifestBuilder<'a> {
    signer: &'a SignerAuthority,
    work_dir: &'a WorkDir,
    ready_timeout: Duration,
}

impl<'a> ManifestBuilder<'a> {
    /// Builder signing with `signer` and writing into `work_dir`.
    pub fn new(signer: &'a SignerAuthority, work_dir: &'a WorkDir) -> Self {
        Self {
            signer,
            work_dir,
            ready_timeout: Duration::from_secs(10),
        }
    }

    /// How long to wait for the command prompt.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Build, sign and persist the manifest for the device behind `channel`.
    pub fn build(&self, mut channel: CommandChannel) -> Result<BuiltManifest, BuildError> {
        let port = channel.endpoint().port.clone();
        let identity = self.read_device(&mut channel);
        channel.close();
        let identity = identity.map_err(|(stage, source)| {
            tracing::error!(port = %port, stage = %stage, error = %source, "device read failed");
            BuildError::Channel {
                stage,
                port: port.clone(),
                source,
            }
        })?;

        let serial = identity.serial.clone();
        self.seal(identity).map_err(|source| {
            tracing::error!(serial = %serial, error = %source, "manifest build failed");
            BuildError::Manifest {
                stage: Stage::BuildManifest,
                serial,
                source,
            }
        })
    }

    fn read_device(
        &self,
        channel: &mut CommandChannel,
    ) -> Result<DeviceIdentity, (Stage, ChannelError)> {
        channel.connect().map_err(|e| (Stage::Connect, e))?;
        channel
            .wait_for_ready(self.ready_timeout)
            .map_err(|e| (Stage::WaitReady, e))?;
        channel.init().map_err(|e| (Stage::Init, e))?;
        read_identity(channel).map_err(|e| (Stage::ReadIdentity, e))
    }

    fn seal(&self, identity: DeviceIdentity) -> Result<BuiltManifest, ManifestError> {
        let manifest = SignedManifest::create(&identity, self.signer)?;
        manifest.verify(self.signer.certificate())?;

        self.work_dir.ensure()?;
        let manifest_ref = self.work_dir.manifest_ref(&identity.serial);
        manifest.write(&manifest_ref.path)?;
        tracing::info!(
            serial = %identity.serial,
            path = %manifest_ref.path.display(),
            "manifest written"
        );
        Ok(BuiltManifest {
            identity,
            manifest,
            manifest_ref,
        })
    }
}
