//! # Session Working Directory
//!
//! One provisioning session owns one working directory holding:
//!
//! ```text
//! <work_dir>/
//!   signer_key.pem              signer private key (PKCS#8 PEM, 0600)
//!   signer_cert.crt             signer certificate (PEM)
//!   <SERIAL>_manifest.json      one signed manifest per device
//! ```
//!
//! ## Write Discipline
//!
//! Every file is written through a temp file in the same directory followed
//! by a rename, so a crash mid-write never leaves a truncated manifest or key
//! for a later stage to pick up. [`StagedFile`] exposes the two halves
//! separately so a caller can stage several files and commit them together.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::serial::SerialNumber;

/// File name of the signer private key.
pub const SIGNER_KEY_FILE: &str = "signer_key.pem";

/// File name of the signer certificate.
pub const SIGNER_CERT_FILE: &str = "signer_cert.crt";

/// Suffix shared by every manifest file.
pub const MANIFEST_SUFFIX: &str = "_manifest.json";

/// A session working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

/// A manifest on disk, identified by the device serial it was named after.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ManifestRef {
    /// Serial number encoded in the file name.
    pub serial: SerialNumber,
    /// Full path of the manifest file.
    pub path: PathBuf,
}

impl WorkDir {
    /// Wrap a directory path. Nothing is created until [`WorkDir::ensure`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory (and parents) if absent.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    /// The directory path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the signer private key.
    pub fn signer_key_path(&self) -> PathBuf {
        self.root.join(SIGNER_KEY_FILE)
    }

    /// Path of the signer certificate.
    pub fn signer_cert_path(&self) -> PathBuf {
        self.root.join(SIGNER_CERT_FILE)
    }

    /// Deterministic manifest path for a device.
    pub fn manifest_path(&self, serial: &SerialNumber) -> PathBuf {
        self.root.join(manifest_file_name(serial))
    }

    /// Reference to the manifest of a device, whether or not it exists yet.
    pub fn manifest_ref(&self, serial: &SerialNumber) -> ManifestRef {
        ManifestRef {
            serial: serial.clone(),
            path: self.manifest_path(serial),
        }
    }

    /// List every manifest file in the directory, sorted by serial.
    ///
    /// Files that do not match `<SERIAL>_manifest.json` are ignored. A missing
    /// directory yields an empty list.
    pub fn discover_manifests(&self) -> io::Result<Vec<ManifestRef>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(serial) = parse_manifest_file_name(name) {
                found.push(ManifestRef {
                    serial,
                    path: entry.path(),
                });
            }
        }
        found.sort();
        tracing::debug!(dir = %self.root.display(), count = found.len(), "discovered manifests");
        Ok(found)
    }
}

/// `<SERIAL>_manifest.json`
pub fn manifest_file_name(serial: &SerialNumber) -> String {
    format!("{serial}{MANIFEST_SUFFIX}")
}

/// Recover the serial number from a manifest file name.
pub fn parse_manifest_file_name(name: &str) -> Option<SerialNumber> {
    let stem = name.strip_suffix(MANIFEST_SUFFIX)?;
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    SerialNumber::parse(stem).ok()
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// A fully written temp file waiting to be renamed onto its target.
///
/// Dropping a `StagedFile` without committing removes the temp file.
#[derive(Debug)]
pub struct StagedFile {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl StagedFile {
    /// Write `bytes` into a temp file next to `target`.
    ///
    /// With `private` set, the temp file is restricted to the owner before
    /// any content is written (Unix only).
    pub fn stage(target: &Path, bytes: &[u8], private: bool) -> io::Result<Self> {
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        if private {
            restrict_to_owner(tmp.path())?;
        }
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        Ok(Self {
            tmp,
            target: target.to_path_buf(),
        })
    }

    /// The path the file will occupy once committed.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename the temp file onto its target.
    pub fn commit(self) -> io::Result<PathBuf> {
        let target = self.target;
        self.tmp.persist(&target).map_err(|e| e.error)?;
        Ok(target)
    }
}

/// Atomically replace `target` with `bytes`.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    StagedFile::stage(target, bytes, false)?.commit()
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> io::Result<()> {
    Ok(())
}
