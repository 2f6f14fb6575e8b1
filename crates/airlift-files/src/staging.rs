//! Temporary artifact staging and the directory-packaging seam.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Staging area for transfer artifacts.
///
/// Outgoing files are copied here before transmission so the source can change
/// underneath a long transfer without corrupting it; incoming chunk
/// directories live under `incoming/`.
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    /// Open (creating if needed) a staging area rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("outgoing"))?;
        fs::create_dir_all(root.join("incoming"))?;
        Ok(Self { root })
    }

    /// Copy a source file into the outgoing area for a transfer.
    ///
    /// Returns the staged path and its size.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    pub fn stage_file(&self, transfer_id: &str, src: &Path) -> io::Result<(PathBuf, u64)> {
        let name = src
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
        let dest = self.outgoing_path(transfer_id, &name.to_string_lossy());
        fs::copy(src, &dest)?;
        let size = fs::metadata(&dest)?.len();
        Ok((dest, size))
    }

    /// Path for an outgoing staged artifact.
    #[must_use]
    pub fn outgoing_path(&self, transfer_id: &str, file_name: &str) -> PathBuf {
        self.root.join("outgoing").join(format!("{transfer_id}-{file_name}"))
    }

    /// The outgoing staging directory itself.
    #[must_use]
    pub fn outgoing_dir(&self) -> PathBuf {
        self.root.join("outgoing")
    }

    /// Per-transfer incoming chunk directory.
    #[must_use]
    pub fn incoming_dir(&self, transfer_id: &str) -> PathBuf {
        self.root.join("incoming").join(transfer_id)
    }

    /// Path where an incoming transfer is reassembled before delivery.
    #[must_use]
    pub fn incoming_artifact(&self, transfer_id: &str, file_name: &str) -> PathBuf {
        self.root.join("incoming").join(format!("{transfer_id}-{file_name}"))
    }
}

/// Best-effort removal of a staged artifact. Failures are logged, never fatal.
pub fn remove_artifact(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("failed to remove staged artifact {}: {e}", path.display());
        }
    }
}

/// Directory packaging collaborator.
///
/// Directory payloads travel as a single artifact; producing and unpacking
/// that artifact is the embedder's concern.
pub trait Packager: Send + Sync {
    /// Pack a directory into a single artifact inside `staging_dir`.
    /// Returns the artifact path and its size.
    ///
    /// # Errors
    ///
    /// Returns an error if packing fails or is unsupported.
    fn pack(&self, dir: &Path, staging_dir: &Path) -> io::Result<(PathBuf, u64)>;

    /// Unpack an artifact into `dest_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if unpacking fails or is unsupported.
    fn unpack(&self, artifact: &Path, dest_dir: &Path) -> io::Result<()>;
}

/// Default packager for deployments without directory support configured.
/// Every operation fails with `Unsupported`, which surfaces as a resource
/// error on the transfer that needed it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPackager;

impl Packager for PassthroughPackager {
    fn pack(&self, dir: &Path, _staging_dir: &Path) -> io::Result<(PathBuf, u64)> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no packager configured for directory {}", dir.display()),
        ))
    }

    fn unpack(&self, artifact: &Path, _dest_dir: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no packager configured for artifact {}", artifact.display()),
        ))
    }
}
