//! Btrfs snapshot chroot: each session runs in a btrfs subvolume
//! snapshot created from a source subvolume by the setup scripts.

use crate::chroot::{ChrootError, Result};
use crate::environment::Environment;
use crate::utils;

#[derive(Debug, Clone, Default)]
pub struct BtrfsSnapshot {
    source_subvolume: String,
    snapshot_directory: String,
    snapshot_path: String,
}

impl BtrfsSnapshot {
    pub fn source_subvolume(&self) -> &str {
        &self.source_subvolume
    }

    pub fn set_source_subvolume(&mut self, subvolume: &str) -> Result<()> {
        if !subvolume.is_empty() && !utils::is_absname(subvolume) {
            return Err(ChrootError::DirectoryAbs(subvolume.to_string()));
        }
        self.source_subvolume = subvolume.to_string();
        Ok(())
    }

    pub fn snapshot_directory(&self) -> &str {
        &self.snapshot_directory
    }

    pub fn set_snapshot_directory(&mut self, directory: &str) -> Result<()> {
        if !directory.is_empty() && !utils::is_absname(directory) {
            return Err(ChrootError::DirectoryAbs(directory.to_string()));
        }
        self.snapshot_directory = directory.to_string();
        Ok(())
    }

    pub fn snapshot_path(&self) -> &str {
        &self.snapshot_path
    }

    pub fn set_snapshot_path(&mut self, path: &str) -> Result<()> {
        if !path.is_empty() && !utils::is_absname(path) {
            return Err(ChrootError::DirectoryAbs(path.to_string()));
        }
        self.snapshot_path = path.to_string();
        Ok(())
    }

    /// Snapshots are created under the configured snapshot directory,
    /// falling back to the parent of the source subvolume.
    pub fn derive_snapshot_path(&mut self, session_id: &str) {
        let base = if !self.snapshot_directory.is_empty() {
            self.snapshot_directory.clone()
        } else {
            utils::dirname(&self.source_subvolume)
        };
        self.snapshot_path = format!("{}/{}", base, session_id);
    }

    pub fn setup_env(&self, env: &mut Environment) {
        env.add_pair("CHROOT_BTRFS_SOURCE_SUBVOLUME", &self.source_subvolume);
        env.add_pair("CHROOT_BTRFS_SNAPSHOT_PATH", &self.snapshot_path);
    }
}
