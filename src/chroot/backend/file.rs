//! File chroot: an archive unpacked into a session directory and
//! optionally repacked on session end.

use crate::chroot::{ChrootError, Result};
use crate::environment::Environment;
use crate::utils;

#[derive(Debug, Clone, Default)]
pub struct FileArchive {
    file: String,
    repack: bool,
}

impl FileArchive {
    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn set_file(&mut self, file: &str) -> Result<()> {
        if !file.is_empty() && !utils::is_absname(file) {
            return Err(ChrootError::FileAbs(file.to_string()));
        }
        self.file = file.to_string();
        Ok(())
    }

    pub fn repack(&self) -> bool {
        self.repack
    }

    pub fn set_repack(&mut self, repack: bool) {
        self.repack = repack;
    }

    pub fn setup_env(&self, env: &mut Environment) {
        env.add_pair("CHROOT_FILE", &self.file);
        env.add_pair("CHROOT_FILE_REPACK", if self.repack { "true" } else { "false" });
    }
}
