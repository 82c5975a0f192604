//! Loopback chroot: a filesystem image file, loop-mounted by the
//! setup scripts.

use crate::chroot::{ChrootError, Result};
use crate::environment::Environment;
use crate::utils;

#[derive(Debug, Clone, Default)]
pub struct Loopback {
    file: String,
}

impl Loopback {
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

    pub fn setup_env(&self, env: &mut Environment) {
        env.add_pair("CHROOT_FILE", &self.file);
    }
}
