//! Plain chroot: an existing directory entered directly, with no
//! session state and no setup scripts.

use crate::chroot::{ChrootError, Result};
use crate::environment::Environment;
use crate::utils;

#[derive(Debug, Clone, Default)]
pub struct Plain {
    directory: String,
}

impl Plain {
    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn set_directory(&mut self, directory: &str) -> Result<()> {
        if !directory.is_empty() && !utils::is_absname(directory) {
            return Err(ChrootError::DirectoryAbs(directory.to_string()));
        }
        self.directory = directory.to_string();
        Ok(())
    }

    pub fn setup_env(&self, env: &mut Environment) {
        env.add_pair("CHROOT_DIRECTORY", &self.directory);
    }
}
