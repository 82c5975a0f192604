//! Block-device chroot: a filesystem on a block device, mounted for
//! the lifetime of the session under an exclusive device lock.

use crate::chroot::{ChrootError, Result};
use crate::environment::Environment;
use crate::utils;

#[derive(Debug, Clone, Default)]
pub struct BlockDevice {
    device: String,
}

impl BlockDevice {
    pub fn new(device: &str) -> Result<Self> {
        let mut backend = Self::default();
        backend.set_device(device)?;
        Ok(backend)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn set_device(&mut self, device: &str) -> Result<()> {
        if !device.is_empty() && !utils::is_absname(device) {
            return Err(ChrootError::DeviceAbs(device.to_string()));
        }
        self.device = device.to_string();
        Ok(())
    }

    pub fn setup_env(&self, env: &mut Environment) {
        env.add_pair("CHROOT_DEVICE", &self.device);
    }
}
