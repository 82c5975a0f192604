//! LVM snapshot chroot: each session runs in a snapshot logical
//! volume created from the parent volume by the setup scripts.

use crate::chroot::{ChrootError, Result};
use crate::environment::Environment;
use crate::utils;

#[derive(Debug, Clone, Default)]
pub struct LvmSnapshot {
    device: String,
    snapshot_device: String,
    snapshot_options: String,
}

impl LvmSnapshot {
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

    pub fn snapshot_device(&self) -> &str {
        &self.snapshot_device
    }

    pub fn set_snapshot_device(&mut self, device: &str) -> Result<()> {
        if !device.is_empty() && !utils::is_absname(device) {
            return Err(ChrootError::DeviceAbs(device.to_string()));
        }
        self.snapshot_device = device.to_string();
        Ok(())
    }

    pub fn snapshot_options(&self) -> &str {
        &self.snapshot_options
    }

    pub fn set_snapshot_options(&mut self, options: &str) {
        self.snapshot_options = options.to_string();
    }

    /// The snapshot device lives beside the parent volume and is named
    /// after the session.
    pub fn derive_snapshot_device(&mut self, session_id: &str) {
        if !self.device.is_empty() {
            self.snapshot_device = format!("{}/{}", utils::dirname(&self.device), session_id);
        }
    }

    pub fn setup_env(&self, env: &mut Environment) {
        env.add_pair("CHROOT_DEVICE", &self.device);
        env.add_pair("CHROOT_LVM_SNAPSHOT_NAME", &utils::basename(&self.snapshot_device));
        env.add_pair("CHROOT_LVM_SNAPSHOT_DEVICE", &self.snapshot_device);
        env.add_pair("CHROOT_LVM_SNAPSHOT_OPTIONS", &self.snapshot_options);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_device_derivation() {
        let mut lvm = LvmSnapshot::default();
        lvm.set_device("/dev/vg0/sid").unwrap();
        lvm.derive_snapshot_device("sid-abcd1234");
        assert_eq!(lvm.snapshot_device(), "/dev/vg0/sid-abcd1234");
    }

    #[test]
    fn test_device_must_be_absolute() {
        let mut lvm = LvmSnapshot::default();
        assert!(matches!(
            lvm.set_device("vg0/sid"),
            Err(ChrootError::DeviceAbs(_))
        ));
        assert!(matches!(
            lvm.set_snapshot_device("vg0/sid-x"),
            Err(ChrootError::DeviceAbs(_))
        ));
    }
}
