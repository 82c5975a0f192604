//! Facet for chroots that mount a filesystem to materialise.

use crate::environment::Environment;

/// Mount behaviour for block-backed chroots.  The device to mount is
/// derived by the owning backend; this facet carries the mount options
/// passed to mount(8).
#[derive(Debug, Clone, Default)]
pub struct Mountable {
    mount_options: String,
}

impl Mountable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount_options(&self) -> &str {
        &self.mount_options
    }

    pub fn set_mount_options(&mut self, options: &str) {
        self.mount_options = options.to_string();
    }

    pub fn setup_env(&self, env: &mut Environment) {
        env.add_pair("CHROOT_MOUNT_OPTIONS", &self.mount_options);
    }
}
