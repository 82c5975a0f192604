//! Custom chroot: materialisation is left entirely to site-provided
//! setup scripts.

use crate::environment::Environment;

#[derive(Debug, Clone)]
pub struct Custom {
    cloneable: bool,
    purgeable: bool,
}

impl Default for Custom {
    fn default() -> Self {
        Self {
            cloneable: true,
            purgeable: false,
        }
    }
}

impl Custom {
    pub fn cloneable(&self) -> bool {
        self.cloneable
    }

    pub fn set_cloneable(&mut self, cloneable: bool) {
        self.cloneable = cloneable;
    }

    pub fn purgeable(&self) -> bool {
        self.purgeable
    }

    pub fn set_purgeable(&mut self, purgeable: bool) {
        self.purgeable = purgeable;
    }

    pub fn setup_env(&self, _env: &mut Environment) {}
}
