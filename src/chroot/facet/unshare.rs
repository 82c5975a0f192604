//! Linux namespace unsharing facet.

use nix::sched::CloneFlags;

use crate::environment::Environment;

/// Which execution contexts to disassociate before running the user
/// command inside the chroot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unshare {
    net: bool,
    sysvipc: bool,
    sysvsem: bool,
    uts: bool,
}

impl Unshare {
    pub fn net(&self) -> bool {
        self.net
    }

    pub fn set_net(&mut self, net: bool) {
        self.net = net;
    }

    pub fn sysvipc(&self) -> bool {
        self.sysvipc
    }

    pub fn set_sysvipc(&mut self, sysvipc: bool) {
        self.sysvipc = sysvipc;
    }

    pub fn sysvsem(&self) -> bool {
        self.sysvsem
    }

    pub fn set_sysvsem(&mut self, sysvsem: bool) {
        self.sysvsem = sysvsem;
    }

    pub fn uts(&self) -> bool {
        self.uts
    }

    pub fn set_uts(&mut self, uts: bool) {
        self.uts = uts;
    }

    pub fn any(&self) -> bool {
        self.net || self.sysvipc || self.sysvsem || self.uts
    }

    /// The clone flags equivalent to the configured unshare set.  SysV
    /// IPC and SysV semaphores both live in the IPC namespace.
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.sysvipc || self.sysvsem {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    pub fn setup_env(&self, env: &mut Environment) {
        env.add_pair("UNSHARE_NET", if self.net { "true" } else { "false" });
        env.add_pair("UNSHARE_SYSVIPC", if self.sysvipc { "true" } else { "false" });
        env.add_pair("UNSHARE_SYSVSEM", if self.sysvsem { "true" } else { "false" });
        env.add_pair("UNSHARE_UTS", if self.uts { "true" } else { "false" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_flags() {
        let mut unshare = Unshare::default();
        assert!(unshare.clone_flags().is_empty());
        assert!(!unshare.any());

        unshare.set_net(true);
        unshare.set_uts(true);
        assert_eq!(
            unshare.clone_flags(),
            CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWUTS
        );

        let mut ipc = Unshare::default();
        ipc.set_sysvsem(true);
        assert_eq!(ipc.clone_flags(), CloneFlags::CLONE_NEWIPC);
    }

    #[test]
    fn test_env_export() {
        let mut unshare = Unshare::default();
        unshare.set_net(true);
        let mut env = Environment::new();
        unshare.setup_env(&mut env);
        assert_eq!(env.get("UNSHARE_NET"), Some("true"));
        assert_eq!(env.get("UNSHARE_UTS"), Some("false"));
    }
}
