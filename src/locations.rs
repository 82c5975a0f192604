//! Well-known filesystem locations used by the chroot machinery.
//!
//! The defaults match a system installation; tests and the commandline
//! front end may rebase everything under an alternative root.

use std::path::{Path, PathBuf};

/// Filesystem layout for configuration, state and helper programs.
#[derive(Debug, Clone)]
pub struct Locations {
    /// System configuration directory, e.g. `/etc/schroot`.
    pub sysconf_dir: PathBuf,
    /// Main configuration keyfile.
    pub conf_file: PathBuf,
    /// Drop-in configuration directory.
    pub conf_dir: PathBuf,
    /// Setup script directory walked by the script runner.
    pub setup_dir: PathBuf,
    /// Exec script directory walked by the script runner.
    pub exec_dir: PathBuf,
    /// Directory holding active session records.
    pub session_dir: PathBuf,
    /// Root under which session mount points are created.
    pub mount_dir: PathBuf,
    /// Default union overlay base directory.
    pub overlay_dir: PathBuf,
    /// Default union underlay base directory.
    pub underlay_dir: PathBuf,
    /// Helper program directory, exported to scripts.
    pub libexec_dir: PathBuf,
    /// Directory holding device lock files.
    pub lock_dir: PathBuf,
    /// The run-parts(8) binary used to drive script directories.
    pub run_parts: PathBuf,
}

impl Default for Locations {
    fn default() -> Self {
        Self {
            sysconf_dir: PathBuf::from("/etc/schroot"),
            conf_file: PathBuf::from("/etc/schroot/schroot.conf"),
            conf_dir: PathBuf::from("/etc/schroot/chroot.d"),
            setup_dir: PathBuf::from("/etc/schroot/setup.d"),
            exec_dir: PathBuf::from("/etc/schroot/exec.d"),
            session_dir: PathBuf::from("/var/lib/schroot/session"),
            mount_dir: PathBuf::from("/var/lib/schroot/mount"),
            overlay_dir: PathBuf::from("/var/lib/schroot/union/overlay"),
            underlay_dir: PathBuf::from("/var/lib/schroot/union/underlay"),
            libexec_dir: PathBuf::from("/usr/lib/schroot"),
            lock_dir: PathBuf::from("/run/lock"),
            run_parts: PathBuf::from("/bin/run-parts"),
        }
    }
}

impl Locations {
    /// Rebase every location under `root`, preserving the standard layout.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            sysconf_dir: root.join("etc/schroot"),
            conf_file: root.join("etc/schroot/schroot.conf"),
            conf_dir: root.join("etc/schroot/chroot.d"),
            setup_dir: root.join("etc/schroot/setup.d"),
            exec_dir: root.join("etc/schroot/exec.d"),
            session_dir: root.join("var/lib/schroot/session"),
            mount_dir: root.join("var/lib/schroot/mount"),
            overlay_dir: root.join("var/lib/schroot/union/overlay"),
            underlay_dir: root.join("var/lib/schroot/union/underlay"),
            libexec_dir: root.join("usr/lib/schroot"),
            lock_dir: root.join("run/lock"),
            run_parts: PathBuf::from("/bin/run-parts"),
        }
    }

    /// Resolve a script-config or profile reference against the
    /// configuration directory.  Absolute references are used as-is.
    pub fn script_config_path(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.sysconf_dir.join(path)
        }
    }
}
