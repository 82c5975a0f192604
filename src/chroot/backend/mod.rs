//! Storage backend variants.  The backend fixes how a chroot is
//! materialised on disk: the path a child enters, the locking
//! performed around each setup phase, and the backend-specific
//! configuration keys.

mod block_device;
mod btrfs_snapshot;
mod custom;
mod directory;
mod file;
mod loopback;
mod lvm_snapshot;
mod plain;

pub use block_device::BlockDevice;
pub use btrfs_snapshot::BtrfsSnapshot;
pub use custom::Custom;
pub use directory::Directory;
pub use file::FileArchive;
pub use loopback::Loopback;
pub use lvm_snapshot::LvmSnapshot;
pub use plain::Plain;

use std::collections::HashSet;

use super::chroot::Chroot;
use super::{ChrootError, Result, SessionFlags, SetupPhase};
use crate::environment::Environment;
use crate::keyfile::{Keyfile, Priority};
use crate::locations::Locations;
use crate::lock::{DeviceLock, LockType};

/// Exclusive device lock timeout for block-backed chroots, in seconds.
const DEVICE_LOCK_TIMEOUT: u32 = 15;

#[derive(Debug, Clone)]
pub enum Backend {
    Plain(Plain),
    Directory(Directory),
    File(FileArchive),
    BlockDevice(BlockDevice),
    Loopback(Loopback),
    LvmSnapshot(LvmSnapshot),
    BtrfsSnapshot(BtrfsSnapshot),
    Custom(Custom),
}

impl Backend {
    pub fn create(kind: &str) -> Result<Self> {
        match kind {
            "plain" => Ok(Backend::Plain(Plain::default())),
            "directory" => Ok(Backend::Directory(Directory::default())),
            "file" => Ok(Backend::File(FileArchive::default())),
            "block-device" => Ok(Backend::BlockDevice(BlockDevice::default())),
            "loopback" => Ok(Backend::Loopback(Loopback::default())),
            "lvm-snapshot" => Ok(Backend::LvmSnapshot(LvmSnapshot::default())),
            "btrfs-snapshot" => Ok(Backend::BtrfsSnapshot(BtrfsSnapshot::default())),
            "custom" => Ok(Backend::Custom(Custom::default())),
            other => Err(ChrootError::ChrootType(other.to_string())),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Backend::Plain(_) => "plain",
            Backend::Directory(_) => "directory",
            Backend::File(_) => "file",
            Backend::BlockDevice(_) => "block-device",
            Backend::Loopback(_) => "loopback",
            Backend::LvmSnapshot(_) => "lvm-snapshot",
            Backend::BtrfsSnapshot(_) => "btrfs-snapshot",
            Backend::Custom(_) => "custom",
        }
    }

    pub fn is_plain(&self) -> bool {
        matches!(self, Backend::Plain(_))
    }

    /// Backends whose mount may expose the chroot below a sub-location
    /// inside the mounted filesystem.
    pub fn has_sub_location(&self) -> bool {
        matches!(
            self,
            Backend::BlockDevice(_) | Backend::Loopback(_) | Backend::LvmSnapshot(_)
        )
    }

    /// The path a child process should chroot into.
    pub fn get_path(&self, chroot: &Chroot) -> String {
        match self {
            Backend::Plain(plain) => plain.directory().to_string(),
            Backend::Directory(dir) => {
                let union_configured = chroot
                    .facets()
                    .union()
                    .map(|u| u.configured())
                    .unwrap_or(false);
                if (union_configured || chroot.run_setup_scripts())
                    && !chroot.mount_location().is_empty()
                {
                    format!("{}{}", chroot.mount_location(), chroot.location())
                } else {
                    dir.directory().to_string()
                }
            }
            Backend::File(_) | Backend::BtrfsSnapshot(_) | Backend::Custom(_) => {
                chroot.mount_location().to_string()
            }
            Backend::BlockDevice(_) | Backend::Loopback(_) | Backend::LvmSnapshot(_) => {
                format!("{}{}", chroot.mount_location(), chroot.location())
            }
        }
    }

    /// The device that will be mounted for this chroot, if any.
    pub fn mount_device(&self, chroot: &Chroot) -> String {
        match self {
            Backend::BlockDevice(block) => block.device().to_string(),
            Backend::Loopback(loop_) => loop_.file().to_string(),
            Backend::LvmSnapshot(lvm) => lvm.snapshot_device().to_string(),
            _ => chroot.stored_mount_device().to_string(),
        }
    }

    pub fn setup_env(&self, env: &mut Environment) {
        match self {
            Backend::Plain(plain) => plain.setup_env(env),
            Backend::Directory(dir) => dir.setup_env(env),
            Backend::File(file) => file.setup_env(env),
            Backend::BlockDevice(block) => block.setup_env(env),
            Backend::Loopback(loop_) => loop_.setup_env(env),
            Backend::LvmSnapshot(lvm) => lvm.setup_env(env),
            Backend::BtrfsSnapshot(btrfs) => btrfs.setup_env(env),
            Backend::Custom(custom) => custom.setup_env(env),
        }
    }

    /// Backend contribution to the session flags, combined with the
    /// facet contributions by the owning chroot.
    pub fn session_flags(&self, chroot: &Chroot) -> SessionFlags {
        let mut flags = SessionFlags::default();
        match self {
            Backend::File(_) | Backend::LvmSnapshot(_) | Backend::BtrfsSnapshot(_) => {
                flags.purge = chroot.active();
            }
            Backend::Custom(custom) => {
                flags.purge = chroot.active() && custom.purgeable();
            }
            _ => (),
        }
        flags
    }

    /// Session fixups applied after cloning a template into a session.
    pub fn clone_session_setup(&mut self, session_id: &str) {
        match self {
            Backend::LvmSnapshot(lvm) => lvm.derive_snapshot_device(session_id),
            Backend::BtrfsSnapshot(btrfs) => btrfs.derive_snapshot_path(session_id),
            _ => (),
        }
    }

    /// The backend of a source clone.  Snapshot backends demote to the
    /// backend of their underlying storage.
    pub fn clone_source_backend(&self) -> Result<Backend> {
        match self {
            Backend::LvmSnapshot(lvm) => {
                let mut block = BlockDevice::default();
                block.set_device(lvm.device())?;
                Ok(Backend::BlockDevice(block))
            }
            Backend::BtrfsSnapshot(btrfs) => {
                let mut dir = Directory::default();
                dir.set_directory(btrfs.source_subvolume())?;
                Ok(Backend::Directory(dir))
            }
            other => Ok(other.clone()),
        }
    }

    /// Per-phase locking contract.  `lock` distinguishes the acquire
    /// call before the scripts from the release call after them;
    /// `status` is the script exit status on release.
    pub fn setup_lock(
        &self,
        chroot: &Chroot,
        phase: SetupPhase,
        lock: bool,
        status: i32,
        locations: &Locations,
    ) -> Result<()> {
        match self {
            Backend::Plain(_) => Ok(()),

            Backend::Directory(_) => session_record(chroot, phase, lock, status, locations),

            Backend::File(file) => {
                if phase == SetupPhase::SetupStart && lock {
                    check_image_file(file.file())?;
                }
                session_record(chroot, phase, lock, status, locations)
            }

            Backend::BlockDevice(block) => {
                // Only lock during setup, not exec; the lock is
                // preserved through the entire session.
                if matches!(phase, SetupPhase::ExecStart | SetupPhase::ExecStop) {
                    return Ok(());
                }
                if (phase == SetupPhase::SetupStart && !lock)
                    || (phase == SetupPhase::SetupStop && lock)
                {
                    return Ok(());
                }

                match check_block_device(block.device()) {
                    Err(ChrootError::FileStat(..)) if phase == SetupPhase::SetupStop => {
                        // The device may already be gone when ending a
                        // session; the scripts must still run.
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                    Ok(()) => (),
                }

                let dlock = DeviceLock::new(block.device(), &locations.lock_dir);
                if lock {
                    dlock
                        .set_lock(LockType::Exclusive, DEVICE_LOCK_TIMEOUT)
                        .map_err(|e| ChrootError::DeviceLock(block.device().to_string(), e))?;
                } else {
                    dlock
                        .unset_lock()
                        .map_err(|e| ChrootError::DeviceUnlock(block.device().to_string(), e))?;
                }
                Ok(())
            }

            Backend::Loopback(loop_) => {
                if phase == SetupPhase::SetupStart && lock {
                    check_image_file(loop_.file())?;
                }
                // Loopback chroots do no locking, but can create
                // sessions when a filesystem union is configured.
                let union_configured = chroot
                    .facets()
                    .union()
                    .map(|u| u.configured())
                    .unwrap_or(false);
                if union_configured {
                    session_record(chroot, phase, lock, status, locations)?;
                }
                Ok(())
            }

            Backend::LvmSnapshot(lvm) => {
                // The teardown script removes the snapshot device; an
                // unlock on setup-stop would fail against a device
                // that no longer exists.
                if !(phase == SetupPhase::SetupStop && !lock) {
                    let device = if phase == SetupPhase::SetupStart {
                        lvm.device()
                    } else {
                        lvm.snapshot_device()
                    };
                    if device.is_empty() {
                        return Err(ChrootError::Device);
                    }

                    match check_block_device(device) {
                        Err(ChrootError::FileStat(..)) if phase == SetupPhase::SetupStop => (),
                        Err(err) => return Err(err),
                        Ok(()) => {
                            // Lock is preserved while running a command.
                            let skip = (phase == SetupPhase::ExecStart && !lock)
                                || (phase == SetupPhase::ExecStop && lock);
                            if !skip {
                                let dlock = DeviceLock::new(device, &locations.lock_dir);
                                if lock {
                                    dlock
                                        .set_lock(LockType::Exclusive, DEVICE_LOCK_TIMEOUT)
                                        .map_err(|e| {
                                            ChrootError::DeviceLock(device.to_string(), e)
                                        })?;
                                } else {
                                    dlock.unset_lock().map_err(|e| {
                                        ChrootError::DeviceUnlock(device.to_string(), e)
                                    })?;
                                }
                            }
                        }
                    }
                }

                session_record(chroot, phase, lock, status, locations)
            }

            Backend::BtrfsSnapshot(_) => session_record(chroot, phase, lock, status, locations),

            Backend::Custom(custom) => {
                if custom.purgeable() {
                    session_record(chroot, phase, lock, status, locations)
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn get_keyfile(&self, chroot: &Chroot, keyfile: &mut Keyfile) {
        let group = chroot.keyfile_name();
        match self {
            Backend::Plain(plain) => {
                keyfile.set_value(group, "directory", plain.directory());
            }
            Backend::Directory(dir) => {
                keyfile.set_value(group, "directory", dir.directory());
            }
            Backend::File(file) => {
                keyfile.set_value(group, "file", file.file());
                if chroot.active() {
                    keyfile.set_value(group, "file-repack", file.repack());
                }
            }
            Backend::BlockDevice(block) => {
                keyfile.set_value(group, "device", block.device());
            }
            Backend::Loopback(loop_) => {
                keyfile.set_value(group, "file", loop_.file());
            }
            Backend::LvmSnapshot(lvm) => {
                keyfile.set_value(group, "device", lvm.device());
                if chroot.active() {
                    keyfile.set_value(group, "lvm-snapshot-device", lvm.snapshot_device());
                } else {
                    keyfile.set_value(group, "lvm-snapshot-options", lvm.snapshot_options());
                }
            }
            Backend::BtrfsSnapshot(btrfs) => {
                if chroot.active() {
                    keyfile.set_value(group, "btrfs-snapshot-path", btrfs.snapshot_path());
                } else {
                    keyfile.set_value(group, "btrfs-source-subvolume", btrfs.source_subvolume());
                    if !btrfs.snapshot_directory().is_empty() {
                        keyfile.set_value(group, "btrfs-snapshot-directory", btrfs.snapshot_directory());
                    }
                }
            }
            Backend::Custom(custom) => {
                // Purgeability must survive into session records, or
                // ending a recovered session would leak its record.
                keyfile.set_value(group, "custom-session-cloneable", custom.cloneable());
                keyfile.set_value(group, "custom-session-purgeable", custom.purgeable());
            }
        }
    }

    pub fn set_keyfile(
        &mut self,
        group: &str,
        keyfile: &Keyfile,
        active: bool,
        used: &mut HashSet<String>,
    ) -> Result<()> {
        match self {
            Backend::Plain(plain) => {
                let directory = read_directory_key(group, keyfile, used)?;
                plain.set_directory(&directory)?;
            }
            Backend::Directory(dir) => {
                let directory = read_directory_key(group, keyfile, used)?;
                dir.set_directory(&directory)?;
            }
            Backend::File(file) => {
                used.insert("file".to_string());
                if let Some(value) = keyfile.get_string(group, "file", Priority::Required)? {
                    file.set_file(&value)?;
                }
                used.insert("file-repack".to_string());
                let priority = if active {
                    Priority::Required
                } else {
                    Priority::Disallowed
                };
                if let Some(value) = keyfile.get_bool(group, "file-repack", priority)? {
                    file.set_repack(value);
                }
            }
            Backend::BlockDevice(block) => {
                used.insert("device".to_string());
                if let Some(value) = keyfile.get_string(group, "device", Priority::Required)? {
                    block.set_device(&value)?;
                }
            }
            Backend::Loopback(loop_) => {
                used.insert("file".to_string());
                if let Some(value) = keyfile.get_string(group, "file", Priority::Required)? {
                    loop_.set_file(&value)?;
                }
            }
            Backend::LvmSnapshot(lvm) => {
                used.insert("device".to_string());
                if let Some(value) = keyfile.get_string(group, "device", Priority::Required)? {
                    lvm.set_device(&value)?;
                }

                used.insert("lvm-snapshot-device".to_string());
                let priority = if active {
                    Priority::Required
                } else {
                    Priority::Disallowed
                };
                if let Some(value) = keyfile.get_string(group, "lvm-snapshot-device", priority)? {
                    lvm.set_snapshot_device(&value)?;
                }

                // Only needed for creating the snapshot, not using it.
                used.insert("lvm-snapshot-options".to_string());
                let priority = if active {
                    Priority::Deprecated
                } else {
                    Priority::Required
                };
                if let Some(value) = keyfile.get_string(group, "lvm-snapshot-options", priority)? {
                    lvm.set_snapshot_options(&value);
                }
            }
            Backend::BtrfsSnapshot(btrfs) => {
                used.insert("btrfs-source-subvolume".to_string());
                let priority = if active {
                    Priority::Disallowed
                } else {
                    Priority::Required
                };
                if let Some(value) = keyfile.get_string(group, "btrfs-source-subvolume", priority)? {
                    btrfs.set_source_subvolume(&value)?;
                }

                used.insert("btrfs-snapshot-directory".to_string());
                let priority = if active {
                    Priority::Disallowed
                } else {
                    Priority::Optional
                };
                if let Some(value) = keyfile.get_string(group, "btrfs-snapshot-directory", priority)? {
                    btrfs.set_snapshot_directory(&value)?;
                }

                used.insert("btrfs-snapshot-path".to_string());
                let priority = if active {
                    Priority::Required
                } else {
                    Priority::Disallowed
                };
                if let Some(value) = keyfile.get_string(group, "btrfs-snapshot-path", priority)? {
                    btrfs.set_snapshot_path(&value)?;
                }
            }
            Backend::Custom(custom) => {
                used.insert("custom-session-cloneable".to_string());
                if let Some(value) =
                    keyfile.get_bool(group, "custom-session-cloneable", Priority::Optional)?
                {
                    custom.set_cloneable(value);
                }
                used.insert("custom-session-purgeable".to_string());
                if let Some(value) =
                    keyfile.get_bool(group, "custom-session-purgeable", Priority::Optional)?
                {
                    custom.set_purgeable(value);
                }
            }
        }

        Ok(())
    }
}

/// Create or remove the session record around the setup phases.
fn session_record(
    chroot: &Chroot,
    phase: SetupPhase,
    lock: bool,
    status: i32,
    locations: &Locations,
) -> Result<()> {
    if (phase == SetupPhase::SetupStart && lock)
        || (phase == SetupPhase::SetupStop && !lock && status == 0)
    {
        chroot.setup_session_info(phase == SetupPhase::SetupStart, locations)?;
    }
    Ok(())
}

/// `directory` is preferred; the deprecated alias `location` is
/// accepted only when `directory` is absent.  Using both at once is an
/// error.
fn read_directory_key(
    group: &str,
    keyfile: &Keyfile,
    used: &mut HashSet<String>,
) -> Result<String> {
    use crate::keyfile::KeyfileError;

    used.insert("directory".to_string());
    used.insert("location".to_string());

    if keyfile.has_key(group, "directory") && keyfile.has_key(group, "location") {
        return Err(ChrootError::Keyfile(KeyfileError::DisallowedKey {
            group: group.to_string(),
            key: "location".to_string(),
        }));
    }

    if keyfile.has_key(group, "location") {
        return Ok(keyfile
            .get_string(group, "location", Priority::Deprecated)?
            .unwrap_or_default());
    }

    Ok(keyfile
        .get_string(group, "directory", Priority::Required)?
        .unwrap_or_default())
}

/// Security checks applied to image files before they are trusted.
fn check_image_file(path: &str) -> Result<()> {
    let info = nix::sys::stat::stat(path)
        .map_err(|e| ChrootError::FileStat(path.to_string(), e))?;

    if info.st_uid != 0 {
        return Err(ChrootError::FileOwner(path.to_string()));
    }
    if info.st_mode & libc::S_IWOTH != 0 {
        return Err(ChrootError::FilePerms(path.to_string()));
    }
    if info.st_mode & libc::S_IFMT != libc::S_IFREG {
        return Err(ChrootError::FileNotReg(path.to_string()));
    }

    Ok(())
}

fn check_block_device(path: &str) -> Result<()> {
    let info = nix::sys::stat::stat(path)
        .map_err(|e| ChrootError::FileStat(path.to_string(), e))?;

    if info.st_mode & libc::S_IFMT != libc::S_IFBLK {
        return Err(ChrootError::DeviceNotBlock(path.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_by_type() {
        for kind in &[
            "plain",
            "directory",
            "file",
            "block-device",
            "loopback",
            "lvm-snapshot",
            "btrfs-snapshot",
            "custom",
        ] {
            let backend = Backend::create(kind).unwrap();
            assert_eq!(backend.tag(), *kind);
        }
        assert!(matches!(
            Backend::create("tarball"),
            Err(ChrootError::ChrootType(_))
        ));
    }

    #[test]
    fn test_source_backend_demotion() {
        let mut lvm = LvmSnapshot::default();
        lvm.set_device("/dev/vg0/sid").unwrap();
        let source = Backend::LvmSnapshot(lvm).clone_source_backend().unwrap();
        match source {
            Backend::BlockDevice(block) => assert_eq!(block.device(), "/dev/vg0/sid"),
            other => panic!("unexpected backend {:?}", other.tag()),
        }

        let mut btrfs = BtrfsSnapshot::default();
        btrfs.set_source_subvolume("/srv/chroot/sid").unwrap();
        let source = Backend::BtrfsSnapshot(btrfs).clone_source_backend().unwrap();
        match source {
            Backend::Directory(dir) => assert_eq!(dir.directory(), "/srv/chroot/sid"),
            other => panic!("unexpected backend {:?}", other.tag()),
        }
    }

    #[test]
    fn test_image_file_checks() {
        // /dev/null is not a regular file.
        assert!(matches!(
            check_image_file("/dev/null"),
            Err(ChrootError::FileNotReg(_))
        ));
        assert!(matches!(
            check_image_file("/no/such/file"),
            Err(ChrootError::FileStat(..))
        ));
    }

    #[test]
    fn test_block_device_check() {
        assert!(matches!(
            check_block_device("/etc/hostname"),
            Err(ChrootError::DeviceNotBlock(_))
        ));
    }
}
