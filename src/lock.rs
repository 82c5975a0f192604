//! Advisory locking with alarm-driven timeouts.
//!
//! Two flavours are provided: whole-file byte-range locks via fcntl,
//! and whole-device mutexes implemented with pid lock files keyed on
//! the device basename.  Both share a scoped SIGALRM guard whose
//! handler only sets a flag; any blocking call interrupted by the
//! alarm reports EINTR, which is mapped to a timeout error.  The guard
//! restores the previous signal disposition and interval timer on
//! every exit path.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::getpid;
use thiserror::Error;

use crate::utils;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to set timeout handler: {0}")]
    Setup(nix::Error),
    #[error("failed to set timeout: {0}")]
    Timer(nix::Error),
    #[error("failed to acquire lock (timeout after {timeout} seconds)")]
    Timeout { timeout: u32 },
    #[error("failed to acquire lock: {0}")]
    Acquire(nix::Error),
    #[error("failed to discard lock: {0}")]
    Release(nix::Error),
    #[error("failed to acquire device lock: {0}")]
    Device(std::io::Error),
    #[error("failed to release device lock held by pid {0}")]
    DeviceHeld(i32),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Lock mode.  `Unlock` releases a previously acquired lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
    Unlock,
}

static ALARM_FIRED: AtomicBool = AtomicBool::new(false);

extern "C" fn alarm_handler(_: libc::c_int) {
    // Exists so that blocking system calls get interrupted; the flag is
    // only consulted by polling loops.
    ALARM_FIRED.store(true, Ordering::SeqCst);
}

/// Scoped SIGALRM timeout.  Arms a one-shot interval timer on
/// construction; restores the previous timer and signal disposition
/// when dropped.
struct AlarmTimeout {
    saved: SigAction,
}

impl AlarmTimeout {
    fn new(timeout: u32) -> Result<Self> {
        ALARM_FIRED.store(false, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(alarm_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let saved = unsafe { sigaction(Signal::SIGALRM, &action) }.map_err(LockError::Setup)?;

        let timer = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            it_value: libc::timeval {
                tv_sec: timeout as libc::time_t,
                tv_usec: 0,
            },
        };
        let ret = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) };
        if ret != 0 {
            let err = nix::Error::last();
            let _ = unsafe { sigaction(Signal::SIGALRM, &saved) };
            return Err(LockError::Timer(err));
        }

        Ok(Self { saved })
    }

    fn expired(&self) -> bool {
        ALARM_FIRED.load(Ordering::SeqCst)
    }
}

impl Drop for AlarmTimeout {
    fn drop(&mut self) {
        let disable = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            it_value: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        unsafe {
            libc::setitimer(libc::ITIMER_REAL, &disable, ptr::null_mut());
            let _ = sigaction(Signal::SIGALRM, &self.saved);
        }
    }
}

/// Advisory lock over an open file descriptor.  A byte-range lock is
/// placed over the entire file regardless of size.
pub struct FileLock {
    fd: RawFd,
}

impl FileLock {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn set_lock(&self, lock_type: LockType, timeout: u32) -> Result<()> {
        let _alarm = AlarmTimeout::new(timeout)?;

        let l_type = match lock_type {
            LockType::Shared => libc::F_RDLCK,
            LockType::Exclusive => libc::F_WRLCK,
            LockType::Unlock => libc::F_UNLCK,
        };
        let mut flock: libc::flock = unsafe { std::mem::zeroed() };
        flock.l_type = l_type as libc::c_short;
        flock.l_whence = libc::SEEK_SET as libc::c_short;
        flock.l_start = 0;
        flock.l_len = 0; // Lock entire file.

        let arg = if timeout != 0 {
            FcntlArg::F_SETLKW(&flock)
        } else {
            FcntlArg::F_SETLK(&flock)
        };

        match fcntl(self.fd, arg) {
            Ok(_) => Ok(()),
            Err(err) => match err.as_errno() {
                Some(Errno::EINTR) => Err(LockError::Timeout { timeout }),
                // Non-blocking contention reports immediately.
                Some(Errno::EAGAIN) | Some(Errno::EACCES) if timeout == 0 => {
                    Err(LockError::Timeout { timeout })
                }
                _ => match lock_type {
                    LockType::Unlock => Err(LockError::Release(err)),
                    _ => Err(LockError::Acquire(err)),
                },
            },
        }
    }

    pub fn unset_lock(&self) -> Result<()> {
        self.set_lock(LockType::Unlock, 0)
    }
}

/// Whole-device mutex using a pid lock file under the system lock
/// directory, keyed by the device basename.  Shared locks are treated
/// as exclusive.
pub struct DeviceLock {
    device: PathBuf,
    lock_dir: PathBuf,
}

impl DeviceLock {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(device: P, lock_dir: Q) -> Self {
        Self {
            device: device.as_ref().to_path_buf(),
            lock_dir: lock_dir.as_ref().to_path_buf(),
        }
    }

    fn lock_file(&self) -> PathBuf {
        let name = utils::basename(&self.device.to_string_lossy());
        self.lock_dir.join(format!("LCK..{}", name))
    }

    fn holder(&self) -> Option<i32> {
        let mut contents = String::new();
        fs::File::open(self.lock_file())
            .and_then(|mut f| f.read_to_string(&mut contents))
            .ok()?;
        contents.trim().parse::<i32>().ok()
    }

    fn try_acquire(&self) -> std::result::Result<bool, std::io::Error> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_file())
        {
            Ok(mut file) => {
                writeln!(file, "{:>10}", getpid().as_raw())?;
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn set_lock(&self, lock_type: LockType, timeout: u32) -> Result<()> {
        let alarm = AlarmTimeout::new(timeout)?;
        let mut last_holder = 0;

        while !alarm.expired() {
            match lock_type {
                LockType::Shared | LockType::Exclusive => {
                    if self.try_acquire().map_err(LockError::Device)? {
                        return Ok(());
                    }
                    match self.holder() {
                        Some(pid) if pid == getpid().as_raw() => return Ok(()),
                        Some(pid) => {
                            // Break stale locks left by dead processes.
                            if unsafe { libc::kill(pid, 0) } != 0
                                && nix::Error::last().as_errno() == Some(Errno::ESRCH)
                            {
                                log::debug!(
                                    "breaking stale lock on {} held by dead pid {}",
                                    self.device.display(),
                                    pid
                                );
                                let _ = fs::remove_file(self.lock_file());
                                continue;
                            }
                            last_holder = pid;
                        }
                        None => continue,
                    }
                }
                LockType::Unlock => {
                    match self.holder() {
                        Some(pid) if pid != getpid().as_raw() => {
                            return Err(LockError::DeviceHeld(pid));
                        }
                        Some(_) => {
                            fs::remove_file(self.lock_file()).map_err(LockError::Device)?;
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
            }

            if timeout == 0 {
                return Err(LockError::Timeout { timeout });
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        log::debug!(
            "device lock on {} timed out; held by pid {}",
            self.device.display(),
            last_holder
        );
        Err(LockError::Timeout { timeout })
    }

    pub fn unset_lock(&self) -> Result<()> {
        self.set_lock(LockType::Unlock, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::io::AsRawFd;

    #[test]
    #[serial]
    fn test_file_lock_exclusive_then_unlock() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let lock = FileLock::new(file.as_file().as_raw_fd());
        lock.set_lock(LockType::Exclusive, 2).unwrap();
        lock.unset_lock().unwrap();
    }

    #[test]
    #[serial]
    fn test_file_lock_shared() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let lock = FileLock::new(file.as_file().as_raw_fd());
        lock.set_lock(LockType::Shared, 0).unwrap();
        lock.unset_lock().unwrap();
    }

    #[test]
    #[serial]
    fn test_signal_disposition_restored() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let lock = FileLock::new(file.as_file().as_raw_fd());

        let before = unsafe {
            sigaction(
                Signal::SIGALRM,
                &SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()),
            )
        }
        .unwrap();

        lock.set_lock(LockType::Exclusive, 2).unwrap();
        lock.unset_lock().unwrap();

        // The lock path must leave SIGALRM as it found it (default).
        let after = unsafe {
            sigaction(
                Signal::SIGALRM,
                &SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()),
            )
        }
        .unwrap();
        assert_eq!(after.handler(), SigHandler::SigDfl);

        let _ = before;
    }

    #[test]
    #[serial]
    fn test_device_lock_acquire_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DeviceLock::new("/dev/null", dir.path());
        lock.set_lock(LockType::Exclusive, 1).unwrap();
        assert!(dir.path().join("LCK..null").exists());
        // Re-acquiring our own lock succeeds.
        lock.set_lock(LockType::Exclusive, 1).unwrap();
        lock.unset_lock().unwrap();
        assert!(!dir.path().join("LCK..null").exists());
    }

    #[test]
    #[serial]
    fn test_device_lock_stale_holder_broken() {
        let dir = tempfile::tempdir().unwrap();
        // Pid 0 never matches a live process we can signal as ESRCH;
        // use an implausibly large pid instead.
        std::fs::write(dir.path().join("LCK..null"), "  99999999\n").unwrap();
        let lock = DeviceLock::new("/dev/null", dir.path());
        lock.set_lock(LockType::Exclusive, 2).unwrap();
        lock.unset_lock().unwrap();
    }

    #[test]
    #[serial]
    fn test_device_unlock_not_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DeviceLock::new("/dev/loop7", dir.path());
        lock.unset_lock().unwrap();
    }
}
