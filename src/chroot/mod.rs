//! Chroot definitions: a polymorphic entity composed of common
//! attributes, a storage backend variant and a set of capability
//! facets.

pub mod backend;
pub mod facet;

#[allow(clippy::module_inception)]
mod chroot;

pub use self::chroot::Chroot;
pub use backend::Backend;
pub use facet::{FacetError, FacetSet};

use thiserror::Error;

use crate::keyfile::KeyfileError;
use crate::lock::LockError;
use crate::personality::PersonalityError;

#[derive(Debug, Error)]
pub enum ChrootError {
    #[error("unknown chroot type '{0}'")]
    ChrootType(String),
    #[error("device must have an absolute path: '{0}'")]
    DeviceAbs(String),
    #[error("directory must have an absolute path: '{0}'")]
    DirectoryAbs(String),
    #[error("file must have an absolute path: '{0}'")]
    FileAbs(String),
    #[error("location must have an absolute path: '{0}'")]
    LocationAbs(String),
    #[error("device name not set")]
    Device,
    #[error("{0}: file is not a block device")]
    DeviceNotBlock(String),
    #[error("{0}: failed to stat file: {1}")]
    FileStat(String, #[source] nix::Error),
    #[error("{0}: file is not owned by user root")]
    FileOwner(String),
    #[error("{0}: file has write permissions for others")]
    FilePerms(String),
    #[error("{0}: file is not a regular file")]
    FileNotReg(String),
    #[error("{0}: failed to lock device: {1}")]
    DeviceLock(String, #[source] LockError),
    #[error("{0}: failed to unlock device: {1}")]
    DeviceUnlock(String, #[source] LockError),
    #[error("{0}: failed to acquire file lock: {1}")]
    FileLock(String, #[source] LockError),
    #[error("{0}: failed to discard file lock: {1}")]
    FileUnlock(String, #[source] LockError),
    #[error("{0}: failed to write session file: {1}")]
    SessionWrite(String, #[source] std::io::Error),
    #[error("{0}: failed to unlink session file: {1}")]
    SessionUnlink(String, #[source] std::io::Error),
    #[error("invalid message verbosity '{0}'")]
    Verbosity(String),
    #[error("invalid environment filter: {0}")]
    EnvironmentFilter(#[source] regex::Error),
    #[error(transparent)]
    Facet(#[from] FacetError),
    #[error(transparent)]
    Keyfile(#[from] KeyfileError),
    #[error(transparent)]
    Personality(#[from] PersonalityError),
}

pub type Result<T> = std::result::Result<T, ChrootError>;

/// Setup and exec phases driven around a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    SetupStart,
    SetupRecover,
    SetupStop,
    ExecStart,
    ExecStop,
}

impl SetupPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SetupPhase::SetupStart => "setup-start",
            SetupPhase::SetupRecover => "setup-recover",
            SetupPhase::SetupStop => "setup-stop",
            SetupPhase::ExecStart => "exec-start",
            SetupPhase::ExecStop => "exec-stop",
        }
    }

    /// Setup phases run scripts from setup.d; exec phases from exec.d.
    pub fn is_setup(self) -> bool {
        matches!(
            self,
            SetupPhase::SetupStart | SetupPhase::SetupRecover | SetupPhase::SetupStop
        )
    }

    /// Stop phases run their script directory in reverse order.
    pub fn is_stop(self) -> bool {
        matches!(self, SetupPhase::SetupStop | SetupPhase::ExecStop)
    }
}

impl std::fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session capabilities derived from the facet set and backend state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// A session chroot may be created from this chroot.
    pub create: bool,
    /// A source chroot may be cloned from this chroot.
    pub clone: bool,
    /// This session's data is purged when it ends.
    pub purge: bool,
}

impl SessionFlags {
    pub fn union(self, other: SessionFlags) -> SessionFlags {
        SessionFlags {
            create: self.create || other.create,
            clone: self.clone || other.clone,
            purge: self.purge || other.purge,
        }
    }
}

/// How chatty user-visible messages should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Normal
    }
}

impl Verbosity {
    pub fn as_str(self) -> &'static str {
        match self {
            Verbosity::Quiet => "quiet",
            Verbosity::Normal => "normal",
            Verbosity::Verbose => "verbose",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "quiet" => Ok(Verbosity::Quiet),
            "normal" => Ok(Verbosity::Normal),
            "verbose" => Ok(Verbosity::Verbose),
            other => Err(ChrootError::Verbosity(other.to_string())),
        }
    }
}

impl std::fmt::Display for Verbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
