//! Chroot catalog: loads chroot definitions from configuration files
//! and directories, indexes them by name and alias, and generates the
//! source chroots advertised by clonable templates.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use thiserror::Error;

use crate::chroot::{Chroot, ChrootError};
use crate::keyfile::{Keyfile, KeyfileError};
use crate::lock::{FileLock, LockError, LockType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}: failed to open file: {1}")]
    FileOpen(String, #[source] nix::Error),
    #[error("{0}: failed to stat file: {1}")]
    FileStat(String, #[source] nix::Error),
    #[error("{0}: file is not owned by user root")]
    FileOwner(String),
    #[error("{0}: file has write permissions for others")]
    FilePerms(String),
    #[error("{0}: file is not a regular file")]
    FileNotReg(String),
    #[error("{0}: failed to acquire file lock: {1}")]
    FileLock(String, #[source] LockError),
    #[error("{0}: failed to read file: {1}")]
    FileRead(String, #[source] std::io::Error),
    #[error("alias '{alias}' already associated with '{chroot}' chroot")]
    AliasExist { alias: String, chroot: String },
    #[error("a chroot or alias '{0}' already exists with this name")]
    ChrootExist(String),
    #[error("{0}: no such chroot")]
    ChrootNotFound(String),
    #[error(transparent)]
    Chroot(#[from] ChrootError),
    #[error(transparent)]
    Keyfile(#[from] KeyfileError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Catalog of chroot definitions keyed by name, with an alias index.
/// Each chroot's own name is also registered as an alias to itself.
#[derive(Debug, Default)]
pub struct ChrootConfig {
    chroots: BTreeMap<String, Chroot>,
    aliases: BTreeMap<String, String>,
}

impl ChrootConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file, or every regular file in a
    /// configuration directory.  `active` marks the loaded definitions
    /// as session records rather than templates.
    pub fn add_location<P: AsRef<Path>>(&mut self, location: P, active: bool) -> Result<()> {
        let location = location.as_ref();
        if location.is_dir() {
            self.add_config_directory(location, active)
        } else {
            self.add_config_file(location, active)
        }
    }

    fn add_config_directory(&mut self, dir: &Path, active: bool) -> Result<()> {
        log::debug!("loading config directory: {}", dir.display());

        let entries = std::fs::read_dir(dir)
            .map_err(|e| ConfigError::FileRead(dir.to_string_lossy().into_owned(), e))?;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("{}: failed to read directory entry: {}", dir.display(), err);
                    continue;
                }
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }

            let path = entry.path();
            match entry.file_type() {
                Ok(file_type) if file_type.is_file() => (),
                _ => {
                    log::warn!("{}: not a regular file, skipped", path.display());
                    continue;
                }
            }

            self.add_config_file(&path, active)?;
        }

        Ok(())
    }

    fn add_config_file(&mut self, file: &Path, active: bool) -> Result<()> {
        log::debug!("loading config file: {}", file.display());

        let path_str = file.to_string_lossy().into_owned();

        // Use a raw fd so the security checks race-freely apply to the
        // file actually read.
        let fd = nix::fcntl::open(file, OFlag::O_RDONLY | OFlag::O_NOFOLLOW, Mode::empty())
            .map_err(|e| ConfigError::FileOpen(path_str.clone(), e))?;
        let file_handle = unsafe { File::from_raw_fd(fd) };

        let info = nix::sys::stat::fstat(file_handle.as_raw_fd())
            .map_err(|e| ConfigError::FileStat(path_str.clone(), e))?;
        if info.st_uid != 0 {
            return Err(ConfigError::FileOwner(path_str));
        }
        if info.st_mode & libc::S_IWOTH != 0 {
            return Err(ConfigError::FilePerms(path_str));
        }
        if info.st_mode & libc::S_IFMT != libc::S_IFREG {
            return Err(ConfigError::FileNotReg(path_str));
        }

        let lock = FileLock::new(file_handle.as_raw_fd());
        lock.set_lock(LockType::Shared, 2)
            .map_err(|e| ConfigError::FileLock(path_str.clone(), e))?;

        let mut contents = String::new();
        let result = BufReader::new(&file_handle)
            .read_to_string(&mut contents)
            .map_err(|e| ConfigError::FileRead(path_str.clone(), e));

        lock.unset_lock()
            .map_err(|e| ConfigError::FileLock(path_str.clone(), e))?;
        result?;

        let keyfile = Keyfile::parse_str(&contents)?;
        self.load_keyfile(keyfile, active)
    }

    /// Construct chroots from every group of a parsed keyfile.
    pub fn load_keyfile(&mut self, mut keyfile: Keyfile, active: bool) -> Result<()> {
        let groups: Vec<String> = keyfile.groups().into_iter().map(str::to_string).collect();

        for group in groups {
            // The active property is not settable from configuration;
            // it reflects which catalog the definition came from.
            keyfile.set_value(&group, "active", active);

            let chroot = Chroot::from_keyfile(&keyfile, &group)?;
            let is_template = !chroot.active();
            let source = if is_template {
                chroot.clone_source()?
            } else {
                None
            };

            self.add(chroot, &keyfile)?;

            if let Some(source) = source {
                self.add(source, &keyfile)?;
            }
        }

        Ok(())
    }

    /// Add a chroot to the catalog.  Duplicate primary names are
    /// fatal; duplicate aliases are skipped with a warning.
    pub fn add(&mut self, chroot: Chroot, keyfile: &Keyfile) -> Result<()> {
        let name = chroot.name().to_string();

        if self.chroots.contains_key(&name) || self.aliases.contains_key(&name) {
            return Err(ConfigError::ChrootExist(name));
        }

        self.aliases.insert(name.clone(), name.clone());
        for alias in chroot.aliases() {
            if let Some(existing) = self.aliases.get(alias) {
                // Do not warn when the alias is for a chroot of the
                // same name.
                if existing != alias {
                    let err = ConfigError::AliasExist {
                        alias: alias.clone(),
                        chroot: existing.clone(),
                    };
                    match keyfile.get_line(&name, "aliases") {
                        Some(line) => log::warn!("line {}: [{}]: {}", line, name, err),
                        None => log::warn!("[{}]: {}", name, err),
                    }
                }
                continue;
            }
            self.aliases.insert(alias.clone(), name.clone());
        }
        self.chroots.insert(name, chroot);

        Ok(())
    }

    pub fn find_chroot(&self, name: &str) -> Option<&Chroot> {
        self.chroots.get(name)
    }

    /// Resolve an alias (or primary name) to its chroot.
    pub fn find_alias(&self, name: &str) -> Option<&Chroot> {
        self.aliases.get(name).and_then(|n| self.find_chroot(n))
    }

    /// All chroots, sorted by name.
    pub fn get_chroots(&self) -> Vec<&Chroot> {
        self.chroots.values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.chroots.is_empty()
    }

    /// All selectable names, aliases included.
    pub fn get_chroot_list(&self) -> Vec<&str> {
        self.aliases.keys().map(String::as_str).collect()
    }

    /// The subset of `names` that does not resolve to any chroot.
    pub fn validate_chroots(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|name| self.find_alias(name).is_none())
            .cloned()
            .collect()
    }

    pub fn print_chroot_list(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        for name in self.get_chroot_list() {
            writeln!(out, "{}", name)?;
        }
        Ok(())
    }

    /// Print the resolved path of each named chroot.
    pub fn print_chroot_location(
        &self,
        names: &[String],
        out: &mut dyn std::io::Write,
    ) -> std::io::Result<()> {
        for name in names {
            match self.find_alias(name) {
                Some(chroot) => writeln!(out, "{}", chroot.get_path())?,
                None => log::error!("{}", ConfigError::ChrootNotFound(name.clone())),
            }
        }
        Ok(())
    }

    /// Dump the configuration of the named chroots as a keyfile.
    /// Generated chroots (source clones) are omitted.
    pub fn print_chroot_config(
        &self,
        names: &[String],
        out: &mut dyn std::io::Write,
    ) -> std::io::Result<()> {
        let mut keyfile = Keyfile::new();

        for name in names {
            match self.find_alias(name) {
                Some(chroot) if chroot.original() => chroot.get_keyfile(&mut keyfile),
                Some(_) => (),
                None => log::error!("{}", ConfigError::ChrootNotFound(name.clone())),
            }
        }

        write!(out, "{}", keyfile)
    }
}
