//! The chroot entity: common attributes plus a storage backend and a
//! facet set.  Templates are loaded from configuration and cloned into
//! session instances; sessions serialise themselves into session
//! records using the same keyfile representation.

use std::collections::HashSet;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use once_cell::sync::Lazy;
use regex::Regex;

use super::backend::Backend;
use super::facet::{
    FacetError, FacetSet, Mountable, SessionClonable, SessionFacet, SourceClonable, SourceFacet,
    UnionFacet, Unshare, Userdata,
};
use super::{ChrootError, Result, SessionFlags, SetupPhase, Verbosity};
use crate::environment::Environment;
use crate::keyfile::{Keyfile, Priority};
use crate::locations::Locations;
use crate::lock::{FileLock, LockType};
use crate::personality::Personality;

/// Variables historically considered dangerous to carry into a chroot.
pub const DEFAULT_ENVIRONMENT_FILTER: &str = "^(BASH_ENV|CDPATH|ENV|HOSTALIASES|IFS|KRB5_CONFIG|KRBCONFDIR|KRBTKFILE|KRB_CONF|LD_.*|LOCALDOMAIN|NLSPATH|PATH_LOCALE|RES_OPTIONS|TERMINFO|TERMINFO_DIRS|TERMPATH)$";

static LOCALISED_DESCRIPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^description\[.*\]$").unwrap());

#[derive(Debug, Clone)]
pub struct Chroot {
    name: String,
    description: String,
    priority: u32,
    aliases: Vec<String>,
    users: Vec<String>,
    groups: Vec<String>,
    root_users: Vec<String>,
    root_groups: Vec<String>,
    environment_filter: Regex,
    preserve_environment: bool,
    default_shell: String,
    command_prefix: Vec<String>,
    message_verbosity: Verbosity,
    script_config: String,
    run_setup_scripts: bool,
    run_exec_scripts: bool,
    persona: Personality,
    active: bool,
    original: bool,
    mount_location: String,
    location: String,
    mount_device: String,
    backend: Backend,
    facets: FacetSet,
}

impl Chroot {
    /// Create a chroot of the given backend type with the default
    /// facet set for that type.
    pub fn new(name: &str, kind: &str) -> Result<Self> {
        let backend = Backend::create(kind)?;
        let locations = Locations::default();

        let mut facets = FacetSet::default();
        facets.add_unshare(Unshare::default())?;
        facets.add_userdata(Userdata::default())?;

        if !backend.is_plain() {
            facets.add_session_clonable(SessionClonable)?;
        }

        match &backend {
            Backend::File(_) | Backend::BlockDevice(_) | Backend::Loopback(_)
            | Backend::LvmSnapshot(_) => {
                facets.add_mountable(Mountable::new())?;
            }
            _ => (),
        }

        match &backend {
            Backend::Directory(_) | Backend::BlockDevice(_) | Backend::Loopback(_) => {
                facets.add_union(UnionFacet::new(
                    &locations.overlay_dir.to_string_lossy(),
                    &locations.underlay_dir.to_string_lossy(),
                ))?;
            }
            Backend::LvmSnapshot(_) | Backend::BtrfsSnapshot(_) => {
                facets.add_source_clonable(SourceClonable::default())?;
            }
            _ => (),
        }

        Ok(Self {
            name: name.to_string(),
            description: String::new(),
            priority: 0,
            aliases: Vec::new(),
            users: Vec::new(),
            groups: Vec::new(),
            root_users: Vec::new(),
            root_groups: Vec::new(),
            environment_filter: Regex::new(DEFAULT_ENVIRONMENT_FILTER)
                .map_err(ChrootError::EnvironmentFilter)?,
            preserve_environment: false,
            default_shell: String::new(),
            command_prefix: Vec::new(),
            message_verbosity: Verbosity::default(),
            script_config: "script-defaults".to_string(),
            run_setup_scripts: false,
            run_exec_scripts: false,
            persona: Personality::undefined(),
            active: false,
            original: true,
            mount_location: String::new(),
            location: String::new(),
            mount_device: String::new(),
            backend,
            facets,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// The group name used when serialising this chroot.
    pub fn keyfile_name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: &str) {
        self.description = description.to_string();
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn set_aliases(&mut self, aliases: Vec<String>) {
        self.aliases = aliases;
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn set_users(&mut self, users: Vec<String>) {
        self.users = users;
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn set_groups(&mut self, groups: Vec<String>) {
        self.groups = groups;
    }

    pub fn root_users(&self) -> &[String] {
        &self.root_users
    }

    pub fn set_root_users(&mut self, users: Vec<String>) {
        self.root_users = users;
    }

    pub fn root_groups(&self) -> &[String] {
        &self.root_groups
    }

    pub fn set_root_groups(&mut self, groups: Vec<String>) {
        self.root_groups = groups;
    }

    pub fn environment_filter(&self) -> &Regex {
        &self.environment_filter
    }

    pub fn set_environment_filter(&mut self, filter: Regex) {
        self.environment_filter = filter;
    }

    pub fn preserve_environment(&self) -> bool {
        self.preserve_environment
    }

    pub fn default_shell(&self) -> &str {
        &self.default_shell
    }

    pub fn command_prefix(&self) -> &[String] {
        &self.command_prefix
    }

    pub fn message_verbosity(&self) -> Verbosity {
        self.message_verbosity
    }

    pub fn script_config(&self) -> &str {
        &self.script_config
    }

    pub fn run_setup_scripts(&self) -> bool {
        self.run_setup_scripts
    }

    pub fn run_exec_scripts(&self) -> bool {
        self.run_exec_scripts
    }

    pub fn persona(&self) -> &Personality {
        &self.persona
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Generated chroots (source clones) are not original; they are
    /// omitted from configuration dumps.
    pub fn original(&self) -> bool {
        self.original
    }

    pub fn mount_location(&self) -> &str {
        &self.mount_location
    }

    pub fn set_mount_location(&mut self, location: &str) -> Result<()> {
        if !location.is_empty() && !crate::utils::is_absname(location) {
            return Err(ChrootError::LocationAbs(location.to_string()));
        }
        self.mount_location = location.to_string();
        Ok(())
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn set_location(&mut self, location: &str) -> Result<()> {
        if !location.is_empty() && !crate::utils::is_absname(location) {
            return Err(ChrootError::LocationAbs(location.to_string()));
        }
        self.location = location.to_string();
        Ok(())
    }

    /// The stored mount device; most backends derive the effective
    /// device instead, see [`Chroot::mount_device`].
    pub fn stored_mount_device(&self) -> &str {
        &self.mount_device
    }

    pub fn set_mount_device(&mut self, device: &str) -> Result<()> {
        if !device.is_empty() && !crate::utils::is_absname(device) {
            return Err(ChrootError::DeviceAbs(device.to_string()));
        }
        self.mount_device = device.to_string();
        Ok(())
    }

    pub fn mount_device(&self) -> String {
        self.backend.mount_device(self)
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn facets(&self) -> &FacetSet {
        &self.facets
    }

    pub fn facets_mut(&mut self) -> &mut FacetSet {
        &mut self.facets
    }

    /// The path a child process should chroot into.
    pub fn get_path(&self) -> String {
        self.backend.get_path(self)
    }

    /// The session id of an active session is its name.
    pub fn session_id(&self) -> Option<&str> {
        if self.active {
            Some(&self.name)
        } else {
            None
        }
    }

    /// Derived session capabilities.
    pub fn session_flags(&self) -> SessionFlags {
        let mut flags = SessionFlags::default();
        if self.facets.session_clonable().is_some() {
            flags.create = true;
        }
        if self.facets.source_clonable().is_some() {
            flags.clone = true;
        }
        if let Some(union) = self.facets.union() {
            if union.configured() && self.facets.session().is_some() {
                flags.purge = true;
            }
        }
        flags.union(self.backend.session_flags(self))
    }

    /// Set the union type, keeping the source-clonable facet in step:
    /// a configured union makes the chroot source-clonable, an
    /// unconfigured one removes that capability.
    pub fn set_union_type(&mut self, union_type: &str) -> Result<()> {
        let union = self
            .facets
            .union_mut()
            .ok_or(FacetError::Invalid("union"))?;
        union.set_union_type(union_type)?;
        let configured = union.configured();

        if configured {
            if self.facets.source_clonable().is_none() {
                self.facets.add_source_clonable(SourceClonable::default())?;
            }
        } else {
            self.facets.remove_source_clonable();
        }

        Ok(())
    }

    /// Export this chroot to a script environment.
    pub fn setup_env(&self, env: &mut Environment, locations: &Locations) {
        let flags = self.session_flags();

        env.add_pair("CHROOT_TYPE", self.backend.tag());
        env.add_pair("CHROOT_NAME", &self.name);
        env.add_pair("CHROOT_DESCRIPTION", &self.description);
        env.add_pair("CHROOT_LOCATION", &self.location);
        env.add_pair("CHROOT_MOUNT_LOCATION", &self.mount_location);
        env.add_pair("CHROOT_PATH", &self.get_path());
        env.add_pair("CHROOT_MOUNT_DEVICE", &self.mount_device());
        env.add_pair(
            "CHROOT_SCRIPT_CONFIG",
            &locations
                .script_config_path(&self.script_config)
                .to_string_lossy(),
        );
        env.add_pair("CHROOT_SESSION_CREATE", bool_str(flags.create));
        env.add_pair("CHROOT_SESSION_CLONE", bool_str(flags.clone));
        env.add_pair("CHROOT_SESSION_PURGE", bool_str(flags.purge));

        self.backend.setup_env(env);

        if let Some(mountable) = self.facets.mountable() {
            mountable.setup_env(env);
        }
        if let Some(union) = self.facets.union() {
            union.setup_env(env);
        }
        if let Some(unshare) = self.facets.unshare() {
            unshare.setup_env(env);
        }
        if let Some(userdata) = self.facets.userdata() {
            userdata.setup_env(env);
        }
    }

    /// Clone this template into a session instance.
    pub fn clone_session(
        &self,
        session_id: &str,
        alias: &str,
        user: &str,
        root: bool,
        locations: &Locations,
    ) -> Result<Chroot> {
        let mut session = self.clone();

        session.facets.remove_session_clonable();
        session
            .facets
            .add_session(SessionFacet::new(&self.name, alias))?;
        session.active = true;
        session.name = session_id.to_string();
        session.description = format!("{} (session chroot)", self.description);

        // Narrow the ACLs to the requesting user.
        let allowed: Vec<String> = if user.is_empty() {
            Vec::new()
        } else {
            vec![user.to_string()]
        };
        if root {
            session.users = Vec::new();
            session.root_users = allowed;
        } else {
            session.users = allowed;
            session.root_users = Vec::new();
        }
        session.groups = Vec::new();
        session.root_groups = Vec::new();

        // Sessions do not themselves re-clone.
        session.facets.remove_source_clonable();

        if !session.backend.is_plain() && session.mount_location.is_empty() {
            let location = locations.mount_dir.join(session_id);
            session.set_mount_location(&location.to_string_lossy())?;
        }

        session.backend.clone_session_setup(session_id);

        if let Some(union) = session.facets.union_mut() {
            union.clone_session_setup(session_id);
        }

        log::debug!("cloned session {}", session.name);
        Ok(session)
    }

    /// Clone the writable source chroot of a clonable template, or
    /// None for templates without that capability.
    pub fn clone_source(&self) -> Result<Option<Chroot>> {
        let source_acls = match self.facets.source_clonable() {
            Some(facet) => facet.clone(),
            None => return Ok(None),
        };

        let mut clone = self.clone();
        clone.backend = self.backend.clone_source_backend()?;
        clone.facets.remove_source_clonable();
        if let Some(union) = clone.facets.union_mut() {
            union.set_union_type("none")?;
        }
        clone.facets.add_source(SourceFacet)?;

        clone.name = format!("{}-source", self.name);
        clone.aliases = self
            .aliases
            .iter()
            .map(|alias| format!("{}-source", alias))
            .collect();
        clone.description = format!("{} (source chroot)", self.description);
        clone.users = source_acls.users().to_vec();
        clone.groups = source_acls.groups().to_vec();
        clone.root_users = source_acls.root_users().to_vec();
        clone.root_groups = source_acls.root_groups().to_vec();
        clone.original = false;

        Ok(Some(clone))
    }

    pub fn lock(&self, phase: SetupPhase, locations: &Locations) -> Result<()> {
        self.backend.setup_lock(self, phase, true, 0, locations)
    }

    pub fn unlock(&self, phase: SetupPhase, status: i32, locations: &Locations) -> Result<()> {
        self.backend.setup_lock(self, phase, false, status, locations)
    }

    /// Create or remove the session record for this session.
    pub fn setup_session_info(&self, start: bool, locations: &Locations) -> Result<()> {
        let path = locations.session_dir.join(&self.name);
        let path_str = path.to_string_lossy().into_owned();

        if start {
            fs::create_dir_all(&locations.session_dir)
                .map_err(|e| ChrootError::SessionWrite(path_str.clone(), e))?;

            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o664)
                .open(&path)
                .map_err(|e| ChrootError::SessionWrite(path_str.clone(), e))?;

            let lock = FileLock::new(file.as_raw_fd());
            lock.set_lock(LockType::Exclusive, 2)
                .map_err(|e| ChrootError::FileLock(path_str.clone(), e))?;

            let mut keyfile = Keyfile::new();
            self.get_keyfile(&mut keyfile);
            file.write_all(keyfile.to_string().as_bytes())
                .map_err(|e| ChrootError::SessionWrite(path_str.clone(), e))?;

            lock.unset_lock()
                .map_err(|e| ChrootError::FileUnlock(path_str, e))?;
        } else {
            fs::remove_file(&path).map_err(|e| ChrootError::SessionUnlink(path_str, e))?;
        }

        Ok(())
    }

    /// Serialise into a keyfile group named after this chroot.
    pub fn get_keyfile(&self, keyfile: &mut Keyfile) {
        let group = self.name.clone();
        keyfile.remove_group(&group);

        keyfile.set_value(&group, "type", self.backend.tag());
        keyfile.set_value(&group, "active", self.active);
        keyfile.set_value(&group, "run-setup-scripts", self.run_setup_scripts);
        keyfile.set_value(&group, "run-exec-scripts", self.run_exec_scripts);
        keyfile.set_value(&group, "script-config", &self.script_config);
        if self.priority != 0 {
            keyfile.set_value(&group, "priority", self.priority);
        }
        if !self.aliases.is_empty() {
            keyfile.set_list_value(&group, "aliases", &self.aliases);
        }
        keyfile.set_value(&group, "environment-filter", self.environment_filter.as_str());
        if !self.description.is_empty() {
            keyfile.set_value(&group, "description", &self.description);
        }
        if !self.users.is_empty() {
            keyfile.set_list_value(&group, "users", &self.users);
        }
        if !self.groups.is_empty() {
            keyfile.set_list_value(&group, "groups", &self.groups);
        }
        if !self.root_users.is_empty() {
            keyfile.set_list_value(&group, "root-users", &self.root_users);
        }
        if !self.root_groups.is_empty() {
            keyfile.set_list_value(&group, "root-groups", &self.root_groups);
        }
        if self.preserve_environment {
            keyfile.set_value(&group, "preserve-environment", true);
        }
        if !self.default_shell.is_empty() {
            keyfile.set_value(&group, "default-shell", &self.default_shell);
        }
        if !self.command_prefix.is_empty() {
            keyfile.set_list_value(&group, "command-prefix", &self.command_prefix);
        }
        if self.message_verbosity != Verbosity::Normal {
            keyfile.set_value(&group, "message-verbosity", self.message_verbosity);
        }
        if !self.persona.is_undefined() {
            keyfile.set_value(&group, "personality", &self.persona);
        }

        if self.active {
            keyfile.set_value(&group, "mount-location", &self.mount_location);
            let mount_device = self.mount_device();
            if !mount_device.is_empty() {
                keyfile.set_value(&group, "mount-device", mount_device);
            }
        }

        if let Some(session) = self.facets.session() {
            keyfile.set_value(&group, "original-name", session.original_name());
            keyfile.set_value(&group, "selected-name", session.selected_name());
        }

        if let Some(source) = self.facets.source_clonable() {
            if !source.users().is_empty() {
                keyfile.set_list_value(&group, "source-users", source.users());
            }
            if !source.groups().is_empty() {
                keyfile.set_list_value(&group, "source-groups", source.groups());
            }
            if !source.root_users().is_empty() {
                keyfile.set_list_value(&group, "source-root-users", source.root_users());
            }
            if !source.root_groups().is_empty() {
                keyfile.set_list_value(&group, "source-root-groups", source.root_groups());
            }
        }

        if let Some(mountable) = self.facets.mountable() {
            if !mountable.mount_options().is_empty() {
                keyfile.set_value(&group, "mount-options", mountable.mount_options());
            }
        }

        if let Some(union) = self.facets.union() {
            keyfile.set_value(&group, "union-type", union.union_type());
            if union.configured() {
                if !union.mount_options().is_empty() {
                    keyfile.set_value(&group, "union-mount-options", union.mount_options());
                }
                keyfile.set_value(&group, "union-overlay-directory", union.overlay_directory());
                keyfile.set_value(&group, "union-underlay-directory", union.underlay_directory());
            }
        }

        if let Some(unshare) = self.facets.unshare() {
            if unshare.net() {
                keyfile.set_value(&group, "unshare.net", true);
            }
            if unshare.sysvipc() {
                keyfile.set_value(&group, "unshare.sysvipc", true);
            }
            if unshare.sysvsem() {
                keyfile.set_value(&group, "unshare.sysvsem", true);
            }
            if unshare.uts() {
                keyfile.set_value(&group, "unshare.uts", true);
            }
        }

        if let Some(userdata) = self.facets.userdata() {
            let user_keys = userdata.user_modifiable();
            if !user_keys.is_empty() {
                keyfile.set_list_value(&group, "user-modifiable-keys", &user_keys);
            }
            let root_keys = userdata.root_modifiable();
            if !root_keys.is_empty() {
                keyfile.set_list_value(&group, "root-modifiable-keys", &root_keys);
            }
            for (key, value) in userdata.data() {
                keyfile.set_value(&group, key, value);
            }
        }

        self.backend.get_keyfile(self, keyfile);
    }

    /// Deserialise a chroot from a keyfile group.  The `active` key
    /// must have been injected by the catalog loader.
    pub fn from_keyfile(keyfile: &Keyfile, group: &str) -> Result<Chroot> {
        let kind = keyfile
            .get_string(group, "type", Priority::Optional)?
            .unwrap_or_else(|| "plain".to_string());
        let mut chroot = Chroot::new(group, &kind)?;

        let mut used: HashSet<String> = HashSet::new();
        used.insert("type".to_string());

        for key in keyfile.keys(group) {
            if LOCALISED_DESCRIPTION.is_match(key) {
                used.insert(key.to_string());
            }
        }

        used.insert("active".to_string());
        let active = keyfile
            .get_bool(group, "active", Priority::Required)?
            .unwrap_or(false);
        chroot.active = active;
        if active {
            chroot.facets.remove_session_clonable();
            chroot.facets.add_session(SessionFacet::default())?;
        }

        used.insert("run-setup-scripts".to_string());
        if let Some(value) = keyfile.get_bool(group, "run-setup-scripts", Priority::Optional)? {
            chroot.run_setup_scripts = value;
        }

        used.insert("run-session-scripts".to_string());
        if let Some(value) = keyfile.get_bool(group, "run-session-scripts", Priority::Deprecated)? {
            chroot.run_exec_scripts = value;
        }
        used.insert("run-exec-scripts".to_string());
        if let Some(value) = keyfile.get_bool(group, "run-exec-scripts", Priority::Optional)? {
            chroot.run_exec_scripts = value;
        }

        used.insert("profile".to_string());
        if let Some(value) = keyfile.get_string(group, "profile", Priority::Optional)? {
            chroot.script_config = value;
        }
        used.insert("script-config".to_string());
        if let Some(value) = keyfile.get_string(group, "script-config", Priority::Optional)? {
            chroot.script_config = value;
        }

        used.insert("priority".to_string());
        if let Some(value) = keyfile.get_uint(group, "priority", Priority::Optional)? {
            chroot.priority = value;
        }

        used.insert("aliases".to_string());
        if let Some(value) = keyfile.get_list(group, "aliases", Priority::Optional)? {
            chroot.aliases = value;
        }

        used.insert("environment-filter".to_string());
        if let Some(value) = keyfile.get_string(group, "environment-filter", Priority::Optional)? {
            chroot.environment_filter =
                Regex::new(&value).map_err(ChrootError::EnvironmentFilter)?;
        }

        used.insert("description".to_string());
        if let Some(value) = keyfile.get_locale_string(group, "description", Priority::Optional)? {
            chroot.description = value;
        }

        used.insert("users".to_string());
        if let Some(value) = keyfile.get_list(group, "users", Priority::Optional)? {
            chroot.users = value;
        }
        used.insert("groups".to_string());
        if let Some(value) = keyfile.get_list(group, "groups", Priority::Optional)? {
            chroot.groups = value;
        }
        used.insert("root-users".to_string());
        if let Some(value) = keyfile.get_list(group, "root-users", Priority::Optional)? {
            chroot.root_users = value;
        }
        used.insert("root-groups".to_string());
        if let Some(value) = keyfile.get_list(group, "root-groups", Priority::Optional)? {
            chroot.root_groups = value;
        }

        used.insert("preserve-environment".to_string());
        if let Some(value) = keyfile.get_bool(group, "preserve-environment", Priority::Optional)? {
            chroot.preserve_environment = value;
        }

        used.insert("default-shell".to_string());
        if let Some(value) = keyfile.get_string(group, "default-shell", Priority::Optional)? {
            chroot.default_shell = value;
        }

        used.insert("command-prefix".to_string());
        if let Some(value) = keyfile.get_list(group, "command-prefix", Priority::Optional)? {
            chroot.command_prefix = value;
        }

        used.insert("message-verbosity".to_string());
        if let Some(value) = keyfile.get_string(group, "message-verbosity", Priority::Optional)? {
            chroot.message_verbosity = Verbosity::parse(&value)?;
        }

        used.insert("personality".to_string());
        if let Some(value) = keyfile.get_string(group, "personality", Priority::Optional)? {
            chroot.persona = Personality::new(&value)?;
        }

        used.insert("mount-location".to_string());
        let priority = if active {
            Priority::Required
        } else {
            Priority::Disallowed
        };
        if let Some(value) = keyfile.get_string(group, "mount-location", priority)? {
            chroot.set_mount_location(&value)?;
        }

        used.insert("mount-device".to_string());
        let priority = if active {
            Priority::Optional
        } else {
            Priority::Disallowed
        };
        if let Some(value) = keyfile.get_string(group, "mount-device", priority)? {
            chroot.set_mount_device(&value)?;
        }

        if chroot.backend.has_sub_location() {
            used.insert("location".to_string());
            if let Some(value) = keyfile.get_string(group, "location", Priority::Optional)? {
                chroot.set_location(&value)?;
            }
        }

        chroot
            .backend
            .set_keyfile(group, keyfile, active, &mut used)?;

        // Session identity keys.
        used.insert("original-name".to_string());
        used.insert("selected-name".to_string());
        let priority = if active {
            Priority::Required
        } else {
            Priority::Disallowed
        };
        let original_name = keyfile.get_string(group, "original-name", priority)?;
        let selected_name = keyfile.get_string(group, "selected-name", priority)?;
        if let Some(session) = chroot.facets.session_mut() {
            if let Some(value) = original_name {
                session.set_original_name(&value);
            }
            if let Some(value) = selected_name {
                session.set_selected_name(&value);
            }
        }

        // Union configuration.
        if chroot.facets.union().is_some() {
            used.insert("union-type".to_string());
            if let Some(value) = keyfile.get_string(group, "union-type", Priority::Optional)? {
                if active {
                    // Sessions never regain the source-clonable facet.
                    if let Some(union) = chroot.facets.union_mut() {
                        union.set_union_type(&value)?;
                    }
                } else {
                    chroot.set_union_type(&value)?;
                }
            }

            let configured = chroot
                .facets
                .union()
                .map(|u| u.configured())
                .unwrap_or(false);

            used.insert("union-mount-options".to_string());
            if let Some(value) =
                keyfile.get_string(group, "union-mount-options", Priority::Optional)?
            {
                if let Some(union) = chroot.facets.union_mut() {
                    union.set_mount_options(&value);
                }
            }

            let priority = if active && configured {
                Priority::Required
            } else {
                Priority::Optional
            };
            used.insert("union-overlay-directory".to_string());
            if let Some(value) = keyfile.get_string(group, "union-overlay-directory", priority)? {
                if let Some(union) = chroot.facets.union_mut() {
                    union.set_overlay_directory(&value)?;
                }
            }
            used.insert("union-underlay-directory".to_string());
            if let Some(value) = keyfile.get_string(group, "union-underlay-directory", priority)? {
                if let Some(union) = chroot.facets.union_mut() {
                    union.set_underlay_directory(&value)?;
                }
            }
        }

        // Source chroot ACLs.
        for key in &[
            "source-users",
            "source-groups",
            "source-root-users",
            "source-root-groups",
        ] {
            used.insert((*key).to_string());
        }
        if active {
            for key in &[
                "source-users",
                "source-groups",
                "source-root-users",
                "source-root-groups",
            ] {
                keyfile.get_list(group, key, Priority::Disallowed)?;
            }
        } else if chroot.facets.source_clonable().is_some() {
            let users = keyfile.get_list(group, "source-users", Priority::Optional)?;
            let groups = keyfile.get_list(group, "source-groups", Priority::Optional)?;
            let root_users = keyfile.get_list(group, "source-root-users", Priority::Optional)?;
            let root_groups = keyfile.get_list(group, "source-root-groups", Priority::Optional)?;
            if let Some(source) = chroot.facets.source_clonable_mut() {
                if let Some(value) = users {
                    source.set_users(value);
                }
                if let Some(value) = groups {
                    source.set_groups(value);
                }
                if let Some(value) = root_users {
                    source.set_root_users(value);
                }
                if let Some(value) = root_groups {
                    source.set_root_groups(value);
                }
            }
        }

        if chroot.facets.mountable().is_some() {
            used.insert("mount-options".to_string());
            if let Some(value) = keyfile.get_string(group, "mount-options", Priority::Optional)? {
                if let Some(mountable) = chroot.facets.mountable_mut() {
                    mountable.set_mount_options(&value);
                }
            }
        }

        // Namespace unsharing.
        for (key, setter) in &[
            ("unshare.net", 0usize),
            ("unshare.sysvipc", 1),
            ("unshare.sysvsem", 2),
            ("unshare.uts", 3),
        ] {
            used.insert((*key).to_string());
            if let Some(value) = keyfile.get_bool(group, key, Priority::Optional)? {
                if let Some(unshare) = chroot.facets.unshare_mut() {
                    match setter {
                        0 => unshare.set_net(value),
                        1 => unshare.set_sysvipc(value),
                        2 => unshare.set_sysvsem(value),
                        _ => unshare.set_uts(value),
                    }
                }
            }
        }

        // User data: declared whitelists plus free-form dotted keys.
        used.insert("user-modifiable-keys".to_string());
        let user_keys = keyfile.get_list(group, "user-modifiable-keys", Priority::Optional)?;
        used.insert("root-modifiable-keys".to_string());
        let root_keys = keyfile.get_list(group, "root-modifiable-keys", Priority::Optional)?;
        if let Some(userdata) = chroot.facets.userdata_mut() {
            if let Some(value) = user_keys {
                userdata.set_user_modifiable(value);
            }
            if let Some(value) = root_keys {
                userdata.set_root_modifiable(value);
            }
        }
        let keys: Vec<String> = keyfile
            .keys(group)
            .into_iter()
            .map(str::to_string)
            .collect();
        for key in keys {
            if !used.contains(&key) && Userdata::valid_key(&key) {
                if let Some(value) = keyfile.get_string(group, &key, Priority::Optional)? {
                    if let Some(userdata) = chroot.facets.userdata_mut() {
                        userdata.set(&key, &value)?;
                    }
                }
                used.insert(key);
            }
        }

        // The custom backend makes session cloning configurable.
        if let Backend::Custom(custom) = &chroot.backend {
            if !custom.cloneable() && !active {
                chroot.facets.remove_session_clonable();
            }
        }

        keyfile.warn_unused(group, &used);

        Ok(chroot)
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_template() -> Chroot {
        let keyfile = Keyfile::parse_str(
            "[sid]\n\
             type=directory\n\
             active=false\n\
             description=Debian unstable\n\
             directory=/srv/chroot/sid\n\
             users=alice\n\
             groups=sbuild\n\
             aliases=unstable,default\n\
             run-setup-scripts=true\n",
        )
        .unwrap();
        Chroot::from_keyfile(&keyfile, "sid").unwrap()
    }

    #[test]
    fn test_template_from_keyfile() {
        let chroot = directory_template();
        assert_eq!(chroot.name(), "sid");
        assert!(!chroot.active());
        assert_eq!(chroot.backend().tag(), "directory");
        assert_eq!(chroot.users(), &["alice".to_string()]);
        assert_eq!(chroot.aliases(), &["unstable".to_string(), "default".to_string()]);
        assert!(chroot.session_flags().create);
        assert!(!chroot.session_flags().clone);
    }

    #[test]
    fn test_plain_has_no_create_flag() {
        let keyfile =
            Keyfile::parse_str("[base]\ntype=plain\nactive=false\ndirectory=/srv/base\n").unwrap();
        let chroot = Chroot::from_keyfile(&keyfile, "base").unwrap();
        assert!(!chroot.session_flags().create);
        assert_eq!(chroot.get_path(), "/srv/base");
    }

    #[test]
    fn test_directory_and_location_disallowed_together() {
        let keyfile = Keyfile::parse_str(
            "[bad]\ntype=directory\nactive=false\ndirectory=/a\nlocation=/b\n",
        )
        .unwrap();
        assert!(matches!(
            Chroot::from_keyfile(&keyfile, "bad"),
            Err(ChrootError::Keyfile(
                crate::keyfile::KeyfileError::DisallowedKey { .. }
            ))
        ));
    }

    #[test]
    fn test_location_alias_still_accepted() {
        let keyfile =
            Keyfile::parse_str("[old]\ntype=plain\nactive=false\nlocation=/srv/old\n").unwrap();
        let chroot = Chroot::from_keyfile(&keyfile, "old").unwrap();
        assert_eq!(chroot.get_path(), "/srv/old");
    }

    #[test]
    fn test_relative_directory_rejected() {
        let keyfile =
            Keyfile::parse_str("[bad]\ntype=directory\nactive=false\ndirectory=srv/x\n").unwrap();
        assert!(matches!(
            Chroot::from_keyfile(&keyfile, "bad"),
            Err(ChrootError::DirectoryAbs(_))
        ));
    }

    #[test]
    fn test_mount_location_disallowed_on_template() {
        let keyfile = Keyfile::parse_str(
            "[bad]\ntype=directory\nactive=false\ndirectory=/a\nmount-location=/mnt\n",
        )
        .unwrap();
        assert!(Chroot::from_keyfile(&keyfile, "bad").is_err());
    }

    #[test]
    fn test_clone_session_directory() {
        let template = directory_template();
        let locations = Locations::default();
        let session = template
            .clone_session("sid-1234", "unstable", "alice", false, &locations)
            .unwrap();

        assert!(session.active());
        assert_eq!(session.name(), "sid-1234");
        assert_eq!(session.session_id(), Some("sid-1234"));
        assert_eq!(
            session.mount_location(),
            "/var/lib/schroot/mount/sid-1234"
        );
        assert_eq!(session.users(), &["alice".to_string()]);
        assert!(session.groups().is_empty());
        assert!(session.root_users().is_empty());
        assert!(session.root_groups().is_empty());
        assert!(session.description().ends_with("(session chroot)"));
        assert!(session.facets().session().is_some());
        assert!(session.facets().session_clonable().is_none());
        let facet = session.facets().session().unwrap();
        assert_eq!(facet.original_name(), "sid");
        assert_eq!(facet.selected_name(), "unstable");
    }

    #[test]
    fn test_clone_session_root_user() {
        let template = directory_template();
        let session = template
            .clone_session("sid-1", "sid", "bob", true, &Locations::default())
            .unwrap();
        assert!(session.users().is_empty());
        assert_eq!(session.root_users(), &["bob".to_string()]);
    }

    #[test]
    fn test_clone_session_lvm_derives_devices() {
        let keyfile = Keyfile::parse_str(
            "[snap]\n\
             type=lvm-snapshot\n\
             active=false\n\
             device=/dev/vg0/snap\n\
             lvm-snapshot-options=--size 1G\n",
        )
        .unwrap();
        let template = Chroot::from_keyfile(&keyfile, "snap").unwrap();
        let session = template
            .clone_session("snap-beef", "snap", "alice", false, &Locations::default())
            .unwrap();

        match session.backend() {
            Backend::LvmSnapshot(lvm) => {
                assert_eq!(lvm.snapshot_device(), "/dev/vg0/snap-beef");
            }
            other => panic!("unexpected backend {}", other.tag()),
        }
        assert_eq!(session.mount_device(), "/dev/vg0/snap-beef");
    }

    #[test]
    fn test_union_installs_source_clonable() {
        let mut chroot = directory_template();
        assert!(chroot.facets().source_clonable().is_none());

        chroot.set_union_type("overlayfs").unwrap();
        assert!(chroot.facets().source_clonable().is_some());
        assert!(chroot.session_flags().clone);

        chroot.set_union_type("none").unwrap();
        assert!(chroot.facets().source_clonable().is_none());
    }

    #[test]
    fn test_clone_source_lvm() {
        let keyfile = Keyfile::parse_str(
            "[snap]\n\
             type=lvm-snapshot\n\
             active=false\n\
             device=/dev/vg0/snap\n\
             lvm-snapshot-options=--size 1G\n\
             aliases=testing\n\
             source-users=admin\n",
        )
        .unwrap();
        let template = Chroot::from_keyfile(&keyfile, "snap").unwrap();
        let source = template.clone_source().unwrap().unwrap();

        assert_eq!(source.name(), "snap-source");
        assert_eq!(source.aliases(), &["testing-source".to_string()]);
        assert_eq!(source.backend().tag(), "block-device");
        assert_eq!(source.users(), &["admin".to_string()]);
        assert!(!source.original());
        assert!(source.facets().source().is_some());
        assert!(source.description().ends_with("(source chroot)"));
    }

    #[test]
    fn test_clone_source_none_without_capability() {
        let template = directory_template();
        assert!(template.clone_source().unwrap().is_none());
    }

    #[test]
    fn test_keyfile_round_trip() {
        let template = directory_template();
        let mut keyfile = Keyfile::new();
        template.get_keyfile(&mut keyfile);

        let reparsed = Chroot::from_keyfile(&keyfile, "sid").unwrap();
        let mut keyfile2 = Keyfile::new();
        reparsed.get_keyfile(&mut keyfile2);

        assert_eq!(keyfile, keyfile2);
    }

    #[test]
    fn test_clone_serialises_identically() {
        let template = directory_template();
        let clone = template.clone();

        let mut a = Keyfile::new();
        template.get_keyfile(&mut a);
        let mut b = Keyfile::new();
        clone.get_keyfile(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_session_record_round_trip() {
        let template = directory_template();
        let dir = tempfile::tempdir().unwrap();
        let locations = Locations::with_root(dir.path());

        let session = template
            .clone_session("sid-42", "sid", "alice", false, &locations)
            .unwrap();
        session.setup_session_info(true, &locations).unwrap();

        let record = locations.session_dir.join("sid-42");
        assert!(record.exists());

        let keyfile = Keyfile::load(&record).unwrap();
        let parsed = Chroot::from_keyfile(&keyfile, "sid-42").unwrap();
        assert!(parsed.active());
        assert_eq!(parsed.facets().session().unwrap().original_name(), "sid");
        assert_eq!(parsed.facets().session().unwrap().selected_name(), "sid");
        assert_eq!(parsed.users(), &["alice".to_string()]);

        // Duplicate creation is rejected by O_CREAT|O_EXCL.
        assert!(matches!(
            session.setup_session_info(true, &locations),
            Err(ChrootError::SessionWrite(..))
        ));

        session.setup_session_info(false, &locations).unwrap();
        assert!(!record.exists());
        assert!(matches!(
            session.setup_session_info(false, &locations),
            Err(ChrootError::SessionUnlink(..))
        ));
    }

    #[test]
    fn test_setup_env_exports() {
        let template = directory_template();
        let session = template
            .clone_session("sid-env", "sid", "alice", false, &Locations::default())
            .unwrap();
        let mut env = Environment::new();
        session.setup_env(&mut env, &Locations::default());

        assert_eq!(env.get("CHROOT_TYPE"), Some("directory"));
        assert_eq!(env.get("CHROOT_NAME"), Some("sid-env"));
        assert_eq!(
            env.get("CHROOT_MOUNT_LOCATION"),
            Some("/var/lib/schroot/mount/sid-env")
        );
        assert_eq!(env.get("CHROOT_PATH"), Some("/var/lib/schroot/mount/sid-env"));
        assert_eq!(env.get("CHROOT_SESSION_CREATE"), Some("false"));
        assert_eq!(env.get("UNSHARE_NET"), Some("false"));
        assert_eq!(
            env.get("CHROOT_SCRIPT_CONFIG"),
            Some("/etc/schroot/script-defaults")
        );
    }

    #[test]
    fn test_session_keys_required_when_active() {
        let keyfile = Keyfile::parse_str(
            "[s]\ntype=directory\nactive=true\ndirectory=/srv/s\noriginal-name=s\nselected-name=s\n",
        )
        .unwrap();
        // mount-location is required for active sessions.
        assert!(matches!(
            Chroot::from_keyfile(&keyfile, "s"),
            Err(ChrootError::Keyfile(
                crate::keyfile::KeyfileError::MissingKey { .. }
            ))
        ));
    }

    #[test]
    fn test_userdata_keys_parsed() {
        let keyfile = Keyfile::parse_str(
            "[u]\n\
             type=directory\n\
             active=false\n\
             directory=/srv/u\n\
             setup.fstab=minimal\n\
             user-modifiable-keys=sbuild.run\n",
        )
        .unwrap();
        let chroot = Chroot::from_keyfile(&keyfile, "u").unwrap();
        let userdata = chroot.facets().userdata().unwrap();
        assert_eq!(userdata.get("setup.fstab"), Some("minimal"));
        assert_eq!(userdata.user_modifiable(), vec!["sbuild.run".to_string()]);
    }

    #[test]
    fn test_custom_not_cloneable() {
        let keyfile = Keyfile::parse_str(
            "[c]\ntype=custom\nactive=false\ncustom-session-cloneable=false\n",
        )
        .unwrap();
        let chroot = Chroot::from_keyfile(&keyfile, "c").unwrap();
        assert!(!chroot.session_flags().create);
    }

    #[test]
    fn test_btrfs_template_keys() {
        let keyfile = Keyfile::parse_str(
            "[b]\n\
             type=btrfs-snapshot\n\
             active=false\n\
             btrfs-source-subvolume=/srv/chroot/sid\n",
        )
        .unwrap();
        let chroot = Chroot::from_keyfile(&keyfile, "b").unwrap();
        assert!(chroot.session_flags().clone);

        // Snapshot path is a session-only key.
        let keyfile = Keyfile::parse_str(
            "[b]\n\
             type=btrfs-snapshot\n\
             active=false\n\
             btrfs-source-subvolume=/srv/chroot/sid\n\
             btrfs-snapshot-path=/srv/snap/x\n",
        )
        .unwrap();
        assert!(Chroot::from_keyfile(&keyfile, "b").is_err());
    }
}
