//! Filesystem union (overlay) facet.

use super::{FacetError, Result};
use crate::environment::Environment;
use crate::utils;

pub const UNION_TYPES: &[&str] = &["aufs", "overlayfs", "unionfs", "none"];

/// Overlay configuration for chroots materialised as a filesystem
/// union of a writable overlay above a read-only underlay.
#[derive(Debug, Clone)]
pub struct UnionFacet {
    union_type: String,
    mount_options: String,
    overlay_directory: String,
    underlay_directory: String,
}

impl UnionFacet {
    pub fn new(overlay_base: &str, underlay_base: &str) -> Self {
        Self {
            union_type: "none".to_string(),
            mount_options: String::new(),
            overlay_directory: overlay_base.to_string(),
            underlay_directory: underlay_base.to_string(),
        }
    }

    /// A union is configured when its type is anything but "none".
    pub fn configured(&self) -> bool {
        self.union_type != "none"
    }

    pub fn union_type(&self) -> &str {
        &self.union_type
    }

    /// Validate and set the union type.  Installation and removal of
    /// the source-clonable facet is handled by the owning chroot.
    pub fn set_union_type(&mut self, union_type: &str) -> Result<()> {
        if !UNION_TYPES.contains(&union_type) {
            return Err(FacetError::UnionTypeUnknown(union_type.to_string()));
        }
        self.union_type = union_type.to_string();
        Ok(())
    }

    pub fn mount_options(&self) -> &str {
        &self.mount_options
    }

    pub fn set_mount_options(&mut self, options: &str) {
        self.mount_options = options.to_string();
    }

    pub fn overlay_directory(&self) -> &str {
        &self.overlay_directory
    }

    pub fn set_overlay_directory(&mut self, directory: &str) -> Result<()> {
        if !utils::is_absname(directory) {
            return Err(FacetError::UnionOverlayAbs(directory.to_string()));
        }
        self.overlay_directory = directory.to_string();
        Ok(())
    }

    pub fn underlay_directory(&self) -> &str {
        &self.underlay_directory
    }

    pub fn set_underlay_directory(&mut self, directory: &str) -> Result<()> {
        if !utils::is_absname(directory) {
            return Err(FacetError::UnionUnderlayAbs(directory.to_string()));
        }
        self.underlay_directory = directory.to_string();
        Ok(())
    }

    /// Append the session id to the overlay and underlay base
    /// directories when a session is cloned.
    pub fn clone_session_setup(&mut self, session_id: &str) {
        self.overlay_directory = format!("{}/{}", self.overlay_directory, session_id);
        self.underlay_directory = format!("{}/{}", self.underlay_directory, session_id);
    }

    pub fn setup_env(&self, env: &mut Environment) {
        env.add_pair("CHROOT_UNION_TYPE", &self.union_type);
        if self.configured() {
            env.add_pair("CHROOT_UNION_MOUNT_OPTIONS", &self.mount_options);
            env.add_pair("CHROOT_UNION_OVERLAY_DIRECTORY", &self.overlay_directory);
            env.add_pair("CHROOT_UNION_UNDERLAY_DIRECTORY", &self.underlay_directory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_type_validation() {
        let mut union = UnionFacet::new("/var/lib/schroot/union/overlay", "/var/lib/schroot/union/underlay");
        assert!(!union.configured());
        union.set_union_type("overlayfs").unwrap();
        assert!(union.configured());
        union.set_union_type("none").unwrap();
        assert!(!union.configured());
        assert!(matches!(
            union.set_union_type("zfs"),
            Err(FacetError::UnionTypeUnknown(_))
        ));
    }

    #[test]
    fn test_directories_must_be_absolute() {
        let mut union = UnionFacet::new("/o", "/u");
        assert!(union.set_overlay_directory("relative/path").is_err());
        assert!(union.set_underlay_directory("relative/path").is_err());
        union.set_overlay_directory("/srv/overlay").unwrap();
        union.set_underlay_directory("/srv/underlay").unwrap();
    }

    #[test]
    fn test_session_suffix() {
        let mut union = UnionFacet::new("/o", "/u");
        union.set_union_type("aufs").unwrap();
        union.clone_session_setup("sid-1234");
        assert_eq!(union.overlay_directory(), "/o/sid-1234");
        assert_eq!(union.underlay_directory(), "/u/sid-1234");
    }

    #[test]
    fn test_env_only_when_configured() {
        let mut env = Environment::new();
        let mut union = UnionFacet::new("/o", "/u");
        union.setup_env(&mut env);
        assert_eq!(env.get("CHROOT_UNION_TYPE"), Some("none"));
        assert!(!env.contains("CHROOT_UNION_OVERLAY_DIRECTORY"));

        let mut env = Environment::new();
        union.set_union_type("overlayfs").unwrap();
        union.set_mount_options("rw");
        union.setup_env(&mut env);
        assert_eq!(env.get("CHROOT_UNION_MOUNT_OPTIONS"), Some("rw"));
        assert_eq!(env.get("CHROOT_UNION_OVERLAY_DIRECTORY"), Some("/o"));
    }
}
