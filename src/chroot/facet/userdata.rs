//! Free-form namespaced user data attached to a chroot.
//!
//! Keys are dotted names such as `setup.fstab`; which keys may be
//! modified is policed by separate user- and root-settable whitelists.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;

use super::{FacetError, Result};
use crate::environment::Environment;

static KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9]*(\.[a-z][a-z0-9-]*)+$").unwrap());

#[derive(Debug, Clone, Default)]
pub struct Userdata {
    data: BTreeMap<String, String>,
    user_modifiable: BTreeSet<String>,
    root_modifiable: BTreeSet<String>,
}

impl Userdata {
    /// True when the key is acceptable as a user data key.
    pub fn valid_key(key: &str) -> bool {
        KEY_PATTERN.is_match(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// Set a value without permission checks (configuration load).
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if !Self::valid_key(key) {
            return Err(FacetError::UserdataKey(key.to_string()));
        }
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Set a value on behalf of a user, honouring the modifiable-key
    /// whitelists.  Root may additionally modify root-modifiable keys.
    pub fn set_checked(&mut self, key: &str, value: &str, root: bool) -> Result<()> {
        let allowed = self.user_modifiable.contains(key)
            || (root && self.root_modifiable.contains(key));
        if !allowed {
            return Err(FacetError::UserdataNotModifiable(key.to_string()));
        }
        self.set(key, value)
    }

    pub fn user_modifiable(&self) -> Vec<String> {
        self.user_modifiable.iter().cloned().collect()
    }

    pub fn set_user_modifiable(&mut self, keys: Vec<String>) {
        self.user_modifiable = keys.into_iter().collect();
    }

    pub fn root_modifiable(&self) -> Vec<String> {
        self.root_modifiable.iter().cloned().collect()
    }

    pub fn set_root_modifiable(&mut self, keys: Vec<String>) {
        self.root_modifiable = keys.into_iter().collect();
    }

    /// Export data to the script environment; `setup.fstab` becomes
    /// `SETUP_FSTAB`.
    pub fn setup_env(&self, env: &mut Environment) {
        for (key, value) in &self.data {
            let name: String = key
                .chars()
                .map(|c| match c {
                    '.' | '-' => '_',
                    other => other.to_ascii_uppercase(),
                })
                .collect();
            env.add_pair(&name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(Userdata::valid_key("setup.fstab"));
        assert!(Userdata::valid_key("sbuild.resolver-type"));
        assert!(Userdata::valid_key("a.b.c"));
        assert!(!Userdata::valid_key("setup"));
        assert!(!Userdata::valid_key("Setup.fstab"));
        assert!(!Userdata::valid_key("setup."));
        assert!(!Userdata::valid_key(".fstab"));
        assert!(!Userdata::valid_key("setup.Fstab"));
    }

    #[test]
    fn test_set_rejects_invalid_key() {
        let mut data = Userdata::default();
        assert!(matches!(
            data.set("notdotted", "x"),
            Err(FacetError::UserdataKey(_))
        ));
        data.set("setup.fstab", "minimal").unwrap();
        assert_eq!(data.get("setup.fstab"), Some("minimal"));
    }

    #[test]
    fn test_modifiable_policing() {
        let mut data = Userdata::default();
        data.set_user_modifiable(vec!["sbuild.field".to_string()]);
        data.set_root_modifiable(vec!["setup.fstab".to_string()]);

        data.set_checked("sbuild.field", "1", false).unwrap();
        assert!(matches!(
            data.set_checked("setup.fstab", "f", false),
            Err(FacetError::UserdataNotModifiable(_))
        ));
        data.set_checked("setup.fstab", "f", true).unwrap();
        assert!(data.set_checked("other.key", "x", true).is_err());
    }

    #[test]
    fn test_env_transform() {
        let mut data = Userdata::default();
        data.set("setup.fstab", "minimal").unwrap();
        data.set("custom.mount-point", "/mnt").unwrap();
        let mut env = Environment::new();
        data.setup_env(&mut env);
        assert_eq!(env.get("SETUP_FSTAB"), Some("minimal"));
        assert_eq!(env.get("CUSTOM_MOUNT_POINT"), Some("/mnt"));
    }
}
