//! Source facets: the capability to expose a writable source chroot,
//! and the mark of a generated source clone.

/// ACLs for the source chroot generated from a clonable template.
/// Contributes the CLONE session flag.
#[derive(Debug, Clone, Default)]
pub struct SourceClonable {
    users: Vec<String>,
    groups: Vec<String>,
    root_users: Vec<String>,
    root_groups: Vec<String>,
}

impl SourceClonable {
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
}

/// Marker facet: this chroot is a generated source clone.
#[derive(Debug, Clone, Copy)]
pub struct SourceFacet;
