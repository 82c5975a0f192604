//! Session facets: the capability to clone a session, and the mark of
//! an active session instance.

/// Marker facet: this chroot can be cloned into a session instance.
/// Contributes the CREATE session flag.
#[derive(Debug, Clone, Copy)]
pub struct SessionClonable;

/// Facet attached to active session instances.  Remembers how the
/// session was created: the template name and the alias the user
/// selected it by.
#[derive(Debug, Clone, Default)]
pub struct SessionFacet {
    original_name: String,
    selected_name: String,
}

impl SessionFacet {
    pub fn new(original_name: &str, selected_name: &str) -> Self {
        Self {
            original_name: original_name.to_string(),
            selected_name: selected_name.to_string(),
        }
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn set_original_name(&mut self, name: &str) {
        self.original_name = name.to_string();
    }

    pub fn selected_name(&self) -> &str {
        &self.selected_name
    }

    pub fn set_selected_name(&mut self, name: &str) {
        self.selected_name = name.to_string();
    }
}
