//! Composable per-chroot capability objects.
//!
//! Each facet type may be attached at most once; attaching a duplicate
//! is an error.  Mutual-exclusion constraints (a chroot is either a
//! session or session-clonable, never both) are enforced at add time.

mod mountable;
mod session;
mod source;
mod union;
mod unshare;
mod userdata;

pub use mountable::Mountable;
pub use session::{SessionClonable, SessionFacet};
pub use source::{SourceClonable, SourceFacet};
pub use union::{UnionFacet, UNION_TYPES};
pub use unshare::Unshare;
pub use userdata::Userdata;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FacetError {
    #[error("facet '{0}' is already present")]
    Present(&'static str),
    #[error("facet '{0}' is not present")]
    Invalid(&'static str),
    #[error("unknown filesystem union type '{0}'")]
    UnionTypeUnknown(String),
    #[error("union overlay must have an absolute path: '{0}'")]
    UnionOverlayAbs(String),
    #[error("union underlay must have an absolute path: '{0}'")]
    UnionUnderlayAbs(String),
    #[error("invalid user data key '{0}'")]
    UserdataKey(String),
    #[error("user data key '{0}' is not modifiable")]
    UserdataNotModifiable(String),
}

pub type Result<T> = std::result::Result<T, FacetError>;

macro_rules! facet_slot {
    ($field:ident, $ty:ty, $name:expr, $add:ident, $get:ident, $get_mut:ident, $remove:ident) => {
        pub fn $add(&mut self, facet: $ty) -> Result<()> {
            if self.$field.is_some() {
                return Err(FacetError::Present($name));
            }
            self.$field = Some(facet);
            Ok(())
        }

        pub fn $get(&self) -> Option<&$ty> {
            self.$field.as_ref()
        }

        pub fn $get_mut(&mut self) -> Option<&mut $ty> {
            self.$field.as_mut()
        }

        pub fn $remove(&mut self) -> Option<$ty> {
            self.$field.take()
        }
    };
}

/// The set of facets attached to a chroot.
#[derive(Debug, Clone, Default)]
pub struct FacetSet {
    mountable: Option<Mountable>,
    session_clonable: Option<SessionClonable>,
    session: Option<SessionFacet>,
    source_clonable: Option<SourceClonable>,
    source: Option<SourceFacet>,
    union: Option<UnionFacet>,
    unshare: Option<Unshare>,
    userdata: Option<Userdata>,
}

impl FacetSet {
    facet_slot!(mountable, Mountable, "mountable", add_mountable, mountable, mountable_mut, remove_mountable);
    facet_slot!(source_clonable, SourceClonable, "source-clonable", add_source_clonable, source_clonable, source_clonable_mut, remove_source_clonable);
    facet_slot!(source, SourceFacet, "source", add_source, source, source_mut, remove_source);
    facet_slot!(union, UnionFacet, "union", add_union, union, union_mut, remove_union);
    facet_slot!(unshare, Unshare, "unshare", add_unshare, unshare, unshare_mut, remove_unshare);
    facet_slot!(userdata, Userdata, "userdata", add_userdata, userdata, userdata_mut, remove_userdata);

    /// A chroot is either a session or session-clonable, never both.
    pub fn add_session_clonable(&mut self, facet: SessionClonable) -> Result<()> {
        if self.session_clonable.is_some() {
            return Err(FacetError::Present("session-clonable"));
        }
        if self.session.is_some() {
            return Err(FacetError::Present("session"));
        }
        self.session_clonable = Some(facet);
        Ok(())
    }

    pub fn session_clonable(&self) -> Option<&SessionClonable> {
        self.session_clonable.as_ref()
    }

    pub fn remove_session_clonable(&mut self) -> Option<SessionClonable> {
        self.session_clonable.take()
    }

    pub fn add_session(&mut self, facet: SessionFacet) -> Result<()> {
        if self.session.is_some() {
            return Err(FacetError::Present("session"));
        }
        if self.session_clonable.is_some() {
            return Err(FacetError::Present("session-clonable"));
        }
        self.session = Some(facet);
        Ok(())
    }

    pub fn session(&self) -> Option<&SessionFacet> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut SessionFacet> {
        self.session.as_mut()
    }

    pub fn remove_session(&mut self) -> Option<SessionFacet> {
        self.session.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_facet_rejected() {
        let mut facets = FacetSet::default();
        facets.add_unshare(Unshare::default()).unwrap();
        match facets.add_unshare(Unshare::default()) {
            Err(FacetError::Present(name)) => assert_eq!(name, "unshare"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_session_exclusive_with_session_clonable() {
        let mut facets = FacetSet::default();
        facets.add_session_clonable(SessionClonable).unwrap();
        assert!(facets.add_session(SessionFacet::default()).is_err());

        facets.remove_session_clonable();
        facets.add_session(SessionFacet::default()).unwrap();
        assert!(facets.add_session_clonable(SessionClonable).is_err());
    }

    #[test]
    fn test_remove_then_add() {
        let mut facets = FacetSet::default();
        facets.add_source(SourceFacet).unwrap();
        assert!(facets.source().is_some());
        facets.remove_source();
        facets.add_source(SourceFacet).unwrap();
    }
}
