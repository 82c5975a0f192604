//! Linux process execution domain (personality) handling.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersonalityError {
    #[error("{0}: personality is unknown; valid personalities: {1}")]
    Unknown(String, String),
    #[error("failed to set personality '{0}': {1}")]
    Set(String, std::io::Error),
}

// Values from <sys/personality.h>.
const ADDR_LIMIT_32BIT: libc::c_ulong = 0x0800000;
const SHORT_INODE: libc::c_ulong = 0x1000000;
const WHOLE_SECONDS: libc::c_ulong = 0x2000000;
const STICKY_TIMEOUTS: libc::c_ulong = 0x4000000;
const MMAP_PAGE_ZERO: libc::c_ulong = 0x0100000;

const PERSONALITIES: &[(&str, libc::c_ulong)] = &[
    ("linux", 0x0000),
    ("linux_32bit", 0x0000 | ADDR_LIMIT_32BIT),
    ("svr4", 0x0001 | STICKY_TIMEOUTS | MMAP_PAGE_ZERO),
    ("scorvr3", 0x0003 | STICKY_TIMEOUTS | WHOLE_SECONDS | SHORT_INODE),
    ("osr5", 0x0003 | STICKY_TIMEOUTS | WHOLE_SECONDS),
    ("wysev386", 0x0004 | STICKY_TIMEOUTS | SHORT_INODE),
    ("iscr4", 0x0005 | STICKY_TIMEOUTS),
    ("bsd", 0x0006),
    ("sunos", 0x0006 | STICKY_TIMEOUTS),
    ("xenix", 0x0007 | STICKY_TIMEOUTS | SHORT_INODE),
    ("linux32", 0x0008),
    ("irix32", 0x0009 | STICKY_TIMEOUTS),
    ("irixn32", 0x000a | STICKY_TIMEOUTS),
    ("irix64", 0x000b | STICKY_TIMEOUTS),
    ("riscos", 0x000c),
    ("solaris", 0x000d | STICKY_TIMEOUTS),
    ("uw7", 0x000e | STICKY_TIMEOUTS | MMAP_PAGE_ZERO),
    ("osf4", 0x000f),
    ("hpux", 0x0010),
];

/// A process execution domain.  The undefined personality leaves the
/// execution domain untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Personality {
    name: String,
    persona: Option<libc::c_ulong>,
}

impl Personality {
    pub fn undefined() -> Self {
        Self {
            name: "undefined".to_string(),
            persona: None,
        }
    }

    pub fn new(name: &str) -> Result<Self, PersonalityError> {
        if name.is_empty() || name == "undefined" {
            return Ok(Self::undefined());
        }

        match PERSONALITIES.iter().find(|(n, _)| *n == name) {
            Some((n, value)) => Ok(Self {
                name: (*n).to_string(),
                persona: Some(*value),
            }),
            None => Err(PersonalityError::Unknown(
                name.to_string(),
                Self::valid_names(),
            )),
        }
    }

    fn valid_names() -> String {
        let mut names: Vec<&str> = PERSONALITIES.iter().map(|(n, _)| *n).collect();
        names.insert(0, "undefined");
        names.join(" ")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_undefined(&self) -> bool {
        self.persona.is_none()
    }

    /// Apply the execution domain to the current process.  A no-op for
    /// the undefined personality.
    pub fn apply(&self) -> Result<(), PersonalityError> {
        if let Some(persona) = self.persona {
            let ret = unsafe { libc::personality(persona) };
            if ret < 0 {
                return Err(PersonalityError::Set(
                    self.name.clone(),
                    std::io::Error::last_os_error(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for Personality {
    fn default() -> Self {
        Self::undefined()
    }
}

impl fmt::Display for Personality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_personalities() {
        assert_eq!(Personality::new("linux").unwrap().name(), "linux");
        assert_eq!(Personality::new("linux32").unwrap().name(), "linux32");
        assert!(!Personality::new("bsd").unwrap().is_undefined());
    }

    #[test]
    fn test_undefined() {
        assert!(Personality::new("").unwrap().is_undefined());
        assert!(Personality::new("undefined").unwrap().is_undefined());
        assert!(Personality::default().is_undefined());
        // Applying the undefined personality changes nothing.
        Personality::undefined().apply().unwrap();
    }

    #[test]
    fn test_unknown_personality_lists_valid_names() {
        let err = Personality::new("hurd").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("hurd"));
        assert!(text.contains("linux32"));
    }
}
