//! Grouped key/value configuration store.
//!
//! The format is a line-oriented INI dialect: `[group]` headers,
//! `key = value` items, `#` comments and blank lines.  Comments are
//! attached to the following group or key and survive a parse/emit
//! round trip.  Reads are priority-tagged so deserialisers can express
//! required, optional, deprecated, obsolete and disallowed keys.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyfileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: invalid line '{text}'")]
    ParseError { line: usize, text: String },
    #[error("[{group}]: a required parameter '{key}' is missing")]
    MissingKey { group: String, key: String },
    #[error("[{group}]: a disallowed parameter '{key}' has been specified")]
    DisallowedKey { group: String, key: String },
    #[error("[{group}] {key}: invalid value '{value}'")]
    InvalidValue {
        group: String,
        key: String,
        value: String,
    },
}

pub type Result<T> = std::result::Result<T, KeyfileError>;

/// How strongly a deserialiser cares about a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Missing key is an error.
    Required,
    /// Missing key leaves the target unchanged.
    Optional,
    /// Key still works but warns when present.
    Deprecated,
    /// Key warns when present and its value is ignored.
    Obsolete,
    /// Key is an error when present.
    Disallowed,
}

#[derive(Debug, Clone)]
struct Item {
    key: String,
    value: String,
    comment: String,
    line: usize,
}

#[derive(Debug, Clone)]
struct Group {
    name: String,
    items: Vec<Item>,
    comment: String,
    line: usize,
}

/// An ordered, commented collection of groups of key/value items.
#[derive(Debug, Clone, Default)]
pub struct Keyfile {
    groups: Vec<Group>,
}

impl PartialEq for Keyfile {
    fn eq(&self, other: &Self) -> bool {
        if self.groups.len() != other.groups.len() {
            return false;
        }
        self.groups.iter().zip(other.groups.iter()).all(|(a, b)| {
            a.name == b.name
                && a.comment == b.comment
                && a.items.len() == b.items.len()
                && a.items.iter().zip(b.items.iter()).all(|(x, y)| {
                    x.key == y.key && x.value == y.value && x.comment == y.comment
                })
        })
    }
}

impl Keyfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::parse(BufReader::new(file))
    }

    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut keyfile = Keyfile::new();
        let mut comment = String::new();
        let mut current: Option<usize> = None;

        for (idx, line) in reader.lines().enumerate() {
            let lineno = idx + 1;
            let line = line?;
            let trimmed = line.trim();

            if trimmed.is_empty() {
                continue;
            }

            if let Some(text) = trimmed.strip_prefix('#') {
                if !comment.is_empty() {
                    comment.push('\n');
                }
                comment.push_str(text);
                continue;
            }

            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                let name = trimmed[1..trimmed.len() - 1].trim();
                if name.is_empty() {
                    return Err(KeyfileError::ParseError {
                        line: lineno,
                        text: trimmed.to_string(),
                    });
                }
                let group = keyfile.ensure_group(name);
                group.comment = std::mem::take(&mut comment);
                group.line = lineno;
                current = Some(keyfile.index_of(name).unwrap());
                continue;
            }

            if let Some(pos) = trimmed.find('=') {
                let key = trimmed[..pos].trim();
                let value = trimmed[pos + 1..].trim();
                let group_idx = match current {
                    Some(idx) if !key.is_empty() => idx,
                    _ => {
                        return Err(KeyfileError::ParseError {
                            line: lineno,
                            text: trimmed.to_string(),
                        })
                    }
                };
                let item_comment = std::mem::take(&mut comment);
                keyfile.set_item(group_idx, key, value, item_comment, lineno);
                continue;
            }

            return Err(KeyfileError::ParseError {
                line: lineno,
                text: trimmed.to_string(),
            });
        }

        Ok(keyfile)
    }

    pub fn parse_str(data: &str) -> Result<Self> {
        Self::parse(data.as_bytes())
    }

    fn index_of(&self, group: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.name == group)
    }

    fn find_group(&self, group: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == group)
    }

    fn ensure_group(&mut self, group: &str) -> &mut Group {
        if self.index_of(group).is_none() {
            self.groups.push(Group {
                name: group.to_string(),
                items: Vec::new(),
                comment: String::new(),
                line: 0,
            });
        }
        let idx = self.index_of(group).unwrap();
        &mut self.groups[idx]
    }

    fn set_item(&mut self, group_idx: usize, key: &str, value: &str, comment: String, line: usize) {
        let group = &mut self.groups[group_idx];
        if let Some(item) = group.items.iter_mut().find(|i| i.key == key) {
            item.value = value.to_string();
            if !comment.is_empty() {
                item.comment = comment;
            }
            item.line = line;
        } else {
            group.items.push(Item {
                key: key.to_string(),
                value: value.to_string(),
                comment,
                line,
            });
        }
    }

    /// Group names in insertion order.
    pub fn groups(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.name.as_str()).collect()
    }

    /// Keys of a group in insertion order.
    pub fn keys(&self, group: &str) -> Vec<&str> {
        self.find_group(group)
            .map(|g| g.items.iter().map(|i| i.key.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.find_group(group).is_some()
    }

    pub fn has_key(&self, group: &str, key: &str) -> bool {
        self.value(group, key).is_some()
    }

    /// Source line of a key, if it was parsed from a stream.
    pub fn get_line(&self, group: &str, key: &str) -> Option<usize> {
        self.find_group(group)
            .and_then(|g| g.items.iter().find(|i| i.key == key))
            .map(|i| i.line)
    }

    fn value(&self, group: &str, key: &str) -> Option<&str> {
        self.find_group(group)
            .and_then(|g| g.items.iter().find(|i| i.key == key))
            .map(|i| i.value.as_str())
    }

    pub fn set_group(&mut self, group: &str, comment: &str) {
        let group = self.ensure_group(group);
        if !comment.is_empty() {
            group.comment = comment.to_string();
        }
    }

    pub fn set_value<T: fmt::Display>(&mut self, group: &str, key: &str, value: T) {
        self.ensure_group(group);
        let idx = self.index_of(group).unwrap();
        self.set_item(idx, key, &value.to_string(), String::new(), 0);
    }

    pub fn set_list_value(&mut self, group: &str, key: &str, value: &[String]) {
        self.set_value(group, key, value.join(","));
    }

    pub fn remove_group(&mut self, group: &str) {
        self.groups.retain(|g| g.name != group);
    }

    pub fn remove_key(&mut self, group: &str, key: &str) {
        if let Some(idx) = self.index_of(group) {
            self.groups[idx].items.retain(|i| i.key != key);
        }
    }

    /// Merge `rhs` into this keyfile; values from `rhs` replace
    /// existing values key by key.
    pub fn merge(&mut self, rhs: &Keyfile) {
        for group in &rhs.groups {
            self.set_group(&group.name, &group.comment);
            let idx = self.index_of(&group.name).unwrap();
            for item in &group.items {
                self.set_item(idx, &item.key, &item.value, item.comment.clone(), item.line);
            }
        }
    }

    fn check_priority(&self, group: &str, key: &str, priority: Priority, present: bool) -> Result<()> {
        if !present {
            if priority == Priority::Required {
                return Err(KeyfileError::MissingKey {
                    group: group.to_string(),
                    key: key.to_string(),
                });
            }
            return Ok(());
        }

        match priority {
            Priority::Deprecated => {
                log::warn!(
                    "[{}]: a deprecated parameter '{}' has been specified; \
                     this option will be removed in the future",
                    group,
                    key
                );
            }
            Priority::Obsolete => {
                log::warn!(
                    "[{}]: an obsolete parameter '{}' has been specified; \
                     this option no longer has any effect",
                    group,
                    key
                );
            }
            Priority::Disallowed => {
                return Err(KeyfileError::DisallowedKey {
                    group: group.to_string(),
                    key: key.to_string(),
                });
            }
            _ => (),
        }

        Ok(())
    }

    pub fn get_string(&self, group: &str, key: &str, priority: Priority) -> Result<Option<String>> {
        let value = self.value(group, key).map(str::to_string);
        self.check_priority(group, key, priority, value.is_some())?;
        if priority == Priority::Obsolete {
            return Ok(None);
        }
        Ok(value)
    }

    pub fn get_bool(&self, group: &str, key: &str, priority: Priority) -> Result<Option<bool>> {
        match self.get_string(group, key, priority)? {
            Some(value) => match value.as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                _ => Err(KeyfileError::InvalidValue {
                    group: group.to_string(),
                    key: key.to_string(),
                    value,
                }),
            },
            None => Ok(None),
        }
    }

    pub fn get_uint(&self, group: &str, key: &str, priority: Priority) -> Result<Option<u32>> {
        match self.get_string(group, key, priority)? {
            Some(value) => value.parse::<u32>().map(Some).map_err(|_| {
                KeyfileError::InvalidValue {
                    group: group.to_string(),
                    key: key.to_string(),
                    value,
                }
            }),
            None => Ok(None),
        }
    }

    pub fn get_list(&self, group: &str, key: &str, priority: Priority) -> Result<Option<Vec<String>>> {
        Ok(self.get_string(group, key, priority)?.map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        }))
    }

    /// Localised string lookup.  Tries `key[ll_TT.charset]`,
    /// `key[ll_TT]`, `key[ll]` and finally the plain key.
    pub fn get_locale_string(&self, group: &str, key: &str, priority: Priority) -> Result<Option<String>> {
        for locale in locale_names() {
            let lkey = format!("{}[{}]", key, locale);
            if let Some(value) = self.value(group, &lkey) {
                self.check_priority(group, key, priority, true)?;
                if priority == Priority::Obsolete {
                    return Ok(None);
                }
                return Ok(Some(value.to_string()));
            }
        }
        self.get_string(group, key, priority)
    }

    /// Warn about keys present in a group but not consumed by the
    /// deserialiser.
    pub fn warn_unused(&self, group: &str, used: &HashSet<String>) {
        if let Some(found) = self.find_group(group) {
            for item in &found.items {
                if !used.contains(&item.key) {
                    log::warn!("[{}]: unknown key '{}' will be ignored", group, item.key);
                }
            }
        }
    }
}

/// Candidate locale names, most specific first, from the usual
/// environment variables.
fn locale_names() -> Vec<String> {
    let locale = ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.is_empty())
        .unwrap_or_default();

    let mut names = Vec::new();
    if locale.is_empty() || locale == "C" || locale == "POSIX" {
        return names;
    }

    names.push(locale.clone());
    let mut stripped = locale;
    if let Some(pos) = stripped.find('.') {
        stripped = stripped[..pos].to_string();
        names.push(stripped.clone());
    }
    if let Some(pos) = stripped.find('_') {
        names.push(stripped[..pos].to_string());
    }
    names
}

fn emit_comment(comment: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if comment.is_empty() {
        return Ok(());
    }
    for line in comment.split('\n') {
        writeln!(f, "#{}", line)?;
    }
    Ok(())
}

impl fmt::Display for Keyfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, group) in self.groups.iter().enumerate() {
            if idx != 0 {
                writeln!(f)?;
            }
            emit_comment(&group.comment, f)?;
            writeln!(f, "[{}]", group.name)?;
            for item in &group.items {
                emit_comment(&item.comment, f)?;
                writeln!(f, "{}={}", item.key, item.value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Test chroot collection
[sid]
type=directory
description=Debian unstable
directory=/srv/chroot/sid
users=alice,bob
# Aliases for convenience
aliases=unstable,default
run-setup-scripts=true
";

    #[test]
    fn test_parse_basic() {
        let kf = Keyfile::parse_str(SAMPLE).unwrap();
        assert_eq!(kf.groups(), vec!["sid"]);
        assert_eq!(
            kf.get_string("sid", "type", Priority::Required).unwrap(),
            Some("directory".to_string())
        );
        assert_eq!(
            kf.get_list("sid", "users", Priority::Optional).unwrap(),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
        assert_eq!(
            kf.get_bool("sid", "run-setup-scripts", Priority::Optional).unwrap(),
            Some(true)
        );
    }

    #[test]
    fn test_whitespace_trimmed() {
        let kf = Keyfile::parse_str("[g]\n  key  =  value with spaces  \n").unwrap();
        assert_eq!(
            kf.get_string("g", "key", Priority::Required).unwrap(),
            Some("value with spaces".to_string())
        );
    }

    #[test]
    fn test_list_element_trim() {
        let kf = Keyfile::parse_str("[g]\nusers= alice , bob ,,carol\n").unwrap();
        assert_eq!(
            kf.get_list("g", "users", Priority::Optional).unwrap(),
            Some(vec!["alice".into(), "bob".into(), "carol".into()])
        );
    }

    #[test]
    fn test_parse_error_has_line() {
        let err = Keyfile::parse_str("[g]\nnot a key value\n").unwrap_err();
        match err {
            KeyfileError::ParseError { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_key_outside_group_rejected() {
        assert!(Keyfile::parse_str("key=value\n").is_err());
    }

    #[test]
    fn test_required_missing() {
        let kf = Keyfile::parse_str("[g]\n").unwrap();
        match kf.get_string("g", "type", Priority::Required) {
            Err(KeyfileError::MissingKey { group, key }) => {
                assert_eq!(group, "g");
                assert_eq!(key, "type");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_disallowed_present() {
        let kf = Keyfile::parse_str("[g]\nmount-location=/mnt\n").unwrap();
        assert!(matches!(
            kf.get_string("g", "mount-location", Priority::Disallowed),
            Err(KeyfileError::DisallowedKey { .. })
        ));
        // Absent disallowed keys are fine.
        assert_eq!(
            kf.get_string("g", "mount-device", Priority::Disallowed).unwrap(),
            None
        );
    }

    #[test]
    fn test_obsolete_value_ignored() {
        let kf = Keyfile::parse_str("[g]\nold-key=value\n").unwrap();
        assert_eq!(
            kf.get_string("g", "old-key", Priority::Obsolete).unwrap(),
            None
        );
    }

    #[test]
    fn test_deprecated_value_still_read() {
        let kf = Keyfile::parse_str("[g]\nrun-session-scripts=true\n").unwrap();
        assert_eq!(
            kf.get_bool("g", "run-session-scripts", Priority::Deprecated).unwrap(),
            Some(true)
        );
    }

    #[test]
    fn test_invalid_bool() {
        let kf = Keyfile::parse_str("[g]\nflag=maybe\n").unwrap();
        assert!(matches!(
            kf.get_bool("g", "flag", Priority::Optional),
            Err(KeyfileError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_emit_round_trip() {
        let kf = Keyfile::parse_str(SAMPLE).unwrap();
        let emitted = kf.to_string();
        let reparsed = Keyfile::parse_str(&emitted).unwrap();
        assert_eq!(kf, reparsed);
    }

    #[test]
    fn test_merge_replaces_values() {
        let mut a = Keyfile::parse_str("[g]\nkey=old\nkeep=1\n").unwrap();
        let b = Keyfile::parse_str("[g]\nkey=new\n[h]\nother=2\n").unwrap();
        a.merge(&b);
        assert_eq!(a.get_string("g", "key", Priority::Optional).unwrap(), Some("new".into()));
        assert_eq!(a.get_string("g", "keep", Priority::Optional).unwrap(), Some("1".into()));
        assert_eq!(a.get_string("h", "other", Priority::Optional).unwrap(), Some("2".into()));
    }

    #[test]
    fn test_duplicate_key_replaces() {
        let kf = Keyfile::parse_str("[g]\nkey=a\nkey=b\n").unwrap();
        assert_eq!(kf.get_string("g", "key", Priority::Optional).unwrap(), Some("b".into()));
        assert_eq!(kf.keys("g").len(), 1);
    }

    #[test]
    fn test_locale_string_fallback() {
        let kf = Keyfile::parse_str("[g]\ndescription=plain\ndescription[en_GB]=tea\n").unwrap();
        // Without a matching locale in the environment the plain key wins.
        let value = kf.get_locale_string("g", "description", Priority::Optional).unwrap();
        assert!(value == Some("plain".into()) || value == Some("tea".into()));
    }

    quickcheck! {
        fn prop_round_trip(pairs: Vec<(u8, u8)>) -> bool {
            // Map arbitrary bytes onto a safe identifier alphabet; the
            // law under test is emit/parse stability, not tokenisation.
            let mut kf = Keyfile::new();
            for (i, (k, v)) in pairs.iter().enumerate() {
                let group = format!("group{}", i % 3);
                let key = format!("key{}", k);
                let value = format!("value{}", v);
                kf.set_value(&group, &key, value);
            }
            let reparsed = Keyfile::parse_str(&kf.to_string()).unwrap();
            reparsed == kf
        }
    }
}
