//! Ordered environment container used to build script and child
//! process environments.  At most one value is stored per name; adding
//! an existing name replaces the value in place, preserving the
//! original insertion position.

use std::ffi::CString;
use std::fmt;

use regex::Regex;

#[derive(Debug, Clone, Default)]
pub struct Environment {
    entries: Vec<(String, String)>,
    filter: Option<Regex>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the calling process environment.
    pub fn from_process() -> Self {
        let mut env = Self::new();
        for (name, value) in std::env::vars() {
            env.add_pair(&name, &value);
        }
        env
    }

    /// Set the name filter.  Names matching the expression are dropped
    /// on addition; entries already present are unaffected.
    pub fn set_filter(&mut self, filter: Option<Regex>) {
        self.filter = filter;
    }

    pub fn filter(&self) -> Option<&Regex> {
        self.filter.as_ref()
    }

    fn filtered(&self, name: &str) -> bool {
        if let Some(filter) = &self.filter {
            if filter.is_match(name) {
                log::debug!("environment filter rejected '{}'", name);
                return true;
            }
        }
        false
    }

    /// Add a name/value pair.  Entries with an empty value are dropped.
    pub fn add_pair(&mut self, name: &str, value: &str) {
        if name.is_empty() || value.is_empty() || self.filtered(name) {
            return;
        }
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value.to_string();
        } else {
            self.entries.push((name.to_string(), value.to_string()));
        }
    }

    /// Add a `NAME=VALUE` string.  Strings without a separator are
    /// dropped.
    pub fn add_str(&mut self, var: &str) {
        match var.find('=') {
            Some(pos) => {
                let (name, value) = var.split_at(pos);
                self.add_pair(name, &value[1..]);
            }
            None => {
                log::debug!("environment variable '{}' has no value, dropped", var);
            }
        }
    }

    /// Merge another environment into this one.
    pub fn add(&mut self, other: &Environment) {
        for (name, value) in &other.entries {
            self.add_pair(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    /// Remove every name present in `other`.
    pub fn remove_all(&mut self, other: &Environment) {
        self.entries.retain(|(n, _)| other.get(n).is_none());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Freshly allocated `NAME=VALUE` strings in insertion order,
    /// suitable for execve.
    pub fn to_argv(&self) -> Vec<CString> {
        self.entries
            .iter()
            .map(|(n, v)| CString::new(format!("{}={}", n, v)).unwrap_or_default())
            .collect()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            writeln!(f, "{}={}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_replace() {
        let mut env = Environment::new();
        env.add_pair("TERM", "xterm");
        env.add_pair("USER", "alice");
        env.add_pair("TERM", "linux");
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("TERM"), Some("linux"));
        // Replacement keeps insertion order.
        let names: Vec<&str> = env.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["TERM", "USER"]);
    }

    #[test]
    fn test_empty_value_dropped() {
        let mut env = Environment::new();
        env.add_pair("EMPTY", "");
        env.add_str("ALSO_EMPTY=");
        env.add_str("NO_SEPARATOR");
        assert!(env.is_empty());
    }

    #[test]
    fn test_add_str() {
        let mut env = Environment::new();
        env.add_str("PATH=/usr/bin:/bin");
        env.add_str("EQ=a=b");
        assert_eq!(env.get("PATH"), Some("/usr/bin:/bin"));
        assert_eq!(env.get("EQ"), Some("a=b"));
    }

    #[test]
    fn test_filter_rejects_on_add() {
        let mut env = Environment::new();
        env.set_filter(Some(Regex::new("^(LD_.*|TERM)$").unwrap()));
        env.add_pair("LD_PRELOAD", "/tmp/evil.so");
        env.add_pair("TERM", "xterm");
        env.add_pair("HOME", "/home/alice");
        assert!(!env.contains("LD_PRELOAD"));
        assert!(!env.contains("TERM"));
        assert_eq!(env.get("HOME"), Some("/home/alice"));
    }

    #[test]
    fn test_merge_and_diff() {
        let mut base = Environment::new();
        base.add_pair("A", "1");
        base.add_pair("B", "2");

        let mut extra = Environment::new();
        extra.add_pair("B", "3");
        extra.add_pair("C", "4");

        let mut merged = base.clone();
        merged.add(&extra);
        assert_eq!(merged.get("B"), Some("3"));
        assert_eq!(merged.get("C"), Some("4"));

        merged.remove_all(&extra);
        assert_eq!(merged.get("A"), Some("1"));
        assert!(!merged.contains("B"));
        assert!(!merged.contains("C"));
    }

    #[test]
    fn test_to_argv_order() {
        let mut env = Environment::new();
        env.add_pair("ONE", "1");
        env.add_pair("TWO", "2");
        let argv = env.to_argv();
        assert_eq!(argv[0].to_str().unwrap(), "ONE=1");
        assert_eq!(argv[1].to_str().unwrap(), "TWO=2");
    }
}
