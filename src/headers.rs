//! case insensitive, multi valued header map
//!
//! exchanges rewrite and re-emit whole header blocks, so headers are kept as
//! an ordered list of name/value pairs with case preserved for forwarding

use std::fmt;

use crate::parser::compare_no_case;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap {
            entries: Vec::with_capacity(16),
        }
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
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

    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| compare_no_case(n.as_bytes(), name.as_bytes()))
            .map(|(_, v)| v.as_str())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| compare_no_case(n.as_bytes(), name.as_bytes()))
            .map(|(_, v)| v.as_str())
    }

    pub fn count(&self, name: &str) -> usize {
        self.values(name).count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first(name).is_some()
    }

    /// removes every value of a header, returning how many were dropped
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(n, _)| !compare_no_case(n.as_bytes(), name.as_bytes()));
        before - self.entries.len()
    }

    /// replaces every value of a header with a single one
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.push(name, value);
    }

    /// true if one of `name`'s comma separated values matches `token`
    /// (`Connection: keep-alive, Upgrade` style lists)
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.values(name).any(|value| contains_token(value, token))
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in self.entries.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (name, value) in self.entries.iter() {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

pub fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| compare_no_case(part.trim().as_bytes(), token.as_bytes()))
}
