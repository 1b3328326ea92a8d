//! HTTP header storage that preserves original case but looks up
//! case-insensitively.
//!
//! A generalization of the teacher's `HTTPHeader::get_header`, which already
//! falls back to a case-insensitive scan; here that's the primary behavior,
//! backed by a map keyed on the lowercased name.

use std::collections::HashMap;

/// Header storage preserving the original-case name of the first
/// occurrence of each header, case-insensitive on lookup.
#[derive(Clone, Debug, Default)]
pub struct HeaderMap {
    // lowercased name -> (original-case name, value)
    entries: HashMap<String, (String, String)>,
    // insertion order, for stable serialization
    order: Vec<String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header. If the (case-insensitive) name already exists,
    /// only the value is updated — the original-case name of the *first*
    /// occurrence is preserved, per spec §3's header-storage invariant.
    pub fn insert(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.1 = value.to_string();
        } else {
            self.order.push(key.clone());
            self.entries.insert(key, (name.to_string(), value.to_string()));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) {
        let key = name.to_ascii_lowercase();
        if self.entries.remove(&key).is_some() {
            self.order.retain(|k| k != &key);
        }
    }

    /// Iterates headers in first-seen order as `(original-case name, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order.iter().map(move |k| {
            let (name, value) = &self.entries[k];
            (name.as_str(), value.as_str())
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Parses one `name: value` header line. The value is trimmed; only the
    /// first colon splits name from value, so colons inside the value (e.g.
    /// in a `Date` header) are preserved.
    pub fn parse_line(&mut self, line: &str) -> bool {
        match line.split_once(':') {
            Some((name, value)) => {
                self.insert(name.trim(), value.trim());
                true
            }
            None => false,
        }
    }

    /// Serializes headers as `name: value\r\n` pairs, skipping any header
    /// whose lowercased name is in `disable`.
    pub fn build(&self, disable: &std::collections::HashSet<String>) -> String {
        let mut out = String::new();
        for key in &self.order {
            if disable.contains(key) {
                continue;
            }
            let (name, value) = &self.entries[key];
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_first_occurrence_case() {
        let mut h = HeaderMap::new();
        h.insert("Content-Type", "text/plain");
        h.insert("content-type", "text/html");
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/html"));
        assert_eq!(h.iter().next().unwrap().0, "Content-Type");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.insert("Host", "example.org");
        assert_eq!(h.get("host"), Some("example.org"));
        assert_eq!(h.get("HOST"), Some("example.org"));
    }

    #[test]
    fn only_first_colon_splits_value() {
        let mut h = HeaderMap::new();
        assert!(h.parse_line("Date: Mon, 01 Jan 2024 00:00:00 GMT"));
        assert_eq!(h.get("Date"), Some("Mon, 01 Jan 2024 00:00:00 GMT"));
    }

    #[test]
    fn build_skips_disabled_headers() {
        let mut h = HeaderMap::new();
        h.insert("Proxy-Connection", "keep-alive");
        h.insert("Host", "example.org");
        let mut disable = std::collections::HashSet::new();
        disable.insert("proxy-connection".to_string());
        let built = h.build(&disable);
        assert!(!built.contains("Proxy-Connection"));
        assert!(built.contains("Host: example.org"));
    }
}
