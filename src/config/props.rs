//! Flat key/value properties for live parameter updates.
//!
//! The metadata server pushes configuration as untyped `name = value`
//! pairs; `Properties` holds one such batch and offers the typed getters
//! the engine needs when folding a batch into its [`Config`].
//!
//! [`Config`]: super::Config

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        let raw = self.get(name)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(name, raw, "ignoring unparsable numeric property: {err}");
                None
            }
        }
    }

    pub fn get_usize(&self, name: &str) -> Option<usize> {
        self.get_i64(name).and_then(|v| usize::try_from(v).ok())
    }

    /// Boolean properties arrive as integers; any non-zero value is true.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get_i64(name).map(|v| v != 0)
    }

    /// Extracts every property under `prefix`, with the prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> Properties {
        let mut out = Properties::new();
        for (name, value) in &self.0 {
            if let Some(rest) = name.strip_prefix(prefix) {
                out.set(rest, value.clone());
            }
        }
        out
    }

    /// Merges `other` into `self`, returning true when any value changed.
    pub fn merge_from(&mut self, other: &Properties) -> bool {
        let mut changed = false;
        for (name, value) in &other.0 {
            if self.0.get(name) != Some(value) {
                self.0.insert(name.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut props = Properties::new();
        for (name, value) in iter {
            props.set(name, value);
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters() {
        let mut props = Properties::new();
        props.set("a.count", "42");
        props.set("a.flag", "1");
        props.set("a.off", "0");
        props.set("a.junk", "not-a-number");

        assert_eq!(props.get_i64("a.count"), Some(42));
        assert_eq!(props.get_bool("a.flag"), Some(true));
        assert_eq!(props.get_bool("a.off"), Some(false));
        assert_eq!(props.get_i64("a.junk"), None);
        assert_eq!(props.get_i64("a.missing"), None);
    }

    #[test]
    fn prefix_extraction_strips_prefix() {
        let props: Properties = [
            ("rsReader.auth.psk.keyId", "k1"),
            ("rsReader.auth.psk.key", "secret"),
            ("rsReader.maxReadSize", "65536"),
        ]
        .into_iter()
        .collect();

        let auth = props.with_prefix("rsReader.auth.");
        assert_eq!(auth.get("psk.keyId"), Some("k1"));
        assert_eq!(auth.get("psk.key"), Some("secret"));
        assert_eq!(auth.get("maxReadSize"), None);
    }

    #[test]
    fn merge_reports_changes() {
        let mut base: Properties = [("k", "v")].into_iter().collect();
        let same: Properties = [("k", "v")].into_iter().collect();
        let update: Properties = [("k", "v2")].into_iter().collect();

        assert!(!base.merge_from(&same));
        assert!(base.merge_from(&update));
        assert_eq!(base.get("k"), Some("v2"));
    }
}
