use crate::{Result, TallyError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Label pairs of one series, canonical by construction.
///
/// Names are unique and iterate in sorted order, so two sets built from the
/// same pairs in any order compare, hash and encode identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs, rejecting a name that appears twice.
    pub fn try_from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels = BTreeMap::new();
        for (name, value) in pairs {
            let name = name.into();
            if labels.contains_key(&name) {
                return Err(TallyError::Config(format!("duplicate label name: {name}")));
            }
            labels.insert(name, value.into());
        }
        Ok(Self(labels))
    }

    /// Builder-style insert; replaces an existing value for `name`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}=\"{value}\"")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_order_insignificant() {
        let a = LabelSet::try_from_pairs([("method", "GET"), ("code", "200")]).unwrap();
        let b = LabelSet::try_from_pairs([("code", "200"), ("method", "GET")]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "{code=\"200\",method=\"GET\"}");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = LabelSet::try_from_pairs([("code", "200"), ("code", "500")]);
        assert!(matches!(result, Err(TallyError::Config(_))));
    }

    #[test]
    fn test_empty_display() {
        assert_eq!(LabelSet::new().to_string(), "{}");
        assert!(LabelSet::new().is_empty());
    }
}
