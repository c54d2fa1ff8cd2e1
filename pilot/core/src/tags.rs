use crate::{error::ValidationError, validation::is_tag_part};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, convert::Infallible, fmt, str::FromStr};

/// A set of key-value pairs that selects a subset of a service's instances,
/// e.g. `version=v1`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, String>);

/// A disjunction of tag sets. An empty list matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagsList(Vec<Tags>);

// === impl Tags ===

impl Tags {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl ToString, value: impl ToString) -> Option<String> {
        self.0.insert(key.to_string(), value.to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True if every pair of `self` is also present in `other`.
    pub fn subset_of(&self, other: &Tags) -> bool {
        self.0
            .iter()
            .all(|(k, v)| other.0.get(k).map(|ov| ov == v).unwrap_or(false))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        for (k, v) in &self.0 {
            if k.is_empty() || !is_tag_part(k) {
                errs.push(format!("invalid tag key: {k:?}"));
            }
            if !is_tag_part(v) {
                errs.push(format!("invalid tag value: {v:?}"));
            }
        }
        errs.into_result()
    }
}

impl<K: ToString, V: ToString> FromIterator<(K, V)> for Tags {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, String>> for Tags {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Formats as sorted, comma-separated `k=v` pairs. Keys with an empty value
/// are written bare.
impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs = self
            .0
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>();
        pairs.sort();
        f.write_str(&pairs.join(","))
    }
}

impl FromStr for Tags {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tags = s
            .split(',')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            })
            .collect();
        Ok(tags)
    }
}

// === impl TagsList ===

impl TagsList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tags> {
        self.0.iter()
    }

    /// True if the list is empty or any of its tag sets is a subset of
    /// `tags`.
    pub fn has_subset_of(&self, tags: &Tags) -> bool {
        self.0.is_empty() || self.0.iter().any(|t| t.subset_of(tags))
    }
}

impl From<Vec<Tags>> for TagsList {
    fn from(tags: Vec<Tags>) -> Self {
        Self(tags)
    }
}

impl FromIterator<Tags> for TagsList {
    fn from_iter<T: IntoIterator<Item = Tags>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for TagsList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for tags in &self.0 {
            if !first {
                f.write_str(";")?;
            }
            first = false;
            fmt::Display::fmt(tags, f)?;
        }
        Ok(())
    }
}
