//! tagmap is the ordered set of key, value pairs that sits inside each
//! `Metric`. Think of it as a specialized map. Tags distinguish identically
//! named metrics that come from different hosts, devices or sources.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::slice::Iter;

/// The tagmap key, value collection. Behaves similarly to
/// `std::collections::BTreeMap<String, String>` but is stored as a vector kept
/// sorted by key, which is faster for the handful of tags a metric carries.
///
/// Keys are unique. Iteration is always in key order, which makes a tagmap's
/// hash and wire rendering deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TagMap {
    inner: Vec<(String, String)>,
}

impl Hash for TagMap {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for &(ref k, ref v) in self.iter() {
            k.hash(state);
            v.hash(state);
        }
    }
}

/// A tagmap serializes as a plain string to string map, which is also how it
/// is written in configuration files.
impl Serialize for TagMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(self.inner.iter().map(|&(ref k, ref v)| (k, v)))
    }
}

impl<'de> Deserialize<'de> for TagMap {
    fn deserialize<D>(deserializer: D) -> Result<TagMap, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map: BTreeMap<String, String> = BTreeMap::deserialize(deserializer)?;
        Ok(map.into_iter().collect())
    }
}

impl TagMap {
    /// Create a `tagmap::Iter`, in key order.
    pub fn iter(&self) -> Iter<(String, String)> {
        self.inner.iter()
    }

    fn position(&self, key: &str) -> Result<usize, usize> {
        self.inner
            .binary_search_by(|probe| probe.0.as_str().cmp(key))
    }

    /// Get a value from the tagmap, if it exists.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self.position(key) {
            Ok(idx) => Some(&self.inner[idx].1),
            Err(_) => None,
        }
    }

    /// Determine if the tagmap holds `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_ok()
    }

    /// Remove a value from the tagmap. The value will be returned if it
    /// existed.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        match self.position(key) {
            Ok(idx) => Some(self.inner.remove(idx).1),
            Err(_) => None,
        }
    }

    /// Insert a key / value into self
    ///
    /// This method will return the value previously stored under the given
    /// key, if there was such a value.
    pub fn insert<K, V>(&mut self, key: K, val: V) -> Option<String>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let key = key.into();
        let val = val.into();
        match self.position(&key) {
            Ok(idx) => Some(::std::mem::replace(&mut self.inner[idx].1, val)),
            Err(idx) => {
                self.inner.insert(idx, (key, val));
                None
            }
        }
    }

    /// Merge two tagmaps
    ///
    /// Keys already present in self are kept as-is. Keys in `other` that do
    /// not exist in self are created.
    pub fn merge(&mut self, other: &TagMap) {
        for &(ref key, ref val) in &other.inner {
            if let Err(idx) = self.position(key) {
                self.inner.insert(idx, (key.clone(), val.clone()));
            }
        }
    }

    /// Overlay two tagmaps
    ///
    /// Unlike `merge` every key / value of `other` wins over what self holds.
    pub fn overlay(&mut self, other: &TagMap) {
        for &(ref key, ref val) in &other.inner {
            self.insert(key.clone(), val.clone());
        }
    }

    /// Retain only the pairs for which `f` returns true.
    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.inner.retain(|&(ref k, ref v)| f(k.as_str(), v.as_str()))
    }

    /// Determine if the tagmap is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Return the length of the tagmap. This is the total number of key /
    /// values stored in the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl<'a> IntoIterator for &'a TagMap {
    type Item = &'a (String, String);
    type IntoIter = Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl<K, V> ::std::iter::FromIterator<(K, V)> for TagMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> TagMap {
        let mut tags = TagMap::default();
        for (k, v) in iter {
            tags.insert(k, v);
        }
        tags
    }
}

impl PartialOrd for TagMap {
    fn partial_cmp(&self, other: &TagMap) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TagMap {
    /// Shorter tagmaps order first, then pairwise by key and value.
    fn cmp(&self, other: &TagMap) -> cmp::Ordering {
        match self.len().cmp(&other.len()) {
            cmp::Ordering::Equal => self.inner.cmp(&other.inner),
            ord => ord,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};

    #[test]
    fn insert_keeps_keys_sorted_and_unique() {
        fn inner(pairs: Vec<(String, String)>) -> TestResult {
            let mut tags = TagMap::default();
            for &(ref k, ref v) in &pairs {
                tags.insert(k.clone(), v.clone());
            }
            let keys: Vec<&String> = tags.iter().map(|&(ref k, _)| k).collect();
            for win in keys.windows(2) {
                if win[0] >= win[1] {
                    return TestResult::failed();
                }
            }
            // last write wins
            for &(ref k, _) in &pairs {
                let last = pairs.iter().rev().find(|&&(ref pk, _)| pk == k).unwrap();
                if tags.get(k) != Some(last.1.as_str()) {
                    return TestResult::failed();
                }
            }
            TestResult::passed()
        }
        QuickCheck::new()
            .tests(1000)
            .quickcheck(inner as fn(Vec<(String, String)>) -> TestResult);
    }

    #[test]
    fn insert_replaces_value() {
        let mut tags = TagMap::default();
        assert_eq!(None, tags.insert("host", "a"));
        assert_eq!(Some("a".to_string()), tags.insert("host", "b"));
        assert_eq!(Some("b"), tags.get("host"));
        assert_eq!(1, tags.len());
    }

    #[test]
    fn merge_does_not_overwrite() {
        let mut left: TagMap = vec![("host", "a")].into_iter().collect();
        let right: TagMap = vec![("host", "b"), ("dc", "x")].into_iter().collect();
        left.merge(&right);
        assert_eq!(Some("a"), left.get("host"));
        assert_eq!(Some("x"), left.get("dc"));
    }

    #[test]
    fn overlay_overwrites() {
        let mut left: TagMap = vec![("host", "a")].into_iter().collect();
        let right: TagMap = vec![("host", "b")].into_iter().collect();
        left.overlay(&right);
        assert_eq!(Some("b"), left.get("host"));
    }

    #[test]
    fn remove_and_retain() {
        let mut tags: TagMap = vec![("a", "1"), ("b", "2"), ("c", "3")]
            .into_iter()
            .collect();
        assert_eq!(Some("2".to_string()), tags.remove("b"));
        assert_eq!(None, tags.remove("b"));
        tags.retain(|k, _| k != "c");
        assert_eq!(1, tags.len());
        assert!(tags.contains_key("a"));
    }
}
