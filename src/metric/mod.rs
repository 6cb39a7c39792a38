//! The unit of telemetry moved through the agent.
//!
//! A `Metric` is a name, a `TagMap`, a set of typed fields and a nanosecond
//! timestamp. Metrics are plain values: every stage of the pipeline takes
//! ownership of the metric it is handed and either forwards, drops, replaces or
//! splits it. The builder methods below all consume `self` and return the
//! transformed metric, so there is never a second live alias to mutate.

mod tagmap;
mod value;

pub use self::tagmap::TagMap;
pub use self::value::FieldValue;

use crate::time;
use seahash::SeaHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// The fields of a metric, ordered by key.
pub type Fields = BTreeMap<String, FieldValue>;

/// A single telemetry data point. See module documentation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    name: String,
    tags: TagMap,
    fields: Fields,
    timestamp: i64,
}

impl Metric {
    /// Create a new metric with no tags, no fields and the current time as
    /// timestamp.
    ///
    /// # Examples
    ///
    /// ```
    /// use tally::metric::Metric;
    ///
    /// let m = Metric::new("cpu").overlay_tag("host", "a").field("usage", 10);
    /// assert_eq!("cpu", m.name());
    /// assert_eq!(Some("a"), m.tags().get("host"));
    /// ```
    pub fn new<S>(name: S) -> Metric
    where
        S: Into<String>,
    {
        Metric {
            name: name.into(),
            tags: TagMap::default(),
            fields: Fields::new(),
            timestamp: time::now_ns(),
        }
    }

    /// Set the timestamp, in nanoseconds since the Unix epoch.
    pub fn time(mut self, timestamp: i64) -> Metric {
        self.timestamp = timestamp;
        self
    }

    /// Replace the name.
    pub fn rename<S>(mut self, name: S) -> Metric
    where
        S: Into<String>,
    {
        self.name = name.into();
        self
    }

    /// Set a field, replacing any prior value under the same key.
    pub fn field<K, V>(mut self, key: K, value: V) -> Metric
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Set a tag, replacing any prior value under the same key.
    pub fn overlay_tag<K, V>(mut self, key: K, val: V) -> Metric
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.insert(key, val);
        self
    }

    /// Set every tag of `map`, replacing prior values.
    pub fn overlay_tags_from_map(mut self, map: &TagMap) -> Metric {
        self.tags.overlay(map);
        self
    }

    /// Set the tags of `map` which the metric does not already carry.
    pub fn merge_tags_from_map(mut self, map: &TagMap) -> Metric {
        self.tags.merge(map);
        self
    }

    /// Remove a tag.
    pub fn remove_tag(mut self, key: &str) -> Metric {
        self.tags.remove(key);
        self
    }

    /// Keep only the tags for which `f` returns true.
    pub fn retain_tags<F>(mut self, f: F) -> Metric
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.tags.retain(f);
        self
    }

    /// Keep only the fields for which `f` returns true.
    pub fn retain_fields<F>(mut self, mut f: F) -> Metric
    where
        F: FnMut(&str, &FieldValue) -> bool,
    {
        let fields = ::std::mem::replace(&mut self.fields, Fields::new());
        self.fields = fields.into_iter().filter(|&(ref k, ref v)| f(k.as_str(), v)).collect();
        self
    }

    /// Round the timestamp to the nearest multiple of `precision_ns`.
    pub fn round_time(mut self, precision_ns: i64) -> Metric {
        self.timestamp = time::round_ns(self.timestamp, precision_ns);
        self
    }

    /// The metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The metric tags.
    pub fn tags(&self) -> &TagMap {
        &self.tags
    }

    /// All metric fields.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// A single field, if present.
    pub fn get_field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// The timestamp in nanoseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Hash of the metric's identity: its name and tags. The timestamp and
    /// fields do not participate.
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = SeaHasher::new();
        self.name.hash(&mut hasher);
        self.tags.hash(&mut hasher);
        hasher.finish()
    }

    /// Whether `other` has the same name and tags as self.
    pub fn same_identity(&self, other: &Metric) -> bool {
        self.name == other.name && self.tags == other.tags
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_ignores_time_and_fields() {
        let m0 = Metric::new("cpu").overlay_tag("host", "a").field("usage", 10).time(1);
        let m1 = Metric::new("cpu").overlay_tag("host", "a").field("idle", 90).time(2);
        let m2 = Metric::new("cpu").overlay_tag("host", "b").field("usage", 10).time(1);

        assert_eq!(m0.identity_hash(), m1.identity_hash());
        assert!(m0.same_identity(&m1));
        assert!(!m0.same_identity(&m2));
        assert_ne!(m0.identity_hash(), m2.identity_hash());
    }

    #[test]
    fn tag_order_does_not_change_identity() {
        let m0 = Metric::new("cpu").overlay_tag("a", "1").overlay_tag("b", "2");
        let m1 = Metric::new("cpu").overlay_tag("b", "2").overlay_tag("a", "1");
        assert_eq!(m0.identity_hash(), m1.identity_hash());
    }

    #[test]
    fn merge_keeps_own_tags() {
        let global: TagMap = vec![("host", "global"), ("dc", "x")].into_iter().collect();
        let m = Metric::new("cpu").overlay_tag("host", "a").merge_tags_from_map(&global);
        assert_eq!(Some("a"), m.tags().get("host"));
        assert_eq!(Some("x"), m.tags().get("dc"));
    }

    #[test]
    fn retain_fields_filters() {
        let m = Metric::new("cpu")
            .field("usage", 10)
            .field("idle", 90)
            .retain_fields(|k, _| k != "idle");
        assert_eq!(1, m.fields().len());
        assert!(m.get_field("usage").is_some());
    }

    #[test]
    fn round_time_to_precision() {
        let m = Metric::new("cpu").time(1_499_999_999).round_time(1_000_000_000);
        assert_eq!(1_000_000_000, m.timestamp());
        let m = Metric::new("cpu").time(1_500_000_000).round_time(1_000_000_000);
        assert_eq!(2_000_000_000, m.timestamp());
    }
}
