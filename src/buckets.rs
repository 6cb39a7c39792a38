//! Buckets are the aggregation window's storage type.
//!
//! A bucket is keyed by metric identity, the name plus tag set, and holds one
//! `Summary` per numeric field seen for that identity during the window.
//! Identities are located through their seahash so a lookup does not hash
//! every tag string twice; hash collisions are resolved by comparing names and
//! tags.

use crate::metric::{Metric, TagMap};
use quantiles::ckms::CKMS;
use std::collections::{BTreeMap, HashMap};

/// Running statistics of a single field.
#[derive(Clone, Debug)]
pub struct Summary {
    /// Number of values seen.
    pub count: u64,
    /// Smallest value seen.
    pub min: f64,
    /// Largest value seen.
    pub max: f64,
    /// Sum of all values.
    pub sum: f64,
    ckms: CKMS<f64>,
}

impl Summary {
    fn new(error: f64, value: f64) -> Summary {
        let mut ckms = CKMS::new(error);
        ckms.insert(value);
        Summary {
            count: 1,
            min: value,
            max: value,
            sum: value,
            ckms,
        }
    }

    fn insert(&mut self, value: f64) {
        self.count += 1;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.sum += value;
        self.ckms.insert(value);
    }

    /// Arithmetic mean of the values seen.
    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }

    /// Approximate value at quantile `q`, within the bucket's error bound.
    pub fn query(&self, q: f64) -> Option<f64> {
        self.ckms.query(q).map(|(_, v)| v)
    }
}

/// All summaries of one identity.
#[derive(Clone, Debug)]
pub struct Entry {
    /// Metric name.
    pub name: String,
    /// Metric tags.
    pub tags: TagMap,
    /// Per field statistics, ordered by field key.
    pub fields: BTreeMap<String, Summary>,
}

/// Buckets stores field statistics until they are pushed.
#[derive(Debug)]
pub struct Buckets {
    entries: HashMap<u64, Vec<Entry>>,
    error: f64,
    len: usize,
}

impl Default for Buckets {
    /// Create a default Buckets, with quantile error bound 0.001.
    ///
    /// # Examples
    ///
    /// ```
    /// use tally::buckets::Buckets;
    ///
    /// let bucket = Buckets::default();
    /// assert!(bucket.is_empty());
    /// ```
    fn default() -> Buckets {
        Buckets::new(0.001)
    }
}

impl Buckets {
    /// Create an empty Buckets whose quantile estimates are within `error`.
    pub fn new(error: f64) -> Buckets {
        Buckets {
            entries: HashMap::new(),
            error,
            len: 0,
        }
    }

    /// Fold every numeric field of `metric` into its identity's summaries.
    /// String and boolean fields are ignored, as are non-finite floats.
    ///
    /// # Examples
    ///
    /// ```
    /// use tally::buckets::Buckets;
    /// use tally::metric::Metric;
    ///
    /// let mut buckets = Buckets::default();
    /// buckets.add(&Metric::new("cpu").field("usage", 10));
    /// buckets.add(&Metric::new("cpu").field("usage", 30));
    /// assert_eq!(1, buckets.len());
    /// ```
    pub fn add(&mut self, metric: &Metric) {
        let error = self.error;
        let slot = self.entries.entry(metric.identity_hash()).or_insert_with(Vec::new);
        let idx = match slot
            .iter()
            .position(|e| e.name == metric.name() && &e.tags == metric.tags())
        {
            Some(idx) => idx,
            None => {
                slot.push(Entry {
                    name: metric.name().to_string(),
                    tags: metric.tags().clone(),
                    fields: BTreeMap::new(),
                });
                self.len += 1;
                slot.len() - 1
            }
        };
        let entry = &mut slot[idx];
        for (key, value) in metric.fields() {
            if value.is_non_finite() {
                continue;
            }
            let v = match value.as_f64() {
                Some(v) => v,
                None => continue,
            };
            if let Some(summary) = entry.fields.get_mut(key) {
                summary.insert(v);
                continue;
            }
            entry.fields.insert(key.clone(), Summary::new(error, v));
        }
    }

    /// Iterate over every stored identity. Order is unspecified.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().flat_map(|v| v.iter())
    }

    /// Remove everything.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.len = 0;
    }

    /// Number of distinct identities stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
