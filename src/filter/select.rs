//! Metric selection by name, tag and field glob patterns, and metric name
//! modification.
//!
//! The same `Selector` is used three ways: as the `select` processor, in front
//! of every destination's delivery buffer, and in front of every aggregator.

use crate::filter;
use crate::metric::Metric;
use glob::{Pattern, PatternError};
use std::collections::BTreeMap;

/// Raw selector settings as they appear in configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectorConfig {
    /// Only names matching one of these pass. Empty passes everything.
    pub namepass: Vec<String>,
    /// Names matching one of these are dropped.
    pub namedrop: Vec<String>,
    /// Only metrics with a tag matching one of these pass. Keys are tag keys,
    /// values are patterns for the tag value.
    pub tagpass: BTreeMap<String, Vec<String>>,
    /// Metrics with a tag matching one of these are dropped.
    pub tagdrop: BTreeMap<String, Vec<String>>,
    /// Only fields whose key matches one of these are kept.
    pub fieldpass: Vec<String>,
    /// Fields whose key matches one of these are removed.
    pub fielddrop: Vec<String>,
}

/// Raw name modifier settings as they appear in configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct NameModifier {
    /// Replace the metric name.
    pub name_override: Option<String>,
    /// Prepend to the metric name.
    pub name_prefix: Option<String>,
    /// Append to the metric name.
    pub name_suffix: Option<String>,
}

impl NameModifier {
    /// Whether applying the modifier would leave names untouched.
    pub fn is_noop(&self) -> bool {
        self.name_override.is_none() && self.name_prefix.is_none() && self.name_suffix.is_none()
    }

    /// Rename `metric`. The override applies first, then prefix and suffix.
    pub fn apply(&self, metric: Metric) -> Metric {
        if self.is_noop() {
            return metric;
        }
        let mut name = match self.name_override {
            Some(ref n) => n.clone(),
            None => metric.name().to_string(),
        };
        if let Some(ref prefix) = self.name_prefix {
            name.insert_str(0, prefix);
        }
        if let Some(ref suffix) = self.name_suffix {
            name.push_str(suffix);
        }
        metric.rename(name)
    }
}

fn compile(raw: &[String]) -> Result<Vec<Pattern>, PatternError> {
    raw.iter().map(|p| Pattern::new(p)).collect()
}

fn compile_tags(
    raw: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<(String, Vec<Pattern>)>, PatternError> {
    raw.iter()
        .map(|(k, v)| compile(v).map(|p| (k.clone(), p)))
        .collect()
}

fn any_match(patterns: &[Pattern], s: &str) -> bool {
    patterns.iter().any(|p| p.matches(s))
}

fn tag_match(rules: &[(String, Vec<Pattern>)], metric: &Metric) -> bool {
    rules.iter().any(|&(ref key, ref patterns)| match metric.tags().get(key) {
        Some(val) => any_match(patterns, val),
        None => false,
    })
}

/// Compiled selector. See `SelectorConfig` for the meaning of each rule.
#[derive(Clone, Debug, Default)]
pub struct Selector {
    namepass: Vec<Pattern>,
    namedrop: Vec<Pattern>,
    tagpass: Vec<(String, Vec<Pattern>)>,
    tagdrop: Vec<(String, Vec<Pattern>)>,
    fieldpass: Vec<Pattern>,
    fielddrop: Vec<Pattern>,
}

impl Selector {
    /// Compile the patterns of `config`.
    pub fn new(config: &SelectorConfig) -> Result<Selector, PatternError> {
        Ok(Selector {
            namepass: compile(&config.namepass)?,
            namedrop: compile(&config.namedrop)?,
            tagpass: compile_tags(&config.tagpass)?,
            tagdrop: compile_tags(&config.tagdrop)?,
            fieldpass: compile(&config.fieldpass)?,
            fielddrop: compile(&config.fielddrop)?,
        })
    }

    /// Whether the metric's name and tags pass. Fields are not considered.
    pub fn accepts(&self, metric: &Metric) -> bool {
        if !self.namepass.is_empty() && !any_match(&self.namepass, metric.name()) {
            return false;
        }
        if any_match(&self.namedrop, metric.name()) {
            return false;
        }
        if !self.tagpass.is_empty() && !tag_match(&self.tagpass, metric) {
            return false;
        }
        !tag_match(&self.tagdrop, metric)
    }

    /// Apply every rule. Returns `None` when the metric is rejected or no
    /// fields remain after field filtering.
    pub fn select(&self, metric: Metric) -> Option<Metric> {
        if !self.accepts(&metric) {
            return None;
        }
        if self.fieldpass.is_empty() && self.fielddrop.is_empty() {
            return Some(metric);
        }
        let fieldpass = &self.fieldpass;
        let fielddrop = &self.fielddrop;
        let metric = metric.retain_fields(|k, _| {
            (fieldpass.is_empty() || any_match(fieldpass, k)) && !any_match(fielddrop, k)
        });
        if metric.fields().is_empty() {
            None
        } else {
            Some(metric)
        }
    }
}

/// Configuration for `SelectFilter`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SelectConfig {
    /// Selection rules.
    #[serde(flatten)]
    pub selector: SelectorConfig,
    /// Renaming applied to selected metrics.
    #[serde(flatten)]
    pub modifier: NameModifier,
}

/// The `select` processor: drops metrics a `Selector` rejects and renames the
/// rest.
pub struct SelectFilter {
    selector: Selector,
    modifier: NameModifier,
}

impl SelectFilter {
    /// Create a new SelectFilter.
    pub fn new(config: SelectConfig) -> Result<SelectFilter, PatternError> {
        Ok(SelectFilter {
            selector: Selector::new(&config.selector)?,
            modifier: config.modifier,
        })
    }
}

impl filter::Filter for SelectFilter {
    fn process(&mut self, metric: Metric, res: &mut Vec<Metric>) -> Result<(), filter::FilterError> {
        if let Some(metric) = self.selector.select(metric) {
            res.push(self.modifier.apply(metric));
        }
        Ok(())
    }
}
