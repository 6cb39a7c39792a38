use crate::filter;
use crate::metric::{Metric, TagMap};

/// Overlays a fixed set of tags onto every metric. Tags already present on
/// the metric are replaced.
pub struct TagFilter {
    tags: TagMap,
}

/// Configuration for `TagFilter`
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TagFilterConfig {
    /// Tags to set.
    #[serde(default)]
    pub tags: TagMap,
}

impl TagFilter {
    /// Create a new TagFilter
    pub fn new(config: TagFilterConfig) -> TagFilter {
        TagFilter { tags: config.tags }
    }
}

impl filter::Filter for TagFilter {
    fn process(
        &mut self,
        metric: Metric,
        res: &mut Vec<Metric>,
    ) -> Result<(), filter::FilterError> {
        res.push(metric.overlay_tags_from_map(&self.tags));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::filter::Filter;

    #[test]
    fn overlays_tags() {
        let mut filter = TagFilter::new(TagFilterConfig {
            tags: vec![("agent", "tally"), ("host", "config")].into_iter().collect(),
        });
        let mut res = Vec::new();
        filter
            .process(Metric::new("m").overlay_tag("host", "own"), &mut res)
            .unwrap();
        assert_eq!(Some("tally"), res[0].tags().get("agent"));
        assert_eq!(Some("config"), res[0].tags().get("host"));
    }
}
