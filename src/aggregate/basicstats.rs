use crate::aggregate::Aggregator;
use crate::buckets::Buckets;
use crate::metric::Metric;

/// Summarizes each numeric field of each metric identity over the window.
///
/// For a field `f` the pushed metric carries `f_count`, `f_min`, `f_max`,
/// `f_mean` and `f_sum`, restricted to the configured `stats`, plus
/// `f_p<N>` for every configured quantile (`0.99` gives `f_p99`).
pub struct BasicStats {
    buckets: Buckets,
    stats: Vec<Stat>,
    quantiles: Vec<(f64, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Stat {
    Count,
    Min,
    Max,
    Mean,
    Sum,
}

impl Stat {
    fn parse(s: &str) -> Option<Stat> {
        match s {
            "count" => Some(Stat::Count),
            "min" => Some(Stat::Min),
            "max" => Some(Stat::Max),
            "mean" => Some(Stat::Mean),
            "sum" => Some(Stat::Sum),
            _ => None,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Stat::Count => "count",
            Stat::Min => "min",
            Stat::Max => "max",
            Stat::Mean => "mean",
            Stat::Sum => "sum",
        }
    }
}

/// Configuration for `BasicStats`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BasicStatsConfig {
    /// Which of `count`, `min`, `max`, `mean`, `sum` to emit.
    pub stats: Vec<String>,
    /// Quantiles to emit, each in `[0, 1]`.
    pub quantiles: Vec<f64>,
    /// Error bound of quantile estimates.
    pub error: f64,
}

impl Default for BasicStatsConfig {
    fn default() -> BasicStatsConfig {
        BasicStatsConfig {
            stats: ["count", "min", "max", "mean", "sum"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            quantiles: Vec::new(),
            error: 0.001,
        }
    }
}

impl BasicStats {
    /// Create a new BasicStats. Unknown stat names and quantiles outside
    /// `[0, 1]` are reported as errors.
    pub fn new(config: BasicStatsConfig) -> Result<BasicStats, String> {
        let mut stats = Vec::new();
        for s in &config.stats {
            match Stat::parse(s) {
                Some(stat) => stats.push(stat),
                None => return Err(format!("unknown stat {:?}", s)),
            }
        }
        let mut quantiles = Vec::new();
        for q in config.quantiles {
            if !(0.0..=1.0).contains(&q) {
                return Err(format!("quantile {} not in [0, 1]", q));
            }
            quantiles.push((q, format!("p{}", q * 100.0)));
        }
        Ok(BasicStats {
            buckets: Buckets::new(config.error),
            stats,
            quantiles,
        })
    }
}

impl Aggregator for BasicStats {
    fn add(&mut self, metric: &Metric) {
        self.buckets.add(metric);
    }

    fn push(&mut self, acc: &mut Vec<Metric>) {
        for entry in self.buckets.iter() {
            let mut m = Metric::new(entry.name.clone()).overlay_tags_from_map(&entry.tags);
            for (field, summary) in &entry.fields {
                for stat in &self.stats {
                    let key = format!("{}_{}", field, stat.suffix());
                    m = match *stat {
                        Stat::Count => m.field(key, summary.count),
                        Stat::Min => m.field(key, summary.min),
                        Stat::Max => m.field(key, summary.max),
                        Stat::Mean => m.field(key, summary.mean()),
                        Stat::Sum => m.field(key, summary.sum),
                    };
                }
                for &(q, ref suffix) in &self.quantiles {
                    if let Some(v) = summary.query(q) {
                        m = m.field(format!("{}_{}", field, suffix), v);
                    }
                }
            }
            if !m.fields().is_empty() {
                acc.push(m);
            }
        }
    }

    fn reset(&mut self) {
        self.buckets.reset();
    }
}
