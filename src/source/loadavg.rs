use crate::metric::Metric;
use crate::source::{Source, SourceError};
use std::fs;
use std::path::PathBuf;

/// Reports the system load averages read from a `/proc/loadavg` formatted
/// file as the `system` metric with fields `load1`, `load5`, `load15`.
pub struct LoadAvg {
    path: PathBuf,
}

/// Configuration for `LoadAvg`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoadAvgConfig {
    /// File to read, `/proc/loadavg` by default.
    pub path: PathBuf,
}

impl Default for LoadAvgConfig {
    fn default() -> LoadAvgConfig {
        LoadAvgConfig {
            path: PathBuf::from("/proc/loadavg"),
        }
    }
}

impl LoadAvg {
    /// Create a new LoadAvg.
    pub fn new(config: LoadAvgConfig) -> LoadAvg {
        LoadAvg { path: config.path }
    }
}

fn parse(contents: &str) -> Result<Metric, SourceError> {
    let mut parts = contents.split_whitespace();
    let mut metric = Metric::new("system");
    for key in &["load1", "load5", "load15"] {
        let raw = parts
            .next()
            .ok_or_else(|| SourceError::Parse(format!("missing {}", key)))?;
        let val: f64 = raw
            .parse()
            .map_err(|_| SourceError::Parse(format!("bad {}: {:?}", key, raw)))?;
        metric = metric.field(*key, val);
    }
    Ok(metric)
}

impl Source for LoadAvg {
    fn gather(&mut self, acc: &mut Vec<Metric>) -> Result<(), SourceError> {
        let contents = fs::read_to_string(&self.path)?;
        acc.push(parse(&contents)?);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metric::FieldValue;

    #[test]
    fn parses_proc_format() {
        let m = parse("0.52 0.58 0.59 1/467 12345\n").unwrap();
        assert_eq!("system", m.name());
        assert_eq!(Some(&FieldValue::Float(0.52)), m.get_field("load1"));
        assert_eq!(Some(&FieldValue::Float(0.59)), m.get_field("load15"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("0.52 nope").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let mut src = LoadAvg::new(LoadAvgConfig {
            path: PathBuf::from("/nonexistent/loadavg"),
        });
        let mut acc = Vec::new();
        match src.gather(&mut acc) {
            Err(SourceError::Io(_)) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(acc.is_empty());
    }
}
