use crate::metric::Metric;
use crate::protocols::line;
use crate::sink::{Sink, SinkError};
use std::io::{self, Write};

/// Output encoding of the console sink.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// InfluxDB line protocol.
    Influx,
    /// One JSON object per line.
    Json,
}

impl Default for Format {
    fn default() -> Format {
        Format::Influx
    }
}

/// Console sink
///
/// Writes every metric to stdout, or any other writer, one per line.
pub struct Console {
    format: Format,
    out: Box<dyn Write + Send>,
    buf: String,
}

/// Configuration for the `Console` sink
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Line encoding.
    pub format: Format,
}

impl Console {
    /// Create a new Console writing to stdout.
    pub fn new(config: ConsoleConfig) -> Console {
        Console::with_writer(config, Box::new(io::stdout()))
    }

    /// Create a new Console writing to `out`.
    pub fn with_writer(config: ConsoleConfig, out: Box<dyn Write + Send>) -> Console {
        Console {
            format: config.format,
            out,
            buf: String::with_capacity(4_096),
        }
    }

    fn encode(&mut self, metric: &Metric) {
        match self.format {
            Format::Influx => {
                line::write_metric(metric, &mut self.buf);
            }
            Format::Json => {
                let obj = json!({
                    "name": metric.name(),
                    "tags": metric.tags(),
                    "fields": metric.fields(),
                    "timestamp": metric.timestamp(),
                });
                self.buf.push_str(&obj.to_string());
                self.buf.push('\n');
            }
        }
    }
}

impl Sink for Console {
    fn write(&mut self, batch: &[Metric]) -> Result<(), SinkError> {
        self.buf.clear();
        for metric in batch {
            self.encode(metric);
        }
        self.out
            .write_all(self.buf.as_bytes())
            .and_then(|()| self.out.flush())
            .map_err(|e| SinkError::Retryable(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn written(out: &Shared) -> String {
        String::from_utf8(out.0.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn influx_lines() {
        let out = Shared::default();
        let mut console = Console::with_writer(ConsoleConfig::default(), Box::new(out.clone()));
        let batch = vec![
            Metric::new("a").field("v", 1).time(1),
            Metric::new("b").overlay_tag("t", "x").field("v", 2.5).time(2),
        ];
        console.write(&batch).unwrap();
        assert_eq!("a v=1i 1\nb,t=x v=2.5 2\n", written(&out));
    }

    #[test]
    fn json_lines() {
        let out = Shared::default();
        let mut console = Console::with_writer(
            ConsoleConfig {
                format: Format::Json,
            },
            Box::new(out.clone()),
        );
        console
            .write(&[Metric::new("a").overlay_tag("t", "x").field("v", 1).time(7)])
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(written(&out).trim()).unwrap();
        assert_eq!("a", parsed["name"]);
        assert_eq!("x", parsed["tags"]["t"]);
        assert_eq!(1, parsed["fields"]["v"]);
        assert_eq!(7, parsed["timestamp"]);
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn io_errors_are_retryable() {
        let mut console = Console::with_writer(ConsoleConfig::default(), Box::new(Broken));
        match console.write(&[Metric::new("a").field("v", 1)]) {
            Err(SinkError::Retryable(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
