//! Provides the CLI option parser
//!
//! Used to parse the argv/config file into a struct that the agent can
//! consume and use as configuration data. Plugin sections are validated for
//! the settings every plugin of their kind shares (intervals, buffer sizes,
//! selectors); the plugin's own table is kept raw in the entry and handed to
//! the plugin's constructor by the registry.

use crate::aggregate::AggregatorConfig;
use crate::buffer::OverflowPolicy;
use crate::filter::{NameModifier, Selector, SelectorConfig};
use crate::metric::TagMap;
use crate::sink::SinkConfig;
use crate::source::SourceConfig;
use clap::{App, Arg};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};
use std::env;
use std::error;
use std::fmt;
use std::fs;
use std::io;
use std::time::Duration;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

/// Errors while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io(String, io::Error),
    /// The configuration file is not valid TOML.
    Parse(toml::de::Error),
    /// A key holds an unusable value.
    Invalid {
        /// Dotted path of the offending key.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
    /// No plugin of this type is registered.
    UnknownPlugin {
        /// `inputs`, `processors`, `aggregators` or `outputs`.
        section: &'static str,
        /// The plugin type name.
        kind: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConfigError::Io(ref path, ref e) => write!(f, "could not read {}: {}", path, e),
            ConfigError::Parse(ref e) => write!(f, "could not parse config file: {}", e),
            ConfigError::Invalid { ref key, ref reason } => write!(f, "{}: {}", key, reason),
            ConfigError::UnknownPlugin { section, ref kind } => {
                write!(f, "undefined but requested {}: {}", section, kind)
            }
        }
    }
}

impl error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            ConfigError::Io(_, ref e) => Some(e),
            ConfigError::Parse(ref e) => Some(e),
            _ => None,
        }
    }
}

fn invalid<K, R>(key: K, reason: R) -> ConfigError
where
    K: Into<String>,
    R: fmt::Display,
{
    ConfigError::Invalid {
        key: key.into(),
        reason: reason.to_string(),
    }
}

/// Settings of the `[agent]` table. Inputs and outputs inherit these unless
/// they set their own.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentSettings {
    /// Default collection interval.
    pub interval: Duration,
    /// Default collection jitter.
    pub collection_jitter: Duration,
    /// Align collections to multiples of the interval.
    pub round_interval: bool,
    /// Default timestamp precision. `None` derives it from the interval.
    pub precision: Option<Duration>,
    /// Default flush interval.
    pub flush_interval: Duration,
    /// Default flush jitter.
    pub flush_jitter: Duration,
    /// Default maximum metrics per write.
    pub metric_batch_size: usize,
    /// Default delivery buffer capacity.
    pub metric_buffer_limit: usize,
    /// Default delivery buffer overflow policy.
    pub overflow_policy: OverflowPolicy,
    /// Capacity of the metric bus.
    pub bus_capacity: usize,
    /// Bound on the whole shutdown sequence.
    pub shutdown_timeout: Duration,
    /// Default first retry delay.
    pub retry_base: Duration,
    /// Default retry delay cap.
    pub retry_max: Duration,
}

impl Default for AgentSettings {
    fn default() -> AgentSettings {
        AgentSettings {
            interval: Duration::from_secs(10),
            collection_jitter: Duration::from_secs(0),
            round_interval: true,
            precision: None,
            flush_interval: Duration::from_secs(10),
            flush_jitter: Duration::from_secs(0),
            metric_batch_size: 1_000,
            metric_buffer_limit: 10_000,
            overflow_policy: OverflowPolicy::DropOldest,
            bus_capacity: 1_000,
            shutdown_timeout: Duration::from_secs(5),
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(30),
        }
    }
}

/// A configured input.
#[derive(Clone, Debug)]
pub struct InputEntry {
    /// Plugin type, e.g. `loadavg`.
    pub kind: String,
    /// Scheduling settings.
    pub source: SourceConfig,
    /// The plugin's table.
    pub table: toml::Value,
}

/// A configured processor.
#[derive(Clone, Debug)]
pub struct ProcessorEntry {
    /// Plugin type, e.g. `tags`.
    pub kind: String,
    /// Unique name.
    pub name: String,
    /// Position in the chain; ties keep declaration order.
    pub order: i64,
    /// The plugin's table.
    pub table: toml::Value,
}

/// A configured aggregator.
#[derive(Clone, Debug)]
pub struct AggregatorEntry {
    /// Plugin type, e.g. `basicstats`.
    pub kind: String,
    /// Window and selection settings.
    pub aggregator: AggregatorConfig,
    /// The plugin's table.
    pub table: toml::Value,
}

/// A configured output.
#[derive(Clone, Debug)]
pub struct OutputEntry {
    /// Plugin type, e.g. `console`.
    pub kind: String,
    /// Flush, buffer and selection settings.
    pub sink: SinkConfig,
    /// The plugin's table.
    pub table: toml::Value,
}

/// Big configuration struct for the tally executable
///
/// This struct is what we construct from parsing the tally configuration.
/// Please see documentation on `parse_args` in this module for more details.
#[derive(Clone, Debug)]
pub struct Args {
    /// The `[agent]` table.
    pub agent: AgentSettings,
    /// Tags added to every metric which does not already carry them.
    pub tags: TagMap,
    /// Inputs, in declaration order.
    pub inputs: Vec<InputEntry>,
    /// Processors, in chain order.
    pub processors: Vec<ProcessorEntry>,
    /// Aggregators, in declaration order.
    pub aggregators: Vec<AggregatorEntry>,
    /// Outputs, in declaration order.
    pub outputs: Vec<OutputEntry>,
    /// The verbosity setting of tally. The higher the value the more chatty
    /// tally gets.
    pub verbose: u64,
    /// Gather every input once, flush and exit.
    pub once: bool,
    /// tally version string. This is set automatically.
    pub version: String,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            agent: AgentSettings::default(),
            tags: TagMap::default(),
            inputs: Vec::new(),
            processors: Vec::new(),
            aggregators: Vec::new(),
            outputs: Vec::new(),
            verbose: 0,
            once: false,
            version: VERSION.unwrap_or("unknown").to_string(),
        }
    }
}

/// Parse the tally configuration arguments
///
/// This function will read the environment arguments and construct an
/// `Args`. Most configuration is stored in an on-disk file. See
/// `tally --help` for more information.
pub fn parse_args() -> Result<Args, ConfigError> {
    let args = App::new("tally")
        .version(VERSION.unwrap_or("unknown"))
        .about("telemetry collection agent: scheduled inputs, buffered batched outputs")
        .arg(
            Arg::with_name("config-file")
                .long("config")
                .short("C")
                .value_name("config")
                .required(true)
                .help("The config file to feed in.")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output."),
        )
        .arg(
            Arg::with_name("once")
                .long("once")
                .help("Gather every input once, flush and exit."),
        )
        .get_matches();

    let verb = args.occurrences_of("verbose");
    let filename = args.value_of("config-file").unwrap_or("tally.toml");
    let buffer =
        fs::read_to_string(filename).map_err(|e| ConfigError::Io(filename.to_string(), e))?;
    let mut parsed = parse_config_file(&buffer, verb)?;
    parsed.once = args.is_present("once");
    Ok(parsed)
}

/// Parse a duration: an integer number of seconds or a string
/// `<n><unit>` where unit is one of `ns`, `us`, `ms`, `s`, `m`, `h`.
/// Compound strings such as `"1m30s"` are accepted.
pub fn parse_duration(value: &toml::Value) -> Result<Duration, String> {
    match *value {
        toml::Value::Integer(i) if i >= 0 => Ok(Duration::from_secs(i as u64)),
        toml::Value::Integer(i) => Err(format!("negative duration {}", i)),
        toml::Value::String(ref s) => parse_duration_str(s),
        ref other => Err(format!("expected a duration, found {}", other.type_str())),
    }
}

fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total = Duration::from_secs(0);
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or_else(|| rest.len());
        if digits == 0 {
            return Err(format!("bad duration {:?}", s));
        }
        let n: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("bad duration {:?}", s))?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or_else(|| rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let part = match unit {
            "ns" => Duration::from_nanos(n),
            "us" | "µs" => Duration::from_micros(n),
            "ms" => Duration::from_millis(n),
            "s" | "" => Duration::from_secs(n),
            "m" => Duration::from_secs(n.saturating_mul(60)),
            "h" => Duration::from_secs(n.saturating_mul(3_600)),
            _ => return Err(format!("unknown unit {:?} in duration {:?}", unit, s)),
        };
        total += part;
    }
    Ok(total)
}

/// serde adapter for duration valued plugin settings.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = toml::Value::deserialize(deserializer)?;
    parse_duration(&value).map_err(D::Error::custom)
}

fn get_duration(
    tbl: &toml::Value,
    path: &str,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match tbl.get(key) {
        Some(v) => parse_duration(v).map_err(|e| invalid(format!("{}.{}", path, key), e)),
        None => Ok(default),
    }
}

fn get_nonzero_duration(
    tbl: &toml::Value,
    path: &str,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let d = get_duration(tbl, path, key, default)?;
    if d == Duration::from_secs(0) {
        return Err(invalid(format!("{}.{}", path, key), "must be greater than zero"));
    }
    Ok(d)
}

fn get_usize(tbl: &toml::Value, path: &str, key: &str, default: usize) -> Result<usize, ConfigError> {
    match tbl.get(key) {
        Some(v) => match v.as_integer() {
            Some(i) if i > 0 => Ok(i as usize),
            Some(_) => Err(invalid(format!("{}.{}", path, key), "must be greater than zero")),
            None => Err(invalid(format!("{}.{}", path, key), "must be an integer")),
        },
        None => Ok(default),
    }
}

fn get_bool(tbl: &toml::Value, path: &str, key: &str, default: bool) -> Result<bool, ConfigError> {
    match tbl.get(key) {
        Some(v) => v
            .as_bool()
            .ok_or_else(|| invalid(format!("{}.{}", path, key), "must be a boolean")),
        None => Ok(default),
    }
}

fn get_str<'a>(tbl: &'a toml::Value, path: &str, key: &str) -> Result<Option<&'a str>, ConfigError> {
    match tbl.get(key) {
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| invalid(format!("{}.{}", path, key), "must be a string")),
        None => Ok(None),
    }
}

fn get_precision(
    tbl: &toml::Value,
    path: &str,
    default: Option<Duration>,
) -> Result<Option<Duration>, ConfigError> {
    match tbl.get("precision") {
        Some(v) => {
            let d = parse_duration(v).map_err(|e| invalid(format!("{}.precision", path), e))?;
            Ok(if d == Duration::from_secs(0) { None } else { Some(d) })
        }
        None => Ok(default),
    }
}

fn get_policy(
    tbl: &toml::Value,
    path: &str,
    default: OverflowPolicy,
) -> Result<OverflowPolicy, ConfigError> {
    match get_str(tbl, path, "overflow_policy")? {
        Some(s) => s
            .parse()
            .map_err(|e: String| invalid(format!("{}.overflow_policy", path), e)),
        None => Ok(default),
    }
}

/// Tags are either plain strings or `{ environment = true, value = "VAR" }`
/// tables naming an environment variable to read the value from.
fn parse_tags(value: Option<&toml::Value>, path: &str) -> Result<TagMap, ConfigError> {
    let mut tags = TagMap::default();
    let tbl = match value {
        Some(v) => v
            .as_table()
            .ok_or_else(|| invalid(path, "must be a table"))?,
        None => return Ok(tags),
    };
    for (k, v) in tbl.iter() {
        let key = format!("{}.{}", path, k);
        let val = match v.as_str() {
            Some(s) => s.to_string(),
            None => {
                let is_env = v.get("environment").and_then(|e| e.as_bool()).unwrap_or(false);
                if !is_env {
                    return Err(invalid(
                        key,
                        "tag must be a string or an environment / value table",
                    ));
                }
                let env_key = get_str(v, &key, "value")?
                    .ok_or_else(|| invalid(key.clone(), "must have a value key"))?;
                env::var(env_key).map_err(|e| invalid(key.clone(), format!("{}: {}", env_key, e)))?
            }
        };
        tags.insert(k.clone(), val);
    }
    Ok(tags)
}

fn plugin_tables(section: &toml::Value, path: &str) -> Result<Vec<(String, toml::Value)>, ConfigError> {
    let tbl = section
        .as_table()
        .ok_or_else(|| invalid(path, "must be a table"))?;
    let mut out = Vec::new();
    for (kind, v) in tbl.iter() {
        match *v {
            toml::Value::Array(ref arr) => {
                for item in arr {
                    if !item.is_table() {
                        return Err(invalid(format!("{}.{}", path, kind), "must be a table"));
                    }
                    out.push((kind.clone(), item.clone()));
                }
            }
            toml::Value::Table(_) => out.push((kind.clone(), v.clone())),
            _ => return Err(invalid(format!("{}.{}", path, kind), "must be a table")),
        }
    }
    Ok(out)
}

fn plugin_name(section: &str, kind: &str, tbl: &toml::Value) -> Result<String, ConfigError> {
    let path = format!("{}.{}", section, kind);
    Ok(match get_str(tbl, &path, "alias")? {
        Some(alias) => format!("{}::{}", path, alias),
        None => path,
    })
}

fn selection(tbl: &toml::Value, path: &str) -> Result<(Selector, NameModifier), ConfigError> {
    let raw: SelectorConfig = tbl
        .clone()
        .try_into()
        .map_err(|e| invalid(path, e))?;
    let selector = Selector::new(&raw).map_err(|e| invalid(path, e))?;
    let modifier: NameModifier = tbl
        .clone()
        .try_into()
        .map_err(|e| invalid(path, e))?;
    Ok((selector, modifier))
}

fn parse_agent(value: Option<&toml::Value>) -> Result<AgentSettings, ConfigError> {
    let mut agent = AgentSettings::default();
    let tbl = match value {
        Some(v) => v,
        None => return Ok(agent),
    };
    let p = "agent";
    agent.interval = get_nonzero_duration(tbl, p, "interval", agent.interval)?;
    agent.collection_jitter = get_duration(tbl, p, "collection_jitter", agent.collection_jitter)?;
    agent.round_interval = get_bool(tbl, p, "round_interval", agent.round_interval)?;
    agent.precision = get_precision(tbl, p, agent.precision)?;
    agent.flush_interval = get_nonzero_duration(tbl, p, "flush_interval", agent.flush_interval)?;
    agent.flush_jitter = get_duration(tbl, p, "flush_jitter", agent.flush_jitter)?;
    agent.metric_batch_size = get_usize(tbl, p, "metric_batch_size", agent.metric_batch_size)?;
    agent.metric_buffer_limit = get_usize(tbl, p, "metric_buffer_limit", agent.metric_buffer_limit)?;
    agent.overflow_policy = get_policy(tbl, p, agent.overflow_policy)?;
    agent.bus_capacity = get_usize(tbl, p, "bus_capacity", agent.bus_capacity)?;
    agent.shutdown_timeout = get_duration(tbl, p, "shutdown_timeout", agent.shutdown_timeout)?;
    agent.retry_base = get_nonzero_duration(tbl, p, "retry_base", agent.retry_base)?;
    agent.retry_max = get_nonzero_duration(tbl, p, "retry_max", agent.retry_max)?;
    if agent.metric_batch_size > agent.metric_buffer_limit {
        warn!(
            "[agent] metric_batch_size {} exceeds metric_buffer_limit {}, clamping",
            agent.metric_batch_size, agent.metric_buffer_limit
        );
        agent.metric_batch_size = agent.metric_buffer_limit;
    }
    Ok(agent)
}

fn parse_input(agent: &AgentSettings, kind: String, tbl: toml::Value) -> Result<InputEntry, ConfigError> {
    let name = plugin_name("inputs", &kind, &tbl)?;
    let interval = get_nonzero_duration(&tbl, &name, "interval", agent.interval)?;
    let source = SourceConfig {
        interval,
        jitter: get_duration(&tbl, &name, "collection_jitter", agent.collection_jitter)?,
        precision: get_precision(&tbl, &name, agent.precision)?,
        round_interval: agent.round_interval,
        tags: parse_tags(tbl.get("tags"), &format!("{}.tags", name))?,
        name,
    };
    Ok(InputEntry {
        kind,
        source,
        table: tbl,
    })
}

fn parse_output(agent: &AgentSettings, kind: String, tbl: toml::Value) -> Result<OutputEntry, ConfigError> {
    let name = plugin_name("outputs", &kind, &tbl)?;
    let (selector, modifier) = selection(&tbl, &name)?;
    let mut sink = SinkConfig::new(name.clone());
    sink.flush_interval = get_nonzero_duration(&tbl, &name, "flush_interval", agent.flush_interval)?;
    sink.flush_jitter = get_duration(&tbl, &name, "flush_jitter", agent.flush_jitter)?;
    sink.batch_size = get_usize(&tbl, &name, "metric_batch_size", agent.metric_batch_size)?;
    sink.buffer_limit = get_usize(&tbl, &name, "metric_buffer_limit", agent.metric_buffer_limit)?;
    sink.overflow_policy = get_policy(&tbl, &name, agent.overflow_policy)?;
    sink.retry_base = get_nonzero_duration(&tbl, &name, "retry_base", agent.retry_base)?;
    sink.retry_max = get_nonzero_duration(&tbl, &name, "retry_max", agent.retry_max)?;
    sink.selector = selector;
    sink.modifier = modifier;
    if sink.batch_size > sink.buffer_limit {
        warn!(
            "[{}] metric_batch_size {} exceeds metric_buffer_limit {}, clamping",
            name, sink.batch_size, sink.buffer_limit
        );
        sink.batch_size = sink.buffer_limit;
    }
    Ok(OutputEntry {
        kind,
        sink,
        table: tbl,
    })
}

fn parse_aggregator(kind: String, tbl: toml::Value) -> Result<AggregatorEntry, ConfigError> {
    let name = plugin_name("aggregators", &kind, &tbl)?;
    let (selector, modifier) = selection(&tbl, &name)?;
    let aggregator = AggregatorConfig {
        period: get_nonzero_duration(&tbl, &name, "period", Duration::from_secs(30))?,
        delay: get_duration(&tbl, &name, "delay", Duration::from_millis(100))?,
        drop_original: get_bool(&tbl, &name, "drop_original", false)?,
        selector,
        modifier,
        name,
    };
    Ok(AggregatorEntry {
        kind,
        aggregator,
        table: tbl,
    })
}

fn parse_processor(kind: String, tbl: toml::Value) -> Result<ProcessorEntry, ConfigError> {
    let name = plugin_name("processors", &kind, &tbl)?;
    let order = match tbl.get("order") {
        Some(v) => v
            .as_integer()
            .ok_or_else(|| invalid(format!("{}.order", name), "must be an integer"))?,
        None => 0,
    };
    Ok(ProcessorEntry {
        kind,
        name,
        order,
        table: tbl,
    })
}

/// Parse the tally configuration file.
///
/// See the `[agent]` defaults on `AgentSettings`; every plugin section is an
/// array of tables keyed by plugin type, e.g. `[[inputs.loadavg]]`.
pub fn parse_config_file(buffer: &str, verbosity: u64) -> Result<Args, ConfigError> {
    let mut args = Args::default();
    let value: toml::Value = toml::from_str(buffer).map_err(ConfigError::Parse)?;

    args.verbose = verbosity;
    args.agent = parse_agent(value.get("agent"))?;
    args.tags = parse_tags(value.get("tags"), "tags")?;

    if let Some(inputs) = value.get("inputs") {
        for (kind, tbl) in plugin_tables(inputs, "inputs")? {
            args.inputs.push(parse_input(&args.agent, kind, tbl)?);
        }
    }
    if let Some(processors) = value.get("processors") {
        for (kind, tbl) in plugin_tables(processors, "processors")? {
            args.processors.push(parse_processor(kind, tbl)?);
        }
        args.processors.sort_by_key(|p| p.order);
    }
    if let Some(aggregators) = value.get("aggregators") {
        for (kind, tbl) in plugin_tables(aggregators, "aggregators")? {
            args.aggregators.push(parse_aggregator(kind, tbl)?);
        }
    }
    if let Some(outputs) = value.get("outputs") {
        for (kind, tbl) in plugin_tables(outputs, "outputs")? {
            args.outputs.push(parse_output(&args.agent, kind, tbl)?);
        }
    }

    Ok(args)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metric::Metric;

    #[test]
    fn empty_config_is_defaults() {
        let args = parse_config_file("", 4).unwrap();
        assert_eq!(AgentSettings::default(), args.agent);
        assert_eq!(4, args.verbose);
        assert!(args.inputs.is_empty());
        assert!(args.outputs.is_empty());
        assert!(!args.once);
    }

    #[test]
    fn durations() {
        let d = |s: &str| parse_duration(&toml::Value::String(s.to_string()));
        assert_eq!(Ok(Duration::from_secs(10)), d("10s"));
        assert_eq!(Ok(Duration::from_millis(250)), d("250ms"));
        assert_eq!(Ok(Duration::from_micros(5)), d("5us"));
        assert_eq!(Ok(Duration::from_nanos(7)), d("7ns"));
        assert_eq!(Ok(Duration::from_secs(90)), d("1m30s"));
        assert_eq!(Ok(Duration::from_secs(7_200)), d("2h"));
        assert_eq!(Ok(Duration::from_secs(3)), d("3"));
        assert!(d("10 parsecs").is_err());
        assert!(d("").is_err());
        assert!(d("s").is_err());
        assert_eq!(
            Ok(Duration::from_secs(12)),
            parse_duration(&toml::Value::Integer(12))
        );
        assert!(parse_duration(&toml::Value::Integer(-1)).is_err());
        assert!(parse_duration(&toml::Value::Boolean(true)).is_err());
    }

    #[test]
    fn agent_overrides() {
        let config = r#"
[agent]
interval = "5s"
round_interval = false
precision = "1ms"
flush_interval = 20
metric_batch_size = 50
metric_buffer_limit = 500
overflow_policy = "block-producer"
shutdown_timeout = "2s"
"#;
        let agent = parse_config_file(config, 0).unwrap().agent;
        assert_eq!(Duration::from_secs(5), agent.interval);
        assert!(!agent.round_interval);
        assert_eq!(Some(Duration::from_millis(1)), agent.precision);
        assert_eq!(Duration::from_secs(20), agent.flush_interval);
        assert_eq!(50, agent.metric_batch_size);
        assert_eq!(500, agent.metric_buffer_limit);
        assert_eq!(OverflowPolicy::BlockProducer, agent.overflow_policy);
        assert_eq!(Duration::from_secs(2), agent.shutdown_timeout);
    }

    #[test]
    fn validation() {
        assert!(parse_config_file("[agent]\ninterval = \"0s\"\n", 0).is_err());
        assert!(parse_config_file("[agent]\nmetric_batch_size = 0\n", 0).is_err());
        assert!(parse_config_file("[agent]\nbus_capacity = -3\n", 0).is_err());
        assert!(parse_config_file("[agent]\noverflow_policy = \"panic\"\n", 0).is_err());
        assert!(parse_config_file("[[inputs.loadavg]]\ninterval = \"0s\"\n", 0).is_err());
        assert!(parse_config_file("[[outputs.null]]\nnamepass = [\"[\"]\n", 0).is_err());
        assert!(parse_config_file("this is not toml", 0).is_err());

        let clamped = parse_config_file(
            "[agent]\nmetric_batch_size = 100\nmetric_buffer_limit = 10\n",
            0,
        )
        .unwrap();
        assert_eq!(10, clamped.agent.metric_batch_size);
    }

    #[test]
    fn inputs_inherit_and_override() {
        let config = r#"
[agent]
interval = "10s"
collection_jitter = "1s"

[tags]
dc = "us-east-1"

[[inputs.loadavg]]
interval = "5s"
[inputs.loadavg.tags]
role = "web"

[[inputs.loadavg]]
alias = "second"
precision = "0s"

[inputs.internal]
"#;
        let args = parse_config_file(config, 0).unwrap();
        assert_eq!(Some("us-east-1"), args.tags.get("dc"));
        assert_eq!(3, args.inputs.len());

        let first = &args.inputs[0];
        assert_eq!("loadavg", first.kind);
        assert_eq!("inputs.loadavg", first.source.name);
        assert_eq!(Duration::from_secs(5), first.source.interval);
        assert_eq!(Duration::from_secs(1), first.source.jitter);
        assert_eq!(Some("web"), first.source.tags.get("role"));

        let second = &args.inputs[1];
        assert_eq!("inputs.loadavg::second", second.source.name);
        assert_eq!(Duration::from_secs(10), second.source.interval);
        assert_eq!(None, second.source.precision);

        assert_eq!("inputs.internal", args.inputs[2].source.name);
    }

    #[test]
    fn environment_tags() {
        env::set_var("TALLY_CONFIG_TEST_REGION", "moon-1");
        let config = r#"
[tags]
region = { environment = true, value = "TALLY_CONFIG_TEST_REGION" }
"#;
        let args = parse_config_file(config, 0).unwrap();
        assert_eq!(Some("moon-1"), args.tags.get("region"));

        let config = r#"
[tags]
region = { environment = true, value = "TALLY_CONFIG_TEST_UNSET_VARIABLE" }
"#;
        assert!(parse_config_file(config, 0).is_err());
        assert!(parse_config_file("[tags]\nn = 1\n", 0).is_err());
    }

    #[test]
    fn processors_sort_by_order_then_declaration() {
        let config = r#"
[[processors.tags]]
alias = "b"
order = 2

[[processors.select]]
alias = "a"
order = 1

[[processors.tags]]
alias = "c"
order = 1

[[processors.delay]]
alias = "d"
tolerance = "1h"
"#;
        let args = parse_config_file(config, 0).unwrap();
        // equal orders keep table order, which groups by processor type
        let names: Vec<&str> = args.processors.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            vec![
                "processors.delay::d",
                "processors.tags::c",
                "processors.select::a",
                "processors.tags::b"
            ],
            names
        );
    }

    #[test]
    fn outputs_carry_selection() {
        let config = r#"
[agent]
flush_interval = "10s"
metric_buffer_limit = 100

[[outputs.console]]
format = "json"
namepass = ["load*"]
name_prefix = "host."
flush_interval = "1s"
metric_batch_size = 1000
retry_max = "5s"
"#;
        let args = parse_config_file(config, 0).unwrap();
        let out = &args.outputs[0];
        assert_eq!("console", out.kind);
        assert_eq!("outputs.console", out.sink.name);
        assert_eq!(Duration::from_secs(1), out.sink.flush_interval);
        assert_eq!(100, out.sink.batch_size);
        assert_eq!(Duration::from_secs(5), out.sink.retry_max);
        assert!(out.sink.selector.accepts(&Metric::new("load1")));
        assert!(!out.sink.selector.accepts(&Metric::new("cpu")));
        assert_eq!("host.x", out.sink.modifier.apply(Metric::new("x")).name());
        assert_eq!(Some("json"), out.table.get("format").and_then(|v| v.as_str()));
    }

    #[test]
    fn aggregator_windows() {
        let config = r#"
[[aggregators.basicstats]]
period = "30s"
delay = "1s"
drop_original = true
namedrop = ["internal_*"]
"#;
        let args = parse_config_file(config, 0).unwrap();
        let agg = &args.aggregators[0].aggregator;
        assert_eq!("aggregators.basicstats", agg.name);
        assert_eq!(Duration::from_secs(30), agg.period);
        assert_eq!(Duration::from_secs(1), agg.delay);
        assert!(agg.drop_original);
        assert!(!agg.selector.accepts(&Metric::new("internal_write")));
    }
}
