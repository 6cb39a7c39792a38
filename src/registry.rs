//! The plugin registration table.
//!
//! A `Registry` maps plugin type names, as they appear in the configuration
//! file (`[[inputs.loadavg]]`, `[[outputs.console]]`), to constructors. It is
//! populated once at startup and handed by reference to `Agent::new`; nothing
//! in the pipeline looks plugins up on its own.

use crate::aggregate::{Aggregator, BasicStats, BasicStatsConfig};
use crate::filter::{DelayFilter, DelayFilterConfig, Filter, SelectFilter, TagFilter, TagFilterConfig};
use crate::sink::{Console, ConsoleConfig, InfluxDB, InfluxDBConfig, Null, NullConfig, Sink};
use crate::source::{Internal, InternalConfig, LoadAvg, LoadAvgConfig, Source};
use crate::stats::AgentStats;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

/// What a constructor may use besides its own table.
pub struct PluginContext {
    /// The agent's counters, for plugins that report on the agent itself.
    pub stats: Arc<AgentStats>,
}

/// Builds an input from its table.
pub type InputFactory =
    Box<dyn Fn(&toml::Value, &PluginContext) -> Result<Box<dyn Source>, String> + Send + Sync>;
/// Builds a processor from its table.
pub type ProcessorFactory =
    Box<dyn Fn(&toml::Value, &PluginContext) -> Result<Box<dyn Filter>, String> + Send + Sync>;
/// Builds an aggregator from its table.
pub type AggregatorFactory =
    Box<dyn Fn(&toml::Value, &PluginContext) -> Result<Box<dyn Aggregator>, String> + Send + Sync>;
/// Builds an output from its table.
pub type OutputFactory =
    Box<dyn Fn(&toml::Value, &PluginContext) -> Result<Box<dyn Sink>, String> + Send + Sync>;

/// See module documentation.
#[derive(Default)]
pub struct Registry {
    inputs: HashMap<String, InputFactory>,
    processors: HashMap<String, ProcessorFactory>,
    aggregators: HashMap<String, AggregatorFactory>,
    outputs: HashMap<String, OutputFactory>,
}

/// Deserialize a plugin's own settings out of its table. Keys shared by all
/// plugins of a kind (interval, alias, selectors) are ignored.
pub fn plugin_config<T>(table: &toml::Value) -> Result<T, String>
where
    T: DeserializeOwned,
{
    table.clone().try_into().map_err(|e| e.to_string())
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// A registry holding every plugin shipped with tally.
    pub fn builtin() -> Registry {
        let mut reg = Registry::new();

        reg.add_input("internal", |tbl, ctx| {
            let config: InternalConfig = plugin_config(tbl)?;
            Ok(Box::new(Internal::new(Arc::clone(&ctx.stats), config)) as Box<dyn Source>)
        });
        reg.add_input("loadavg", |tbl, _| {
            let config: LoadAvgConfig = plugin_config(tbl)?;
            Ok(Box::new(LoadAvg::new(config)) as Box<dyn Source>)
        });

        reg.add_processor("delay", |tbl, _| {
            let config: DelayFilterConfig = plugin_config(tbl)?;
            Ok(Box::new(DelayFilter::new(&config)) as Box<dyn Filter>)
        });
        reg.add_processor("tags", |tbl, _| {
            let config: TagFilterConfig = plugin_config(tbl)?;
            Ok(Box::new(TagFilter::new(config)) as Box<dyn Filter>)
        });
        reg.add_processor("select", |tbl, _| {
            let filter = SelectFilter::new(plugin_config(tbl)?).map_err(|e| e.to_string())?;
            Ok(Box::new(filter) as Box<dyn Filter>)
        });

        reg.add_aggregator("basicstats", |tbl, _| {
            let config: BasicStatsConfig = plugin_config(tbl)?;
            Ok(Box::new(BasicStats::new(config)?) as Box<dyn Aggregator>)
        });

        reg.add_output("console", |tbl, _| {
            let config: ConsoleConfig = plugin_config(tbl)?;
            Ok(Box::new(Console::new(config)) as Box<dyn Sink>)
        });
        reg.add_output("influxdb", |tbl, _| {
            let config: InfluxDBConfig = plugin_config(tbl)?;
            Ok(Box::new(InfluxDB::new(config)) as Box<dyn Sink>)
        });
        reg.add_output("null", |tbl, _| {
            let config: NullConfig = plugin_config(tbl)?;
            Ok(Box::new(Null::new(&config)) as Box<dyn Sink>)
        });

        reg
    }

    /// Register an input type, replacing any previous one of that name.
    pub fn add_input<S, F>(&mut self, kind: S, factory: F)
    where
        S: Into<String>,
        F: Fn(&toml::Value, &PluginContext) -> Result<Box<dyn Source>, String> + Send + Sync + 'static,
    {
        self.inputs.insert(kind.into(), Box::new(factory));
    }

    /// Register a processor type, replacing any previous one of that name.
    pub fn add_processor<S, F>(&mut self, kind: S, factory: F)
    where
        S: Into<String>,
        F: Fn(&toml::Value, &PluginContext) -> Result<Box<dyn Filter>, String> + Send + Sync + 'static,
    {
        self.processors.insert(kind.into(), Box::new(factory));
    }

    /// Register an aggregator type, replacing any previous one of that name.
    pub fn add_aggregator<S, F>(&mut self, kind: S, factory: F)
    where
        S: Into<String>,
        F: Fn(&toml::Value, &PluginContext) -> Result<Box<dyn Aggregator>, String>
            + Send
            + Sync
            + 'static,
    {
        self.aggregators.insert(kind.into(), Box::new(factory));
    }

    /// Register an output type, replacing any previous one of that name.
    pub fn add_output<S, F>(&mut self, kind: S, factory: F)
    where
        S: Into<String>,
        F: Fn(&toml::Value, &PluginContext) -> Result<Box<dyn Sink>, String> + Send + Sync + 'static,
    {
        self.outputs.insert(kind.into(), Box::new(factory));
    }

    /// The constructor for input type `kind`.
    pub fn input(&self, kind: &str) -> Option<&InputFactory> {
        self.inputs.get(kind)
    }

    /// The constructor for processor type `kind`.
    pub fn processor(&self, kind: &str) -> Option<&ProcessorFactory> {
        self.processors.get(kind)
    }

    /// The constructor for aggregator type `kind`.
    pub fn aggregator(&self, kind: &str) -> Option<&AggregatorFactory> {
        self.aggregators.get(kind)
    }

    /// The constructor for output type `kind`.
    pub fn output(&self, kind: &str) -> Option<&OutputFactory> {
        self.outputs.get(kind)
    }

    /// Registered type names per section, sorted, for `--help` style
    /// listings.
    pub fn kinds(&self) -> Vec<(&'static str, Vec<&str>)> {
        fn sorted<V>(m: &HashMap<String, V>) -> Vec<&str> {
            let mut v: Vec<&str> = m.keys().map(|k| k.as_str()).collect();
            v.sort();
            v
        }
        vec![
            ("inputs", sorted(&self.inputs)),
            ("processors", sorted(&self.processors)),
            ("aggregators", sorted(&self.aggregators)),
            ("outputs", sorted(&self.outputs)),
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metric::Metric;

    fn ctx() -> PluginContext {
        PluginContext {
            stats: Arc::new(AgentStats::new()),
        }
    }

    fn table(s: &str) -> toml::Value {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn builtin_kinds() {
        let reg = Registry::builtin();
        let kinds = reg.kinds();
        assert_eq!(("inputs", vec!["internal", "loadavg"]), kinds[0]);
        assert_eq!(("processors", vec!["delay", "select", "tags"]), kinds[1]);
        assert_eq!(("aggregators", vec!["basicstats"]), kinds[2]);
        assert_eq!(("outputs", vec!["console", "influxdb", "null"]), kinds[3]);
        assert!(reg.input("statsd").is_none());
    }

    #[test]
    fn constructors_read_their_tables() {
        let reg = Registry::builtin();
        let ctx = ctx();

        let mut tags = (reg.processor("tags").unwrap())(
            &table("alias = \"x\"\norder = 3\n[tags]\ndc = \"eu\"\n"),
            &ctx,
        )
        .unwrap();
        let mut out = Vec::new();
        tags.process(Metric::new("m").field("v", 1), &mut out).unwrap();
        assert_eq!(Some("eu"), out[0].tags().get("dc"));

        assert!((reg.processor("select").unwrap())(&table("namepass = [\"[\"]"), &ctx).is_err());
        assert!((reg.aggregator("basicstats").unwrap())(&table("stats = [\"median\"]"), &ctx).is_err());
        assert!((reg.output("console").unwrap())(&table("format = \"xml\""), &ctx).is_err());
        assert!((reg.output("null").unwrap())(&table("flush_interval = \"1s\""), &ctx).is_ok());
        assert!((reg.input("internal").unwrap())(&table("interval = \"1s\""), &ctx).is_ok());
    }

    #[test]
    fn custom_registration_replaces() {
        struct Quiet;
        impl Sink for Quiet {
            fn write(&mut self, _batch: &[Metric]) -> Result<(), crate::sink::SinkError> {
                Ok(())
            }
        }
        let mut reg = Registry::builtin();
        reg.add_output("console", |_, _| Ok(Box::new(Quiet) as Box<dyn Sink>));
        assert!((reg.output("console").unwrap())(&table("format = \"xml\""), &ctx()).is_ok());
    }
}
