//! mackerel-plugin-helper - Simple writing of plugins for the mackerel agent in Rust
//!
//! SPDX-License-Identifier: LGPL-3.0-only
//!
//! # About
//! Every plugin run is a short lived process: the agent starts it,
//! reads `name<TAB>value<TAB>unixtime` lines from stdout and lets it
//! exit. This crate takes care of the parts that are the same for
//! every plugin:
//!
//! - turning cumulative counters into per-minute rates, with the last
//!   readings kept in a checkpoint file between runs
//!   ([checkpoint], [diff]),
//! - reading only the new part of a growing log file, with a position
//!   file and staleness detection ([position]),
//! - folding parsed log lines into counts, percentages, averages and
//!   percentiles ([aggregate]),
//! - printing values and graph definitions ([output]),
//! - fetching a few independent series at once ([fanout]).
//!
//! Two plugins come with it: [accesslog] and [multicore].
//!
//! # Usage
//! Create a struct for your plugin, implement [MackerelPlugin] for it
//! and call [MackerelPlugin::simple_start].
//!
//! # Example
//! ```rust,no_run
//! use anyhow::Result;
//! use mackerel_plugin_helper::{
//!     metric::{Graph, MetricDef, Metrics, NumericMetric},
//!     Config, MackerelPlugin,
//! };
//!
//! struct UptimePlugin;
//!
//! impl MackerelPlugin for UptimePlugin {
//!     fn fetch_metrics(&mut self, _config: &Config, _now: u64) -> Result<Metrics> {
//!         let uptime: f64 = std::fs::read_to_string("/proc/uptime")?
//!             .split_whitespace()
//!             .next()
//!             .unwrap_or("0")
//!             .parse()?;
//!         let mut metrics = Metrics::new();
//!         metrics.insert(String::from("seconds"), NumericMetric::Float64(uptime));
//!         Ok(metrics)
//!     }
//!
//!     fn graph_definition(&self) -> Vec<Graph> {
//!         vec![Graph::new(
//!             "",
//!             "Uptime",
//!             "float",
//!             vec![MetricDef::new("seconds", "Seconds")],
//!         )]
//!     }
//!
//!     fn metric_key_prefix(&self) -> String {
//!         String::from("uptime")
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     UptimePlugin.simple_start(String::from("uptime"))?;
//!     Ok(())
//! }
//! ```
//!
//! # Logging
//! This crate uses the default [log] crate to output log messages.
//! Absorbed problems (corrupt state files, skipped log lines, failed
//! fetches in a fan-out) are logged at level warn, the rest is trace
//! or debug. Select a log framework you like to see them; if you do
//! not want log output, just do nothing.

// Tell us if we forget to document things
#![warn(missing_docs)]
// We do not want to write unsafe code
#![forbid(unsafe_code)]

pub mod accesslog;
pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod diff;
pub mod error;
pub mod fanout;
pub mod metric;
pub mod multicore;
pub mod output;
pub mod position;

pub use crate::config::Config;

use crate::{
    checkpoint::CheckpointStore,
    diff::DiffCalculator,
    metric::{Graph, Metrics, NumericMetric},
    output::{join_key, matches_wildcard, write_definitions, write_value},
};
use anyhow::Result;
use log::{trace, warn};
use std::{
    collections::BTreeSet,
    io::{self, BufWriter, Write},
};

/// Defines a Mackerel Plugin and the needed functions
pub trait MackerelPlugin {
    /// Gather the current values.
    ///
    /// Keys are the metric names used in [MackerelPlugin::graph_definition].
    /// Counters are returned as their raw cumulative value, the
    /// difference to the last run is calculated for every metric
    /// marked with [metric::MetricDef::diff]. `now` is the unix time
    /// the values are printed with.
    fn fetch_metrics(&mut self, config: &Config, now: u64) -> Result<Metrics>;

    /// The graphs this plugin draws.
    fn graph_definition(&self) -> Vec<Graph>;

    /// Prefix for all metric keys and graph names.
    fn metric_key_prefix(&self) -> String;

    /// Write out the graph definitions, as the agent asks for them when
    /// MACKEREL_AGENT_PLUGIN_META is set.
    fn output_definitions<W: Write>(&self, handle: &mut BufWriter<W>) -> Result<()> {
        write_definitions(handle, &self.metric_key_prefix(), &self.graph_definition())
    }

    /// Fetch values and write them out, as of unix time `now`.
    ///
    /// Values of counter metrics are replaced by their difference to
    /// the last run. Counters without a usable earlier reading are left
    /// out this time. The checkpoint file is only touched if the plugin
    /// has counter metrics, and only keeps the counters seen in this
    /// run.
    ///
    /// A `#` in a graph name stands for one instance name: the metrics
    /// of such a graph are looked up as `<graph>.<metric>` with the
    /// instance filled in, e.g. `cpu.cpu0.user` for graph `cpu.#`.
    fn output_values<W: Write>(
        &mut self,
        handle: &mut BufWriter<W>,
        config: &Config,
        now: u64,
    ) -> Result<()> {
        let metrics = self.fetch_metrics(config, now)?;
        let prefix = self.metric_key_prefix();
        let graphs = self.graph_definition();
        let has_diff = graphs.iter().flat_map(|g| &g.metrics).any(|m| m.diff);

        let store = CheckpointStore::new(&config.tempfile);
        let _lock = if has_diff { store.lock() } else { None };
        let mut checkpoints = if has_diff {
            store.load_or_empty()
        } else {
            Default::default()
        };
        let calc = DiffCalculator::new(config.max_gap, config.rate_scale);
        let mut seen = BTreeSet::new();

        for graph in &graphs {
            for def in &graph.metrics {
                let values: Vec<(String, &NumericMetric)> = if graph.name.contains('#') {
                    metrics
                        .iter()
                        .filter(|(name, _)| matches_wildcard(&graph.name, &def.name, name))
                        .map(|(name, value)| (join_key(&prefix, name), value))
                        .collect()
                } else {
                    metrics
                        .get(&def.name)
                        .map(|value| (join_key(&join_key(&prefix, &graph.name), &def.name), value))
                        .into_iter()
                        .collect()
                };
                if values.is_empty() {
                    trace!("No value for {}", def.name);
                }
                for (key, value) in values {
                    if def.diff {
                        if let Some(delta) = calc.compute(&key, *value, now, &mut checkpoints).value() {
                            write_value(handle, &key, &delta.into(), now)?;
                        }
                        seen.insert(key);
                    } else {
                        write_value(handle, &key, value, now)?;
                    }
                }
            }
        }

        if has_diff {
            checkpoints.retain(|key, _| seen.contains(key));
            if let Err(e) = store.save(&checkpoints) {
                warn!("Could not save checkpoints: {}", e);
            }
        }
        Ok(())
    }

    /// A simplified start, only need a name, for the rest, defaults are fine.
    fn simple_start(&mut self, name: String) -> Result<bool> {
        trace!("Simple Start, setting up config");
        let config = Config::new(name);
        trace!("Plugin: {:#?}", config);

        self.start(config)
    }

    /// The main plugin function: print graph definitions when the
    /// agent asks for them, values otherwise.
    fn start(&mut self, config: Config) -> Result<bool> {
        trace!("Plugin start");
        trace!("My plugin config: {config:#?}");

        // We want to write a possibly large amount to stdout, take and lock it
        let stdout = io::stdout();
        // Buffered writer, to gather multiple small writes together
        let mut handle = BufWriter::with_capacity(config.fetch_size, stdout.lock());
        if config.meta {
            trace!("Agent asks for graph definitions");
            self.output_definitions(&mut handle)?;
        } else {
            let now = output::epoch_now()?;
            self.output_values(&mut handle, &config, now)?;
        }
        // And flush the handle, so it can also deal with possible errors
        handle.flush()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{checkpoint::CheckpointStore, diff::RateScale, metric::MetricDef};

    // Our plugin struct
    #[derive(Debug)]
    struct TestPlugin {
        requests: u64,
    }

    impl MackerelPlugin for TestPlugin {
        fn fetch_metrics(&mut self, _config: &Config, _now: u64) -> Result<Metrics> {
            let mut metrics = Metrics::new();
            metrics.insert(String::from("requests"), NumericMetric::UInt64(self.requests));
            metrics.insert(String::from("workers"), NumericMetric::Int64(4));
            Ok(metrics)
        }

        fn graph_definition(&self) -> Vec<Graph> {
            vec![
                Graph::new(
                    "requests",
                    "Test Requests",
                    "integer",
                    vec![MetricDef::new("requests", "Requests").diff()],
                ),
                Graph::new(
                    "workers",
                    "Test Workers",
                    "integer",
                    vec![
                        MetricDef::new("workers", "Workers"),
                        MetricDef::new("idle", "Idle").stacked(),
                    ],
                ),
            ]
        }

        fn metric_key_prefix(&self) -> String {
            String::from("test")
        }
    }

    fn run(plugin: &mut TestPlugin, config: &Config, now: u64) -> String {
        // Have the plugin "write" to a variable, then check what it wrote
        let mut handle = BufWriter::new(Vec::new());
        plugin.output_values(&mut handle, config, now).unwrap();
        handle.flush().unwrap();
        let (recovered_writer, _buffered_data) = handle.into_parts();
        String::from_utf8(recovered_writer).unwrap()
    }

    #[test]
    fn test_output_values() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(String::from("test")).with_tempfile(dir.path().join("cp"));
        let mut plugin = TestPlugin { requests: 1000 };

        // First run only has the gauge, the counter sets its baseline
        assert_eq!(
            run(&mut plugin, &config, 1660000000),
            String::from("test.workers.workers\t4\t1660000000\n")
        );

        plugin.requests = 1300;
        assert_eq!(
            run(&mut plugin, &config, 1660000060),
            String::from(
                "test.requests.requests\t300\t1660000060\ntest.workers.workers\t4\t1660000060\n"
            )
        );

        // Restarted server, counter went back
        plugin.requests = 10;
        assert_eq!(
            run(&mut plugin, &config, 1660000120),
            String::from("test.workers.workers\t4\t1660000120\n")
        );
    }

    #[test]
    fn test_output_values_per_second() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(String::from("test")).with_tempfile(dir.path().join("cp"));
        config.rate_scale = RateScale::PerSecond;
        let mut plugin = TestPlugin { requests: 0 };
        run(&mut plugin, &config, 100);
        plugin.requests = 50;
        assert!(run(&mut plugin, &config, 110).starts_with("test.requests.requests\t5\t110\n"));
    }

    #[test]
    fn test_stale_checkpoints_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(String::from("test")).with_tempfile(dir.path().join("cp"));
        let store = CheckpointStore::new(&config.tempfile);
        let mut old = store.load_or_empty();
        DiffCalculator::default().compute(
            "test.renamed.requests",
            NumericMetric::UInt64(5),
            1659990000,
            &mut old,
        );
        store.save(&old).unwrap();

        let mut plugin = TestPlugin { requests: 7 };
        run(&mut plugin, &config, 1660000000);
        let kept = store.load().unwrap();
        assert_eq!(kept.keys().collect::<Vec<_>>(), vec!["test.requests.requests"]);
    }

    // Metrics per queue, the queue names are only known at fetch time
    struct QueuePlugin {
        processed: Vec<(&'static str, u64)>,
    }

    impl MackerelPlugin for QueuePlugin {
        fn fetch_metrics(&mut self, _config: &Config, _now: u64) -> Result<Metrics> {
            Ok(self
                .processed
                .iter()
                .map(|(queue, n)| (format!("queue.{}.processed", queue), NumericMetric::UInt64(*n)))
                .collect())
        }

        fn graph_definition(&self) -> Vec<Graph> {
            vec![Graph::new(
                "queue.#",
                "Processed Jobs",
                "integer",
                vec![MetricDef::new("processed", "Processed").diff()],
            )]
        }

        fn metric_key_prefix(&self) -> String {
            String::from("jobs")
        }
    }

    #[test]
    fn test_wildcard_graph() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(String::from("jobs")).with_tempfile(dir.path().join("cp"));
        config.rate_scale = RateScale::Delta;
        let mut plugin = QueuePlugin {
            processed: vec![("default", 10), ("mail", 3)],
        };
        let mut handle = BufWriter::new(Vec::new());
        plugin.output_values(&mut handle, &config, 100).unwrap();
        assert!(handle.buffer().is_empty());

        plugin.processed = vec![("default", 15), ("mail", 4)];
        let mut handle = BufWriter::new(Vec::new());
        plugin.output_values(&mut handle, &config, 160).unwrap();
        handle.flush().unwrap();
        let (recovered_writer, _buffered_data) = handle.into_parts();
        assert_eq!(
            String::from_utf8(recovered_writer).unwrap(),
            "jobs.queue.default.processed\t5\t160\njobs.queue.mail.processed\t1\t160\n"
        );
    }

    #[test]
    fn test_output_definitions() {
        let plugin = TestPlugin { requests: 0 };
        let mut handle = BufWriter::new(Vec::new());
        plugin.output_definitions(&mut handle).unwrap();
        handle.flush().unwrap();
        let (recovered_writer, _buffered_data) = handle.into_parts();
        let output = String::from_utf8(recovered_writer).unwrap();
        let mut lines = output.lines();
        assert_eq!(lines.next(), Some(output::META_HEADER));
        let json: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(json["graphs"]["test.requests"]["label"], "Test Requests");
        assert_eq!(json["graphs"]["test.workers"]["metrics"][1]["stacked"], true);
    }
}
