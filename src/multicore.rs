//! Per core CPU usage
//!
//! The kernel counts, per core, the time spent in every CPU state
//! since boot. The usage of a state between two runs is the growth of
//! its counter over the growth of the core's total, so every run keeps
//! the raw counters in the checkpoint file for the next one.

use crate::{
    checkpoint::{CheckpointStore, Checkpoints},
    diff::{DiffCalculator, DiffOutcome, RateScale},
    metric::{Graph, MetricDef, Metrics, NumericMetric},
    Config, MackerelPlugin,
};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{debug, warn};
use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::{BufRead, BufReader},
    path::PathBuf,
};

/// CPU states in the order of the `cpuN` lines in /proc/stat. Older
/// kernels only have the first few.
pub const CPU_STATES: [&str; 10] = [
    "user",
    "nice",
    "system",
    "idle",
    "iowait",
    "irq",
    "softirq",
    "steal",
    "guest",
    "guest_nice",
];

/// Counters of one core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreStat {
    /// Name as in /proc/stat, `cpu0`, `cpu1`, ...
    pub name: String,
    /// One counter per entry of [CPU_STATES], as far as the kernel has them
    pub values: Vec<u64>,
}

impl CoreStat {
    /// Sum of all counters
    pub fn total(&self) -> u64 {
        self.values.iter().sum()
    }
}

/// Read the per core lines of /proc/stat. The summary `cpu` line and
/// everything that is not about CPUs is skipped.
pub fn parse_proc_stat<R: BufRead>(reader: R) -> Result<Vec<CoreStat>> {
    let mut cores = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let name = match fields.next() {
            Some(name) if name.starts_with("cpu") && name != "cpu" => name,
            _ => continue,
        };
        let values = fields
            .take(CPU_STATES.len())
            .map(|v| {
                v.parse::<u64>()
                    .with_context(|| format!("bad counter {:?} for {}", v, name))
            })
            .collect::<Result<Vec<_>>>()?;
        cores.push(CoreStat {
            name: name.to_string(),
            values,
        });
    }
    Ok(cores)
}

/// The 5 minute load average from the content of /proc/loadavg
pub fn parse_loadavg5(content: &str) -> Result<f64> {
    let col = content
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("cannot fetch loadavg5 from {:?}", content))?;
    Ok(col.parse()?)
}

/// Usage of every state in percent, keyed `cpu.<core>.<state>`.
///
/// Cores without a usable earlier reading, or whose total went
/// backwards, are left out. `checkpoints` is updated with the current
/// counters and keeps nothing else.
pub fn core_usage(
    cores: &[CoreStat],
    now: u64,
    calc: &DiffCalculator,
    checkpoints: &mut Checkpoints,
) -> Metrics {
    let mut ret = Metrics::new();
    let mut seen = BTreeSet::new();
    for core in cores {
        let total_key = format!("{}.total", core.name);
        let total = calc.compute(&total_key, core.total().into(), now, checkpoints);
        seen.insert(total_key);

        let mut states = Vec::new();
        for (state, value) in CPU_STATES.iter().zip(&core.values) {
            let key = format!("{}.{}", core.name, state);
            states.push((state, calc.compute(&key, (*value).into(), now, checkpoints)));
            seen.insert(key);
        }

        match total {
            DiffOutcome::Delta(total) if total > 0.0 => {
                for (state, outcome) in states {
                    if let Some(delta) = outcome.value() {
                        ret.insert(
                            format!("cpu.{}.{}", core.name, state),
                            NumericMetric::Float64(delta / total * 100.0),
                        );
                    }
                }
            }
            other => debug!("{}: no usage this time ({:?})", core.name, other),
        }
    }
    checkpoints.retain(|key, _| seen.contains(key));
    ret
}

/// Command line of the multicore plugin.
#[derive(Debug, Parser)]
#[command(name = "mackerel-plugin-multicore", about = "CPU usage per core")]
pub struct MulticoreArgs {
    /// Checkpoint file, instead of the one in the plugin working directory
    #[arg(long, value_name = "PATH")]
    pub tempfile: Option<PathBuf>,
}

/// The plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticorePlugin {
    /// Where to read the CPU counters
    pub proc_stat: PathBuf,
    /// Where to read the load average
    pub loadavg: PathBuf,
}

impl Default for MulticorePlugin {
    fn default() -> Self {
        Self {
            proc_stat: PathBuf::from("/proc/stat"),
            loadavg: PathBuf::from("/proc/loadavg"),
        }
    }
}

impl MackerelPlugin for MulticorePlugin {
    fn fetch_metrics(&mut self, config: &Config, now: u64) -> Result<Metrics> {
        let file = File::open(&self.proc_stat)
            .with_context(|| format!("could not open {}", self.proc_stat.display()))?;
        let cores = parse_proc_stat(BufReader::new(file))?;

        let store = CheckpointStore::new(&config.tempfile);
        let _lock = store.lock();
        let mut checkpoints = store.load_or_empty();
        let calc = DiffCalculator::new(config.max_gap, RateScale::Delta);
        let mut metrics = core_usage(&cores, now, &calc, &mut checkpoints);
        if let Err(e) = store.save(&checkpoints) {
            warn!("Could not save checkpoints: {}", e);
        }

        if !metrics.is_empty() {
            let content = fs::read_to_string(&self.loadavg)
                .with_context(|| format!("could not read {}", self.loadavg.display()))?;
            let loadavg5 = parse_loadavg5(&content)?;
            metrics.insert(
                String::from("loadavg5"),
                NumericMetric::Float64(loadavg5 / cores.len() as f64),
            );
        }
        Ok(metrics)
    }

    fn graph_definition(&self) -> Vec<Graph> {
        vec![
            Graph::new(
                "cpu.#",
                "MultiCore CPU",
                "percentage",
                vec![
                    MetricDef::new("user", "user").stacked(),
                    MetricDef::new("nice", "nice").stacked(),
                    MetricDef::new("system", "system").stacked(),
                    MetricDef::new("idle", "idle").stacked(),
                    MetricDef::new("iowait", "ioWait").stacked(),
                    MetricDef::new("irq", "irq").stacked(),
                    MetricDef::new("softirq", "softirq").stacked(),
                    MetricDef::new("steal", "steal").stacked(),
                    MetricDef::new("guest", "guest").stacked(),
                    MetricDef::new("guest_nice", "guest_nice").stacked(),
                ],
            ),
            Graph::new(
                "loadavg_per_core",
                "MultiCore loadavg5 per core",
                "float",
                vec![MetricDef::new("loadavg5", "loadavg5")],
            ),
        ]
    }

    fn metric_key_prefix(&self) -> String {
        String::from("multicore")
    }
}
