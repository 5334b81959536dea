//! Access log plugin
//!
//! Counts requests per HTTP status class and collects request times
//! from the lines appended to an access log since the last run. Both
//! LTSV and Apache common/combined logs are understood; without an
//! explicit format, the first parsable line decides.

use crate::{
    aggregate::{aggregate, ParsedRecord, PercentileMethod},
    error::StateError,
    metric::{Graph, MetricDef, Metrics},
    position::{position_path_for, IncrementalReader},
    Config, MackerelPlugin,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, warn};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
};

/// Log formats
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Decide on the first line that parses
    #[default]
    #[value(skip)]
    Guess,
    /// Labeled tab-separated values
    Ltsv,
    /// Apache common or combined log
    Apache,
}

/// Does this line look like LTSV? The first field has to start with a
/// plain `label:`.
fn looks_like_ltsv(line: &str) -> bool {
    let first = line.split('\t').next().unwrap_or_default();
    match first.split_once(':') {
        Some((label, _)) => {
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    }
}

/// Parse one LTSV line.
pub fn parse_ltsv(line: &str) -> Result<ParsedRecord, StateError> {
    let mut status = None;
    let mut reqtime = None;
    let mut taken_sec = None;
    let mut reqtime_microsec = None;
    for field in line.split('\t') {
        let Some((label, value)) = field.split_once(':') else {
            continue;
        };
        match label {
            "status" => status = value.trim().parse::<u16>().ok(),
            "reqtime" | "request_time" => reqtime = value.trim().parse::<f64>().ok(),
            "taken_sec" => taken_sec = value.trim().parse::<f64>().ok(),
            "reqtime_microsec" => {
                reqtime_microsec = value.trim().parse::<f64>().ok().map(|us| us / 1_000_000.0)
            }
            _ => {}
        }
    }
    let status = status.ok_or_else(|| StateError::record(format!("no status in {:?}", line)))?;
    Ok(ParsedRecord {
        status,
        latency: reqtime.or(taken_sec).or(reqtime_microsec),
    })
}

/// Parse one Apache common/combined log line.
///
/// The status is the first field after the quoted request.
pub fn parse_apache(line: &str) -> Result<ParsedRecord, StateError> {
    let invalid = || StateError::record(format!("not an apache log line: {:?}", line));
    let open = line.find('"').ok_or_else(invalid)?;
    let rest = &line[open + 1..];
    // The request itself may contain escaped quotes
    let mut escaped = false;
    let close = rest
        .char_indices()
        .find(|&(_, c)| {
            let end = c == '"' && !escaped;
            escaped = c == '\\' && !escaped;
            end
        })
        .map(|(i, _)| i)
        .ok_or_else(invalid)?;
    let status = rest[close + 1..]
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(invalid)?;
    Ok(ParsedRecord {
        status,
        latency: None,
    })
}

/// Turns lines into records, guessing the format once if needed.
#[derive(Debug)]
pub struct LineParser {
    format: LogFormat,
}

impl LineParser {
    /// Parser for the given format
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }

    /// The format in use, [LogFormat::Guess] until a line decided it
    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Parse one line
    pub fn parse(&mut self, line: &str) -> Result<ParsedRecord, StateError> {
        match self.format {
            LogFormat::Ltsv => parse_ltsv(line),
            LogFormat::Apache => parse_apache(line),
            LogFormat::Guess => {
                // An apache line from an IPv6 client looks like LTSV at
                // first, so a failed guess gets the other format too
                let (guess, other) = if looks_like_ltsv(line) {
                    (LogFormat::Ltsv, LogFormat::Apache)
                } else {
                    (LogFormat::Apache, LogFormat::Ltsv)
                };
                let (format, record) = match LineParser::new(guess).parse(line) {
                    Ok(record) => (guess, record),
                    Err(e) => match LineParser::new(other).parse(line) {
                        Ok(record) => (other, record),
                        Err(_) => return Err(e),
                    },
                };
                debug!("Guessed log format {:?}", format);
                self.format = format;
                Ok(record)
            }
        }
    }
}

/// Parse everything `reader` has left into metrics.
///
/// Lines are parsed while they are read, a read error stops the batch
/// and is returned.
pub fn metrics_from_reader<R: BufRead>(reader: R, format: LogFormat) -> Result<Metrics> {
    let mut parser = LineParser::new(format);
    let mut read_error = None;
    let records = reader
        .split(b'\n')
        .map_while(|line| line.map_err(|e| read_error = Some(e)).ok())
        .filter_map(|buf| {
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches('\r');
            (!line.is_empty()).then(|| parser.parse(line))
        });
    let batch = aggregate(records);
    if let Some(e) = read_error {
        return Err(e).context("could not read log");
    }
    Ok(batch.into_metrics(PercentileMethod::NearestRank))
}

/// Command line of the access log plugin.
#[derive(Debug, Parser)]
#[command(
    name = "mackerel-plugin-accesslog",
    about = "Status classes and request times from an access log"
)]
pub struct AccesslogArgs {
    /// Metric key prefix
    #[arg(long, default_value = "")]
    pub metric_key_prefix: String,
    /// Log format, guessed from the first line if not given
    #[arg(long, value_enum)]
    pub format: Option<LogFormat>,
    /// Position file, relative to the working directory unless absolute
    #[arg(long, value_name = "PATH")]
    pub posfile: Option<PathBuf>,
    /// Read the whole log every time, without a position file
    #[arg(long, default_value_t = false)]
    pub no_posfile: bool,
    /// The access log
    pub file: PathBuf,
}

impl From<AccesslogArgs> for AccesslogPlugin {
    fn from(args: AccesslogArgs) -> Self {
        Self {
            prefix: args.metric_key_prefix,
            file: args.file,
            posfile: args.posfile,
            no_posfile: args.no_posfile,
            format: args.format.unwrap_or_default(),
        }
    }
}

/// The plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccesslogPlugin {
    /// Metric key prefix, "accesslog" if empty
    pub prefix: String,
    /// The log file
    pub file: PathBuf,
    /// Custom position file
    pub posfile: Option<PathBuf>,
    /// Read the whole file every time, without a position file
    pub no_posfile: bool,
    /// Log format
    pub format: LogFormat,
}

impl AccesslogPlugin {
    /// Plugin for the given log with all defaults
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            prefix: String::new(),
            file: file.into(),
            posfile: None,
            no_posfile: false,
            format: LogFormat::Guess,
        }
    }

    /// Title-cased prefix for graph labels
    fn label_prefix(&self) -> String {
        let prefix = self.metric_key_prefix();
        let mut chars = prefix.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => prefix,
        }
    }
}

impl MackerelPlugin for AccesslogPlugin {
    fn fetch_metrics(&mut self, config: &Config, now: u64) -> Result<Metrics> {
        if self.no_posfile {
            let file = File::open(&self.file)
                .with_context(|| format!("could not open {}", self.file.display()))?;
            return metrics_from_reader(BufReader::new(file), self.format);
        }

        let posfile = position_path_for(
            &config.workdir,
            &config.plugin_name,
            &self.file,
            self.posfile.as_deref(),
        );
        let (mut reader, should_emit) =
            IncrementalReader::open(&self.file, &posfile, config.staleness_window, now)?;
        if !should_emit {
            // Move the position to the end without reporting anything
            let skipped = reader.discard()?;
            warn!(
                "No recent position for {}, skipped {} bytes",
                self.file.display(),
                skipped
            );
            return Ok(Metrics::new());
        }
        metrics_from_reader(reader, self.format)
    }

    fn graph_definition(&self) -> Vec<Graph> {
        let label = self.label_prefix();
        vec![
            Graph::new(
                "access_num",
                &format!("{} Access Num", label),
                "integer",
                vec![
                    MetricDef::new("total_count", "Total Count"),
                    MetricDef::new("5xx_count", "HTTP 5xx Count").stacked(),
                    MetricDef::new("4xx_count", "HTTP 4xx Count").stacked(),
                    MetricDef::new("3xx_count", "HTTP 3xx Count").stacked(),
                    MetricDef::new("2xx_count", "HTTP 2xx Count").stacked(),
                ],
            ),
            Graph::new(
                "access_rate",
                &format!("{} Access Rate", label),
                "percentage",
                vec![
                    MetricDef::new("5xx_percentage", "HTTP 5xx Percentage").stacked(),
                    MetricDef::new("4xx_percentage", "HTTP 4xx Percentage").stacked(),
                    MetricDef::new("3xx_percentage", "HTTP 3xx Percentage").stacked(),
                    MetricDef::new("2xx_percentage", "HTTP 2xx Percentage").stacked(),
                ],
            ),
            Graph::new(
                "latency",
                &format!("{} Latency", label),
                "float",
                vec![
                    MetricDef::new("99_percentile", "99 Percentile"),
                    MetricDef::new("95_percentile", "95 Percentile"),
                    MetricDef::new("90_percentile", "90 Percentile"),
                    MetricDef::new("average", "Average"),
                ],
            ),
        ]
    }

    fn metric_key_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::from("accesslog")
        } else {
            self.prefix.clone()
        }
    }
}
