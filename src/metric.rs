//! Metric values and graph definitions

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Flat set of metrics a plugin fetched in one run, keyed by metric
/// name.
pub type Metrics = BTreeMap<String, NumericMetric>;

/// A single numeric metric value.
///
/// Keeps the type the value was read as, so counters read as unsigned
/// integers can be checked for wraparound and the output does not
/// print integers as floats.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum NumericMetric {
    /// Signed integer
    Int64(i64),
    /// Unsigned integer, usually a counter
    UInt64(u64),
    /// Anything else
    Float64(f64),
}

impl NumericMetric {
    /// Value as float, for calculations.
    pub fn as_f64(&self) -> f64 {
        match *self {
            NumericMetric::Int64(v) => v as f64,
            NumericMetric::UInt64(v) => v as f64,
            NumericMetric::Float64(v) => v,
        }
    }
}

impl From<i64> for NumericMetric {
    fn from(v: i64) -> Self {
        NumericMetric::Int64(v)
    }
}

impl From<u64> for NumericMetric {
    fn from(v: u64) -> Self {
        NumericMetric::UInt64(v)
    }
}

impl From<f64> for NumericMetric {
    fn from(v: f64) -> Self {
        NumericMetric::Float64(v)
    }
}

impl fmt::Display for NumericMetric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NumericMetric::Int64(v) => write!(f, "{}", v),
            NumericMetric::UInt64(v) => write!(f, "{}", v),
            NumericMetric::Float64(v) => write!(f, "{}", v),
        }
    }
}

/// One line in a graph.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricDef {
    /// Name of the value in the [Metrics] returned by the plugin
    pub name: String,
    /// Label shown in the graph
    pub label: String,
    /// Stack on top of the previous metric?
    pub stacked: bool,
    /// Cumulative counter, report the difference to the last run
    #[serde(skip)]
    pub diff: bool,
}

impl MetricDef {
    /// Plain gauge metric
    pub fn new(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            stacked: false,
            diff: false,
        }
    }

    /// Draw stacked
    pub fn stacked(mut self) -> Self {
        self.stacked = true;
        self
    }

    /// Treat as counter
    pub fn diff(mut self) -> Self {
        self.diff = true;
        self
    }
}

/// A graph as shown by the agent.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Graph {
    /// Graph name, joined with the plugin prefix into the metric keys
    #[serde(skip)]
    pub name: String,
    /// Graph title
    pub label: String,
    /// Unit, one of float, integer, percentage, bytes, bytes/sec, iops
    pub unit: String,
    /// The lines in this graph
    pub metrics: Vec<MetricDef>,
}

impl Graph {
    /// New graph with the given metrics
    pub fn new(name: &str, label: &str, unit: &str, metrics: Vec<MetricDef>) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            unit: unit.to_string(),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(NumericMetric::from(-3i64).to_string(), "-3");
        assert_eq!(NumericMetric::from(18446744073709551615u64).to_string(), "18446744073709551615");
        assert_eq!(NumericMetric::from(0.7604f64).to_string(), "0.7604");
        assert_eq!(NumericMetric::from(70.0f64).to_string(), "70");
    }

    #[test]
    fn test_tagged_json() {
        let json = serde_json::to_string(&NumericMetric::UInt64(42)).unwrap();
        assert_eq!(json, r#"{"type":"uint64","value":42}"#);
        let back: NumericMetric = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NumericMetric::UInt64(42));
    }

    #[test]
    fn test_graph_builders() {
        let def = MetricDef::new("requests", "Requests").diff().stacked();
        assert!(def.diff);
        assert!(def.stacked);
        let graph = Graph::new("nginx.requests", "Nginx Requests", "integer", vec![def]);
        let json = serde_json::to_value(&graph).unwrap();
        assert_eq!(json["label"], "Nginx Requests");
        assert_eq!(json["metrics"][0]["name"], "requests");
        // Internal fields stay out of the meta output
        assert!(json.get("name").is_none());
        assert!(json["metrics"][0].get("diff").is_none());
    }
}
