//! What the agent reads on stdout
//!
//! Values are printed one per line as `name<TAB>value<TAB>unixtime`.
//! When the agent asks for the graph definitions, a marker line is
//! followed by a single line of JSON describing all graphs.

use crate::metric::{Graph, NumericMetric};
use anyhow::Result;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io::{BufWriter, Write},
    time::{SystemTime, UNIX_EPOCH},
};

/// First line of the graph definition output
pub const META_HEADER: &str = "# mackerel-agent-plugin";

/// Current unix time in seconds
pub fn epoch_now() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Write one value line.
pub fn write_value<W: Write>(
    handle: &mut BufWriter<W>,
    key: &str,
    value: &NumericMetric,
    now: u64,
) -> Result<()> {
    writeln!(handle, "{}\t{}\t{}", key, value, now)?;
    Ok(())
}

#[derive(Serialize)]
struct GraphDefinitions<'a> {
    graphs: BTreeMap<String, &'a Graph>,
}

/// Write the graph definitions, each graph named `<prefix>.<graph>`.
pub fn write_definitions<W: Write>(
    handle: &mut BufWriter<W>,
    prefix: &str,
    graphs: &[Graph],
) -> Result<()> {
    let defs = GraphDefinitions {
        graphs: graphs
            .iter()
            .map(|g| (join_key(prefix, &g.name), g))
            .collect(),
    };
    writeln!(handle, "{}", META_HEADER)?;
    serde_json::to_writer(&mut *handle, &defs)?;
    writeln!(handle)?;
    Ok(())
}

/// Join metric name parts with dots, skipping empty ones.
pub fn join_key(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{}.{}", prefix, name),
    }
}

/// Is `key` the metric `metric` of one instance of graph `graph`?
///
/// Every `#` in the graph name matches exactly one non-empty,
/// dot-free part of the key.
pub fn matches_wildcard(graph: &str, metric: &str, key: &str) -> bool {
    let Some(instance) = key
        .strip_suffix(metric)
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return false;
    };
    let pattern: Vec<&str> = graph.split('.').collect();
    let parts: Vec<&str> = instance.split('.').collect();
    pattern.len() == parts.len()
        && pattern
            .iter()
            .zip(&parts)
            .all(|(p, part)| if *p == "#" { !part.is_empty() } else { p == part })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricDef;

    fn written<F>(f: F) -> String
    where
        F: FnOnce(&mut BufWriter<Vec<u8>>) -> Result<()>,
    {
        let mut handle = BufWriter::new(Vec::new());
        f(&mut handle).unwrap();
        handle.flush().unwrap();
        let (recovered_writer, _buffered_data) = handle.into_parts();
        String::from_utf8(recovered_writer).unwrap()
    }

    #[test]
    fn test_write_value() {
        let output = written(|h| {
            write_value(h, "accesslog.access_num.total_count", &NumericMetric::Float64(10.0), 1660000000)?;
            write_value(h, "redis.keys.db0", &NumericMetric::UInt64(42), 1660000000)?;
            write_value(h, "accesslog.latency.average", &NumericMetric::Float64(0.7604), 1660000000)
        });
        assert_eq!(
            output,
            "accesslog.access_num.total_count\t10\t1660000000\nredis.keys.db0\t42\t1660000000\naccesslog.latency.average\t0.7604\t1660000000\n"
        );
    }

    #[test]
    fn test_write_definitions() {
        let graphs = vec![Graph::new(
            "access_num",
            "Accesslog Access Num",
            "integer",
            vec![
                MetricDef::new("total_count", "Total Count"),
                MetricDef::new("5xx_count", "HTTP 5xx Count").stacked(),
            ],
        )];
        let output = written(|h| write_definitions(h, "accesslog", &graphs));
        let mut lines = output.lines();
        assert_eq!(lines.next(), Some(META_HEADER));
        let json: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        let graph = &json["graphs"]["accesslog.access_num"];
        assert_eq!(graph["label"], "Accesslog Access Num");
        assert_eq!(graph["unit"], "integer");
        assert_eq!(graph["metrics"][1]["name"], "5xx_count");
        assert_eq!(graph["metrics"][1]["stacked"], true);
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_matches_wildcard() {
        assert!(matches_wildcard("cpu.#", "user", "cpu.cpu0.user"));
        assert!(matches_wildcard("disk.#.io", "read", "disk.sda.io.read"));
        assert!(!matches_wildcard("cpu.#", "user", "cpu.user"));
        assert!(!matches_wildcard("cpu.#", "user", "cpu.cpu0.nice"));
        assert!(!matches_wildcard("cpu.#", "user", "cpu.a.b.user"));
        assert!(!matches_wildcard("cpu.#", "user", "mem.cpu0.user"));
        assert!(!matches_wildcard("cpu.#", "user", "cpu..user"));
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("nginx", "requests"), "nginx.requests");
        assert_eq!(join_key("", "requests"), "requests");
        assert_eq!(join_key("nginx", ""), "nginx");
    }
}
