//! Gauge registry shared between the scrape cycle and the HTTP endpoint.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Metric {0} is not registered")]
    UnknownMetric(String),
    #[error("Metric {name} expects {expected} label values, got {actual}")]
    LabelCount {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Metric {0} is already registered with a different description")]
    Conflict(String),
}

/// Description of a registered gauge family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaugeDesc {
    /// The full Prometheus metric name.
    pub name: String,
    /// Help text.
    pub help: String,
    /// Ordered label names.
    pub label_names: Vec<String>,
}

/// A unique identifier for a metric time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// The full Prometheus metric name.
    pub name: String,
    /// Label values, in the family's label-name order.
    pub label_values: Vec<String>,
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Total gauge writes.
    pub writes: u64,
    /// Completed scrape cycles.
    pub cycles_completed: u64,
    /// Successful sensor fetches.
    pub fetch_successes: u64,
    /// Failed sensor fetches.
    pub fetch_failures: u64,
}

/// Thread-safe gauge registry.
///
/// A write to an existing series replaces its value. Series are never removed.
pub struct MetricsRegistry {
    /// Registered families by name.
    families: RwLock<HashMap<String, GaugeDesc>>,
    /// Stored values indexed by series key.
    series: RwLock<HashMap<SeriesKey, f64>>,
    /// Prefix for the exporter's own metrics.
    self_prefix: String,
    /// Statistics.
    stats: RwLock<RegistryStats>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    ///
    /// `prefix` is the configured metric prefix; the exporter's own metrics
    /// are named `<prefix>_exporter_*`, or `purple_exporter_*` without one.
    pub fn new(prefix: &str) -> Self {
        let self_prefix = if prefix.is_empty() {
            "purple_exporter".to_string()
        } else {
            format!("{}_exporter", prefix)
        };

        Self {
            families: RwLock::new(HashMap::new()),
            series: RwLock::new(HashMap::new()),
            self_prefix,
            stats: RwLock::new(RegistryStats::default()),
        }
    }

    /// Register a gauge family before its first write.
    ///
    /// Registering the same description twice is a no-op.
    pub fn register_gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<(), RegistryError> {
        let desc = GaugeDesc {
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
        };

        let mut families = self.families.write();
        match families.get(name) {
            Some(existing) if *existing == desc => Ok(()),
            Some(_) => Err(RegistryError::Conflict(name.to_string())),
            None => {
                families.insert(name.to_string(), desc);
                Ok(())
            }
        }
    }

    /// Set a gauge, replacing any previous value for the same label values.
    pub fn set_gauge(
        &self,
        name: &str,
        label_values: &[&str],
        value: f64,
    ) -> Result<(), RegistryError> {
        self.check_labels(name, label_values.len())?;

        let key = SeriesKey {
            name: name.to_string(),
            label_values: label_values.iter().map(|v| v.to_string()).collect(),
        };

        trace!(metric = name, labels = ?label_values, value, "Setting gauge");

        self.series.write().insert(key, value);

        self.stats.write().writes += 1;
        Ok(())
    }

    /// Read the current value of a series.
    pub fn get_gauge(&self, name: &str, label_values: &[&str]) -> Option<f64> {
        let key = SeriesKey {
            name: name.to_string(),
            label_values: label_values.iter().map(|v| v.to_string()).collect(),
        };
        self.series.read().get(&key).copied()
    }

    fn check_labels(&self, name: &str, actual: usize) -> Result<(), RegistryError> {
        let families = self.families.read();
        let desc = families
            .get(name)
            .ok_or_else(|| RegistryError::UnknownMetric(name.to_string()))?;

        if desc.label_names.len() != actual {
            return Err(RegistryError::LabelCount {
                name: name.to_string(),
                expected: desc.label_names.len(),
                actual,
            });
        }
        Ok(())
    }

    /// Record the outcome of one scrape cycle.
    pub fn record_cycle(&self, succeeded: usize, failed: usize) {
        let mut stats = self.stats.write();
        stats.cycles_completed += 1;
        stats.fetch_successes += succeeded as u64;
        stats.fetch_failures += failed as u64;
    }

    /// Get the current number of stored series.
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }

    /// Render all series in Prometheus exposition format.
    pub fn render(&self) -> String {
        let families = self.families.read();
        let series = self.series.read();
        let mut output = Vec::with_capacity(series.len() * 64);

        let mut by_name: HashMap<&str, Vec<(&SeriesKey, f64)>> = HashMap::new();
        for (key, value) in series.iter() {
            by_name.entry(&key.name).or_default().push((key, *value));
        }

        let mut names: Vec<_> = families.keys().collect();
        names.sort();

        for name in names {
            let Some(entries) = by_name.get_mut(name.as_str()) else {
                continue;
            };
            let desc = &families[name];
            entries.sort_by(|a, b| a.0.cmp(b.0));

            writeln!(output, "# HELP {} {}", name, escape_help(&desc.help)).ok();
            writeln!(output, "# TYPE {} gauge", name).ok();

            for (key, value) in entries.iter() {
                writeln!(
                    output,
                    "{}{} {}",
                    name,
                    format_labels(&desc.label_names, &key.label_values),
                    format_value(*value)
                )
                .ok();
            }
        }

        let stats = self.stats.read();
        let prefix = &self.self_prefix;
        writeln!(output).ok();
        writeln!(output, "# TYPE {}_series_total gauge", prefix).ok();
        writeln!(output, "{}_series_total {}", prefix, series.len()).ok();

        writeln!(output, "# TYPE {}_cycles_total counter", prefix).ok();
        writeln!(output, "{}_cycles_total {}", prefix, stats.cycles_completed).ok();

        writeln!(output, "# TYPE {}_fetch_success_total counter", prefix).ok();
        writeln!(
            output,
            "{}_fetch_success_total {}",
            prefix, stats.fetch_successes
        )
        .ok();

        writeln!(output, "# TYPE {}_fetch_failure_total counter", prefix).ok();
        writeln!(
            output,
            "{}_fetch_failure_total {}",
            prefix, stats.fetch_failures
        )
        .ok();

        String::from_utf8(output).unwrap_or_default()
    }
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<MetricsRegistry>;

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape help text (backslash and newline only).
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format labels for Prometheus exposition format.
fn format_labels(names: &[String], values: &[String]) -> String {
    if names.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = names
        .iter()
        .zip(values)
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}
