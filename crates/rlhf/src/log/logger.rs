//! Metric logger traits and composites.

use std::collections::HashMap;
use std::sync::Mutex;

/// A named table of string cells, one `Vec` per row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Mean of every column whose cells all parse as numbers.
    pub fn numeric_column_means(&self) -> Vec<(String, f64)> {
        if self.rows.is_empty() {
            return Vec::new();
        }
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(col, name)| {
                let values = self
                    .rows
                    .iter()
                    .map(|row| row.get(col)?.trim().parse::<f64>().ok())
                    .collect::<Option<Vec<f64>>>()?;
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                Some((name.clone(), mean))
            })
            .collect()
    }
}

/// Trait for logging metrics to various backends.
///
/// Delivery is fire-and-forget: backends swallow their own failures.
pub trait MetricLogger: Send + Sync {
    /// Log a scalar value (e.g. reward, loss).
    fn log_scalar(&self, name: &str, value: f64, step: u64);

    /// Log a set of metrics collected in a map.
    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64);

    /// Log a table of samples (e.g. query, response, reward).
    fn log_table(&self, _name: &str, _table: &Table, _step: u64) {}

    /// Close the logger and flush any pending writes.
    fn close(&self) {}
}

/// A logger that does nothing (default).
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_scalar(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_metrics(&self, _metrics: &HashMap<String, f64>, _step: u64) {}
}

/// A composite logger that dispatches to multiple backends.
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }
}

impl MetricLogger for CompositeLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log_scalar(name, value, step);
        }
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        for logger in &self.loggers {
            logger.log_metrics(metrics, step);
        }
    }

    fn log_table(&self, name: &str, table: &Table, step: u64) {
        for logger in &self.loggers {
            logger.log_table(name, table, step);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}

/// Logger that records everything it receives.
#[derive(Default)]
pub struct MemoryLogger {
    scalars: Mutex<Vec<(u64, String, f64)>>,
    tables: Mutex<Vec<(u64, String, Table)>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values recorded under `name`, in step order of arrival.
    pub fn series(&self, name: &str) -> Vec<(u64, f64)> {
        self.scalars
            .lock()
            .map(|scalars| {
                scalars
                    .iter()
                    .filter(|(_, n, _)| n == name)
                    .map(|(step, _, value)| (*step, *value))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every metric name seen so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .scalars
            .lock()
            .map(|scalars| scalars.iter().map(|(_, n, _)| n.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names.dedup();
        names
    }

    /// Tables recorded under `name`.
    pub fn tables(&self, name: &str) -> Vec<(u64, Table)> {
        self.tables
            .lock()
            .map(|tables| {
                tables
                    .iter()
                    .filter(|(_, n, _)| n == name)
                    .map(|(step, _, table)| (*step, table.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl MetricLogger for MemoryLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        if let Ok(mut scalars) = self.scalars.lock() {
            scalars.push((step, name.to_string(), value));
        }
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        if let Ok(mut scalars) = self.scalars.lock() {
            let mut sorted: Vec<_> = metrics.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            for (name, value) in sorted {
                scalars.push((step, name.clone(), *value));
            }
        }
    }

    fn log_table(&self, name: &str, table: &Table, step: u64) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.push((step, name.to_string(), table.clone()));
        }
    }
}
