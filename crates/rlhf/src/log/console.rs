//! Console logging backend.

use super::{MetricLogger, Table};
use std::collections::HashMap;

/// Logger that prints metrics via tracing.
pub struct ConsoleLogger {
    /// Maximum table rows printed per call
    max_table_rows: usize,
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleLogger {
    pub fn new() -> Self {
        Self { max_table_rows: 4 }
    }

    pub fn with_max_table_rows(mut self, rows: usize) -> Self {
        self.max_table_rows = rows;
        self
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::info!("Step {}: {} = {:.4}", step, name, value);
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        // Group output to avoid spamming lines
        let mut sorted: Vec<_> = metrics.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        let output = sorted
            .iter()
            .map(|(key, value)| format!("{key}={value:.4}"))
            .collect::<Vec<_>>()
            .join(", ");

        tracing::info!("Step {}: {}", step, output);
    }

    fn log_table(&self, name: &str, table: &Table, step: u64) {
        for row in table.rows.iter().take(self.max_table_rows) {
            let cells = table
                .columns
                .iter()
                .zip(row)
                .map(|(column, cell)| format!("{column}={cell:?}"))
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!("Step {}: [{}] {}", step, name, cells);
        }
    }
}
