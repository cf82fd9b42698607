//! TensorBoard logging backend.

use super::{MetricLogger, Table};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tensorboard_rs::summary_writer::SummaryWriter;

/// Logger that writes round metrics to TensorBoard event files.
///
/// Sample tables are reduced to the means of their numeric columns
/// (`game_log/reward`), since event files only carry scalars here.
pub struct TensorBoardLogger {
    writer: Mutex<SummaryWriter>,
    flush_every: u64,
}

impl TensorBoardLogger {
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        tracing::info!(dir = %log_dir.as_ref().display(), "Writing TensorBoard events");
        Self {
            writer: Mutex::new(SummaryWriter::new(log_dir.as_ref())),
            flush_every: 1,
        }
    }

    /// Flush only on rounds that are a multiple of `rounds`.
    pub fn with_flush_every(mut self, rounds: u64) -> Self {
        self.flush_every = rounds.max(1);
        self
    }

    fn write<'a>(&self, scalars: impl IntoIterator<Item = (&'a str, f64)>, step: u64) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        for (name, value) in scalars {
            writer.add_scalar(name, value as f32, step as usize);
        }
        if step % self.flush_every == 0 {
            let _ = writer.flush();
        }
    }
}

impl MetricLogger for TensorBoardLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        self.write([(name, value)], step);
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        self.write(metrics.iter().map(|(name, value)| (name.as_str(), *value)), step);
    }

    fn log_table(&self, name: &str, table: &Table, step: u64) {
        let means: Vec<(String, f64)> = table
            .numeric_column_means()
            .into_iter()
            .map(|(column, mean)| (format!("{name}/{column}"), mean))
            .collect();
        self.write(means.iter().map(|(tag, mean)| (tag.as_str(), *mean)), step);
    }

    fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}
