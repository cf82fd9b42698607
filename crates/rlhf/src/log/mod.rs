//! Metric sinks.
//!
//! Provides:
//! - `MetricLogger` trait for composable backends
//! - `ConsoleLogger` for lightweight logging through `tracing`
//! - `MemoryLogger` that keeps every record in memory
//! - `TensorBoardLogger` for visualization (optional)
//! - `CompositeLogger` for multi-backend logging

mod console;
mod logger;
#[cfg(feature = "tensorboard")]
mod tensorboard;

pub use console::ConsoleLogger;
pub use logger::{CompositeLogger, MemoryLogger, MetricLogger, NoOpLogger, Table};
#[cfg(feature = "tensorboard")]
pub use tensorboard::TensorBoardLogger;
