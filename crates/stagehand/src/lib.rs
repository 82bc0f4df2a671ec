//! Coordination primitives for long-running async operations.
//!
//! Two engines share one execution contract:
//!
//! * [`SingleFlightCache`] lazily loads one value, deduplicating concurrent
//!   loaders so the [`Operation`] runs at most once per load.
//! * [`WorkflowCoordinator`] runs one [`Operation`] at a time, publishes its
//!   lifecycle as [`CoordinatorState`], and queues work submitted while busy.
//!
//! Both route operations through an [`ExecutionHandle`], which owns the
//! spawned task and delivers exactly one completion per start.

/// Single-flight memoizing loader.
pub mod cache;
/// Task classification for spawned executions.
pub mod class;
/// Stateful one-at-a-time operation coordinator.
pub mod coordinator;
/// Error taxonomy shared by all primitives.
pub mod error;
/// Spawned execution ownership and completion delivery.
pub mod handle;
/// Operation contract and execution context.
pub mod operation;
/// Hierarchical progress sink.
pub mod progress;
mod spawn;
/// Timeout decorator for operations.
pub mod timeout;
#[cfg(test)]
mod test_support;
mod token;

pub use cache::{CacheSpec, SingleFlightCache};
pub use class::TaskClass;
pub use coordinator::{CoordinatorSpec, CoordinatorState, StateStream, WorkflowCoordinator};
pub use error::{Error, Result};
pub use handle::ExecutionHandle;
pub use operation::{BoxOperation, FnOperation, Operation, OperationContext, OperationExt, from_fn};
pub use progress::{Progress, report_progress};
pub use spawn::spawn;
pub use timeout::WithTimeout;
pub use token::ExecutionId;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Installs a stderr `fmt` subscriber filtered by `RUST_LOG`.
///
/// The library never installs a subscriber on its own; binaries and tests call
/// this when they want to see `stagehand.*` events. Defaults to `info` when
/// `RUST_LOG` is unset. Calling it twice is a no-op.
pub fn init_tracing() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let _ = tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)).with(filter).try_init();
}
