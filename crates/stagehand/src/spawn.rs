//! Task spawning for executions.
//!
//! Coordinators are driven from synchronous call sites as often as from async
//! ones, so spawning never requires an ambient runtime: without one, tasks land
//! on a small runtime owned by this crate.

use std::future::Future;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

use crate::{Error, Result, TaskClass};

/// Runtime for executions started outside any Tokio runtime.
fn detached_runtime() -> &'static Runtime {
	static DETACHED: OnceLock<Runtime> = OnceLock::new();
	DETACHED.get_or_init(|| {
		let workers = AtomicUsize::new(0);
		Builder::new_multi_thread()
			.enable_all()
			.worker_threads(2)
			.thread_name_fn(move || format!("stagehand-exec-{}", workers.fetch_add(1, Ordering::Relaxed)))
			.build()
			.expect("failed to build stagehand execution runtime")
	})
}

/// Spawns `fut` inside a `stagehand.task` span tagged with its class.
pub fn spawn<F>(class: TaskClass, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	let fut = fut.instrument(tracing::debug_span!("stagehand.task", class = class.as_str()));
	match Handle::try_current() {
		Ok(handle) => handle.spawn(fut),
		Err(_) => {
			tracing::trace!(class = class.as_str(), "stagehand.spawn.detached");
			detached_runtime().spawn(fut)
		}
	}
}

/// Runs `fut` on its own task and resolves to its outcome.
///
/// A panic inside `fut` settles as [`Error::OperationFailed`] carrying the
/// panic message and an aborted task as [`Error::Cancelled`], so whoever
/// awaits this never loses the outcome.
pub(crate) async fn run_isolated<F, T>(class: TaskClass, fut: F) -> Result<T>
where
	F: Future<Output = Result<T>> + Send + 'static,
	T: Send + 'static,
{
	spawn(class, fut).await.unwrap_or_else(|err| Err(join_failure(err)))
}

fn join_failure(err: JoinError) -> Error {
	if !err.is_panic() {
		return Error::Cancelled;
	}
	let payload = err.into_panic();
	let message = payload
		.downcast_ref::<&'static str>()
		.map(|msg| (*msg).to_string())
		.or_else(|| payload.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "non-string panic payload".to_string());
	tracing::warn!(panic = %message, "stagehand.spawn.operation_panicked");
	Error::msg(format!("operation panicked: {message}"))
}
