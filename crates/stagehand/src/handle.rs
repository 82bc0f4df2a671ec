use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::operation::{BoxOperation, OperationContext};
use crate::progress::Progress;
use crate::spawn::run_isolated;
use crate::token::{ExecutionId, next_execution_id};
use crate::{Error, Result, TaskClass};

type Completion<T> = Box<dyn FnOnce(ExecutionId, Result<T>) + Send + 'static>;

/// Owns one spawned execution of an operation.
///
/// The completion callback runs exactly once per started handle with the
/// operation's outcome, including after the handle itself has been dropped.
/// Owners must therefore tolerate late callbacks and discard them by comparing
/// the [`ExecutionId`] they receive with the execution they consider current.
///
/// Dropping a handle requests cancellation; no execution outlives its handle
/// without having been told to stop.
pub struct ExecutionHandle<T> {
	id: ExecutionId,
	class: TaskClass,
	cancel: CancellationToken,
	progress: Option<Progress>,
	pending: Option<(BoxOperation<T>, Completion<T>)>,
	task: Option<JoinHandle<()>>,
}

impl<T> ExecutionHandle<T>
where
	T: Send + 'static,
{
	/// Creates an unstarted handle with a freshly minted execution id.
	pub fn new(class: TaskClass, operation: BoxOperation<T>, completion: impl FnOnce(ExecutionId, Result<T>) + Send + 'static) -> Self {
		Self {
			id: next_execution_id(),
			class,
			cancel: CancellationToken::new(),
			progress: None,
			pending: Some((operation, Box::new(completion))),
			task: None,
		}
	}

	/// Attaches a progress sink, exposed to the operation through its context
	/// and finalized when the execution settles.
	#[must_use]
	pub fn with_progress(mut self, progress: Progress) -> Self {
		self.progress = Some(progress);
		self
	}

	/// Spawns the execution.
	///
	/// # Panics
	///
	/// Panics if called more than once.
	pub fn start(&mut self) {
		let Some((operation, completion)) = self.pending.take() else {
			panic!("ExecutionHandle::start called more than once for {}", self.id);
		};

		let id = self.id;
		let class = self.class;
		let progress = self.progress.clone();
		let cx = OperationContext::new(id, self.cancel.clone(), progress.clone());
		tracing::debug!(execution = %id, class = %class, "stagehand.handle.start");

		self.task = Some(crate::spawn(class, async move {
			let outcome = run_isolated(class, async move { operation.execute(&cx).await }).await;

			if let Some(progress) = progress
				&& progress.finalize()
			{
				tracing::debug!(execution = %id, "stagehand.handle.progress_forced_complete");
			}

			tracing::debug!(
				execution = %id,
				outcome = match &outcome {
					Ok(_) => "succeeded",
					Err(Error::Cancelled) => "cancelled",
					Err(_) => "failed",
				},
				"stagehand.handle.settled"
			);
			completion(id, outcome);
		}));
	}
}

impl<T> ExecutionHandle<T> {
	pub fn id(&self) -> ExecutionId {
		self.id
	}

	pub fn progress(&self) -> Option<&Progress> {
		self.progress.as_ref()
	}

	pub fn is_started(&self) -> bool {
		self.task.is_some()
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Requests cooperative cancellation. Idempotent.
	pub fn cancel(&self) {
		if !self.cancel.is_cancelled() {
			tracing::debug!(execution = %self.id, "stagehand.handle.cancel");
			self.cancel.cancel();
		}
	}
}

impl<T> Drop for ExecutionHandle<T> {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

impl<T> std::fmt::Debug for ExecutionHandle<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ExecutionHandle")
			.field("id", &self.id)
			.field("class", &self.class)
			.field("started", &self.task.is_some())
			.field("cancelled", &self.cancel.is_cancelled())
			.finish()
	}
}
