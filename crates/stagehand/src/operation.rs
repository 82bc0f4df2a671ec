use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::progress::Progress;
use crate::timeout::WithTimeout;
use crate::token::{ExecutionId, next_execution_id};
use crate::{Error, Result};

/// A named, cancellable, failable unit of async work producing `Output`.
///
/// Operations may be executed any number of times and concurrently, so
/// `execute` takes `&self`. Cancellation is cooperative: implementations check
/// [`OperationContext::is_cancelled`] or await [`OperationContext::cancelled`]
/// at safe points and return [`Error::Cancelled`].
#[async_trait]
pub trait Operation: Send + Sync + 'static {
	type Output: Send + 'static;

	async fn execute(&self, cx: &OperationContext) -> Result<Self::Output>;
}

/// Type-erased shared operation.
pub type BoxOperation<T> = Arc<dyn Operation<Output = T>>;

#[async_trait]
impl<O> Operation for Arc<O>
where
	O: Operation + ?Sized,
{
	type Output = O::Output;

	async fn execute(&self, cx: &OperationContext) -> Result<Self::Output> {
		(**self).execute(cx).await
	}
}

/// Per-execution context handed to [`Operation::execute`].
///
/// Carries the execution id, the cancellation flag and, for coordinated
/// executions, the progress sink. Contexts are passed explicitly rather than
/// through task-locals so nested operations see exactly what their caller
/// chose to share.
#[derive(Debug, Clone)]
pub struct OperationContext {
	id: ExecutionId,
	cancel: CancellationToken,
	progress: Option<Progress>,
}

impl OperationContext {
	pub(crate) fn new(id: ExecutionId, cancel: CancellationToken, progress: Option<Progress>) -> Self {
		Self { id, cancel, progress }
	}

	/// Context for running an operation outside any cache or coordinator.
	pub fn detached() -> Self {
		Self::new(next_execution_id(), CancellationToken::new(), None)
	}

	/// Detached context with a progress sink attached.
	pub fn detached_with_progress(progress: Progress) -> Self {
		Self::new(next_execution_id(), CancellationToken::new(), Some(progress))
	}

	pub fn id(&self) -> ExecutionId {
		self.id
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Resolves once cancellation has been requested.
	pub async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}

	/// Returns [`Error::Cancelled`] once cancellation has been requested.
	pub fn check_cancelled(&self) -> Result<()> {
		if self.cancel.is_cancelled() { Err(Error::Cancelled) } else { Ok(()) }
	}

	pub fn cancellation_token(&self) -> &CancellationToken {
		&self.cancel
	}

	/// Progress sink of the current execution.
	///
	/// Returns [`Error::Misuse`] when no sink is attached, which is the case
	/// for cache loads and detached contexts.
	pub fn progress(&self) -> Result<&Progress> {
		self.progress.as_ref().ok_or(Error::Misuse("progress sink used outside a coordinated execution"))
	}

	/// Context sharing this execution's id and progress with a child
	/// cancellation token. Cancelling the child leaves the parent running.
	pub fn child(&self) -> Self {
		Self {
			id: self.id,
			cancel: self.cancel.child_token(),
			progress: self.progress.clone(),
		}
	}
}

/// Operation built from an async closure, see [`from_fn`].
pub struct FnOperation<F> {
	f: F,
}

/// Adapts `f` into an [`Operation`].
///
/// The closure receives an owned clone of the context so the returned future
/// can be `'static`.
pub fn from_fn<F, Fut, T>(f: F) -> FnOperation<F>
where
	F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<T>> + Send + 'static,
	T: Send + 'static,
{
	FnOperation { f }
}

#[async_trait]
impl<F, Fut, T> Operation for FnOperation<F>
where
	F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<T>> + Send + 'static,
	T: Send + 'static,
{
	type Output = T;

	async fn execute(&self, cx: &OperationContext) -> Result<T> {
		(self.f)(cx.clone()).await
	}
}

/// Combinators available on every [`Operation`].
pub trait OperationExt: Operation + Sized {
	/// Cancels the operation if it has not settled after `timeout`.
	fn with_timeout(self, timeout: Duration) -> WithTimeout<Self> {
		WithTimeout::new(timeout, self)
	}

	/// Erases the concrete operation type.
	fn boxed(self) -> BoxOperation<Self::Output> {
		Arc::new(self)
	}
}

impl<O: Operation> OperationExt for O {}
