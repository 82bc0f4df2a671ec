//! Error taxonomy for cache loads and coordinated executions.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Outcome of an operation that did not produce a value.
///
/// Cloneable so one failure can be delivered to every waiter of a load and
/// stored in [`crate::CoordinatorState::Failed`].
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// The operation or the waiting caller was cancelled.
	#[error("operation cancelled")]
	Cancelled,

	/// The operation returned an error of its own.
	#[error("operation failed: {0}")]
	OperationFailed(Arc<anyhow::Error>),

	/// API misuse detected at runtime, e.g. reading a progress sink that was
	/// never attached to the current execution.
	#[error("programmer misuse: {0}")]
	Misuse(&'static str),
}

impl Error {
	/// Wraps an arbitrary error as [`Error::OperationFailed`].
	pub fn failed(err: impl Into<anyhow::Error>) -> Self {
		Self::OperationFailed(Arc::new(err.into()))
	}

	/// Builds an [`Error::OperationFailed`] from a message.
	pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
		Self::OperationFailed(Arc::new(anyhow::Error::msg(message)))
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}

	/// Returns the underlying cause of an operation failure.
	pub fn cause(&self) -> Option<&anyhow::Error> {
		match self {
			Self::OperationFailed(cause) => Some(cause),
			_ => None,
		}
	}

	/// Downcasts the underlying cause of an operation failure.
	pub fn downcast_ref<E>(&self) -> Option<&E>
	where
		E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
	{
		self.cause().and_then(|cause| cause.downcast_ref::<E>())
	}

	/// Returns true when both errors share the same failure allocation.
	///
	/// Every waiter of one settled load receives a clone of the same error,
	/// so identity is a reliable way to tell outcomes apart in tests and logs.
	pub fn same_failure(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Cancelled, Self::Cancelled) => true,
			(Self::OperationFailed(a), Self::OperationFailed(b)) => Arc::ptr_eq(a, b),
			(Self::Misuse(a), Self::Misuse(b)) => a == b,
			_ => false,
		}
	}
}

impl From<anyhow::Error> for Error {
	fn from(err: anyhow::Error) -> Self {
		Self::OperationFailed(Arc::new(err))
	}
}
