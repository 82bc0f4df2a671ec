use crate::Error;

/// Observable lifecycle of a [`super::WorkflowCoordinator`].
///
/// Every variant except `Ready` carries the last known value, if any, so views
/// can keep showing stale data while a refresh runs or after it failed.
#[derive(Debug, Clone)]
pub enum CoordinatorState<T> {
	/// Idle with no outcome to report.
	Ready,
	/// An operation is running; carries the value known when it started.
	Busy(Option<T>),
	/// The most recent operation produced a value.
	Succeeded(T),
	/// The most recent operation failed; carries the value known before it.
	Failed(Error, Option<T>),
}

impl<T> CoordinatorState<T> {
	pub fn is_ready(&self) -> bool {
		matches!(self, Self::Ready)
	}

	pub fn is_busy(&self) -> bool {
		matches!(self, Self::Busy(_))
	}

	pub fn is_succeeded(&self) -> bool {
		matches!(self, Self::Succeeded(_))
	}

	pub fn is_failed(&self) -> bool {
		matches!(self, Self::Failed(..))
	}

	/// Last known value carried by this state.
	pub fn value(&self) -> Option<&T> {
		match self {
			Self::Ready => None,
			Self::Busy(prev) | Self::Failed(_, prev) => prev.as_ref(),
			Self::Succeeded(value) => Some(value),
		}
	}

	pub fn error(&self) -> Option<&Error> {
		match self {
			Self::Failed(err, _) => Some(err),
			_ => None,
		}
	}
}

/// Structural equality. Failures compare by identity, see
/// [`Error::same_failure`].
impl<T: PartialEq> PartialEq for CoordinatorState<T> {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Ready, Self::Ready) => true,
			(Self::Busy(a), Self::Busy(b)) => a == b,
			(Self::Succeeded(a), Self::Succeeded(b)) => a == b,
			(Self::Failed(ea, a), Self::Failed(eb, b)) => ea.same_failure(eb) && a == b,
			_ => false,
		}
	}
}

impl<T: std::fmt::Debug> std::fmt::Display for CoordinatorState<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Ready => f.write_str("ready"),
			Self::Busy(None) => f.write_str("busy"),
			Self::Busy(Some(prev)) => write!(f, "busy (previous: {prev:?})"),
			Self::Succeeded(value) => write!(f, "succeeded: {value:?}"),
			Self::Failed(err, None) => write!(f, "failed: {err}"),
			Self::Failed(err, Some(prev)) => write!(f, "failed: {err} (previous: {prev:?})"),
		}
	}
}
