use std::sync::atomic::{AtomicU64, Ordering};

/// Unique token minted for every execution.
///
/// Owners compare the id carried by a completion against the id of the
/// execution they currently consider active; a mismatch marks the completion
/// as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(u64);

impl ExecutionId {
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl std::fmt::Display for ExecutionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "exec#{}", self.0)
	}
}

/// Process-wide monotonic execution clock, starting at 1.
static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Mints the next execution id.
pub(crate) fn next_execution_id() -> ExecutionId {
	ExecutionId(CLOCK.fetch_add(1, Ordering::AcqRel).wrapping_add(1))
}

/// Monotonic id source for waiters registered on one cache instance.
#[derive(Debug, Default)]
pub(crate) struct WaiterClock {
	next: u64,
}

impl WaiterClock {
	/// Returns the next waiter id. Only called under the owner's lock.
	pub(crate) fn next(&mut self) -> u64 {
		self.next = self.next.wrapping_add(1);
		self.next
	}
}
