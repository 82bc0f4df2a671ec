use std::time::Duration;

use async_trait::async_trait;

use crate::operation::{Operation, OperationContext};
use crate::{Error, Result};

/// Operation decorator that cancels its inner operation after a deadline.
///
/// The inner operation runs with a child cancellation token. When the timer
/// wins the race the child token is cancelled and [`Error::Cancelled`] is
/// returned; an outcome that arrives first is passed through unchanged.
pub struct WithTimeout<O> {
	timeout: Duration,
	inner: O,
}

impl<O> WithTimeout<O> {
	pub fn new(timeout: Duration, inner: O) -> Self {
		Self { timeout, inner }
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}
}

#[async_trait]
impl<O> Operation for WithTimeout<O>
where
	O: Operation,
{
	type Output = O::Output;

	async fn execute(&self, cx: &OperationContext) -> Result<O::Output> {
		let child = cx.child();
		tokio::select! {
			biased;
			outcome = self.inner.execute(&child) => outcome,
			_ = tokio::time::sleep(self.timeout) => {
				tracing::debug!(execution = %cx.id(), timeout_ms = millis(self.timeout), "stagehand.timeout.expired");
				child.cancellation_token().cancel();
				Err(Error::Cancelled)
			}
		}
	}
}

/// Whole milliseconds for trace fields, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
