//! Operations and helpers shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};

use crate::operation::{BoxOperation, Operation, OperationContext};
use crate::{Error, Result};

/// Returns `start`, `start + 1`, ... on successive executions.
pub(crate) struct Incrementing {
	next: AtomicI64,
	pub(crate) executions: Arc<AtomicUsize>,
}

impl Incrementing {
	pub(crate) fn new(start: i64) -> Self {
		Self {
			next: AtomicI64::new(start),
			executions: Arc::new(AtomicUsize::new(0)),
		}
	}
}

#[async_trait]
impl Operation for Incrementing {
	type Output = i64;

	async fn execute(&self, _cx: &OperationContext) -> Result<i64> {
		self.executions.fetch_add(1, Ordering::SeqCst);
		Ok(self.next.fetch_add(1, Ordering::SeqCst))
	}
}

/// Always fails with the same error allocation.
pub(crate) struct Failing {
	pub(crate) error: Error,
}

impl Failing {
	pub(crate) fn new(message: &'static str) -> Self {
		Self { error: Error::msg(message) }
	}
}

#[async_trait]
impl Operation for Failing {
	type Output = i64;

	async fn execute(&self, _cx: &OperationContext) -> Result<i64> {
		Err(self.error.clone())
	}
}

/// Test-controlled gate: executions announce themselves, then park until the
/// test releases them or their execution is cancelled.
#[derive(Clone)]
pub(crate) struct Gate {
	release: Arc<Semaphore>,
	entered_tx: mpsc::UnboundedSender<()>,
	entered_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>>,
	pub(crate) cancelled: Arc<AtomicUsize>,
}

impl Gate {
	pub(crate) fn new() -> Self {
		let (entered_tx, entered_rx) = mpsc::unbounded_channel();
		Self {
			release: Arc::new(Semaphore::new(0)),
			entered_tx,
			entered_rx: Arc::new(tokio::sync::Mutex::new(entered_rx)),
			cancelled: Arc::new(AtomicUsize::new(0)),
		}
	}

	/// Waits until one more execution has reached the gate.
	pub(crate) async fn entered(&self) {
		let mut rx = self.entered_rx.lock().await;
		tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("execution never reached the gate");
	}

	/// Lets one parked execution continue.
	pub(crate) fn open_one(&self) {
		self.release.add_permits(1);
	}

	async fn pass(&self, cx: &OperationContext) -> Result<()> {
		let _ = self.entered_tx.send(());
		tokio::select! {
			permit = self.release.acquire() => {
				if let Ok(permit) = permit {
					permit.forget();
				}
				Ok(())
			}
			_ = cx.cancelled() => {
				self.cancelled.fetch_add(1, Ordering::SeqCst);
				Err(Error::Cancelled)
			}
		}
	}

	/// Operation that waits at this gate and then produces `outcome`.
	pub(crate) fn op<T>(&self, outcome: Result<T>) -> Gated<T>
	where
		T: Clone + Send + Sync + 'static,
	{
		Gated {
			gate: self.clone(),
			outcome,
			ignore_cancel: false,
			executions: Arc::new(AtomicUsize::new(0)),
		}
	}

	/// Like [`Self::op`], but keeps waiting for the gate after cancellation and
	/// then produces `outcome` anyway.
	pub(crate) fn stubborn_op<T>(&self, outcome: Result<T>) -> Gated<T>
	where
		T: Clone + Send + Sync + 'static,
	{
		Gated {
			ignore_cancel: true,
			..self.op(outcome)
		}
	}
}

pub(crate) struct Gated<T> {
	gate: Gate,
	outcome: Result<T>,
	ignore_cancel: bool,
	pub(crate) executions: Arc<AtomicUsize>,
}

#[async_trait]
impl<T> Operation for Gated<T>
where
	T: Clone + Send + Sync + 'static,
{
	type Output = T;

	async fn execute(&self, cx: &OperationContext) -> Result<T> {
		self.executions.fetch_add(1, Ordering::SeqCst);
		if self.ignore_cancel {
			self.gate.pass(&OperationContext::detached()).await?;
		} else {
			self.gate.pass(cx).await?;
		}
		self.outcome.clone()
	}
}

/// Runs one queued operation per execution, in order.
pub(crate) struct Sequence<T> {
	ops: Mutex<VecDeque<BoxOperation<T>>>,
}

impl<T> Sequence<T>
where
	T: Send + 'static,
{
	pub(crate) fn new(ops: Vec<BoxOperation<T>>) -> Self {
		Self {
			ops: Mutex::new(ops.into()),
		}
	}
}

#[async_trait]
impl<T> Operation for Sequence<T>
where
	T: Send + 'static,
{
	type Output = T;

	async fn execute(&self, cx: &OperationContext) -> Result<T> {
		let next = self.ops.lock().pop_front();
		match next {
			Some(op) => op.execute(cx).await,
			None => Err(Error::msg("sequence exhausted")),
		}
	}
}

/// Polls `cond` until it holds, failing the test after two seconds.
pub(crate) async fn eventually(what: &str, cond: impl Fn() -> bool) {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
	while !cond() {
		assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
		tokio::time::sleep(Duration::from_millis(1)).await;
	}
}
