//! One-at-a-time operation coordinator with an observable lifecycle.
//!
//! A [`WorkflowCoordinator`] runs at most one [`Operation`] at a time and
//! publishes every transition of its [`CoordinatorState`]:
//!
//! ```text
//! Ready        -> Busy(None)        submit
//! Busy(prev)   -> Ready             cancel / reset
//! Busy(prev)   -> Succeeded(value)  operation succeeded
//! Busy(prev)   -> Failed(err, prev) operation failed
//! Succeeded(v) -> Busy(Some(v))     submit
//! Failed(_, v) -> Busy(v)           submit
//! ```
//!
//! Work submitted while busy either waits in a FIFO backlog or, with
//! `cancel_if_busy`, displaces the active execution. Each execution carries an
//! [`ExecutionId`]; a completion whose id is no longer the active one is
//! discarded, so only the most recently started execution is ever observed.
//!
//! The backlog is only non-empty while busy: it drains as soon as the active
//! execution settles, and [`WorkflowCoordinator::cancel`] clears it.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::handle::ExecutionHandle;
use crate::operation::{BoxOperation, Operation};
use crate::progress::Progress;
use crate::token::ExecutionId;
use crate::{Error, Result, TaskClass};

mod state;

pub use state::CoordinatorState;

/// Configuration for one coordinator instance.
#[derive(Debug, Clone)]
pub struct CoordinatorSpec {
	pub(crate) name: String,
	pub(crate) class: TaskClass,
	pub(crate) event_buffer: usize,
}

impl CoordinatorSpec {
	/// Sets the name reported in traces.
	#[must_use]
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = name.into();
		self
	}

	/// Sets the task class used to spawn executions.
	#[must_use]
	pub fn class(mut self, class: TaskClass) -> Self {
		self.class = class;
		self
	}

	/// Sets how many transitions a subscriber may fall behind before it
	/// starts skipping ahead.
	///
	/// # Panics
	///
	/// Panics if `size` is zero.
	#[must_use]
	pub fn event_buffer(mut self, size: usize) -> Self {
		assert!(size > 0, "event buffer size must be > 0");
		self.event_buffer = size;
		self
	}
}

impl Default for CoordinatorSpec {
	fn default() -> Self {
		Self {
			name: "coordinator".to_string(),
			class: TaskClass::Interactive,
			event_buffer: 128,
		}
	}
}

/// The running execution.
struct Active<T> {
	handle: ExecutionHandle<T>,
	prev: Option<T>,
}

enum Phase<T> {
	Ready,
	Busy(Active<T>),
	Succeeded(T),
	Failed(Error, Option<T>),
}

impl<T: Clone> Phase<T> {
	fn last_value(&self) -> Option<T> {
		match self {
			Self::Ready => None,
			Self::Busy(active) => active.prev.clone(),
			Self::Succeeded(value) => Some(value.clone()),
			Self::Failed(_, prev) => prev.clone(),
		}
	}

	fn project(&self) -> CoordinatorState<T> {
		match self {
			Self::Ready => CoordinatorState::Ready,
			Self::Busy(active) => CoordinatorState::Busy(active.prev.clone()),
			Self::Succeeded(value) => CoordinatorState::Succeeded(value.clone()),
			Self::Failed(err, prev) => CoordinatorState::Failed(err.clone(), prev.clone()),
		}
	}

	fn label(&self) -> &'static str {
		match self {
			Self::Ready => "ready",
			Self::Busy(_) => "busy",
			Self::Succeeded(_) => "succeeded",
			Self::Failed(..) => "failed",
		}
	}

	fn active_id(&self) -> Option<ExecutionId> {
		match self {
			Self::Busy(active) => Some(active.handle.id()),
			_ => None,
		}
	}
}

struct CoordinatorCore<T> {
	phase: Phase<T>,
	backlog: VecDeque<BoxOperation<T>>,
}

struct CoordinatorInner<T> {
	spec: CoordinatorSpec,
	core: Mutex<CoordinatorCore<T>>,
	events: broadcast::Sender<CoordinatorState<T>>,
}

/// Runs one operation at a time and publishes its lifecycle.
///
/// Cloning yields another handle to the same coordinator. Dropping the last
/// handle cancels the active execution, if any.
pub struct WorkflowCoordinator<T> {
	inner: Arc<CoordinatorInner<T>>,
}

impl<T> Clone for WorkflowCoordinator<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Default for WorkflowCoordinator<T>
where
	T: Clone + Send + Sync + 'static,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<T> WorkflowCoordinator<T>
where
	T: Clone + Send + Sync + 'static,
{
	/// Creates a coordinator in the `Ready` state.
	pub fn new() -> Self {
		Self::with_spec(CoordinatorSpec::default())
	}

	pub fn with_spec(spec: CoordinatorSpec) -> Self {
		Self::seeded(spec, Phase::Ready)
	}

	/// Creates a coordinator that starts in `Succeeded(value)`.
	pub fn with_value(value: T) -> Self {
		Self::with_spec_and_value(CoordinatorSpec::default(), value)
	}

	pub fn with_spec_and_value(spec: CoordinatorSpec, value: T) -> Self {
		Self::seeded(spec, Phase::Succeeded(value))
	}

	/// Creates a coordinator that starts in `Failed(error, value)`.
	pub fn with_error(error: Error, value: Option<T>) -> Self {
		Self::with_spec_and_error(CoordinatorSpec::default(), error, value)
	}

	pub fn with_spec_and_error(spec: CoordinatorSpec, error: Error, value: Option<T>) -> Self {
		Self::seeded(spec, Phase::Failed(error, value))
	}

	fn seeded(spec: CoordinatorSpec, phase: Phase<T>) -> Self {
		let (events, _) = broadcast::channel(spec.event_buffer.max(1));
		Self {
			inner: Arc::new(CoordinatorInner {
				spec,
				core: Mutex::new(CoordinatorCore {
					phase,
					backlog: VecDeque::new(),
				}),
				events,
			}),
		}
	}

	/// Submits `operation` for execution.
	///
	/// When idle the operation starts immediately and the state becomes
	/// `Busy` carrying the last known value. When busy it is queued behind the
	/// active execution, unless `cancel_if_busy` is set, in which case the
	/// active execution is cancelled (publishing `Ready`) and `operation`
	/// starts in its place. Displacing the active execution leaves the backlog
	/// untouched.
	pub fn submit(&self, operation: impl Operation<Output = T>, cancel_if_busy: bool) {
		let operation: BoxOperation<T> = Arc::new(operation);
		let mut guard = self.inner.core.lock();
		let core = &mut *guard;

		let prev = match &core.phase {
			Phase::Busy(_) if !cancel_if_busy => {
				core.backlog.push_back(operation);
				tracing::debug!(coordinator = %self.inner.spec.name, backlog = core.backlog.len(), "stagehand.coordinator.enqueue");
				return;
			}
			Phase::Busy(active) => {
				let prev = active.prev.clone();
				self.inner.cancel_active(core);
				prev
			}
			phase => phase.last_value(),
		};
		self.inner.begin(core, operation, prev);
	}

	/// Cancels the active execution and drops any queued work.
	///
	/// Transitions `Busy` to `Ready`; has no effect in any other state. The
	/// cancelled operation may still settle later, its outcome is discarded.
	pub fn cancel(&self) {
		let mut guard = self.inner.core.lock();
		let core = &mut *guard;
		if !matches!(core.phase, Phase::Busy(_)) {
			return;
		}
		self.inner.clear_backlog(core);
		self.inner.cancel_active(core);
	}

	/// Clears the backlog, cancels the active execution and returns to
	/// `Ready` from whatever state the coordinator was in.
	pub fn reset(&self) {
		let mut guard = self.inner.core.lock();
		let core = &mut *guard;
		self.inner.clear_backlog(core);
		self.inner.cancel_active(core);
		if !matches!(core.phase, Phase::Ready) {
			self.inner.transition(core, Phase::Ready);
		}
	}

	/// Snapshot of the current state.
	pub fn state(&self) -> CoordinatorState<T> {
		self.inner.core.lock().phase.project()
	}

	pub fn is_busy(&self) -> bool {
		matches!(self.inner.core.lock().phase, Phase::Busy(_))
	}

	/// Last known value, whatever the state.
	pub fn value(&self) -> Option<T> {
		self.inner.core.lock().phase.last_value()
	}

	/// Progress sink of the active execution; `None` unless busy.
	pub fn progress(&self) -> Option<Progress> {
		match &self.inner.core.lock().phase {
			Phase::Busy(active) => active.handle.progress().cloned(),
			_ => None,
		}
	}

	/// Number of operations waiting behind the active execution.
	pub fn backlog_len(&self) -> usize {
		self.inner.core.lock().backlog.len()
	}

	/// Subscribes to state transitions.
	///
	/// The stream yields the state current at subscription time first, then
	/// every later transition in order.
	pub fn subscribe(&self) -> StateStream<T> {
		let core = self.inner.core.lock();
		StateStream {
			pending: Some(core.phase.project()),
			rx: self.inner.events.subscribe(),
			name: self.inner.spec.name.clone(),
		}
	}
}

impl<T> CoordinatorInner<T>
where
	T: Clone + Send + Sync + 'static,
{
	/// Replaces the phase and publishes the new state. Returns the old phase.
	fn transition(&self, core: &mut CoordinatorCore<T>, phase: Phase<T>) -> Phase<T> {
		let old = std::mem::replace(&mut core.phase, phase);
		let state = core.phase.project();
		tracing::debug!(
			coordinator = %self.spec.name,
			from = old.label(),
			to = core.phase.label(),
			execution = ?core.phase.active_id().or(old.active_id()).map(|id| id.get()),
			"stagehand.coordinator.transition"
		);
		// No receivers is fine; nobody is watching yet.
		let _ = self.events.send(state);
		old
	}

	/// Starts `operation` as the active execution.
	fn begin(self: &Arc<Self>, core: &mut CoordinatorCore<T>, operation: BoxOperation<T>, prev: Option<T>) {
		let weak: Weak<Self> = Arc::downgrade(self);
		let mut handle = ExecutionHandle::new(self.spec.class, operation, move |id, outcome| {
			if let Some(inner) = weak.upgrade() {
				inner.settle(id, outcome);
			}
		})
		.with_progress(Progress::new());
		handle.start();
		self.transition(core, Phase::Busy(Active { handle, prev }));
	}

	/// Cancels the active execution, if any, and transitions to `Ready`.
	fn cancel_active(&self, core: &mut CoordinatorCore<T>) {
		if !matches!(core.phase, Phase::Busy(_)) {
			return;
		}
		if let Phase::Busy(active) = self.transition(core, Phase::Ready) {
			active.handle.cancel();
		}
	}

	fn clear_backlog(&self, core: &mut CoordinatorCore<T>) {
		if !core.backlog.is_empty() {
			tracing::debug!(coordinator = %self.spec.name, dropped = core.backlog.len(), "stagehand.coordinator.backlog_cleared");
			core.backlog.clear();
		}
	}

	/// Records the outcome of execution `id` and starts the next queued
	/// operation.
	fn settle(self: &Arc<Self>, id: ExecutionId, outcome: Result<T>) {
		let mut guard = self.core.lock();
		let core = &mut *guard;
		if core.phase.active_id() != Some(id) {
			tracing::debug!(coordinator = %self.spec.name, execution = %id, "stagehand.coordinator.stale_completion");
			return;
		}

		let prev = match &core.phase {
			Phase::Busy(active) => active.prev.clone(),
			_ => None,
		};
		let next = match outcome {
			Ok(value) => Phase::Succeeded(value),
			Err(err) => Phase::Failed(err, prev),
		};
		self.transition(core, next);

		if let Some(operation) = core.backlog.pop_front() {
			tracing::debug!(coordinator = %self.spec.name, remaining = core.backlog.len(), "stagehand.coordinator.drain");
			let prev = core.phase.last_value();
			self.begin(core, operation, prev);
		}
	}
}

/// Ordered stream of coordinator states, see [`WorkflowCoordinator::subscribe`].
///
/// A subscriber that falls more than the configured event buffer behind skips
/// the transitions it missed and resumes from the oldest one still buffered.
pub struct StateStream<T> {
	pending: Option<CoordinatorState<T>>,
	rx: broadcast::Receiver<CoordinatorState<T>>,
	name: String,
}

impl<T> StateStream<T>
where
	T: Clone + Send + Sync + 'static,
{
	/// Next state, or `None` once the coordinator is gone.
	pub async fn next(&mut self) -> Option<CoordinatorState<T>> {
		if let Some(state) = self.pending.take() {
			return Some(state);
		}
		loop {
			match self.rx.recv().await {
				Ok(state) => return Some(state),
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					tracing::warn!(coordinator = %self.name, skipped, "stagehand.coordinator.subscriber_lagged");
				}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}

	/// Next state if one is already available.
	pub fn try_next(&mut self) -> Option<CoordinatorState<T>> {
		if let Some(state) = self.pending.take() {
			return Some(state);
		}
		loop {
			match self.rx.try_recv() {
				Ok(state) => return Some(state),
				Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
					tracing::warn!(coordinator = %self.name, skipped, "stagehand.coordinator.subscriber_lagged");
				}
				Err(_) => return None,
			}
		}
	}

	/// Waits for the first state matching `pred`, discarding the others.
	pub async fn wait_for(&mut self, mut pred: impl FnMut(&CoordinatorState<T>) -> bool) -> Option<CoordinatorState<T>> {
		while let Some(state) = self.next().await {
			if pred(&state) {
				return Some(state);
			}
		}
		None
	}
}

impl<T> std::fmt::Debug for StateStream<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StateStream").field("coordinator", &self.name).field("pending", &self.pending.is_some()).finish()
	}
}
