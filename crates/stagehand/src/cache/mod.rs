//! Single-flight memoizing loader.
//!
//! A [`SingleFlightCache`] holds zero or one value produced by its configured
//! operation. The first caller to find the cache empty triggers a load; every
//! caller arriving while that load is in flight joins it as a waiter and
//! receives the same outcome. The operation is never executed twice for one
//! load.
//!
//! # Reset
//!
//! [`SingleFlightCache::reset`] discards a cached value and loads again. A
//! reset issued while a load is already in flight does not start a second
//! execution: it joins the in-flight load exactly like
//! [`SingleFlightCache::value`] and may therefore observe a value that was
//! requested before the reset. Appoint a single owner to call `reset` when
//! that distinction matters. If the joined load fails, the reset then runs
//! one load of its own and returns that outcome instead.
//!
//! A reset that fails keeps the previously cached value. A load whose
//! operation itself reports [`Error::Cancelled`] always leaves the cache empty.
//!
//! # Cancellation
//!
//! Dropping the future returned by `value`/`reset`, or cancelling the token
//! given to the `*_until` variants, cancels that caller:
//!
//! * a waiter is removed alone; the load and other waiters continue;
//! * the triggering caller cancels the whole load, every waiter resolves to
//!   [`Error::Cancelled`], and the cache returns to its previous value (or
//!   empty).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::handle::ExecutionHandle;
use crate::operation::{BoxOperation, Operation};
use crate::token::{ExecutionId, WaiterClock};
use crate::{Error, Result, TaskClass};

/// Configuration for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheSpec {
	pub(crate) name: String,
	pub(crate) class: TaskClass,
}

impl CacheSpec {
	/// Sets the name reported in traces.
	#[must_use]
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = name.into();
		self
	}

	/// Sets the task class used to spawn loads.
	#[must_use]
	pub fn class(mut self, class: TaskClass) -> Self {
		self.class = class;
		self
	}
}

impl Default for CacheSpec {
	fn default() -> Self {
		Self {
			name: "cache".to_string(),
			class: TaskClass::Background,
		}
	}
}

type Waiter<T> = oneshot::Sender<Result<T>>;

/// One in-flight load.
struct Load<T> {
	handle: ExecutionHandle<T>,
	/// Value to restore when the load is cancelled or a reset fails.
	fallback: Option<T>,
	/// Waiter id of the caller that started the load.
	trigger: u64,
	/// Every suspended caller, trigger included, keyed by waiter id.
	waiters: HashMap<u64, Waiter<T>>,
}

enum CacheState<T> {
	Empty,
	Loading(Load<T>),
	Cached(T),
}

struct CacheCore<T> {
	state: CacheState<T>,
	waiter_ids: WaiterClock,
}

struct CacheInner<T> {
	spec: CacheSpec,
	operation: BoxOperation<T>,
	core: Mutex<CacheCore<T>>,
}

/// Lazily loaded, single-flight cached value.
///
/// Cloning yields another handle to the same cache.
pub struct SingleFlightCache<T> {
	inner: Arc<CacheInner<T>>,
}

impl<T> Clone for SingleFlightCache<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> SingleFlightCache<T>
where
	T: Clone + Send + Sync + 'static,
{
	/// Creates an empty cache loaded by `operation`.
	pub fn new(operation: impl Operation<Output = T>) -> Self {
		Self::with_spec(CacheSpec::default(), operation)
	}

	/// Creates an empty cache with explicit configuration.
	pub fn with_spec(spec: CacheSpec, operation: impl Operation<Output = T>) -> Self {
		Self {
			inner: Arc::new(CacheInner {
				spec,
				operation: Arc::new(operation),
				core: Mutex::new(CacheCore {
					state: CacheState::Empty,
					waiter_ids: WaiterClock::default(),
				}),
			}),
		}
	}

	/// Returns the cached value, loading it first if needed.
	pub async fn value(&self) -> Result<T> {
		self.fetch(false, None).await
	}

	/// Discards the cached value and loads a fresh one, or joins the load
	/// already in flight. A joined load that fails is followed by one load of
	/// the reset's own.
	pub async fn reset(&self) -> Result<T> {
		self.fetch(true, None).await
	}

	/// Like [`Self::value`], resolving to [`Error::Cancelled`] once `cancel`
	/// fires.
	pub async fn value_until(&self, cancel: &CancellationToken) -> Result<T> {
		self.fetch(false, Some(cancel)).await
	}

	/// Like [`Self::reset`], resolving to [`Error::Cancelled`] once `cancel`
	/// fires.
	pub async fn reset_until(&self, cancel: &CancellationToken) -> Result<T> {
		self.fetch(true, Some(cancel)).await
	}

	/// Returns the cached value without loading.
	pub fn peek(&self) -> Option<T> {
		match &self.inner.core.lock().state {
			CacheState::Cached(value) => Some(value.clone()),
			_ => None,
		}
	}

	pub fn is_loading(&self) -> bool {
		matches!(self.inner.core.lock().state, CacheState::Loading(_))
	}

	/// Number of callers joined to the in-flight load, excluding its trigger.
	pub fn waiter_count(&self) -> usize {
		match &self.inner.core.lock().state {
			CacheState::Loading(load) => load.waiters.keys().filter(|id| **id != load.trigger).count(),
			_ => 0,
		}
	}

	async fn fetch(&self, force: bool, cancel: Option<&CancellationToken>) -> Result<T> {
		let (ticket, rx) = match self.enter(force) {
			Entry::Cached(value) => return Ok(value),
			Entry::Wait(ticket, rx) => (ticket, rx),
		};
		let joined = !ticket.trigger;
		let outcome = ticket.wait(rx, cancel).await;
		if !(force && joined && matches!(outcome, Err(Error::OperationFailed(_)))) {
			return outcome;
		}

		// The joined load was requested before this reset; run one of our own.
		tracing::debug!(cache = %self.inner.spec.name, "stagehand.cache.reset_retry");
		match self.enter(true) {
			Entry::Cached(value) => Ok(value),
			Entry::Wait(ticket, rx) => ticket.wait(rx, cancel).await,
		}
	}

	/// Serves the cached value or registers the caller on a load.
	fn enter(&self, force: bool) -> Entry<T> {
		let mut core = self.inner.core.lock();
		let waiter = core.waiter_ids.next();
		let (tx, rx) = oneshot::channel();
		match &mut core.state {
			CacheState::Cached(value) if !force => Entry::Cached(value.clone()),
			CacheState::Loading(load) => {
				load.waiters.insert(waiter, tx);
				tracing::trace!(cache = %self.inner.spec.name, execution = %load.handle.id(), waiter, reset = force, "stagehand.cache.join");
				Entry::Wait(Ticket::new(&self.inner, load.handle.id(), waiter, false), rx)
			}
			state => {
				let fallback = match std::mem::replace(state, CacheState::Empty) {
					CacheState::Cached(value) => Some(value),
					_ => None,
				};
				let load = self.inner.start_load(waiter, tx, fallback);
				let ticket = Ticket::new(&self.inner, load.handle.id(), waiter, true);
				*state = CacheState::Loading(load);
				Entry::Wait(ticket, rx)
			}
		}
	}
}

/// How a caller was admitted by `enter`.
enum Entry<T>
where
	T: Clone + Send + Sync + 'static,
{
	Cached(T),
	Wait(Ticket<T>, oneshot::Receiver<Result<T>>),
}

impl<T> CacheInner<T>
where
	T: Clone + Send + Sync + 'static,
{
	/// Spawns a load for the trigger `waiter`. Called under the core lock.
	fn start_load(self: &Arc<Self>, waiter: u64, tx: Waiter<T>, fallback: Option<T>) -> Load<T> {
		let weak: Weak<Self> = Arc::downgrade(self);
		let mut handle = ExecutionHandle::new(self.spec.class, Arc::clone(&self.operation), move |id, outcome| {
			if let Some(inner) = weak.upgrade() {
				inner.settle(id, outcome);
			}
		});
		tracing::debug!(cache = %self.spec.name, execution = %handle.id(), reset = fallback.is_some(), "stagehand.cache.load_start");
		handle.start();
		Load {
			handle,
			fallback,
			trigger: waiter,
			waiters: HashMap::from([(waiter, tx)]),
		}
	}

	/// Delivers the outcome of load `id` to all of its waiters.
	fn settle(&self, id: ExecutionId, outcome: Result<T>) {
		let mut core = self.core.lock();
		let current = matches!(&core.state, CacheState::Loading(load) if load.handle.id() == id);
		if !current {
			tracing::debug!(cache = %self.spec.name, execution = %id, "stagehand.cache.stale_completion");
			return;
		}
		let CacheState::Loading(load) = std::mem::replace(&mut core.state, CacheState::Empty) else {
			unreachable!()
		};

		core.state = match &outcome {
			Ok(value) => CacheState::Cached(value.clone()),
			Err(Error::Cancelled) => CacheState::Empty,
			Err(_) => load.fallback.map_or(CacheState::Empty, CacheState::Cached),
		};
		tracing::debug!(
			cache = %self.spec.name,
			execution = %id,
			waiters = load.waiters.len(),
			ok = outcome.is_ok(),
			cached = matches!(core.state, CacheState::Cached(_)),
			"stagehand.cache.settled"
		);
		for tx in load.waiters.into_values() {
			let _ = tx.send(outcome.clone());
		}
	}

	/// Withdraws a caller from load `id` before it settled.
	fn abandon(&self, id: ExecutionId, waiter: u64, trigger: bool) {
		let mut core = self.core.lock();
		let CacheState::Loading(load) = &mut core.state else {
			return;
		};
		if load.handle.id() != id {
			return;
		}

		if !trigger {
			load.waiters.remove(&waiter);
			tracing::debug!(cache = %self.spec.name, execution = %id, waiter, "stagehand.cache.waiter_cancelled");
			return;
		}

		let CacheState::Loading(load) = std::mem::replace(&mut core.state, CacheState::Empty) else {
			unreachable!()
		};
		load.handle.cancel();
		core.state = load.fallback.map_or(CacheState::Empty, CacheState::Cached);
		tracing::debug!(
			cache = %self.spec.name,
			execution = %id,
			waiters = load.waiters.len().saturating_sub(1),
			"stagehand.cache.trigger_cancelled"
		);
		for (other, tx) in load.waiters {
			if other != waiter {
				let _ = tx.send(Err(Error::Cancelled));
			}
		}
	}
}

/// A caller's registration on one load.
///
/// Dropping an armed ticket withdraws the caller, which covers both explicit
/// token cancellation and the caller's future being dropped.
struct Ticket<T>
where
	T: Clone + Send + Sync + 'static,
{
	inner: Arc<CacheInner<T>>,
	load: ExecutionId,
	waiter: u64,
	trigger: bool,
	armed: bool,
}

impl<T> Ticket<T>
where
	T: Clone + Send + Sync + 'static,
{
	fn new(inner: &Arc<CacheInner<T>>, load: ExecutionId, waiter: u64, trigger: bool) -> Self {
		Self {
			inner: Arc::clone(inner),
			load,
			waiter,
			trigger,
			armed: true,
		}
	}

	async fn wait(mut self, rx: oneshot::Receiver<Result<T>>, cancel: Option<&CancellationToken>) -> Result<T> {
		let received = match cancel {
			Some(cancel) => tokio::select! {
				biased;
				received = rx => received,
				_ = cancel.cancelled() => return Err(Error::Cancelled),
			},
			None => rx.await,
		};
		self.armed = false;
		received.unwrap_or(Err(Error::Cancelled))
	}
}

impl<T> Drop for Ticket<T>
where
	T: Clone + Send + Sync + 'static,
{
	fn drop(&mut self) {
		if self.armed {
			self.inner.abandon(self.load, self.waiter, self.trigger);
		}
	}
}
