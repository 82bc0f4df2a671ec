//! Hierarchical progress counters.
//!
//! A [`Progress`] is a shared counter of `completed / total` units that can
//! adopt children. Each child contributes `pending_units` of its parent's
//! total, scaled by the child's own completed fraction, so nested operations
//! report into one root without knowing about each other.
//!
//! The coordinator attaches a fresh root to every execution and finalizes it
//! when the execution settles, so observers always see 100% at the end even if
//! the operation never touched its counters.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Result;

#[derive(Default)]
struct ProgressNode {
	total: i64,
	completed: i64,
	children: Vec<(Progress, i64)>,
}

/// Shared hierarchical progress counter. Clones observe the same counter.
#[derive(Clone, Default)]
pub struct Progress {
	node: Arc<Mutex<ProgressNode>>,
}

impl Progress {
	/// Creates an indeterminate counter (`total == 0`).
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a counter with a known amount of work.
	pub fn with_total(total_units: i64) -> Self {
		let progress = Self::new();
		progress.set_total_units(total_units);
		progress
	}

	pub fn total_units(&self) -> i64 {
		self.node.lock().total
	}

	pub fn completed_units(&self) -> i64 {
		self.node.lock().completed
	}

	/// Sets the amount of work. Negative totals are clamped to zero.
	pub fn set_total_units(&self, total_units: i64) {
		self.node.lock().total = total_units.max(0);
	}

	pub fn set_completed_units(&self, completed_units: i64) {
		self.node.lock().completed = completed_units.max(0);
	}

	/// Adds `units` to the completed count.
	pub fn increment(&self, units: i64) {
		let mut node = self.node.lock();
		node.completed = node.completed.saturating_add(units).max(0);
	}

	/// True while no total has been set.
	pub fn is_indeterminate(&self) -> bool {
		self.node.lock().total == 0
	}

	pub fn is_finished(&self) -> bool {
		!self.is_indeterminate() && self.fraction_completed() >= 1.0
	}

	/// Attaches `child`, weighting its completion as `pending_units` of this
	/// counter's total.
	///
	/// # Panics
	///
	/// Panics if `child` is this counter or one of its ancestors, since the
	/// tree must stay acyclic for [`Self::fraction_completed`] to terminate.
	pub fn add_child(&self, child: Progress, pending_units: i64) {
		assert!(!child.reaches(self), "progress cannot adopt itself or an ancestor");
		self.node.lock().children.push((child, pending_units.max(0)));
	}

	/// True when `target` is this counter or one of its descendants.
	fn reaches(&self, target: &Progress) -> bool {
		if Arc::ptr_eq(&self.node, &target.node) {
			return true;
		}
		let children: Vec<Progress> = self.node.lock().children.iter().map(|(child, _)| child.clone()).collect();
		children.iter().any(|child| child.reaches(target))
	}

	/// Creates and attaches a child worth `pending_units`.
	///
	/// An indeterminate parent adopts `pending_units` as its total so the
	/// child's work becomes visible; this happens when a reporting step runs
	/// directly as the root of an execution.
	pub fn child(&self, pending_units: i64) -> Progress {
		{
			let mut node = self.node.lock();
			if node.total == 0 {
				tracing::info!(pending_units, "stagehand.progress.parent_indeterminate");
				node.total = pending_units.max(0);
			}
		}
		let child = Progress::new();
		self.add_child(child.clone(), pending_units);
		child
	}

	/// Fraction of work done in `0.0..=1.0`, including weighted children.
	pub fn fraction_completed(&self) -> f64 {
		let (total, completed, children) = {
			let node = self.node.lock();
			(node.total, node.completed, node.children.clone())
		};
		if total <= 0 {
			return 0.0;
		}
		let from_children: f64 = children.iter().map(|(child, pending)| child.fraction_completed() * (*pending as f64)).sum();
		((completed as f64 + from_children) / total as f64).clamp(0.0, 1.0)
	}

	/// Forces the counter to report completion.
	///
	/// An indeterminate counter becomes `1/1`; otherwise `completed` is set to
	/// `total`. Returns true when anything had to be forced.
	pub fn finalize(&self) -> bool {
		let mut node = self.node.lock();
		let mut forced = false;
		if node.total == 0 {
			node.total = 1;
			forced = true;
		}
		if node.completed != node.total {
			node.completed = node.total;
			forced = true;
		}
		forced
	}
}

impl std::fmt::Debug for Progress {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let node = self.node.lock();
		f.debug_struct("Progress")
			.field("total", &node.total)
			.field("completed", &node.completed)
			.field("children", &node.children.len())
			.finish()
	}
}

/// Runs `work` against a child of `parent` worth `pending_units`, finalizing
/// the child afterwards whatever the outcome.
///
/// Lets an operation that never reports progress still advance its parent by
/// a fixed share once it finishes.
pub async fn report_progress<F, Fut, T>(parent: &Progress, pending_units: i64, work: F) -> Result<T>
where
	F: FnOnce(Progress) -> Fut,
	Fut: Future<Output = Result<T>>,
{
	let child = parent.child(pending_units);
	let outcome = work(child.clone()).await;
	if child.is_indeterminate() {
		tracing::warn!(pending_units, "stagehand.progress.child_total_unset");
	}
	child.finalize();
	outcome
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fraction_weights_children_by_pending_units() {
		let root = Progress::with_total(100);
		let a = root.child(25);
		let b = root.child(75);
		a.set_total_units(4);
		a.set_completed_units(2);
		b.set_total_units(3);
		assert!((root.fraction_completed() - 0.125).abs() < 1e-9);

		b.set_completed_units(3);
		assert!((root.fraction_completed() - 0.875).abs() < 1e-9);
		a.increment(2);
		assert!(root.is_finished());
	}

	#[test]
	fn indeterminate_reports_zero_and_finalizes_to_one_of_one() {
		let progress = Progress::new();
		assert!(progress.is_indeterminate());
		assert_eq!(progress.fraction_completed(), 0.0);

		assert!(progress.finalize());
		assert_eq!((progress.completed_units(), progress.total_units()), (1, 1));
		assert!(!progress.finalize());
	}

	#[test]
	fn child_of_indeterminate_parent_sets_parent_total() {
		let root = Progress::new();
		let child = root.child(40);
		assert_eq!(root.total_units(), 40);
		child.finalize();
		assert!(root.is_finished());
	}

	#[test]
	#[should_panic(expected = "progress cannot adopt itself")]
	fn adopting_self_panics() {
		let progress = Progress::new();
		progress.add_child(progress.clone(), 1);
	}

	#[test]
	#[should_panic(expected = "or an ancestor")]
	fn adopting_an_ancestor_panics() {
		let root = Progress::with_total(2);
		let middle = root.child(1);
		let leaf = middle.child(1);
		leaf.add_child(root.clone(), 1);
	}

	#[test]
	fn shared_child_under_two_parents_is_allowed() {
		let a = Progress::with_total(1);
		let b = Progress::with_total(1);
		let shared = Progress::with_total(4);
		a.add_child(shared.clone(), 1);
		b.add_child(shared.clone(), 1);
		shared.set_completed_units(2);
		assert!((a.fraction_completed() - 0.5).abs() < 1e-9);
		assert!((b.fraction_completed() - 0.5).abs() < 1e-9);
	}

	#[tokio::test]
	async fn report_progress_finalizes_child_on_error() {
		let root = Progress::with_total(10);
		let outcome: Result<()> = report_progress(&root, 10, |_child| async { Err::<(), _>(crate::Error::msg("nope")) }).await;
		assert!(outcome.is_err());
		assert!(root.is_finished());
	}
}
