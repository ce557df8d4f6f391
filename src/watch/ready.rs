//! Startup readiness barrier (§4.F, §9): releases once every awaited
//! subject has reported in at least once. A counter initialized to the
//! number of subjects, decremented exactly once per subject; the last
//! decrement notifies any waiter.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

pub struct ReadyBarrier {
	remaining: AtomicUsize,
	notify: Notify,
}

impl ReadyBarrier {
	pub fn new(subjects: usize) -> Self {
		ReadyBarrier {
			remaining: AtomicUsize::new(subjects),
			notify: Notify::new(),
		}
	}

	/// Adds `n` more subjects the barrier must wait for, used when the
	/// initial upstream set is only known after the proxy-service
	/// subscription's first value arrives. Must be called before any
	/// `arrive()` that could otherwise observe the counter reach zero.
	pub fn extend(&self, n: usize) {
		self.remaining.fetch_add(n, Ordering::AcqRel);
	}

	/// Reports that one subject has produced its first value. Idempotent
	/// decrements are the caller's responsibility: call this at most once
	/// per subject.
	pub fn arrive(&self) {
		if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
			self.notify.notify_waiters();
		}
	}

	pub async fn wait(&self) {
		loop {
			if self.remaining.load(Ordering::Acquire) == 0 {
				return;
			}
			let notified = self.notify.notified();
			if self.remaining.load(Ordering::Acquire) == 0 {
				return;
			}
			notified.await;
		}
	}
}
