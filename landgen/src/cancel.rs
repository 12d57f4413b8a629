use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
	cancelled: AtomicBool,
	notify: Notify,
}

/// Cooperative cancellation shared between a caller and a generation run.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<Inner>);

impl CancelToken {
	pub fn new() -> Self { Self::default() }

	pub fn cancel(&self) {
		if !self.0.cancelled.swap(true, Ordering::AcqRel) {
			self.0.notify.notify_waiters();
		}
	}

	pub fn is_cancelled(&self) -> bool { self.0.cancelled.load(Ordering::Acquire) }

	/// Resolves once [`Self::cancel`] has been called.
	pub async fn cancelled(&self) {
		loop {
			let notified = self.0.notify.notified();
			if self.is_cancelled() {
				return;
			}
			notified.await;
		}
	}
}

impl std::fmt::Debug for CancelToken {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_tuple("CancelToken").field(&self.is_cancelled()).finish()
	}
}
