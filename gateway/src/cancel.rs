use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Handle for cooperatively cancelling a long-running operation.
///
/// Cancellation takes effect at the next suspension point of the operation;
/// protocol flows that would otherwise leave a transfer half-open emit their
/// abort frame before returning.
#[derive(Clone)]
pub struct CancelToken {
	inner: Arc<Inner>,
}

struct Inner {
	cancelled: AtomicBool,
	notify: Notify,
}

impl CancelToken {
	/// Create a new, not-yet-cancelled token.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				cancelled: AtomicBool::new(false),
				notify: Notify::new(),
			}),
		}
	}

	/// Request cancellation. Wakes every waiter.
	pub fn cancel(&self) {
		self.inner.cancelled.store(true, Ordering::SeqCst);
		self.inner.notify.notify_waiters();
	}

	/// Check whether cancellation was requested.
	pub fn is_cancelled(&self) -> bool {
		self.inner.cancelled.load(Ordering::SeqCst)
	}

	/// Wait until cancellation is requested.
	pub async fn cancelled(&self) {
		if self.is_cancelled() {
			return;
		}
		let mut notified = std::pin::pin!(self.inner.notify.notified());
		// Register before the second check so a concurrent cancel cannot
		// slip between the check and the await.
		notified.as_mut().enable();
		if self.is_cancelled() {
			return;
		}
		notified.await;
	}
}

impl Default for CancelToken {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for CancelToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CancelToken")
			.field("cancelled", &self.is_cancelled())
			.finish()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use assert2::assert;

	#[tokio::test]
	async fn cancel_wakes_waiters() {
		let token = CancelToken::new();
		assert!(!token.is_cancelled());

		let waiter = {
			let token = token.clone();
			tokio::spawn(async move { token.cancelled().await })
		};
		token.cancel();
		waiter.await.unwrap();
		assert!(token.is_cancelled());
	}
}
