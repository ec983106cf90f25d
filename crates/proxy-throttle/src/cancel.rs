//! Explicit cancellation for throttled operations.
//!
//! A connection that is being torn down needs to unblock any task that is
//! sleeping while it waits for bandwidth.  Rather than relying on dropping
//! futures from the outside, every waiting operation takes a [`CancelToken`]
//! and gives up promptly once it is cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use event_listener::{Event, EventListener};

/// Shared state behind a [`CancelToken`].
#[derive(Debug, Default)]
struct CancelInner {
    /// Set once, never cleared.
    cancelled: AtomicBool,
    /// Notified when `cancelled` becomes true.
    event: Event,
}

/// A cloneable handle used to abort throttling waits.
///
/// All clones share the same state: cancelling one cancels them all.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    /// The shared flag and its wakeup event.
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Return a new token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every operation using this token (or a clone of it).
    ///
    /// Cancelling twice is harmless.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.event.notify(usize::MAX);
        }
    }

    /// Return true if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Return a future that resolves once this token is cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
            listener: None,
        }
    }
}

/// Future returned by [`CancelToken::cancelled`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Cancelled {
    /// The token we are watching.
    token: CancelToken,
    /// A registration on the token's event, once we have had to wait.
    listener: Option<EventListener>,
}

impl Cancelled {
    /// Return true if the token is cancelled, without registering for a wakeup.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Return `Ready` if the token is cancelled; otherwise arrange for `cx`
    /// to be woken when it is.
    pub(crate) fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if self.token.is_cancelled() {
                self.listener = None;
                return Poll::Ready(());
            }
            match self.listener.as_mut() {
                Some(listener) => {
                    if Pin::new(listener).poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    // Notified: look at the flag again.
                    self.listener = None;
                }
                None => {
                    // Register first, then re-check the flag, so that a
                    // concurrent cancel() can't slip between the two.
                    self.listener = Some(self.token.inner.event.listen());
                }
            }
        }
    }
}

impl Future for Cancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.poll_cancelled(cx)
    }
}
