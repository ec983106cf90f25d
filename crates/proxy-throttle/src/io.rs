//! Throttled wrappers around asynchronous byte streams.

use futures::io::{AsyncRead, AsyncWrite};
use futures::{ready, Future};
use pin_project::pin_project;
use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tor_rtcompat::SleepProvider;

use crate::{CancelToken, Cancelled, Direction, RateLimitEngine};

/// Bookkeeping shared by [`ThrottledReader`] and [`ThrottledWriter`].
struct Throttle<R: SleepProvider> {
    /// The engine we ask for bandwidth.
    engine: Arc<RateLimitEngine<R>>,
    /// Which of the engine's budgets we draw from.
    direction: Direction,
    /// Resolves once our owner wants us to stop waiting.
    cancel: Cancelled,
    /// A sleep until the budget is refilled, if we ran out.
    waiting_for: Option<Pin<Box<R::SleepFuture>>>,
    /// When we last moved at least one byte.
    last_activity: Option<Instant>,
}

impl<R: SleepProvider> Throttle<R> {
    /// Make a new `Throttle` for `direction`.
    fn new(engine: Arc<RateLimitEngine<R>>, direction: Direction, cancel: CancelToken) -> Self {
        Throttle {
            engine,
            direction,
            cancel: cancel.cancelled(),
            waiting_for: None,
            last_activity: None,
        }
    }

    /// Run `io` for as many of `len` bytes as the budget allows.
    ///
    /// `io` is called at most once, with the number of bytes it may move.
    /// If the budget is exhausted we sleep until it's refilled instead.  If
    /// we're cancelled while asleep, we report `Ok(0)`.
    fn poll_io<F>(&mut self, cx: &mut Context<'_>, len: usize, io: F) -> Poll<IoResult<usize>>
    where
        F: FnOnce(&mut Context<'_>, usize) -> Poll<IoResult<usize>>,
    {
        let engine = &*self.engine;

        if !engine.is_enabled() {
            self.waiting_for = None;
            let result = io(cx, len);
            if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
                self.last_activity = Some(engine.runtime().now());
            }
            return result;
        }

        loop {
            if self.cancel.is_cancelled() {
                self.waiting_for = None;
                return Poll::Ready(Ok(0));
            }
            if let Some(sleep) = self.waiting_for.as_mut() {
                if self.cancel.poll_cancelled(cx).is_ready() {
                    self.waiting_for = None;
                    return Poll::Ready(Ok(0));
                }
                let () = ready!(sleep.as_mut().poll(cx)); // return if still asleep.
                self.waiting_for = None;
            }

            match engine.try_acquire(self.direction, len) {
                Ok(permit) => match io(cx, permit.len()) {
                    Poll::Ready(Ok(n)) => {
                        if n > 0 {
                            self.last_activity = Some(engine.runtime().now());
                        }
                        return Poll::Ready(permit.used(n).map(|()| n).map_err(Into::into));
                    }
                    other => {
                        permit.unused();
                        return other;
                    }
                },
                Err(wait) => {
                    self.waiting_for = Some(Box::pin(engine.runtime().sleep(wait)));
                    // loop around to poll the sleep we just created.
                }
            }
        }
    }
}

/// An [`AsyncRead`] whose reads are limited by a [`RateLimitEngine`]'s
/// downstream budget.
///
/// Once the engine runs out, reads wait for it to refill rather than
/// returning zero bytes: a zero-byte read still means end-of-stream.
/// The only other source of `Ok(0)` is cancellation.
#[pin_project]
pub struct ThrottledReader<R: SleepProvider, T> {
    /// Our rate limiting state.
    throttle: Throttle<R>,
    /// The stream we're reading from.
    #[pin]
    inner: T,
}

impl<R: SleepProvider, T> ThrottledReader<R, T> {
    /// Wrap `io`.
    pub(crate) fn new(engine: Arc<RateLimitEngine<R>>, cancel: CancelToken, io: T) -> Self {
        ThrottledReader {
            throttle: Throttle::new(engine, Direction::Downstream, cancel),
            inner: io,
        }
    }

    /// Return a pinned reference to the wrapped stream.
    pub fn inner_pinned(self: Pin<&mut Self>) -> Pin<&mut T> {
        self.project().inner
    }

    /// Return a reference to the wrapped stream.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Return a mutable reference to the wrapped stream.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwrap this reader.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Return when data was last read, if ever.
    pub fn last_activity(&self) -> Option<Instant> {
        self.throttle.last_activity
    }
}

impl<R: SleepProvider, T: AsyncRead> AsyncRead for ThrottledReader<R, T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let this = self.project();
        let mut inner = this.inner;
        let len = buf.len();
        this.throttle
            .poll_io(cx, len, |cx, n| inner.as_mut().poll_read(cx, &mut buf[..n]))
    }
}

/// An [`AsyncWrite`] whose writes are limited by a [`RateLimitEngine`]'s
/// upstream budget.
///
/// Flushing and closing are never throttled.
#[pin_project]
pub struct ThrottledWriter<R: SleepProvider, T> {
    /// Our rate limiting state.
    throttle: Throttle<R>,
    /// The stream we're writing to.
    #[pin]
    inner: T,
}

impl<R: SleepProvider, T> ThrottledWriter<R, T> {
    /// Wrap `io`.
    pub(crate) fn new(engine: Arc<RateLimitEngine<R>>, cancel: CancelToken, io: T) -> Self {
        ThrottledWriter {
            throttle: Throttle::new(engine, Direction::Upstream, cancel),
            inner: io,
        }
    }

    /// Return a pinned reference to the wrapped stream.
    pub fn inner_pinned(self: Pin<&mut Self>) -> Pin<&mut T> {
        self.project().inner
    }

    /// Return a reference to the wrapped stream.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Return a mutable reference to the wrapped stream.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwrap this writer.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Return when data was last written, if ever.
    pub fn last_activity(&self) -> Option<Instant> {
        self.throttle.last_activity
    }
}

impl<R: SleepProvider, T: AsyncWrite> AsyncWrite for ThrottledWriter<R, T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<IoResult<usize>> {
        let this = self.project();
        let mut inner = this.inner;
        this.throttle
            .poll_io(cx, buf.len(), |cx, n| inner.as_mut().poll_write(cx, &buf[..n]))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_close(cx)
    }
}
