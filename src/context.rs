//! Operation context
//!
//! A [`Context`] carries an optional deadline and an explicit cancel signal.
//! Every context-bearing operation on a
//! [`CancellableConnection`](crate::CancellableConnection) watches one; when it
//! fires the caller gets [`Error::Cancelled`](crate::Error::Cancelled).
//!
//! Contexts form a chain: a child fires when it or any ancestor fires, and its
//! effective deadline is the earliest deadline along the chain.

use futures::future::select_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// `cancel()` was called on the context or an ancestor
    Canceled,
    /// The effective deadline passed
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => write!(f, "canceled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

struct Inner {
    // When `cancel()` was first called
    fired: watch::Sender<Option<Instant>>,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

/// Cancellable, deadline-bearing operation context
///
/// Cloning is cheap; clones share the same cancel signal.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    fn new(deadline: Option<Instant>, parent: Option<Context>) -> Self {
        let inherited = parent.as_ref().and_then(|p| p.deadline());
        let deadline = match (deadline, inherited) {
            (Some(own), Some(up)) => Some(own.min(up)),
            (own, up) => own.or(up),
        };
        let (fired, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                fired,
                deadline,
                parent,
            }),
        }
    }

    /// Context that only fires on explicit `cancel()`
    pub fn background() -> Self {
        Self::new(None, None)
    }

    /// Context that fires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(Some(Instant::now() + timeout), None)
    }

    /// Context that fires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::new(Some(deadline), None)
    }

    /// Derived context with its own cancel signal
    pub fn child(&self) -> Self {
        Self::new(None, Some(self.clone()))
    }

    /// Derived context with an additional timeout
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self::new(Some(Instant::now() + timeout), Some(self.clone()))
    }

    /// Effective deadline (earliest along the chain)
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the effective deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fire this context (and its descendants). The first reason wins.
    ///
    /// Canceling a context whose deadline already passed changes nothing.
    pub fn cancel(&self) {
        let now = Instant::now();
        self.inner.fired.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(now);
                true
            } else {
                false
            }
        });
    }

    /// Non-blocking check: why the context fired, if it has
    ///
    /// Whichever happened first, the earliest cancel along the chain or the
    /// effective deadline, decides the reason.
    pub fn err(&self) -> Option<CancelReason> {
        let mut canceled_at: Option<Instant> = None;
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Some(at) = *ctx.inner.fired.borrow() {
                canceled_at = Some(canceled_at.map_or(at, |c| c.min(at)));
            }
            current = ctx.inner.parent.as_ref();
        }
        let expired = self.inner.deadline.filter(|d| Instant::now() >= *d);

        match (canceled_at, expired) {
            (Some(at), Some(deadline)) if deadline <= at => Some(CancelReason::DeadlineExceeded),
            (Some(_), _) => Some(CancelReason::Canceled),
            (None, Some(_)) => Some(CancelReason::DeadlineExceeded),
            (None, None) => None,
        }
    }

    /// True once the context has fired
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve when the context fires
    pub async fn done(&self) -> CancelReason {
        if let Some(reason) = self.err() {
            return reason;
        }

        let mut receivers = Vec::new();
        let mut current = Some(self);
        while let Some(ctx) = current {
            receivers.push(ctx.inner.fired.subscribe());
            current = ctx.inner.parent.as_ref();
        }

        let signals = receivers.iter_mut().map(|rx| {
            Box::pin(async move {
                if rx.wait_for(Option::is_some).await.is_err() {
                    // Sender lives as long as the context; park forever if it ever goes away.
                    futures::future::pending::<()>().await;
                }
                CancelReason::Canceled
            })
        });
        let explicit = select_all(signals);

        let reason = match self.inner.deadline {
            Some(deadline) => tokio::select! {
                (reason, _, _) = explicit => reason,
                _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
            },
            None => explicit.await.0,
        };
        // Agree with every later `err()` when a cancel and the deadline land together.
        self.err().unwrap_or(reason)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}
