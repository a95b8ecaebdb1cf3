//! Cancellation race
//!
//! Every context-bearing call runs on a detached task while the caller waits
//! on whichever finishes first: the call or the context.
//!
//! * Call first: its result is returned unchanged and no kill is sent.
//! * Context first: the caller gets `Error::Cancelled` right away. A kill for
//!   the session is dispatched on another task, bounded by the kill timeout.
//!   The call keeps running until it drains (normally because of the kill);
//!   its result is discarded. The connection stays locked until then.
//!
//! At most one kill per session is in flight. A cancellation that arrives
//! while a kill is outstanding does not send another one.
//!
//! A kill is only dispatched while the canceled call is still registered as
//! running on the session. If the call drains and a new one starts between
//! that check and the server acting on the kill, the new call can be hit. This
//! window is inherent to out-of-band kills and is not closed here.

use crate::context::Context;
use crate::error::Error;
use crate::kill_pool::SessionKiller;
use crate::metrics::{counters, histograms, labels};
use crate::session::SessionId;
use crate::state::SessionState;
use crate::{KillConfig, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

/// How an operation ended, from the cancellation layer's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancellationOutcome {
    /// The call returned before the context fired
    CompletedNormally,
    /// The context fired and the kill was acknowledged by the server
    CanceledKillSent,
    /// The context fired and the kill failed or timed out
    CanceledKillFailed,
    /// The context fired while a kill for the session was already in flight
    CanceledKillCoalesced,
    /// The context fired but the call drained before a kill was needed
    CanceledKillSkipped,
}

impl CancellationOutcome {
    /// True for every outcome where the caller saw a cancellation
    pub fn is_canceled(&self) -> bool {
        !matches!(self, CancellationOutcome::CompletedNormally)
    }
}

impl std::fmt::Display for CancellationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CompletedNormally => write!(f, "completed-normally"),
            Self::CanceledKillSent => write!(f, "canceled-kill-sent"),
            Self::CanceledKillFailed => write!(f, "canceled-kill-failed"),
            Self::CanceledKillCoalesced => write!(f, "canceled-kill-coalesced"),
            Self::CanceledKillSkipped => write!(f, "canceled-kill-skipped"),
        }
    }
}

struct Tracking {
    state: SessionState,
    next_seq: u64,
    running: Option<u64>,
    last_outcome: Option<CancellationOutcome>,
}

/// Per-connection cancellation bookkeeping
///
/// Holds the session identity (fixed at construction), the session state and
/// the single-kill-in-flight flag.
pub struct SessionHandle {
    id: SessionId,
    tracking: Mutex<Tracking>,
    kill_in_flight: AtomicBool,
    kills_dispatched: AtomicU64,
}

impl SessionHandle {
    /// Bookkeeping for a connection whose identity was just resolved
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            tracking: Mutex::new(Tracking {
                state: SessionState::Idle,
                next_seq: 0,
                running: None,
                last_outcome: None,
            }),
            kill_in_flight: AtomicBool::new(false),
            kills_dispatched: AtomicU64::new(0),
        }
    }

    /// Session identity
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Outcome of the most recent operation (updated when its kill finishes)
    pub fn last_outcome(&self) -> Option<CancellationOutcome> {
        self.lock().last_outcome
    }

    /// True while a kill command for this session is outstanding
    pub fn kill_in_flight(&self) -> bool {
        self.kill_in_flight.load(Ordering::Acquire)
    }

    /// Number of kill commands dispatched for this session
    pub fn kills_dispatched(&self) -> u64 {
        self.kills_dispatched.load(Ordering::Relaxed)
    }

    /// Mark the session closed (terminal)
    pub fn mark_closed(&self) {
        let mut tracking = self.lock();
        tracking.running = None;
        tracking.state = SessionState::Closed;
    }

    fn lock(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Result<u64> {
        let mut tracking = self.lock();
        match tracking.state {
            SessionState::Idle => {
                tracking.state.transition(SessionState::Executing)?;
                tracking.next_seq += 1;
                let seq = tracking.next_seq;
                tracking.running = Some(seq);
                Ok(seq)
            }
            SessionState::Closed => Err(Error::ConnectionClosed),
            other => Err(Error::ConnectionBusy(format!(
                "session {} is {}",
                self.id, other
            ))),
        }
    }

    fn finish(&self, seq: u64, fatal: bool) {
        let mut tracking = self.lock();
        if tracking.running != Some(seq) {
            return;
        }
        tracking.running = None;
        let next = if fatal {
            SessionState::Closed
        } else {
            SessionState::Idle
        };
        if let Err(e) = tracking.state.transition(next) {
            tracing::debug!(session = %self.id, error = %e, "ignoring drain transition");
        }
    }

    fn mark_canceling(&self, seq: u64) -> bool {
        let mut tracking = self.lock();
        tracking.running == Some(seq) && tracking.state.transition(SessionState::Canceling).is_ok()
    }

    fn mark_kill_pending(&self, seq: u64) -> bool {
        let mut tracking = self.lock();
        tracking.running == Some(seq)
            && tracking.state == SessionState::Canceling
            && tracking.state.transition(SessionState::KillPending).is_ok()
    }

    fn set_outcome(&self, outcome: CancellationOutcome) {
        self.lock().last_outcome = Some(outcome);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("kill_in_flight", &self.kill_in_flight())
            .finish()
    }
}

// Settles the session when the detached call ends, including by panic.
struct Drain {
    session: Arc<SessionHandle>,
    seq: u64,
    fatal: bool,
}

impl Drop for Drain {
    fn drop(&mut self) {
        self.session.finish(self.seq, self.fatal);
    }
}

/// Races blocking calls against their contexts and kills abandoned work
#[derive(Clone)]
pub struct CancellationRace {
    killer: Arc<dyn SessionKiller>,
    kill_timeout: Duration,
}

impl CancellationRace {
    /// Create a race manager sending kills through `killer`
    pub fn new(killer: Arc<dyn SessionKiller>, config: &KillConfig) -> Self {
        Self {
            killer,
            kill_timeout: config.kill_timeout,
        }
    }

    /// Kill timeout applied to every dispatched kill
    pub fn kill_timeout(&self) -> Duration {
        self.kill_timeout
    }

    /// Run `call` on `session`, racing it against `ctx`
    ///
    /// `call` resolves to the call's result plus a lease (normally the guard
    /// of the physical connection). The lease is dropped only after the
    /// session state has been settled, so the next operation on the
    /// connection always starts from a settled state.
    ///
    /// If this future is dropped before either side wins, the call still
    /// drains on its own but no kill is sent.
    pub async fn run<T, L, F>(
        &self,
        ctx: &Context,
        session: &Arc<SessionHandle>,
        op: &'static str,
        call: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        L: Send + 'static,
        F: Future<Output = (Result<T>, L)> + Send + 'static,
    {
        if let Some(reason) = ctx.err() {
            counters::operation_finished(op, "cancelled_before_start");
            return Err(Error::Cancelled(reason));
        }

        let seq = session.begin()?;
        let span = tracing::debug_span!("op", op, session = %session.id());

        let mut drain = Drain {
            session: session.clone(),
            seq,
            fatal: true,
        };
        let mut call = tokio::spawn(
            async move {
                let (result, lease) = call.await;
                drain.fatal = matches!(&result, Err(e) if e.is_fatal());
                drop(drain);
                drop(lease);
                result
            }
            .instrument(span),
        );

        tokio::select! {
            biased;

            reason = ctx.done() => {
                tracing::debug!(op, session = %session.id(), %reason, "context fired before call returned");
                self.dispatch_kill(session, seq);
                counters::operation_finished(op, "cancelled");
                if let Some(deadline) = ctx.deadline() {
                    histograms::cancellation_latency(op, Instant::now().saturating_duration_since(deadline));
                }
                Err(Error::Cancelled(reason))
            }

            joined = &mut call => {
                session.set_outcome(CancellationOutcome::CompletedNormally);
                match joined {
                    Ok(result) => {
                        counters::operation_finished(op, if result.is_ok() { "ok" } else { "error" });
                        result
                    }
                    Err(e) => {
                        tracing::error!(op, session = %session.id(), error = %e, "call task failed");
                        counters::operation_finished(op, "error");
                        Err(Error::ConnectionClosed)
                    }
                }
            }
        }
    }

    fn dispatch_kill(&self, session: &Arc<SessionHandle>, seq: u64) {
        if !session.mark_canceling(seq) {
            session.set_outcome(CancellationOutcome::CanceledKillSkipped);
            counters::kill_dispatched(labels::KILL_SKIPPED);
            return;
        }

        if session
            .kill_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(session = %session.id(), "kill already in flight");
            session.set_outcome(CancellationOutcome::CanceledKillCoalesced);
            counters::kill_dispatched(labels::KILL_COALESCED);
            return;
        }

        let killer = self.killer.clone();
        let session = session.clone();
        let timeout = self.kill_timeout;
        tokio::spawn(async move {
            let outcome = if session.mark_kill_pending(seq) {
                session.kills_dispatched.fetch_add(1, Ordering::Relaxed);
                match killer.terminate(session.id(), timeout).await {
                    Ok(()) => {
                        counters::kill_dispatched(labels::KILL_SENT);
                        CancellationOutcome::CanceledKillSent
                    }
                    Err(e) => {
                        tracing::warn!(session = %session.id(), error = %e, "kill failed");
                        counters::kill_failed(e.kind());
                        counters::kill_dispatched(labels::KILL_FAILED);
                        CancellationOutcome::CanceledKillFailed
                    }
                }
            } else {
                counters::kill_dispatched(labels::KILL_SKIPPED);
                CancellationOutcome::CanceledKillSkipped
            };
            session.kill_in_flight.store(false, Ordering::Release);
            session.set_outcome(outcome);
        });
    }
}

impl std::fmt::Debug for CancellationRace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationRace")
            .field("kill_timeout", &self.kill_timeout)
            .finish()
    }
}
