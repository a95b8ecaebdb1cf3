//! Cancellable connection
//!
//! Wraps one physical connection. Every context-bearing call goes through the
//! [`CancellationRace`]; metadata accessors read straight from the wrapper.
//!
//! The physical connection sits behind an async mutex. A call holds the lock
//! for as long as it runs on the server, including after its caller has been
//! told it was canceled, so a following call waits (bounded by its own
//! context) for the abandoned one to drain.

use crate::context::Context;
use crate::driver::RawConnection;
use crate::race::{CancellationOutcome, CancellationRace, SessionHandle};
use crate::session::SessionId;
use crate::state::SessionState;
use crate::types::{ExecResult, Rows, TxOptions, Value};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A physical connection whose calls honour their context
pub struct CancellableConnection<R: RawConnection> {
    conn: Arc<Mutex<R>>,
    session: Arc<SessionHandle>,
    race: CancellationRace,
    server_version: Option<String>,
}

impl<R: RawConnection> CancellableConnection<R> {
    /// Wrap a connection whose session identity is already resolved
    pub fn new(conn: R, id: SessionId, race: CancellationRace) -> Self {
        let server_version = conn.server_version();
        Self {
            conn: Arc::new(Mutex::new(conn)),
            session: Arc::new(SessionHandle::new(id)),
            race,
            server_version,
        }
    }

    /// Server session identity (fixed for the connection's lifetime)
    pub fn session_id(&self) -> &SessionId {
        self.session.id()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Outcome of the most recent operation
    pub fn last_outcome(&self) -> Option<CancellationOutcome> {
        self.session.last_outcome()
    }

    /// Cancellation bookkeeping for this connection
    pub fn session(&self) -> &Arc<SessionHandle> {
        &self.session
    }

    /// Server version reported at startup
    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    /// Run a statement that returns rows
    pub async fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Rows> {
        let (sql, params) = (sql.to_string(), params.to_vec());
        let mut conn = self.acquire(ctx).await?;
        self.race
            .run(ctx, &self.session, "query", async move {
                let result = conn.query(&sql, &params).await;
                (result, conn)
            })
            .await
    }

    /// Run a statement that returns no rows
    pub async fn execute(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let (sql, params) = (sql.to_string(), params.to_vec());
        let mut conn = self.acquire(ctx).await?;
        self.race
            .run(ctx, &self.session, "execute", async move {
                let result = conn.execute(&sql, &params).await;
                (result, conn)
            })
            .await
    }

    /// Prepare a statement
    pub async fn prepare(&self, ctx: &Context, sql: &str) -> Result<CancellableStatement<R>> {
        let sql = sql.to_string();
        let mut conn = self.acquire(ctx).await?;
        let stmt = self
            .race
            .run(ctx, &self.session, "prepare", async move {
                let result = conn.prepare(&sql).await;
                (result, conn)
            })
            .await?;
        Ok(CancellableStatement {
            stmt: Arc::new(stmt),
            conn: self.conn.clone(),
            session: self.session.clone(),
            race: self.race.clone(),
            closed: false,
        })
    }

    /// Begin a transaction
    pub async fn begin(&self, ctx: &Context, opts: TxOptions) -> Result<CancellableTransaction<'_, R>> {
        let mut conn = self.acquire(ctx).await?;
        self.race
            .run(ctx, &self.session, "begin", async move {
                let result = conn.begin(opts).await;
                (result, conn)
            })
            .await?;
        Ok(CancellableTransaction {
            conn: self,
            finished: false,
        })
    }

    /// Round-trip to the server
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        let mut conn = self.acquire(ctx).await?;
        self.race
            .run(ctx, &self.session, "ping", async move {
                let result = conn.ping().await;
                (result, conn)
            })
            .await
    }

    /// Close the connection
    ///
    /// Waits for any abandoned call to drain first.
    pub async fn close(self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        self.session.mark_closed();
        let result = conn.close().await;
        drop(conn);
        result
    }

    async fn acquire(&self, ctx: &Context) -> Result<OwnedMutexGuard<R>> {
        if let Some(reason) = ctx.err() {
            return Err(Error::Cancelled(reason));
        }
        if self.session.state() == SessionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        tokio::select! {
            biased;
            reason = ctx.done() => Err(Error::Cancelled(reason)),
            guard = self.conn.clone().lock_owned() => Ok(guard),
        }
    }
}

impl<R: RawConnection> std::fmt::Debug for CancellableConnection<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableConnection")
            .field("session", &self.session)
            .field("server_version", &self.server_version)
            .finish()
    }
}

/// A prepared statement bound to its connection
pub struct CancellableStatement<R: RawConnection> {
    stmt: Arc<R::Statement>,
    conn: Arc<Mutex<R>>,
    session: Arc<SessionHandle>,
    race: CancellationRace,
    closed: bool,
}

impl<R: RawConnection> CancellableStatement<R> {
    /// Run the statement, returning rows
    pub async fn query(&self, ctx: &Context, params: &[Value]) -> Result<Rows> {
        let (stmt, params) = (self.stmt.clone(), params.to_vec());
        let mut conn = self.acquire(ctx).await?;
        self.race
            .run(ctx, &self.session, "stmt_query", async move {
                let result = conn.query_statement(&stmt, &params).await;
                (result, conn)
            })
            .await
    }

    /// Run the statement, returning the affected row count
    pub async fn execute(&self, ctx: &Context, params: &[Value]) -> Result<ExecResult> {
        let (stmt, params) = (self.stmt.clone(), params.to_vec());
        let mut conn = self.acquire(ctx).await?;
        self.race
            .run(ctx, &self.session, "stmt_execute", async move {
                let result = conn.execute_statement(&stmt, &params).await;
                (result, conn)
            })
            .await
    }

    /// Release the statement on the server
    pub async fn close(mut self, ctx: &Context) -> Result<()> {
        let stmt = self.stmt.clone();
        let mut conn = self.acquire(ctx).await?;
        self.closed = true;
        self.race
            .run(ctx, &self.session, "stmt_close", async move {
                let result = conn.close_statement(&stmt).await;
                (result, conn)
            })
            .await
    }

    async fn acquire(&self, ctx: &Context) -> Result<OwnedMutexGuard<R>> {
        if let Some(reason) = ctx.err() {
            return Err(Error::Cancelled(reason));
        }
        tokio::select! {
            biased;
            reason = ctx.done() => Err(Error::Cancelled(reason)),
            guard = self.conn.clone().lock_owned() => Ok(guard),
        }
    }
}

impl<R: RawConnection> Drop for CancellableStatement<R> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!(session = %self.session.id(), "prepared statement dropped without close");
        }
    }
}

/// An open transaction on a [`CancellableConnection`]
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping it unfinished leaves the transaction open on the server.
pub struct CancellableTransaction<'c, R: RawConnection> {
    conn: &'c CancellableConnection<R>,
    finished: bool,
}

impl<'c, R: RawConnection> CancellableTransaction<'c, R> {
    /// Run a statement that returns rows inside the transaction
    pub async fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Rows> {
        self.conn.query(ctx, sql, params).await
    }

    /// Run a statement that returns no rows inside the transaction
    pub async fn execute(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.conn.execute(ctx, sql, params).await
    }

    /// Commit
    pub async fn commit(mut self, ctx: &Context) -> Result<()> {
        let mut conn = self.conn.acquire(ctx).await?;
        self.finished = true;
        self.conn
            .race
            .run(ctx, &self.conn.session, "commit", async move {
                let result = conn.commit().await;
                (result, conn)
            })
            .await
    }

    /// Roll back
    pub async fn rollback(mut self, ctx: &Context) -> Result<()> {
        let mut conn = self.conn.acquire(ctx).await?;
        self.finished = true;
        self.conn
            .race
            .run(ctx, &self.conn.session, "rollback", async move {
                let result = conn.rollback().await;
                (result, conn)
            })
            .await
    }
}

impl<'c, R: RawConnection> Drop for CancellableTransaction<'c, R> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                session = %self.conn.session_id(),
                "transaction dropped without commit or rollback"
            );
        }
    }
}
