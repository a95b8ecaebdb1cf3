//! Backend capability traits
//!
//! A backend supplies three layers:
//! * [`Driver`] turns a DSN into a [`Connector`]
//! * [`Connector`] opens physical connections and knows the backend's
//!   administrative SQL (session identity lookup, session kill)
//! * [`RawConnection`] runs blocking calls on one physical connection
//!
//! Async methods return `Send` futures: a canceled call keeps running on a
//! detached task until it drains, so it must be able to move across threads.

use crate::config::KillMode;
use crate::session::SessionId;
use crate::types::{ExecResult, Rows, TxOptions, Value};
use crate::Result;
use std::future::Future;

/// One physical connection to the server
pub trait RawConnection: Send + 'static {
    /// Backend handle for a prepared statement
    type Statement: Send + Sync + 'static;

    /// Run a statement that returns rows
    fn query(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Result<Rows>> + Send;

    /// Run a statement that returns no rows
    fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Result<ExecResult>> + Send;

    /// Prepare a statement
    fn prepare(&mut self, sql: &str) -> impl Future<Output = Result<Self::Statement>> + Send;

    /// Run a prepared statement that returns rows
    fn query_statement(
        &mut self,
        stmt: &Self::Statement,
        params: &[Value],
    ) -> impl Future<Output = Result<Rows>> + Send;

    /// Run a prepared statement that returns no rows
    fn execute_statement(
        &mut self,
        stmt: &Self::Statement,
        params: &[Value],
    ) -> impl Future<Output = Result<ExecResult>> + Send;

    /// Release a prepared statement
    fn close_statement(
        &mut self,
        stmt: &Self::Statement,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Begin a transaction
    fn begin(&mut self, opts: TxOptions) -> impl Future<Output = Result<()>> + Send;

    /// Commit the open transaction
    fn commit(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Roll back the open transaction
    fn rollback(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Round-trip to the server
    fn ping(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Close the connection
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Server version reported at startup
    fn server_version(&self) -> Option<String> {
        None
    }
}

/// Opens physical connections to one server
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced
    type Connection: RawConnection;

    /// Open and authenticate a new physical connection
    fn connect(&self) -> impl Future<Output = Result<Self::Connection>> + Send;

    /// Query returning the identity of the session it runs on (one row, one column)
    fn session_identity_sql(&self) -> &str;

    /// Administrative statement killing `target`
    fn kill_sql(&self, target: &SessionId, mode: KillMode) -> Result<String>;

    /// Whether the kill statement's result reports that a session was hit
    fn kill_acknowledged(&self, rows: &Rows) -> bool {
        let _ = rows;
        true
    }
}

/// Builds connectors from DSNs
pub trait Driver: Send + Sync + 'static {
    /// Connector type produced
    type Connector: Connector;

    /// Parse `dsn` and build a connector. Fails with `Error::Config` on a malformed DSN.
    fn open_connector(&self, dsn: &str) -> Result<Self::Connector>;
}
