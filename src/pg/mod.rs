//! PostgreSQL backend
//!
//! Speaks the version 3 wire protocol directly over TCP or a Unix socket.
//! Every call uses the simple query protocol; parameters are bound client-side
//! as escaped literals and prepared statements map to `PREPARE`/`EXECUTE`.
//!
//! Session identity is the backend process id (`pg_backend_pid()`), and a
//! session is killed with `pg_terminate_backend` or `pg_cancel_backend`
//! depending on [`KillMode`].

pub mod conn;
pub mod dsn;
pub mod params;
pub mod protocol;
pub mod scram;
pub mod transport;

pub use conn::{PgConnection, PgStatement};
pub use dsn::{PgConfig, Target};

use crate::config::KillMode;
use crate::driver::{Connector, Driver};
use crate::session::SessionId;
use crate::types::Rows;
use crate::{Error, Result};
use std::sync::Arc;

const IDENTITY_SQL: &str = "SELECT pg_backend_pid()";

/// Driver for `postgres://` DSNs
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDriver;

impl Driver for PgDriver {
    type Connector = PgConnector;

    fn open_connector(&self, dsn: &str) -> Result<PgConnector> {
        Ok(PgConnector::new(PgConfig::parse(dsn)?))
    }
}

/// Opens [`PgConnection`]s for one parsed configuration
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: Arc<PgConfig>,
}

impl PgConnector {
    /// Connector for `config`
    pub fn new(config: PgConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Parsed configuration
    pub fn config(&self) -> &PgConfig {
        &self.config
    }
}

impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect(&self.config).await
    }

    fn session_identity_sql(&self) -> &str {
        IDENTITY_SQL
    }

    fn kill_sql(&self, target: &SessionId, mode: KillMode) -> Result<String> {
        let pid: i32 = target
            .as_str()
            .parse()
            .map_err(|_| Error::Protocol(format!("not a backend pid: {:?}", target.as_str())))?;
        let function = match mode {
            KillMode::TerminateSession => "pg_terminate_backend",
            KillMode::CancelStatement => "pg_cancel_backend",
        };
        Ok(format!("SELECT {}({})", function, pid))
    }

    /// Both kill functions return false when no such backend exists
    fn kill_acknowledged(&self, rows: &Rows) -> bool {
        rows.first_value() == Some("t")
    }
}
