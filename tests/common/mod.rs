//! In-memory backend for exercising the cancellation layer without a server
//!
//! Statements understood by the mock:
//! * `SELECT session_id()` returns the session's identity
//! * `SLEEP <ms>` sleeps, unless the session is killed first
//! * `KILL <id>` terminates a session, `CANCEL <id>` aborts its running statement
//! * `SELECT <value>` returns `<value>`
//! * `FAIL` returns a non-fatal server error
//! * anything else succeeds with no rows

#![allow(dead_code)]

use cancellable_sql::driver::{Connector, Driver, RawConnection};
use cancellable_sql::{
    CancellableConnector, CancellableDriver, Error, ExecResult, KillConfig, KillMode, Result, Rows,
    ServerError, SessionId, TxOptions, Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const IDENTITY_SQL: &str = "SELECT session_id()";

/// One statement as seen by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub connector: String,
    pub session: String,
    pub sql: String,
}

#[derive(Default)]
struct Session {
    abort: Notify,
    terminated: AtomicBool,
    closed: AtomicBool,
}

#[derive(Default)]
struct ServerState {
    next_session: AtomicU64,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    log: Mutex<Vec<Executed>>,
    kills: Mutex<Vec<String>>,
    kill_attempts: AtomicUsize,
    kills_running: Mutex<HashMap<String, usize>>,
    max_concurrent_kills: AtomicUsize,
    kill_delay_ms: AtomicU64,
    fail_kills: AtomicBool,
    fail_identity: AtomicBool,
    fail_connect: AtomicBool,
}

struct RunningKill {
    state: Arc<ServerState>,
    target: String,
}

impl Drop for RunningKill {
    fn drop(&mut self) {
        let mut running = self.state.kills_running.lock().unwrap();
        if let Some(n) = running.get_mut(&self.target) {
            *n -= 1;
        }
    }
}

impl ServerState {
    fn record(&self, connector: &str, session: &str, sql: &str) {
        self.log.lock().unwrap().push(Executed {
            connector: connector.to_string(),
            session: session.to_string(),
            sql: sql.to_string(),
        });
    }

    async fn kill(self: &Arc<Self>, target: &str, terminate: bool) -> Result<Rows> {
        self.kill_attempts.fetch_add(1, Ordering::SeqCst);
        let _running = {
            let mut running = self.kills_running.lock().unwrap();
            let n = running.entry(target.to_string()).or_insert(0);
            *n += 1;
            self.max_concurrent_kills.fetch_max(*n, Ordering::SeqCst);
            RunningKill {
                state: self.clone(),
                target: target.to_string(),
            }
        };

        let delay = Duration::from_millis(self.kill_delay_ms.load(Ordering::SeqCst));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_kills.load(Ordering::SeqCst) {
            return Err(Error::Server(
                ServerError::new("permission denied to terminate process").with_code("42501"),
            ));
        }

        let session = self.sessions.lock().unwrap().get(target).cloned();
        let hit = match session {
            Some(s) if !s.closed.load(Ordering::SeqCst) && !s.terminated.load(Ordering::SeqCst) => {
                if terminate {
                    s.terminated.store(true, Ordering::SeqCst);
                }
                s.abort.notify_waiters();
                true
            }
            _ => false,
        };
        self.kills.lock().unwrap().push(target.to_string());
        Ok(Rows::scalar("killed", Some(if hit { "t" } else { "f" }.to_string())))
    }
}

/// Shared handle to the mock server
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<ServerState>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn driver(&self) -> MockDriver {
        MockDriver {
            server: self.clone(),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn connector(&self, label: &str) -> MockConnector {
        MockConnector {
            server: self.clone(),
            label: label.to_string(),
        }
    }

    pub fn set_kill_delay(&self, delay: Duration) {
        self.state
            .kill_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_kill_failure(&self, fail: bool) {
        self.state.fail_kills.store(fail, Ordering::SeqCst);
    }

    pub fn set_identity_failure(&self, fail: bool) {
        self.state.fail_identity.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_failure(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Targets of kills that reached the server and completed
    pub fn kills(&self) -> Vec<String> {
        self.state.kills.lock().unwrap().clone()
    }

    /// Kill statements received, including failed and abandoned ones
    pub fn kill_attempts(&self) -> usize {
        self.state.kill_attempts.load(Ordering::SeqCst)
    }

    /// Highest number of kills running at once against a single target
    pub fn max_concurrent_kills(&self) -> usize {
        self.state.max_concurrent_kills.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<Executed> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn statements_for(&self, session: &str) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|e| e.session == session)
            .map(|e| e.sql)
            .collect()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions.lock().unwrap().len()
    }

    pub fn closed_sessions(&self) -> Vec<String> {
        let mut closed: Vec<String> = self
            .state
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.closed.load(Ordering::SeqCst))
            .map(|(id, _)| id.clone())
            .collect();
        closed.sort();
        closed
    }
}

/// Hands out one connector per DSN, labelled in creation order
pub struct MockDriver {
    server: MockServer,
    opened: AtomicUsize,
}

impl Driver for MockDriver {
    type Connector = MockConnector;

    fn open_connector(&self, dsn: &str) -> Result<MockConnector> {
        if !dsn.starts_with("mock://") {
            return Err(Error::Config(format!("unsupported DSN: {}", dsn)));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.server.connector(&format!("connector-{}", n)))
    }
}

pub struct MockConnector {
    server: MockServer,
    label: String,
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection> {
        let state = self.server.state.clone();
        if state.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connect("connection refused".into()));
        }
        tokio::task::yield_now().await;

        let id = (state.next_session.fetch_add(1, Ordering::SeqCst) + 100).to_string();
        let session = Arc::new(Session::default());
        state
            .sessions
            .lock()
            .unwrap()
            .insert(id.clone(), session.clone());
        Ok(MockConnection {
            state,
            session,
            id,
            connector: self.label.clone(),
        })
    }

    fn session_identity_sql(&self) -> &str {
        IDENTITY_SQL
    }

    fn kill_sql(&self, target: &SessionId, mode: KillMode) -> Result<String> {
        Ok(match mode {
            KillMode::TerminateSession => format!("KILL {}", target),
            KillMode::CancelStatement => format!("CANCEL {}", target),
        })
    }

    fn kill_acknowledged(&self, rows: &Rows) -> bool {
        rows.first_value() == Some("t")
    }
}

pub struct MockConnection {
    state: Arc<ServerState>,
    session: Arc<Session>,
    id: String,
    connector: String,
}

impl MockConnection {
    async fn run(&mut self, sql: &str) -> Result<Rows> {
        if self.session.terminated.load(Ordering::SeqCst) || self.session.closed.load(Ordering::SeqCst)
        {
            return Err(Error::ConnectionClosed);
        }
        self.state.record(&self.connector, &self.id, sql);

        let words: Vec<&str> = sql.split_whitespace().collect();
        match words.as_slice() {
            [] => Ok(Rows::default()),
            ["SELECT", "session_id()"] => {
                if self.state.fail_identity.load(Ordering::SeqCst) {
                    Ok(Rows::default())
                } else {
                    Ok(Rows::scalar("session_id", Some(self.id.clone())))
                }
            }
            ["SLEEP", ms] => {
                let ms: u64 = ms
                    .parse()
                    .map_err(|_| Error::Server(ServerError::new("bad sleep duration")))?;
                let session = self.session.clone();
                let aborted = session.abort.notified();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        Ok(Rows::scalar("sleep", Some("done".to_string())))
                    }
                    _ = aborted => {
                        if session.terminated.load(Ordering::SeqCst) {
                            Err(Error::Server(ServerError {
                                severity: Some("FATAL".into()),
                                ..ServerError::new("terminating connection due to administrator command")
                                    .with_code("57P01")
                            }))
                        } else {
                            Err(Error::Server(
                                ServerError::new("canceling statement due to user request")
                                    .with_code("57014"),
                            ))
                        }
                    }
                }
            }
            ["KILL", target] => self.state.kill(target, true).await,
            ["CANCEL", target] => self.state.kill(target, false).await,
            ["FAIL"] => Err(Error::Server(
                ServerError::new("syntax error").with_code("42601"),
            )),
            ["SELECT", value] => Ok(Rows::scalar("?column?", Some(value.to_string()))),
            _ => Ok(Rows::default()),
        }
    }
}

impl RawConnection for MockConnection {
    type Statement = String;

    async fn query(&mut self, sql: &str, _params: &[Value]) -> Result<Rows> {
        self.run(sql).await
    }

    async fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<ExecResult> {
        let rows = self.run(sql).await?;
        Ok(ExecResult {
            rows_affected: rows.len() as u64,
        })
    }

    async fn prepare(&mut self, sql: &str) -> Result<String> {
        self.run(&format!("PREPARE {}", sql)).await?;
        Ok(sql.to_string())
    }

    async fn query_statement(&mut self, stmt: &String, _params: &[Value]) -> Result<Rows> {
        self.run(stmt).await
    }

    async fn execute_statement(&mut self, stmt: &String, _params: &[Value]) -> Result<ExecResult> {
        let rows = self.run(stmt).await?;
        Ok(ExecResult {
            rows_affected: rows.len() as u64,
        })
    }

    async fn close_statement(&mut self, stmt: &String) -> Result<()> {
        self.run(&format!("DEALLOCATE {}", stmt)).await.map(|_| ())
    }

    async fn begin(&mut self, _opts: TxOptions) -> Result<()> {
        self.run("BEGIN").await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<()> {
        self.run("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.run("ROLLBACK").await.map(|_| ())
    }

    async fn ping(&mut self) -> Result<()> {
        self.run("").await.map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        self.session.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn server_version(&self) -> Option<String> {
        Some("mock-1.0".to_string())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connector pair over `server`: the first connector is the main one, the second feeds the kill pool
pub fn open(server: &MockServer, config: KillConfig) -> CancellableConnector<MockConnector> {
    init_tracing();
    CancellableDriver::new(server.driver())
        .open_connector_with_config("mock://test", config)
        .expect("open connector")
}

/// Poll `check` until it holds, failing after five seconds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
