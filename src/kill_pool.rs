//! Kill pool
//!
//! A small set of administrative connections, opened lazily against the same
//! server as the main connector, used only to send "kill session" commands.
//! Connections in this pool are never handed to callers and never run user
//! statements.
//!
//! Capacity is enforced by a semaphore. A kill that cannot get a slot within
//! its timeout fails with [`KillError::PoolExhausted`]; the whole kill
//! (slot wait, lazy connect, command) shares one deadline.

use crate::config::{KillConfig, KillMode};
use crate::driver::{Connector, RawConnection};
use crate::error::KillError;
use crate::session::SessionId;
use futures::future::BoxFuture;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

type KillResult = std::result::Result<(), KillError>;

/// Anything able to kill a server session out of band
///
/// Implemented by [`KillPool`]; the race manager only depends on this trait.
pub trait SessionKiller: Send + Sync + 'static {
    /// Kill `target`, giving up after `timeout`
    fn terminate<'a>(&'a self, target: &'a SessionId, timeout: Duration)
        -> BoxFuture<'a, KillResult>;
}

/// Pool of administrative connections dedicated to kill commands
pub struct KillPool<C: Connector> {
    connector: C,
    idle: Mutex<Vec<C::Connection>>,
    permits: Semaphore,
    size: usize,
    mode: KillMode,
}

impl<C: Connector> KillPool<C> {
    /// Create a pool; no connection is opened until the first kill
    pub fn new(connector: C, config: &KillConfig) -> Self {
        Self {
            connector,
            idle: Mutex::new(Vec::with_capacity(config.kill_pool_size)),
            permits: Semaphore::new(config.kill_pool_size),
            size: config.kill_pool_size,
            mode: config.kill_mode,
        }
    }

    /// Configured capacity
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently running a kill
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Open administrative connections waiting for work
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Kill mode used for every command
    pub fn mode(&self) -> KillMode {
        self.mode
    }

    /// Kill `target`, bounded by `timeout`
    pub async fn terminate(&self, target: &SessionId, timeout: Duration) -> KillResult {
        let started = Instant::now();
        let deadline = started + timeout;

        let _permit = match tokio::time::timeout_at(deadline, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(KillError::Connect("kill pool closed".into())),
            Err(_) => {
                return Err(KillError::PoolExhausted {
                    size: self.size,
                    timeout,
                })
            }
        };

        let sql = self
            .connector
            .kill_sql(target, self.mode)
            .map_err(|e| KillError::InvalidTarget(e.to_string()))?;

        let mut conn = match self.take_idle() {
            Some(conn) => conn,
            None => {
                tracing::debug!(size = self.size, "opening kill connection");
                match tokio::time::timeout_at(deadline, self.connector.connect()).await {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => return Err(KillError::Connect(e.to_string())),
                    Err(_) => {
                        return Err(KillError::Timeout {
                            target: target.to_string(),
                            timeout,
                        })
                    }
                }
            }
        };

        let rows = match tokio::time::timeout_at(deadline, conn.query(&sql, &[])).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => {
                if !e.is_fatal() {
                    self.put_idle(conn);
                }
                return Err(KillError::Command(e.to_string()));
            }
            Err(_) => {
                // Wire state unknown after an abandoned command; drop the connection.
                return Err(KillError::Timeout {
                    target: target.to_string(),
                    timeout,
                });
            }
        };
        self.put_idle(conn);
        crate::metrics::histograms::kill_duration(started.elapsed());

        if !self.connector.kill_acknowledged(&rows) {
            return Err(KillError::NotAcknowledged {
                target: target.to_string(),
            });
        }

        tracing::debug!(session = %target, mode = %self.mode, elapsed = ?started.elapsed(), "kill sent");
        Ok(())
    }

    /// Close every idle administrative connection
    pub async fn close(&self) {
        self.permits.close();
        let idle = std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        for mut conn in idle {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "error closing kill connection");
            }
        }
    }

    fn take_idle(&self) -> Option<C::Connection> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop()
    }

    fn put_idle(&self, conn: C::Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.size {
            idle.push(conn);
        }
    }
}

impl<C: Connector> SessionKiller for KillPool<C> {
    fn terminate<'a>(
        &'a self,
        target: &'a SessionId,
        timeout: Duration,
    ) -> BoxFuture<'a, KillResult> {
        Box::pin(KillPool::terminate(self, target, timeout))
    }
}

impl<C: Connector> std::fmt::Debug for KillPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillPool")
            .field("size", &self.size)
            .field("available", &self.available())
            .field("mode", &self.mode)
            .finish()
    }
}
