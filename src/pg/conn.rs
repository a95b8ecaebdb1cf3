//! One PostgreSQL session over the simple query protocol

use super::dsn::{PgConfig, Target};
use super::params::bind;
use super::protocol::constants::{tx_status, PROTOCOL_VERSION, SCRAM_SHA_256};
use super::protocol::{
    decode_message, encode_message, AuthenticationMessage, BackendMessage, FrontendMessage,
};
use super::scram::ScramClient;
use super::transport::Transport;
use crate::driver::RawConnection;
use crate::error::ServerError;
use crate::types::{Column, ExecResult, Row, Rows, TxOptions, Value};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use tracing::Instrument;

/// Server-side prepared statement created with `PREPARE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgStatement {
    name: String,
    sql: String,
}

impl PgStatement {
    /// Server-side statement name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Statement text as prepared
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Collected result of one simple query round trip
#[derive(Debug, Default)]
struct QueryOutcome {
    rows: Option<Rows>,
    rows_affected: u64,
}

/// An authenticated connection
#[derive(Debug)]
pub struct PgConnection {
    transport: Transport,
    read_buf: BytesMut,
    write_buf: BytesMut,
    parameters: HashMap<String, String>,
    backend_pid: Option<i32>,
    tx_status: u8,
    next_statement: u64,
    broken: bool,
}

impl PgConnection {
    /// Open a transport and run startup and authentication
    pub async fn connect(config: &PgConfig) -> Result<Self> {
        let setup = async {
            let transport = match &config.target {
                Target::Tcp { host, port } => Transport::connect_tcp(host, *port).await,
                Target::Unix(path) => Transport::connect_unix(path).await,
            }
            .map_err(|e| Error::Connect(format!("{}: {}", config.target, e)))?;

            let mut conn = Self {
                transport,
                read_buf: BytesMut::with_capacity(8192),
                write_buf: BytesMut::with_capacity(1024),
                parameters: HashMap::new(),
                backend_pid: None,
                tx_status: tx_status::IDLE,
                next_statement: 0,
                broken: false,
            };
            conn.startup(config).await?;
            Ok::<_, Error>(conn)
        }
        .instrument(tracing::info_span!(
            "startup",
            target = %config.target,
            user = %config.user,
            database = %config.database
        ));

        match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, setup).await.map_err(|_| {
                Error::Connect(format!("{}: timed out after {:?}", config.target, limit))
            })?,
            None => setup.await,
        }
    }

    /// Process id reported in BackendKeyData
    pub fn backend_pid(&self) -> Option<i32> {
        self.backend_pid
    }

    /// Run-time parameter last reported by the server
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Whether a transaction block is open (including a failed one)
    pub fn in_transaction(&self) -> bool {
        self.tx_status != tx_status::IDLE
    }

    async fn startup(&mut self, config: &PgConfig) -> Result<()> {
        self.send(&FrontendMessage::Startup {
            version: PROTOCOL_VERSION,
            params: config.startup_params(),
        })
        .await?;

        loop {
            match self.recv().await? {
                BackendMessage::Authentication(AuthenticationMessage::Ok) => {
                    tracing::debug!("authenticated");
                }
                BackendMessage::Authentication(AuthenticationMessage::CleartextPassword) => {
                    let password = require_password(config)?;
                    self.send(&FrontendMessage::Password(password.to_string())).await?;
                }
                BackendMessage::Authentication(AuthenticationMessage::Sasl(mechanisms)) => {
                    self.authenticate_scram(config, &mechanisms).await?;
                }
                BackendMessage::Authentication(AuthenticationMessage::Md5Password { .. }) => {
                    return Err(Error::Authentication(
                        "MD5 password authentication is not supported; use scram-sha-256".into(),
                    ));
                }
                BackendMessage::Authentication(other) => {
                    return Err(Error::Protocol(format!(
                        "unexpected authentication message {:?}",
                        other
                    )));
                }
                BackendMessage::BackendKeyData { process_id, .. } => {
                    self.backend_pid = Some(process_id);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!(%notice, "startup notice");
                }
                BackendMessage::ErrorResponse(err) => return Err(startup_error(err)),
                BackendMessage::ReadyForQuery { status } => {
                    self.tx_status = status;
                    tracing::info!(
                        server_version = self.parameter("server_version").unwrap_or("unknown"),
                        "startup complete"
                    );
                    return Ok(());
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during startup: {:?}",
                        other
                    )))
                }
            }
        }
    }

    async fn authenticate_scram(&mut self, config: &PgConfig, mechanisms: &[String]) -> Result<()> {
        if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
            return Err(Error::Authentication(format!(
                "no supported SASL mechanism offered: {}",
                mechanisms.join(", ")
            )));
        }
        let client = ScramClient::new(config.user.clone(), require_password(config)?);

        self.send(&FrontendMessage::SaslInitialResponse {
            mechanism: SCRAM_SHA_256.to_string(),
            data: client.client_first().into_bytes(),
        })
        .await?;

        let server_first = match self.recv().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslContinue(data)) => data,
            BackendMessage::ErrorResponse(err) => return Err(startup_error(err)),
            other => {
                return Err(Error::Protocol(format!(
                    "expected SASL continue, got {:?}",
                    other
                )))
            }
        };
        let server_first = String::from_utf8(server_first)
            .map_err(|_| Error::Authentication("server-first-message is not UTF-8".into()))?;
        let (client_final, verifier) = client
            .client_final(&server_first)
            .map_err(|e| Error::Authentication(e.to_string()))?;

        self.send(&FrontendMessage::SaslResponse(client_final.into_bytes()))
            .await?;

        let server_final = match self.recv().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslFinal(data)) => data,
            BackendMessage::ErrorResponse(err) => return Err(startup_error(err)),
            other => {
                return Err(Error::Protocol(format!(
                    "expected SASL final, got {:?}",
                    other
                )))
            }
        };
        verifier
            .verify(&String::from_utf8_lossy(&server_final))
            .map_err(|e| Error::Authentication(e.to_string()))?;
        tracing::debug!("SCRAM-SHA-256 exchange verified");
        Ok(())
    }

    /// Send one simple query and collect everything up to ReadyForQuery
    async fn simple_query(&mut self, sql: &str) -> Result<QueryOutcome> {
        if self.broken {
            return Err(Error::ConnectionClosed);
        }
        let result = self.round_trip(sql).await;
        if let Err(ref e) = result {
            if e.is_fatal() {
                self.broken = true;
            }
        }
        result
    }

    async fn round_trip(&mut self, sql: &str) -> Result<QueryOutcome> {
        self.send(&FrontendMessage::Query(sql.to_string())).await?;

        let mut outcome = QueryOutcome::default();
        let mut current: Option<Rows> = None;
        let mut error: Option<ServerError> = None;

        loop {
            let msg = match self.recv().await {
                Ok(msg) => msg,
                // A terminated backend sends its FATAL error and then hangs up.
                Err(e) => {
                    return Err(match error {
                        Some(err) if err.is_fatal() => Error::Server(err),
                        _ => e,
                    })
                }
            };
            match msg {
                BackendMessage::RowDescription(fields) => {
                    let columns = fields
                        .into_iter()
                        .map(|f| Column {
                            name: f.name,
                            type_id: f.type_oid,
                        })
                        .collect();
                    current = Some(Rows::new(columns, Vec::new()));
                }
                BackendMessage::DataRow(values) => {
                    let rows = current
                        .as_mut()
                        .ok_or_else(|| Error::Protocol("DataRow before RowDescription".into()))?;
                    let values = values
                        .into_iter()
                        .map(|v| v.map(|b| String::from_utf8_lossy(&b).into_owned()))
                        .collect();
                    rows.rows.push(Row::new(values));
                }
                BackendMessage::CommandComplete(tag) => {
                    outcome.rows_affected = rows_affected(&tag);
                    if let Some(rows) = current.take() {
                        outcome.rows = Some(rows);
                    }
                }
                BackendMessage::EmptyQueryResponse => {}
                BackendMessage::ErrorResponse(err) => {
                    tracing::debug!(error = %err, "statement failed");
                    error.get_or_insert(err);
                    current = None;
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!(%notice, "server notice");
                }
                BackendMessage::NotificationResponse { channel, .. } => {
                    tracing::debug!(%channel, "notification ignored");
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.tx_status = status;
                    break;
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message in query response: {:?}",
                        other
                    )))
                }
            }
        }

        match error {
            Some(err) => Err(Error::Server(err)),
            None => Ok(outcome),
        }
    }

    async fn send(&mut self, msg: &FrontendMessage) -> Result<()> {
        self.write_buf.clear();
        encode_message(msg, &mut self.write_buf);
        self.transport.send(&self.write_buf).await
    }

    async fn recv(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some((msg, used)) =
                decode_message(&self.read_buf).map_err(|e| Error::Protocol(e.to_string()))?
            {
                self.read_buf.advance(used);
                return Ok(msg);
            }
            if self.transport.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    fn statement_name(&mut self) -> String {
        self.next_statement += 1;
        format!("cs_stmt_{}", self.next_statement)
    }
}

impl RawConnection for PgConnection {
    type Statement = PgStatement;

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Rows> {
        let sql = bind(sql, params)?;
        let outcome = self.simple_query(&sql).await?;
        Ok(outcome.rows.unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let sql = bind(sql, params)?;
        let outcome = self.simple_query(&sql).await?;
        Ok(ExecResult {
            rows_affected: outcome.rows_affected,
        })
    }

    async fn prepare(&mut self, sql: &str) -> Result<PgStatement> {
        let name = self.statement_name();
        self.simple_query(&format!("PREPARE {} AS {}", name, sql)).await?;
        Ok(PgStatement {
            name,
            sql: sql.to_string(),
        })
    }

    async fn query_statement(&mut self, stmt: &PgStatement, params: &[Value]) -> Result<Rows> {
        let sql = execute_sql(stmt, params)?;
        Ok(self.simple_query(&sql).await?.rows.unwrap_or_default())
    }

    async fn execute_statement(&mut self, stmt: &PgStatement, params: &[Value]) -> Result<ExecResult> {
        let sql = execute_sql(stmt, params)?;
        let outcome = self.simple_query(&sql).await?;
        Ok(ExecResult {
            rows_affected: outcome.rows_affected,
        })
    }

    async fn close_statement(&mut self, stmt: &PgStatement) -> Result<()> {
        self.simple_query(&format!("DEALLOCATE {}", stmt.name)).await?;
        Ok(())
    }

    async fn begin(&mut self, opts: TxOptions) -> Result<()> {
        let mut sql = String::from("BEGIN");
        if let Some(level) = opts.isolation {
            sql.push_str(&format!(" ISOLATION LEVEL {}", level));
        }
        if opts.read_only {
            sql.push_str(" READ ONLY");
        }
        self.simple_query(&sql).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.simple_query("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.simple_query("ROLLBACK").await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.simple_query("").await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.broken {
            self.broken = true;
            if let Err(e) = self.send(&FrontendMessage::Terminate).await {
                tracing::debug!(error = %e, "terminate not delivered");
            }
        }
        self.transport.shutdown().await
    }

    fn server_version(&self) -> Option<String> {
        self.parameter("server_version").map(str::to_string)
    }
}

fn execute_sql(stmt: &PgStatement, params: &[Value]) -> Result<String> {
    if params.is_empty() {
        return Ok(format!("EXECUTE {}", stmt.name));
    }
    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${}", i)).collect();
    bind(
        &format!("EXECUTE {}({})", stmt.name, placeholders.join(", ")),
        params,
    )
}

fn require_password(config: &PgConfig) -> Result<&str> {
    config
        .password
        .as_deref()
        .ok_or_else(|| Error::Authentication("server requested a password but none was given".into()))
}

/// Invalid authorization (28xxx) is an authentication failure; anything else stays a server error
fn startup_error(err: ServerError) -> Error {
    if err.code.as_deref().is_some_and(|c| c.starts_with("28")) {
        Error::Authentication(err.to_string())
    } else {
        Error::Server(err)
    }
}

/// Row count from a command tag such as `INSERT 0 5`, `UPDATE 3` or `SELECT 10`
fn rows_affected(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
