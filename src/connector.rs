//! Connector factory
//!
//! [`CancellableDriver`] turns a DSN into a [`CancellableConnector`]: a main
//! connector producing [`CancellableConnection`]s, paired with a
//! [`KillPool`] built from a second connector against the same server and
//! credentials. There is no global registry; callers keep the objects they
//! are given.

use crate::config::KillConfig;
use crate::conn::CancellableConnection;
use crate::context::Context;
use crate::driver::{Connector, Driver, RawConnection};
use crate::kill_pool::{KillPool, SessionKiller};
use crate::race::CancellationRace;
use crate::session::resolve_identity;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::Instrument;

/// Wraps a backend driver so its connections become cancellable
#[derive(Debug, Clone, Default)]
pub struct CancellableDriver<D: Driver> {
    driver: D,
}

impl<D: Driver> CancellableDriver<D> {
    /// Wrap a backend driver
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    /// Build a connector pair from a DSN
    ///
    /// Kill options may be given in the DSN query string (`kill_pool_size`,
    /// `kill_timeout`); they are removed before the DSN reaches the backend.
    pub fn open_connector(&self, dsn: &str) -> Result<CancellableConnector<D::Connector>> {
        let (dsn, config) = KillConfig::extract_from_dsn(dsn)?;
        self.open_connector_with_config(&dsn, config)
    }

    /// Build a connector pair from a DSN and an explicit configuration
    pub fn open_connector_with_config(
        &self,
        dsn: &str,
        config: KillConfig,
    ) -> Result<CancellableConnector<D::Connector>> {
        config.validate()?;
        let connector = self.driver.open_connector(dsn)?;
        let kill_connector = self.driver.open_connector(dsn)?;
        Ok(CancellableConnector::new(connector, kill_connector, config))
    }

    /// Open a single connection from a DSN
    pub async fn open(
        &self,
        ctx: &Context,
        dsn: &str,
    ) -> Result<CancellableConnection<<D::Connector as Connector>::Connection>> {
        self.open_connector(dsn)?.connect(ctx).await
    }
}

/// Main connector paired with its kill pool
pub struct CancellableConnector<C: Connector> {
    connector: C,
    kill_pool: Arc<KillPool<C>>,
    race: CancellationRace,
    config: Arc<KillConfig>,
}

impl<C: Connector> CancellableConnector<C> {
    /// Pair `connector` with a kill pool built on `kill_connector`
    ///
    /// Both connectors must target the same server with the same credentials.
    pub fn new(connector: C, kill_connector: C, config: KillConfig) -> Self {
        let kill_pool = Arc::new(KillPool::new(kill_connector, &config));
        let killer: Arc<dyn SessionKiller> = kill_pool.clone();
        let race = CancellationRace::new(killer, &config);
        Self {
            connector,
            kill_pool,
            race,
            config: Arc::new(config),
        }
    }

    /// Kill configuration shared by every connection
    pub fn config(&self) -> &KillConfig {
        &self.config
    }

    /// The kill pool used by this connector's connections
    pub fn kill_pool(&self) -> &Arc<KillPool<C>> {
        &self.kill_pool
    }

    /// Open a physical connection and resolve its session identity
    ///
    /// A connection whose identity cannot be resolved is closed and
    /// `Error::IdentityResolution` is returned.
    pub async fn connect(&self, ctx: &Context) -> Result<CancellableConnection<C::Connection>> {
        if let Some(reason) = ctx.err() {
            return Err(Error::Cancelled(reason));
        }

        let setup = async {
            let mut conn = self.connector.connect().await.map_err(connect_error)?;
            match resolve_identity(&mut conn, self.connector.session_identity_sql()).await {
                Ok(id) => Ok((conn, id)),
                Err(e) => {
                    if let Err(close_err) = conn.close().await {
                        tracing::debug!(error = %close_err, "error closing connection without identity");
                    }
                    Err(e)
                }
            }
        };

        let (conn, id) = async {
            tokio::select! {
                biased;
                reason = ctx.done() => Err(Error::Cancelled(reason)),
                setup = setup => setup,
            }
        }
        .instrument(tracing::info_span!("connect"))
        .await?;

        tracing::info!(session = %id, "connection ready");
        Ok(CancellableConnection::new(conn, id, self.race.clone()))
    }

    /// Close idle kill connections
    pub async fn close(&self) {
        self.kill_pool.close().await;
    }
}

impl<C: Connector> std::fmt::Debug for CancellableConnector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableConnector")
            .field("config", &self.config)
            .field("kill_pool", &self.kill_pool)
            .finish()
    }
}

fn connect_error(e: Error) -> Error {
    match e {
        Error::Config(_) | Error::Connect(_) | Error::Cancelled(_) => e,
        other => Error::Connect(other.to_string()),
    }
}
