//! Integration tests against a live Postgres server
//!
//! These tests require a running Postgres instance and a role allowed to call
//! `pg_terminate_backend` on its own sessions (any role can, for sessions it owns).
//!
//! Run with: cargo test --test postgres_integration -- --ignored --nocapture

use cancellable_sql::pg::PgDriver;
use cancellable_sql::{
    CancelReason, CancellableConnector, CancellableDriver, CancellationOutcome, Context, Error,
    KillConfig, KillMode, SessionState, TxOptions, Value,
};
use std::time::{Duration, Instant};

fn test_dsn() -> String {
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_else(|_| "postgres".to_string());
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let db = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "postgres".to_string());

    format!("postgres://{}:{}@{}:{}/{}", user, password, host, port, db)
}

/// Helper to build a connector against the test database
fn test_connector(mode: KillMode) -> CancellableConnector<cancellable_sql::pg::PgConnector> {
    let config = KillConfig::builder()
        .kill_pool_size(2)
        .kill_timeout(Duration::from_secs(5))
        .kill_mode(mode)
        .build()
        .expect("config");
    CancellableDriver::new(PgDriver)
        .open_connector_with_config(&test_dsn(), config)
        .expect("connector")
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_connect_resolves_backend_pid() {
    let connector = test_connector(KillMode::TerminateSession);
    let bg = Context::background();
    let conn = connector.connect(&bg).await.expect("connect");

    let rows = conn
        .query(&bg, "SELECT pg_backend_pid()", &[])
        .await
        .expect("query");
    println!("  session {} (server {:?})", conn.session_id(), conn.server_version());
    assert_eq!(rows.first_value(), Some(conn.session_id().as_str()));

    conn.close().await.expect("close");
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_deadline_terminates_backend() {
    let connector = test_connector(KillMode::TerminateSession);
    let bg = Context::background();
    let conn = connector.connect(&bg).await.expect("connect");
    let pid = conn.session_id().to_string();

    let ctx = Context::with_timeout(Duration::from_millis(100));
    let started = Instant::now();
    let err = conn
        .query(&ctx, "SELECT pg_sleep(30)", &[])
        .await
        .unwrap_err();
    println!("  cancelled after {:?}", started.elapsed());
    assert_eq!(err.cancel_reason(), Some(CancelReason::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(wait_until(|| conn.state() == SessionState::Closed).await);
    assert_eq!(conn.last_outcome(), Some(CancellationOutcome::CanceledKillSent));

    // The backend is gone from the server's point of view.
    let observer = connector.connect(&bg).await.expect("connect observer");
    let rows = observer
        .query(
            &bg,
            "SELECT count(*) FROM pg_stat_activity WHERE pid = $1",
            &[Value::Int(pid.parse().expect("numeric pid"))],
        )
        .await
        .expect("query");
    assert_eq!(rows.first_value(), Some("0"));
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_cancel_statement_keeps_session() {
    let connector = test_connector(KillMode::CancelStatement);
    let bg = Context::background();
    let conn = connector.connect(&bg).await.expect("connect");

    let ctx = Context::with_timeout(Duration::from_millis(100));
    let err = conn
        .query(&ctx, "SELECT pg_sleep(30)", &[])
        .await
        .unwrap_err();
    assert!(err.is_cancellation());
    assert!(wait_until(|| conn.state() == SessionState::Idle).await);

    let rows = conn
        .query(&bg, "SELECT $1::int + 1", &[Value::Int(41)])
        .await
        .expect("session survives statement cancel");
    assert_eq!(rows.first_value(), Some("42"));
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_fast_query_is_untouched() {
    let connector = test_connector(KillMode::TerminateSession);
    let bg = Context::background();
    let conn = connector.connect(&bg).await.expect("connect");

    let ctx = Context::with_timeout(Duration::from_secs(10));
    let rows = conn
        .query(&ctx, "SELECT $1::text AS greeting", &[Value::from("it's fine")])
        .await
        .expect("query");
    assert_eq!(rows.first_value(), Some("it's fine"));
    assert_eq!(conn.last_outcome(), Some(CancellationOutcome::CompletedNormally));
    assert_eq!(connector.kill_pool().idle_connections(), 0);
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_transaction_and_prepared_statement() {
    let connector = test_connector(KillMode::TerminateSession);
    let bg = Context::background();
    let conn = connector.connect(&bg).await.expect("connect");

    conn.execute(&bg, "CREATE TEMP TABLE cs_items (id int, name text)", &[])
        .await
        .expect("create");

    let tx = conn.begin(&bg, TxOptions::default()).await.expect("begin");
    let inserted = tx
        .execute(
            &bg,
            "INSERT INTO cs_items VALUES ($1, $2), ($3, $4)",
            &[Value::Int(1), Value::from("a"), Value::Int(2), Value::from("b")],
        )
        .await
        .expect("insert");
    assert_eq!(inserted.rows_affected, 2);
    tx.commit(&bg).await.expect("commit");

    let stmt = conn
        .prepare(&bg, "SELECT name FROM cs_items WHERE id = $1")
        .await
        .expect("prepare");
    let rows = stmt.query(&bg, &[Value::Int(2)]).await.expect("execute");
    assert_eq!(rows.first_value(), Some("b"));
    stmt.close(&bg).await.expect("deallocate");

    conn.ping(&bg).await.expect("ping");
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_concurrent_cancellations_share_kill_pool() {
    let connector = test_connector(KillMode::TerminateSession);
    let bg = Context::background();

    let mut conns = Vec::new();
    for _ in 0..4 {
        conns.push(connector.connect(&bg).await.expect("connect"));
    }

    let started = Instant::now();
    let results = futures::future::join_all(conns.iter().map(|conn| async move {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        conn.query(&ctx, "SELECT pg_sleep(30)", &[]).await
    }))
    .await;
    println!("  all callers back after {:?}", started.elapsed());

    for result in results {
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
    for conn in &conns {
        assert!(wait_until(|| conn.state() == SessionState::Closed).await);
    }
    assert!(connector.kill_pool().idle_connections() <= 2);
}
