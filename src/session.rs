//! Session identity
//!
//! Each physical connection asks the server once, right after it is opened,
//! which session it is. The answer is the target of any later kill and never
//! changes for the lifetime of the connection.

use crate::driver::RawConnection;
use crate::{Error, Result};
use std::fmt;

/// Server-assigned identifier of one live session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a raw identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw identity text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the session identity of a freshly opened connection
///
/// Runs `sql` (a single-row, single-column query) and takes its first cell.
/// Any error, an empty result or a NULL/blank cell fails with
/// `Error::IdentityResolution`; the caller is responsible for closing the
/// connection in that case.
pub async fn resolve_identity<R: RawConnection>(conn: &mut R, sql: &str) -> Result<SessionId> {
    let rows = match conn.query(sql, &[]).await {
        Ok(rows) => rows,
        Err(e) => {
            crate::metrics::counters::identity_resolved("error");
            return Err(Error::IdentityResolution(format!(
                "identity query failed: {}",
                e
            )));
        }
    };

    match rows.first_value().map(str::trim) {
        Some(id) if !id.is_empty() => {
            crate::metrics::counters::identity_resolved("ok");
            Ok(SessionId::new(id))
        }
        _ => {
            crate::metrics::counters::identity_resolved("empty");
            Err(Error::IdentityResolution(
                "identity query returned no session id".into(),
            ))
        }
    }
}
