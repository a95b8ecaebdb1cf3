//! Protocol message types

use crate::error::ServerError;
use bytes::Bytes;

/// Message sent by the client
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// Startup packet (no tag byte)
    Startup {
        /// Protocol version
        version: i32,
        /// Startup parameters (user, database, ...)
        params: Vec<(String, String)>,
    },
    /// Cleartext password
    Password(String),
    /// Simple query
    Query(String),
    /// First SASL message, naming the mechanism
    SaslInitialResponse {
        /// Mechanism name
        mechanism: String,
        /// client-first-message
        data: Vec<u8>,
    },
    /// Subsequent SASL message
    SaslResponse(Vec<u8>),
    /// Orderly disconnect
    Terminate,
}

/// Message sent by the server
#[derive(Debug, Clone)]
pub enum BackendMessage {
    /// Authentication request or result
    Authentication(AuthenticationMessage),
    /// Process id and secret key of the backend
    BackendKeyData {
        /// Backend process id
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },
    /// A statement finished; carries the command tag
    CommandComplete(String),
    /// One row, text format, `None` for NULL
    DataRow(Vec<Option<Bytes>>),
    /// The query string was empty
    EmptyQueryResponse,
    /// Statement or session error
    ErrorResponse(ServerError),
    /// Warning or informational notice
    NoticeResponse(ServerError),
    /// LISTEN/NOTIFY delivery
    NotificationResponse {
        /// Sending backend
        process_id: i32,
        /// Channel name
        channel: String,
        /// Payload
        payload: String,
    },
    /// Run-time parameter report
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },
    /// Server is ready for the next query
    ReadyForQuery {
        /// Transaction status byte
        status: u8,
    },
    /// Result column descriptions
    RowDescription(Vec<FieldDescription>),
}

/// Authentication sub-messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMessage {
    /// Authentication complete
    Ok,
    /// Send the password in clear
    CleartextPassword,
    /// Send an MD5-hashed password (not supported by this client)
    Md5Password {
        /// Hash salt
        salt: [u8; 4],
    },
    /// SASL negotiation with the listed mechanisms
    Sasl(Vec<String>),
    /// SASL server-first-message
    SaslContinue(Vec<u8>),
    /// SASL server-final-message
    SaslFinal(Vec<u8>),
}

/// Column description from RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Column name
    pub name: String,
    /// Data type OID
    pub type_oid: u32,
    /// Format code (0 = text, 1 = binary)
    pub format_code: i16,
}
