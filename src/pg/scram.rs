//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677), without channel binding

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const GS2_HEADER: &str = "n,,";

/// SCRAM exchange failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScramError {
    /// Server message could not be parsed
    #[error("invalid server message: {0}")]
    InvalidServerMessage(String),

    /// Server nonce does not extend the client nonce
    #[error("server nonce does not extend client nonce")]
    NonceMismatch,

    /// Server signature did not verify
    #[error("server signature mismatch")]
    SignatureMismatch,

    /// Server reported an error in its final message
    #[error("server rejected authentication: {0}")]
    ServerRejected(String),
}

/// Keys derived from the server-first-message, needed to check the server-final-message
#[derive(Debug, Clone)]
pub struct ScramVerifier {
    server_key: Vec<u8>,
    auth_message: String,
}

/// Client side of one SCRAM-SHA-256 exchange
#[derive(Debug, Clone)]
pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
}

impl ScramClient {
    /// Start an exchange with a fresh random nonce
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let mut raw = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut raw);
        Self::with_nonce(username, password, BASE64.encode(raw))
    }

    /// Start an exchange with a caller-chosen nonce
    pub fn with_nonce(
        username: impl Into<String>,
        password: impl Into<String>,
        nonce: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            nonce: nonce.into(),
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", escape_username(&self.username), self.nonce)
    }

    /// client-first-message
    pub fn client_first(&self) -> String {
        format!("{}{}", GS2_HEADER, self.client_first_bare())
    }

    /// Answer the server-first-message with the client-final-message
    pub fn client_final(&self, server_first: &str) -> Result<(String, ScramVerifier), ScramError> {
        let challenge = ServerFirst::parse(server_first)?;
        if challenge.nonce.len() <= self.nonce.len() || !challenge.nonce.starts_with(&self.nonce) {
            return Err(ScramError::NonceMismatch);
        }

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(
            self.password.as_bytes(),
            &challenge.salt,
            challenge.iterations,
            &mut salted,
        )
        .map_err(|e| ScramError::InvalidServerMessage(e.to_string()))?;

        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);
        let without_proof = format!("c={},r={}", BASE64.encode(GS2_HEADER), challenge.nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare(), server_first, without_proof);
        let signature = hmac(&stored_key, auth_message.as_bytes())?;

        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let verifier = ScramVerifier {
            server_key: hmac(&salted, b"Server Key")?,
            auth_message,
        };
        Ok((format!("{},p={}", without_proof, BASE64.encode(proof)), verifier))
    }
}

impl ScramVerifier {
    /// Check the server-final-message
    pub fn verify(&self, server_final: &str) -> Result<(), ScramError> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerRejected(err.to_string()));
        }
        let encoded = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| ScramError::InvalidServerMessage("missing verifier".into()))?;
        let signature = BASE64
            .decode(encoded)
            .map_err(|e| ScramError::InvalidServerMessage(format!("verifier: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(&self.server_key)
            .map_err(|e| ScramError::InvalidServerMessage(e.to_string()))?;
        mac.update(self.auth_message.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ScramError::SignatureMismatch)
    }
}

struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl ServerFirst {
    fn parse(msg: &str) -> Result<Self, ScramError> {
        let (mut nonce, mut salt, mut iterations) = (None, None, None);
        for attr in msg.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(v),
                Some(("i", v)) => iterations = Some(v),
                _ => {}
            }
        }
        let missing = |name: &str| ScramError::InvalidServerMessage(format!("missing {}", name));

        let nonce = nonce.filter(|n| !n.is_empty()).ok_or_else(|| missing("nonce"))?;
        let salt = BASE64
            .decode(salt.ok_or_else(|| missing("salt"))?)
            .map_err(|e| ScramError::InvalidServerMessage(format!("salt: {}", e)))?;
        let iterations = iterations
            .ok_or_else(|| missing("iteration count"))?
            .parse::<u32>()
            .ok()
            .filter(|&i| i > 0)
            .ok_or_else(|| ScramError::InvalidServerMessage("bad iteration count".into()))?;

        Ok(Self {
            nonce: nonce.to_string(),
            salt,
            iterations,
        })
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| ScramError::InvalidServerMessage(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}
