//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677) as PostgreSQL uses it.
//!
//! Channel binding is never offered (`n,,` GS2 header, `c=biws`), and the
//! user name sent in the exchange is informational only: the server
//! authenticates the startup user.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::error::{GenericCode, PgError};

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name advertised in AuthenticationSASL.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

#[derive(Debug, Clone, Error)]
pub enum ScramError {
    #[error("Malformed SCRAM server message: {0}")]
    Malformed(&'static str),
    #[error("Server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("The server did not return the correct signature")]
    SignatureMismatch,
    #[error("SCRAM rejected by server: {0}")]
    Server(String),
    #[error("SCRAM message out of order")]
    OutOfOrder,
}

impl From<ScramError> for PgError {
    fn from(e: ScramError) -> Self {
        match e {
            ScramError::SignatureMismatch => {
                PgError::generic(GenericCode::SaslSignatureMismatch, e.to_string())
            }
            other => PgError::Auth(other.to_string()),
        }
    }
}

enum Stage {
    /// client-first sent
    Started,
    /// client-final sent, holding the ServerSignature we expect back
    Proved { expected: [u8; 32] },
    Verified,
}

/// One SCRAM-SHA-256 exchange. Messages must be fed in protocol order.
pub struct ScramClient {
    user: String,
    password: String,
    nonce: String,
    stage: Stage,
}

impl ScramClient {
    pub fn new(user: &str, password: &str) -> Self {
        let raw: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(user, password, &BASE64.encode(raw))
    }

    pub fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            user: user.replace('=', "=3D").replace(',', "=2C"),
            password: password.to_string(),
            nonce: nonce.to_string(),
            stage: Stage::Started,
        }
    }

    fn first_bare(&self) -> String {
        format!("n={},r={}", self.user, self.nonce)
    }

    /// `n,,n=<user>,r=<nonce>`
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.first_bare()).into_bytes()
    }

    /// Answer server-first (`r=..,s=..,i=..`) with client-final.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.stage, Stage::Started) {
            return Err(ScramError::OutOfOrder);
        }
        let text = std::str::from_utf8(server_first).map_err(|_| ScramError::Malformed("utf-8"))?;
        let first = ServerFirst::parse(text)?;
        if !first.nonce.starts_with(&self.nonce) || first.nonce.len() == self.nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let keys = Keys::derive(&self.password, &first.salt, first.iterations)?;
        let without_proof = format!("c=biws,r={}", first.nonce);
        let auth_message = format!("{},{},{}", self.first_bare(), text, without_proof);

        let signature = mac(&keys.stored, auth_message.as_bytes())?;
        let mut proof = keys.client;
        proof.iter_mut().zip(signature).for_each(|(p, s)| *p ^= s);

        self.stage = Stage::Proved {
            expected: mac(&keys.server, auth_message.as_bytes())?,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check server-final (`v=<signature>` or `e=<error>`).
    pub fn verify(&mut self, server_final: &[u8]) -> Result<(), ScramError> {
        let Stage::Proved { expected } = self.stage else {
            return Err(ScramError::OutOfOrder);
        };
        let text = std::str::from_utf8(server_final).map_err(|_| ScramError::Malformed("utf-8"))?;
        if let Some(error) = attribute(text, 'e') {
            return Err(ScramError::Server(error.to_string()));
        }
        let signature = attribute(text, 'v')
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or(ScramError::Malformed("server signature"))?;

        // Compare without an early exit.
        let diff = signature
            .iter()
            .zip(expected.iter())
            .fold(signature.len() ^ expected.len(), |acc, (a, b)| acc | usize::from(a ^ b));
        if diff != 0 {
            return Err(ScramError::SignatureMismatch);
        }
        self.stage = Stage::Verified;
        Ok(())
    }
}

struct ServerFirst<'a> {
    nonce: &'a str,
    salt: Vec<u8>,
    iterations: u32,
}

impl<'a> ServerFirst<'a> {
    fn parse(text: &'a str) -> Result<Self, ScramError> {
        let nonce = attribute(text, 'r').ok_or(ScramError::Malformed("nonce"))?;
        let salt = attribute(text, 's')
            .and_then(|s| BASE64.decode(s).ok())
            .ok_or(ScramError::Malformed("salt"))?;
        let iterations = attribute(text, 'i')
            .and_then(|i| i.parse().ok())
            .filter(|&i: &u32| i > 0)
            .ok_or(ScramError::Malformed("iteration count"))?;
        Ok(Self {
            nonce,
            salt,
            iterations,
        })
    }
}

fn attribute(text: &str, name: char) -> Option<&str> {
    text.split(',').find_map(|part| {
        let mut chars = part.chars();
        (chars.next() == Some(name) && chars.next() == Some('=')).then(|| &part[2..])
    })
}

struct Keys {
    client: [u8; 32],
    stored: [u8; 32],
    server: [u8; 32],
}

impl Keys {
    fn derive(password: &str, salt: &[u8], iterations: u32) -> Result<Self, ScramError> {
        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut salted)
            .map_err(|_| ScramError::Malformed("iteration count"))?;
        let client = mac(&salted, b"Client Key")?;
        Ok(Self {
            client,
            stored: Sha256::digest(client).into(),
            server: mac(&salted, b"Server Key")?,
        })
    }
}

fn mac(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::OutOfOrder)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
