//! SCRAM-SHA-256 client (RFC 5802, RFC 7677) used during startup.
//!
//! No channel binding: the GS2 header is always `n,,`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type Key = [u8; 32];

/// base64 of the `n,,` header, echoed back in the final message.
const CHANNEL_BINDING: &str = "biws";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("Malformed server message: {0}")]
    Malformed(&'static str),
    #[error("Server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("Server signature does not match")]
    SignatureMismatch,
    #[error("Server final message received before the first one")]
    OutOfOrder,
    #[error("Invalid key material")]
    InvalidKey,
}

/// What the client needs to check the server's final message.
struct Verifier {
    server_key: Key,
    auth_message: String,
}

pub struct ScramClient {
    user: String,
    password: String,
    nonce: String,
    verifier: Option<Verifier>,
}

impl ScramClient {
    pub fn new(user: &str, password: &str) -> Self {
        let raw: [u8; 18] = rand::thread_rng().gen();
        Self {
            user: user.to_string(),
            password: password.to_string(),
            nonce: BASE64.encode(raw),
            verifier: None,
        }
    }

    fn first_bare(&self) -> String {
        format!("n={},r={}", escape_name(&self.user), self.nonce)
    }

    /// `n,,n=<user>,r=<nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.first_bare()).into_bytes()
    }

    /// Answer `r=<nonce>,s=<salt>,i=<iterations>` with the client proof.
    pub fn process_server_first(&mut self, message: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first = std::str::from_utf8(message)
            .map_err(|_| ScramError::Malformed("not UTF-8"))?;

        let (mut nonce, mut salt, mut iterations) = (None, None, None);
        for attribute in server_first.split(',') {
            match attribute.split_once('=') {
                Some(("r", value)) => nonce = Some(value),
                Some(("s", value)) => {
                    salt = Some(BASE64.decode(value).map_err(|_| ScramError::Malformed("salt"))?)
                }
                Some(("i", value)) => {
                    iterations = Some(
                        value
                            .parse::<u32>()
                            .map_err(|_| ScramError::Malformed("iteration count"))?,
                    )
                }
                _ => {}
            }
        }
        let nonce = nonce.ok_or(ScramError::Malformed("missing nonce"))?;
        let salt = salt.ok_or(ScramError::Malformed("missing salt"))?;
        let iterations = iterations.ok_or(ScramError::Malformed("missing iteration count"))?;
        if !nonce.starts_with(&self.nonce) {
            return Err(ScramError::NonceMismatch);
        }

        let mut salted = Key::default();
        pbkdf2::pbkdf2::<HmacSha256>(self.password.as_bytes(), &salt, iterations, &mut salted)
            .map_err(|_| ScramError::InvalidKey)?;

        let without_proof = format!("c={},r={}", CHANNEL_BINDING, nonce);
        let auth_message = format!("{},{},{}", self.first_bare(), server_first, without_proof);

        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key: Key = Sha256::digest(client_key).into();
        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        proof.iter_mut().zip(signature).for_each(|(p, s)| *p ^= s);

        self.verifier = Some(Verifier {
            server_key: hmac(&salted, b"Server Key")?,
            auth_message,
        });
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `v=<server signature>`.
    pub fn verify_server_final(&self, message: &[u8]) -> Result<(), ScramError> {
        let verifier = self.verifier.as_ref().ok_or(ScramError::OutOfOrder)?;
        let signature = std::str::from_utf8(message)
            .ok()
            .and_then(|s| s.strip_prefix("v="))
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or(ScramError::Malformed("server signature"))?;

        let mut mac = new_mac(&verifier.server_key)?;
        mac.update(verifier.auth_message.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ScramError::SignatureMismatch)
    }
}

fn new_mac(key: &[u8]) -> Result<HmacSha256, ScramError> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| ScramError::InvalidKey)
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Key, ScramError> {
    let mut mac = new_mac(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// The server authenticates the startup user and ignores this name, so only
/// the attribute separators are escaped.
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}
