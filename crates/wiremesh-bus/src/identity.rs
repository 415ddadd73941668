// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::BusError;

const CONNECT_CONTEXT: &[u8] = b"wiremesh-bus-connect:";

pub type Nonce = [u8; 32];

pub fn new_nonce() -> Nonce {
    rand::random()
}

/// What a client holds when it connects.
#[derive(Clone)]
pub enum Credentials {
    /// The server's own in-process connection. Never accepted remotely.
    Server,
    /// Operator access to `admin.>`.
    Admin(String),
    /// A registered device, identified by its signing key.
    Device(SigningKey),
    /// An unregistered device holding an invitation.
    Invite(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => f.write_str("Server"),
            Self::Admin(_) => f.write_str("Admin(..)"),
            Self::Device(key) => write!(f, "Device({})", encode_verifying_key(&key.verifying_key())),
            Self::Invite(_) => f.write_str("Invite(..)"),
        }
    }
}

/// What a client sends to answer the broker's nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Proof {
    Admin { token: String },
    Device { public_key: String, signature: String },
    Invite { token: String },
}

impl Credentials {
    /// `None` for [`Credentials::Server`], which cannot be proven over a
    /// socket.
    pub fn prove(&self, nonce: &Nonce) -> Option<Proof> {
        match self {
            Self::Server => None,
            Self::Admin(token) => Some(Proof::Admin { token: token.clone() }),
            Self::Invite(token) => Some(Proof::Invite { token: token.clone() }),
            Self::Device(key) => {
                let signature = key.sign(&connect_message(nonce));
                Some(Proof::Device {
                    public_key: encode_verifying_key(&key.verifying_key()),
                    signature: BASE64.encode(signature.to_bytes()),
                })
            }
        }
    }
}

fn connect_message(nonce: &Nonce) -> Vec<u8> {
    let mut msg = Vec::with_capacity(CONNECT_CONTEXT.len() + nonce.len());
    msg.extend_from_slice(CONNECT_CONTEXT);
    msg.extend_from_slice(nonce);
    msg
}

pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    BASE64.encode(key.as_bytes())
}

pub fn decode_verifying_key(b64: &str) -> Result<VerifyingKey, BusError> {
    let bytes = BASE64.decode(b64).map_err(|_| BusError::Unauthorized)?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| BusError::Unauthorized)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| BusError::Unauthorized)
}

/// Check a device proof against `nonce`, returning the identity it proves.
pub fn verify_device(
    nonce: &Nonce,
    public_key: &str,
    signature: &str,
) -> Result<String, BusError> {
    let key = decode_verifying_key(public_key)?;
    let sig = BASE64.decode(signature).map_err(|_| BusError::Unauthorized)?;
    let sig = Signature::from_slice(&sig).map_err(|_| BusError::Unauthorized)?;
    key.verify(&connect_message(nonce), &sig)
        .map_err(|_| BusError::Unauthorized)?;
    Ok(public_key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_proof_verifies_only_for_its_nonce() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let creds = Credentials::Device(key.clone());
        let nonce = new_nonce();

        let Some(Proof::Device { public_key, signature }) = creds.prove(&nonce) else {
            panic!("expected device proof");
        };
        assert_eq!(
            verify_device(&nonce, &public_key, &signature).unwrap(),
            encode_verifying_key(&key.verifying_key())
        );

        let other_nonce = [0u8; 32];
        assert!(verify_device(&other_nonce, &public_key, &signature).is_err());
    }

    #[test]
    fn server_credentials_have_no_proof() {
        assert!(Credentials::Server.prove(&new_nonce()).is_none());
    }
}
