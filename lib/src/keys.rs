use std::fmt;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::dht_messages::NodeId;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid key material")]
    InvalidKey,
}

/// P-256 signing key identifying a peer.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

/// Public half of a [`PrivateKey`]; the peer ID is derived from it.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PrivateKey {
    pub fn generate() -> Self {
        Self(SigningKey::random(&mut OsRng))
    }

    pub fn from_hex(private_key_hex: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(private_key_hex)?;
        SigningKey::from_slice(&bytes)
            .map(Self)
            .map_err(|_| KeyError::InvalidKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(VerifyingKey::from(&self.0))
    }

    pub fn peer_id(&self) -> NodeId {
        self.public_key().peer_id()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.0.sign(message);
        signature.to_vec()
    }
}

// Never print key material.
impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("peer_id", &hex::encode(self.peer_id()))
            .finish()
    }
}

impl PublicKey {
    pub fn from_hex(public_key_hex: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(public_key_hex)?;
        VerifyingKey::from_sec1_bytes(&bytes)
            .map(Self)
            .map_err(|_| KeyError::InvalidKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_sec1_bytes())
    }

    /// SHA-1 of the SEC1 encoding.
    pub fn peer_id(&self) -> NodeId {
        let mut hasher = Sha1::new();
        hasher.update(self.0.to_sec1_bytes());
        hasher.finalize().into()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(signature) => self.0.verify(message, &signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}
