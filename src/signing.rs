//! Authenticity of commands sent to agents.
//!
//! The server holds a secp256k1 private key and signs every command it puts
//! on the bus. Agents hold the matching public key and refuse envelopes that
//! do not verify or have expired. The signature covers the payload and the
//! expiry together, so neither can be swapped independently.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShoveyError};

/// Signed command as it travels over the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// JSON encoded payload
    pub payload: String,
    /// Base64 encoded signature over [`signing_input`]
    pub signature: String,
    pub expires_at: DateTime<Utc>,
}

impl SignedEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

fn signing_input(payload: &str, expires_at: &DateTime<Utc>) -> Vec<u8> {
    format!("{}\n{}", payload, expires_at.to_rfc3339()).into_bytes()
}

pub trait PayloadSigner: Send + Sync {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Serialize `payload` and sign it together with its expiry.
pub fn seal<T: Serialize>(
    signer: &dyn PayloadSigner,
    payload: &T,
    expires_at: DateTime<Utc>,
) -> Result<SignedEnvelope> {
    let payload = serde_json::to_string(payload)?;
    let signature = signer.sign(&signing_input(&payload, &expires_at))?;
    Ok(SignedEnvelope {
        payload,
        signature: STANDARD.encode(signature),
        expires_at,
    })
}

/// ECDSA over secp256k1 with SHA-256.
#[derive(Clone)]
pub struct EcdsaSigner {
    key: SigningKey,
}

impl std::fmt::Debug for EcdsaSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdsaSigner")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

impl EcdsaSigner {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_bytes(secret: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(secret)
            .map_err(|e| ShoveyError::Signing(format!("invalid private key: {}", e)))?;
        Ok(Self { key })
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let secret = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ShoveyError::Signing(format!("private key is not valid base64: {}", e)))?;
        Self::from_bytes(&secret)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let encoded = std::fs::read_to_string(path)?;
        Self::from_base64(&encoded)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, format!("{}\n", self.to_base64()))?;
        Ok(())
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.key.to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from(&self.key)
    }

    /// Compressed SEC1 public key, the form agents are configured with.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.verifying_key().to_encoded_point(true).as_bytes())
    }
}

impl PayloadSigner for EcdsaSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature: Signature = self
            .key
            .try_sign(message)
            .map_err(|e| ShoveyError::Signing(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }
}

/// Agent side check of envelopes produced by [`seal`].
#[derive(Debug, Clone)]
pub struct EnvelopeVerifier {
    key: VerifyingKey,
}

impl EnvelopeVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ShoveyError::Signing(format!("public key is not valid base64: {}", e)))?;
        let key = VerifyingKey::from_sec1_bytes(&bytes)
            .map_err(|e| ShoveyError::Signing(format!("invalid public key: {}", e)))?;
        Ok(Self { key })
    }

    /// Verify signature and expiry, then decode the payload.
    pub fn open<T: DeserializeOwned>(&self, envelope: &SignedEnvelope, now: DateTime<Utc>) -> Result<T> {
        let raw = STANDARD
            .decode(&envelope.signature)
            .map_err(|e| ShoveyError::Signing(format!("signature is not valid base64: {}", e)))?;
        let signature = Signature::from_slice(&raw)
            .map_err(|e| ShoveyError::Signing(format!("malformed signature: {}", e)))?;

        self.key
            .verify(
                &signing_input(&envelope.payload, &envelope.expires_at),
                &signature,
            )
            .map_err(|_| ShoveyError::Signing("signature does not verify".to_string()))?;

        if now > envelope.expires_at {
            return Err(ShoveyError::Signing(format!(
                "envelope expired at {}",
                envelope.expires_at
            )));
        }

        Ok(serde_json::from_str(&envelope.payload)?)
    }
}
