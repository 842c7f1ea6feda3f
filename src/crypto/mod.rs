//! Cryptographic foundations for device liveness proofs
//!
//! Devices identify themselves by an Ed25519 public key and sign every
//! heartbeat and registration over a deterministic message string. This
//! module owns key handling, message construction, and verification.

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Ed25519 keypair for a device. Servers only ever hold verifying keys;
/// the signing half exists for tests and the simulator.
#[derive(Debug, Clone)]
pub struct DeviceKeypair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl DeviceKeypair {
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        getrandom::getrandom(&mut secret_bytes).expect("Failed to generate random bytes");
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_bytes(private_bytes: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&private_bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Hex encoding of the public key, the wire identity of the device.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.to_bytes())
    }
}

/// Parse a hex-encoded Ed25519 public key.
pub fn parse_public_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| Error::InvalidPublicKey(format!("not hex: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidPublicKey("expected 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| Error::InvalidPublicKey(format!("not a curve point: {}", e)))
}

/// Parse a hex-encoded Ed25519 signature.
pub fn parse_signature(signature_hex: &str) -> Result<Signature> {
    let bytes = hex::decode(signature_hex)
        .map_err(|e| Error::InvalidSignature(format!("not hex: {}", e)))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| Error::InvalidSignature("expected 64 bytes".to_string()))?;
    Ok(Signature::from_bytes(&bytes))
}

/// Deterministic heartbeat message. An absent latency signs as 0 so both
/// sides build the same bytes.
pub fn heartbeat_message(
    public_key_hex: &str,
    timestamp: i64,
    nonce: &str,
    latency_ms: Option<i64>,
) -> String {
    format!(
        "HEARTBEAT|{}|{}|{}|{}",
        public_key_hex,
        timestamp,
        nonce,
        latency_ms.unwrap_or(0)
    )
}

/// Deterministic registration message.
pub fn registration_message(public_key_hex: &str, timestamp: i64, nonce: &str) -> String {
    format!("REGISTER|{}|{}|{}", public_key_hex, timestamp, nonce)
}

/// Verify a signature over a message. Returns a plain bool: callers decide
/// whether failure is a rejection (registration) or a recorded miss
/// (heartbeat).
pub fn verify(public_key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    public_key.verify(message, signature).is_ok()
}
