//! Cryptographic primitives for Emberchain
//!
//! Ed25519 keypairs plus the address scheme: an address is the lowercase hex
//! encoding of the first 20 bytes of SHA-256 over the raw public key.

use crate::error::ChainError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// Number of public-key hash bytes kept for the address.
pub const ADDRESS_BYTES: usize = 20;

/// Derive the 40-hex-character address for a raw Ed25519 public key.
pub fn address_from_public_key(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..ADDRESS_BYTES])
}

/// Derive an address from a hex-encoded public key.
pub fn derive_address(public_key_hex: &str) -> Result<String, ChainError> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key hex: {}", e)))?;
    Ok(address_from_public_key(&bytes))
}

#[derive(Clone, Debug)]
pub struct KeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        KeyPair {
            signing_key,
            verifying_key,
        }
    }

    /// Loads a KeyPair from hex-encoded secret and public keys. The public
    /// key must match the one derived from the secret key.
    pub fn from_hex(private_hex: &str, public_hex: &str) -> Result<Self, ChainError> {
        let secret_bytes = hex::decode(private_hex)
            .map_err(|e| ChainError::CryptoError(format!("Invalid private key hex: {}", e)))?;
        let secret: [u8; 32] = secret_bytes.try_into().map_err(|_| {
            ChainError::CryptoError("Private key must be 32 bytes".to_string())
        })?;

        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();

        if hex::encode(verifying_key.to_bytes()) != public_hex.to_lowercase() {
            return Err(ChainError::CryptoError(
                "Public key does not match the private key".to_string(),
            ));
        }

        Ok(KeyPair {
            signing_key,
            verifying_key,
        })
    }

    /// The node-visible address derived from this keypair's public key.
    pub fn address(&self) -> String {
        address_from_public_key(&self.verifying_key.to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.to_bytes())
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Signs a message and returns the 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Verifies an Ed25519 signature given the hex-encoded public key.
pub fn verify_signature(
    public_key_hex: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<(), ChainError> {
    let key_bytes = hex::decode(public_key_hex)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key hex: {}", e)))?;
    let key_array: [u8; 32] = key_bytes.try_into().map_err(|_| {
        ChainError::CryptoError("Public key must be 32 bytes".to_string())
    })?;

    let verifying_key = VerifyingKey::from_bytes(&key_array)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;

    let signature = Signature::from_slice(signature)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    verifying_key
        .verify(message, &signature)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}
