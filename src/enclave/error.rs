// Canopy — Enclave error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnclaveError {
    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Key derivation error: {0}")]
    Derivation(String),

    #[error("Master secret not found — run `canopy init` first")]
    MasterSecretNotFound,

    #[error("Entropy error: generated secret has insufficient entropy ({0} bytes, expected {1})")]
    InsufficientEntropy(usize, usize),

    #[error("Encryption failed for owner {0}")]
    Encrypt(uuid::Uuid),

    #[error("Decryption failed for owner {0} — wrong key or corrupted blob")]
    Decrypt(uuid::Uuid),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}
