// Canopy — Vault Key Provider
//
// Custody of the master secret and derivation of the field key.
//
// Flow:
//   1. `get_or_create_master_secret()` — keyring lookup, or generate + store on first run
//   2. `derive_field_key()` — Argon2id turns the master secret into the 32-byte field key
//   3. `unlock()` — wraps both and hands back a ready `VaultCipher`

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::cipher::{VaultCipher, FIELD_KEY_LEN};
use super::EnclaveError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Service name used to identify Canopy entries in the platform keyring.
const KEYRING_SERVICE: &str = "canopy-vault";

/// Username for the keyring entry (identifies the master secret).
const KEYRING_USER: &str = "master-secret";

/// Length of the randomly generated master secret in bytes.
const MASTER_SECRET_LEN: usize = 32;

/// Context mixed into the salt so the field key never equals a key derived
/// for another purpose from the same secret.
const FIELD_KEY_CONTEXT: &[u8] = b"field-key-v1";

// m=65536 (64 MiB), t=3, p=4
const ARGON2_M_COST: u32 = 65536;
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 4;

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over master secret custody, so tests never touch the
/// platform keyring.
pub trait VaultKeyProvider {
    /// Retrieve the master secret, generating and storing one on first run.
    fn get_or_create_master_secret(&self) -> Result<Zeroizing<Vec<u8>>, EnclaveError>;

    /// Derive the field key from the master secret using Argon2id.
    fn derive_field_key(
        &self,
        master_secret: &[u8],
    ) -> Result<Zeroizing<[u8; FIELD_KEY_LEN]>, EnclaveError>;

    /// Check if a master secret already exists.
    fn has_master_secret(&self) -> Result<bool, EnclaveError>;

    /// Delete the master secret.
    /// WARNING: every sealed field becomes unreadable.
    fn delete_master_secret(&self) -> Result<(), EnclaveError>;

    /// Derive the field key for an initialized vault and return the cipher.
    fn unlock(&self) -> Result<VaultCipher, EnclaveError> {
        if !self.has_master_secret()? {
            return Err(EnclaveError::MasterSecretNotFound);
        }
        let master = self.get_or_create_master_secret()?;
        let key = self.derive_field_key(&master)?;
        Ok(VaultCipher::new(key))
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy)]
struct KdfCost {
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self {
            m_cost: ARGON2_M_COST,
            t_cost: ARGON2_T_COST,
            p_cost: ARGON2_P_COST,
        }
    }
}

/// Salt = SHA-256(service || "::" || user || "::" || context)
fn build_salt(service: &str, user: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(service.as_bytes());
    hasher.update(b"::");
    hasher.update(user.as_bytes());
    hasher.update(b"::");
    hasher.update(FIELD_KEY_CONTEXT);
    hasher.finalize().to_vec()
}

fn derive(
    master_secret: &[u8],
    salt: &[u8],
    cost: KdfCost,
) -> Result<Zeroizing<[u8; FIELD_KEY_LEN]>, EnclaveError> {
    let params = Params::new(cost.m_cost, cost.t_cost, cost.p_cost, Some(FIELD_KEY_LEN))
        .map_err(|e| EnclaveError::Derivation(format!("invalid Argon2 params: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; FIELD_KEY_LEN]);
    argon2
        .hash_password_into(master_secret, salt, key.as_mut_slice())
        .map_err(|e| EnclaveError::Derivation(format!("Argon2id hash failed: {}", e)))?;
    Ok(key)
}

fn generate_master_secret() -> Result<Zeroizing<Vec<u8>>, EnclaveError> {
    let mut secret = Zeroizing::new(vec![0u8; MASTER_SECRET_LEN]);
    rand::rng().fill_bytes(&mut secret);

    if secret.len() != MASTER_SECRET_LEN {
        return Err(EnclaveError::InsufficientEntropy(
            secret.len(),
            MASTER_SECRET_LEN,
        ));
    }

    Ok(secret)
}

// ─── Platform Implementation ─────────────────────────────────────────────────

/// Production implementation using the `keyring` crate
/// (Keychain on macOS, Credential Manager on Windows, keyutils on Linux).
pub struct KeyringProvider {
    service: String,
    user: String,
}

impl KeyringProvider {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
            user: KEYRING_USER.to_string(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, EnclaveError> {
        keyring::Entry::new(&self.service, &self.user)
            .map_err(|e| EnclaveError::Keyring(format!("failed to create keyring entry: {}", e)))
    }
}

impl Default for KeyringProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VaultKeyProvider for KeyringProvider {
    fn get_or_create_master_secret(&self) -> Result<Zeroizing<Vec<u8>>, EnclaveError> {
        let entry = self.entry()?;

        match entry.get_secret() {
            Ok(secret) => {
                tracing::debug!("Retrieved existing master secret from keyring");
                Ok(Zeroizing::new(secret))
            }
            Err(keyring::Error::NoEntry) => {
                tracing::info!("No master secret found — generating new one");
                let secret = generate_master_secret()?;
                entry.set_secret(&secret).map_err(|e| {
                    EnclaveError::Keyring(format!("failed to store master secret: {}", e))
                })?;
                tracing::info!("Master secret stored in platform keyring");
                Ok(secret)
            }
            Err(e) => Err(EnclaveError::Keyring(format!(
                "failed to retrieve master secret: {}",
                e
            ))),
        }
    }

    fn derive_field_key(
        &self,
        master_secret: &[u8],
    ) -> Result<Zeroizing<[u8; FIELD_KEY_LEN]>, EnclaveError> {
        derive(master_secret, &build_salt(&self.service, &self.user), KdfCost::default())
    }

    fn has_master_secret(&self) -> Result<bool, EnclaveError> {
        let entry = self.entry()?;
        match entry.get_secret() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(EnclaveError::Keyring(format!(
                "failed to check master secret: {}",
                e
            ))),
        }
    }

    fn delete_master_secret(&self) -> Result<(), EnclaveError> {
        let entry = self.entry()?;
        match entry.delete_credential() {
            Ok(()) => {
                tracing::warn!("Master secret deleted from keyring — sealed fields are now unreadable");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => {
                tracing::debug!("No master secret to delete");
                Ok(())
            }
            Err(e) => Err(EnclaveError::Keyring(format!(
                "failed to delete master secret: {}",
                e
            ))),
        }
    }
}

// ─── In-Memory Mock for Testing ──────────────────────────────────────────────


// ─── Tests ───────────────────────────────────────────────────────────────────
