// Canopy — Field Cipher
//
// XChaCha20-Poly1305 with a random 24-byte nonce per blob.
// Blob format: [ nonce (24 bytes) | ciphertext + tag ]
//
// Every blob is bound to its owner id through the associated data, so a
// name copied from one item onto another fails to decrypt.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::EnclaveError;

/// Length of the field key in bytes.
pub const FIELD_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 24;
const AAD_DOMAIN: &[u8] = b"canopy-field-v1";
const FINGERPRINT_DOMAIN: &[u8] = b"canopy-fingerprint-v1";

type HmacSha256 = Hmac<Sha256>;

/// Encrypts and decrypts opaque column values on behalf of the store.
///
/// The store never looks at plaintext itself; it asks the cipher to
/// decrypt only where ordering depends on a sealed value (message stamps).
pub trait FieldCipher: Send + Sync {
    /// Seal `plaintext` for the row identified by `owner`.
    fn encrypt(&self, owner: &Uuid, plaintext: &[u8]) -> Result<Vec<u8>, EnclaveError>;

    /// Open a blob previously sealed for `owner`.
    fn decrypt(&self, owner: &Uuid, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, EnclaveError>;

    /// Keyed digest over `parts`, stable across calls. Used for equality
    /// checks on sealed values without storing them in the clear.
    fn fingerprint(&self, owner: &Uuid, parts: &[&[u8]]) -> Result<[u8; 32], EnclaveError>;
}

/// Production cipher holding the derived field key.
pub struct VaultCipher {
    key: Zeroizing<[u8; FIELD_KEY_LEN]>,
    mac_key: Zeroizing<[u8; 32]>,
}

impl VaultCipher {
    pub fn new(key: Zeroizing<[u8; FIELD_KEY_LEN]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(key.as_slice());
        let mut mac_key = Zeroizing::new([0u8; 32]);
        mac_key.copy_from_slice(&hasher.finalize());
        Self { key, mac_key }
    }

    /// Build a cipher from raw bytes, rejecting anything but 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnclaveError> {
        let key: [u8; FIELD_KEY_LEN] = bytes.try_into().map_err(|_| {
            EnclaveError::InvalidKey(format!(
                "field key must be {} bytes, got {}",
                FIELD_KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self::new(Zeroizing::new(key)))
    }

    fn aad(owner: &Uuid) -> Vec<u8> {
        let mut aad = Vec::with_capacity(AAD_DOMAIN.len() + 16);
        aad.extend_from_slice(AAD_DOMAIN);
        aad.extend_from_slice(owner.as_bytes());
        aad
    }

    fn aead(&self) -> Result<XChaCha20Poly1305, EnclaveError> {
        XChaCha20Poly1305::new_from_slice(self.key.as_slice())
            .map_err(|e| EnclaveError::InvalidKey(e.to_string()))
    }
}

impl FieldCipher for VaultCipher {
    fn encrypt(&self, owner: &Uuid, plaintext: &[u8]) -> Result<Vec<u8>, EnclaveError> {
        let cipher = self.aead()?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = Self::aad(owner);

        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|_| EnclaveError::Encrypt(*owner))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, owner: &Uuid, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, EnclaveError> {
        if blob.len() < NONCE_LEN {
            return Err(EnclaveError::Decrypt(*owner));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = self.aead()?;
        let aad = Self::aad(owner);

        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
            .map_err(|_| EnclaveError::Decrypt(*owner))?;

        Ok(Zeroizing::new(plaintext))
    }

    fn fingerprint(&self, owner: &Uuid, parts: &[&[u8]]) -> Result<[u8; 32], EnclaveError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.mac_key.as_slice())
            .map_err(|e| EnclaveError::InvalidKey(e.to_string()))?;
        mac.update(owner.as_bytes());
        // Length-prefix each part so ("ab", "c") and ("a", "bc") differ.
        for part in parts {
            mac.update(&(part.len() as u64).to_le_bytes());
            mac.update(part);
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&mac.finalize().into_bytes());
        Ok(digest)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
