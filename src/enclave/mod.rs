// Canopy — Enclave Module
//
// Key custody and field encryption. The master secret lives in the OS
// keyring; Argon2id turns it into the field key, and `FieldCipher`
// encrypts every opaque column (item names, colors, message stamps and
// bodies) bound to the id of the row that owns it.

mod cipher;
mod error;
mod provider;

pub use cipher::{FieldCipher, VaultCipher, FIELD_KEY_LEN};
pub use error::EnclaveError;
pub use provider::{KeyringProvider, VaultKeyProvider};
