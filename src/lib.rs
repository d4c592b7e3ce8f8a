// Canopy — Library root
//
// Re-exports the enclave (key custody + field cipher), the hierarchical
// store, and the CLI.

pub mod cli;
pub mod enclave;
pub mod error;
pub mod store;

pub use error::{CanopyError, Result};
