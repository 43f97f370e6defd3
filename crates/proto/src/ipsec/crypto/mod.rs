//! Cryptographic providers for IKE SAs
//!
//! - [`prf`]: PRF and prf+ key expansion, key material and PSK AUTH values
//! - [`cipher`]: the [`CipherSuite`] capability and its AES-CBC/HMAC-SHA2
//!   implementation

pub mod cipher;
pub mod prf;

pub use cipher::{cipher_suite_for, CbcHmacSuite, CipherSuite, SuiteKeys};
pub use prf::{KeyMaterial, PrfAlgorithm};
