//! IKEv2 protocol engine.
//!
//! This crate negotiates, maintains, rekeys and tears down IKE and Child
//! Security Associations between two peers:
//!
//! - **WireCodec** - binary IKE payload encoding/decoding with strict length checks
//! - **ChildSaRegistry** - dual-indexed (inbound/outbound SPI) Child SA collection
//! - **IkeSaDirectory** - SPI routing, half-open accounting and cookie admission
//! - **PolicyStore** - peer policy lookup and identity authorization
//! - **CipherSuite** - pluggable per-SA cryptography
//!
//! # Features
//!
//! - `ipsec` (default) - the IKEv2 engine
//!
//! # Example
//!
//! ```rust
//! use ike_proto::ipsec::ikev2::id::{IdPayload, IdType, Identity};
//! use ike_proto::ipsec::ikev2::payload::PayloadCodec;
//!
//! let id = Identity::new(IdType::Fqdn, b"host.example".to_vec());
//! let wire = IdPayload::new(id.clone()).to_bytes().unwrap();
//! assert_eq!(&wire[0..2], &20u16.to_be_bytes());
//!
//! let parsed = IdPayload::from_bytes(&wire).unwrap();
//! assert_eq!(parsed.id, id);
//! ```
//!
//! # Security
//!
//! - No unsafe code
//! - Malformed network input surfaces as typed errors, never panics
//! - Key material is zeroized on drop
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ipsec")]
pub mod ipsec;
