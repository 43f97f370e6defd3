//! IKEv2 engine (RFC 7296)
//!
//! # Architecture
//!
//! ```text
//! inbound datagram
//!   └── ikev2::message (WireCodec)      decode header + payload chain
//!        └── directory::IkeSaDirectory   locate / create IKE SA by SPI,
//!             │                          half-open + cookie admission
//!             └── ike_sa::IkeSa          per-SA command queue
//!                  ├── policy::PolicyStore       authorization
//!                  ├── crypto::CipherSuite       protection
//!                  └── child_sa::ChildSaRegistry Child SA ownership
//! ```
//!
//! Every shared structure (registry, directory table, policy store) is
//! guarded by its own lock, and no lock is held while another component's
//! locked operation or a cryptographic call runs.
//!
//! # Quick Start
//!
//! ```rust
//! use ike_proto::ipsec::{
//!     context::EngineContext,
//!     ike_sa::{ChildSaRequest, IpsecMode, IpsecProtocol},
//!     ikev2::{
//!         DhTransformId, EncrTransformId, IdTemplate, Identity, IntegTransformId, PrfTransformId,
//!         Proposal, ProtocolId, Transform,
//!     },
//!     policy::{Authenticator, GeneralConfiguration, IkeSaConfiguration, PeerConfiguration, Role},
//! };
//!
//! let ctx = EngineContext::new(GeneralConfiguration::default());
//! ctx.policy()
//!     .add_peer_configuration(PeerConfiguration::new(
//!         "198.51.100.0/24".parse().unwrap(),
//!         Role::Initiator,
//!         IkeSaConfiguration::new(Identity::fqdn("gw.example"), Authenticator::psk(b"secret"))
//!             .with_proposal(
//!                 Proposal::new(1, ProtocolId::Ike)
//!                     .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 256))
//!                     .add_transform(Transform::prf(PrfTransformId::HmacSha256))
//!                     .add_transform(Transform::integ(IntegTransformId::HmacSha256_128))
//!                     .add_transform(Transform::dh(DhTransformId::Group14)),
//!             )
//!             .allow_id(IdTemplate::Any),
//!     ))
//!     .unwrap();
//!
//! let spi = ctx
//!     .request_child_sa(
//!         "192.0.2.1".parse().unwrap(),
//!         "198.51.100.7".parse().unwrap(),
//!         ChildSaRequest::new(IpsecProtocol::Esp, IpsecMode::Tunnel),
//!     )
//!     .unwrap();
//!
//! // The IKE_SA_INIT request is produced when the SA's queue runs
//! let outbound = ctx.run_ike_sa(spi);
//! assert_eq!(outbound.len(), 1);
//! assert!(!ctx.directory().use_cookies());
//! ```
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod child_sa;
pub mod config;
pub mod context;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod ike_sa;
pub mod ikev2;
pub mod logging;
pub mod metrics;
pub mod policy;

// Re-export commonly used types
pub use child_sa::{ChildSa, ChildSaRegistry, ChildSaState};
pub use context::EngineContext;
pub use directory::{DispatchOutcome, IkeSaDirectory};
pub use error::{Error, Result};
pub use ike_sa::{Command, IkeSa};
pub use policy::{IkeSaConfiguration, PeerConfiguration, PolicyStore, Role};
