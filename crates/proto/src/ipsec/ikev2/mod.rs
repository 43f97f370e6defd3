//! IKEv2 wire format (RFC 7296)
//!
//! 1. **IKE_SA_INIT**: negotiate algorithms, exchange nonces
//! 2. **IKE_AUTH**: authenticate peers and create the first Child SA
//! 3. **CREATE_CHILD_SA**: create additional Child SAs or rekey
//! 4. **INFORMATIONAL**: deletes and notifications

pub mod constants;
pub mod id;
pub mod message;
pub mod payload;
pub mod proposal;
pub mod state;

pub use constants::*;
pub use id::{IdPayload, IdTemplate, IdType, Identity};
pub use message::{IkeHeader, IkeMessage};
pub use payload::*;
pub use proposal::*;
pub use state::{IkeSaState, StateMachine};
