//! Engine configuration file
//!
//! JSON description of the general settings and peer policies, turned into
//! a populated [`PolicyStore`]. Algorithms are named rather than numbered:
//!
//! ```json
//! {
//!   "general": { "cookie_threshold": 20, "max_half_open": 1000 },
//!   "peers": [{
//!     "prefixes": ["198.51.100.0/24"],
//!     "role": "responder",
//!     "local_id": { "id_type": "fqdn", "value": "gw.example" },
//!     "allowed_ids": [{ "kind": "suffix", "id_type": "fqdn", "suffix": ".example" }],
//!     "psk": "secret",
//!     "proposals": [{ "encryption": "aes-cbc", "key_bits": 128, "prf": "hmac-sha256",
//!                     "integrity": "hmac-sha256-128", "dh": "group14" }]
//!   }]
//! }
//! ```

use super::{
    child_sa::{IpsecMode, SaLifetime},
    ikev2::id::{IdTemplate, IdType, Identity},
    ikev2::proposal::{
        DhTransformId, EncrTransformId, IntegTransformId, PrfTransformId, Proposal, ProtocolId,
        Transform,
    },
    policy::{
        AaaParameters, Authenticator, GeneralConfiguration, IkeSaConfiguration, PeerConfiguration,
        PolicyStore, Role, SaTimers,
    },
    Error, Result,
};
use ike_platform::config::{load_json_file, load_json_str};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use zeroize::Zeroizing;

/// Top-level configuration document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfiguration,

    /// Peer policies, in insertion order
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// One peer policy
#[derive(Clone, Deserialize)]
pub struct PeerConfig {
    /// Covered address prefixes
    pub prefixes: Vec<IpNet>,

    /// Local role; the general default role when absent
    #[serde(default)]
    pub role: Option<Role>,

    /// Local identity
    pub local_id: IdConfig,

    /// Identities the peer may claim
    pub allowed_ids: Vec<IdTemplate>,

    /// Pre-shared key; AAA authentication when absent
    #[serde(default)]
    pub psk: Option<String>,

    /// AAA server
    #[serde(default)]
    pub aaa: Option<AaaParameters>,

    /// IKE SA proposals
    pub proposals: Vec<ProposalConfig>,

    /// ESP Child SA proposals; the built-in default when empty
    #[serde(default)]
    pub child_proposals: Vec<ProposalConfig>,

    /// Child SA encapsulation mode
    #[serde(default = "default_mode")]
    pub child_mode: IpsecMode,

    /// Timers
    #[serde(default)]
    pub timers: TimersConfig,

    /// Child SA lifetime
    #[serde(default)]
    pub child_lifetime: Option<LifetimeConfig>,
}

impl std::fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConfig")
            .field("prefixes", &self.prefixes)
            .field("role", &self.role)
            .field("local_id", &self.local_id)
            .field("psk", &self.psk.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

fn default_mode() -> IpsecMode {
    IpsecMode::Tunnel
}

/// Identity in textual form
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdConfig {
    /// Identity type
    pub id_type: IdType,
    /// Name, address, or hex for binary types
    pub value: String,
}

impl IdConfig {
    /// Build the wire identity
    pub fn to_identity(&self) -> Result<Identity> {
        match self.id_type {
            IdType::Ipv4Addr | IdType::Ipv6Addr => {
                let addr: IpAddr = self.value.parse().map_err(|_| {
                    Error::Config(format!("Invalid address identity: {}", self.value))
                })?;
                let id = Identity::from_ip(addr);
                if id.id_type != self.id_type {
                    return Err(Error::Config(format!(
                        "Address {} does not match identity type {:?}",
                        self.value, self.id_type
                    )));
                }
                Ok(id)
            }
            id_type if id_type.is_textual() => {
                Ok(Identity::new(id_type, self.value.as_bytes().to_vec()))
            }
            id_type => {
                let data = hex::decode(&self.value).map_err(|e| {
                    Error::Config(format!("Invalid hex identity {}: {}", self.value, e))
                })?;
                Ok(Identity::new(id_type, data))
            }
        }
    }
}

/// Named algorithms of one proposal
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProposalConfig {
    /// `aes-cbc`, `aes-ctr`, `aes-gcm16` or `chacha20-poly1305`
    pub encryption: String,
    /// Key length for variable-length ciphers
    #[serde(default)]
    pub key_bits: Option<u16>,
    /// `hmac-sha256`, `hmac-sha384` or `hmac-sha512`
    #[serde(default)]
    pub prf: Option<String>,
    /// `hmac-sha256-128`, `hmac-sha384-192` or `hmac-sha512-256`
    #[serde(default)]
    pub integrity: Option<String>,
    /// `group14`, `group15`, `group19` or `group31`
    #[serde(default)]
    pub dh: Option<String>,
}

impl ProposalConfig {
    /// Build a proposal numbered `num` for `protocol`
    pub fn to_proposal(&self, num: u8, protocol: ProtocolId) -> Result<Proposal> {
        let encr = match self.encryption.as_str() {
            "aes-cbc" => EncrTransformId::AesCbc,
            "aes-ctr" => EncrTransformId::AesCtr,
            "aes-gcm16" => EncrTransformId::AesGcm16,
            "chacha20-poly1305" => EncrTransformId::ChaCha20Poly1305,
            other => return Err(unknown("encryption", other)),
        };
        let encr = match self.key_bits {
            Some(bits) => Transform::encr_with_key_len(encr, bits),
            None => Transform::encr(encr),
        };
        let mut proposal = Proposal::new(num, protocol).add_transform(encr);

        if let Some(prf) = &self.prf {
            let prf = match prf.as_str() {
                "hmac-sha256" => PrfTransformId::HmacSha256,
                "hmac-sha384" => PrfTransformId::HmacSha384,
                "hmac-sha512" => PrfTransformId::HmacSha512,
                other => return Err(unknown("prf", other)),
            };
            proposal = proposal.add_transform(Transform::prf(prf));
        }
        if let Some(integ) = &self.integrity {
            let integ = match integ.as_str() {
                "hmac-sha256-128" => IntegTransformId::HmacSha256_128,
                "hmac-sha384-192" => IntegTransformId::HmacSha384_192,
                "hmac-sha512-256" => IntegTransformId::HmacSha512_256,
                other => return Err(unknown("integrity", other)),
            };
            proposal = proposal.add_transform(Transform::integ(integ));
        }
        if let Some(dh) = &self.dh {
            let dh = match dh.as_str() {
                "group14" => DhTransformId::Group14,
                "group15" => DhTransformId::Group15,
                "group19" => DhTransformId::Group19,
                "group31" => DhTransformId::Group31,
                other => return Err(unknown("dh", other)),
            };
            proposal = proposal.add_transform(Transform::dh(dh));
        }
        Ok(proposal)
    }
}

fn unknown(kind: &str, name: &str) -> Error {
    Error::Config(format!("Unknown {} algorithm: {}", kind, name))
}

/// Timers in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    /// Initial retransmission timeout
    pub retransmit_timeout_secs: u64,
    /// Retransmissions before giving up
    pub retransmit_count: u32,
    /// IKE SA rekey interval
    pub ike_rekey_secs: u64,
    /// Idle time before a liveness check
    pub idle_timeout_secs: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        let timers = SaTimers::default();
        TimersConfig {
            retransmit_timeout_secs: timers.retransmit_timeout.as_secs(),
            retransmit_count: timers.retransmit_count,
            ike_rekey_secs: timers.ike_rekey.as_secs(),
            idle_timeout_secs: timers.idle_timeout.as_secs(),
        }
    }
}

impl From<TimersConfig> for SaTimers {
    fn from(config: TimersConfig) -> Self {
        SaTimers {
            retransmit_timeout: Duration::from_secs(config.retransmit_timeout_secs),
            retransmit_count: config.retransmit_count,
            ike_rekey: Duration::from_secs(config.ike_rekey_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

/// Child SA lifetime in seconds and bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LifetimeConfig {
    /// Rekey after
    pub soft_secs: u64,
    /// Delete after
    pub hard_secs: u64,
    /// Byte limits (soft, hard)
    #[serde(default)]
    pub bytes: Option<(u64, u64)>,
}

impl LifetimeConfig {
    fn to_lifetime(self) -> Result<SaLifetime> {
        let lifetime = SaLifetime::new(
            Duration::from_secs(self.soft_secs),
            Duration::from_secs(self.hard_secs),
        )?;
        match self.bytes {
            Some((soft, hard)) => lifetime.with_byte_limits(soft, hard),
            None => Ok(lifetime),
        }
    }
}

impl PeerConfig {
    /// Build the policy entry; `default_role` fills a missing role
    pub fn to_peer_configuration(&self, default_role: Role) -> Result<PeerConfiguration> {
        let (first, rest) = self
            .prefixes
            .split_first()
            .ok_or_else(|| Error::Config("Peer policy covers no prefixes".to_string()))?;

        let authenticator = match &self.psk {
            Some(psk) => Authenticator::PreSharedKey(Zeroizing::new(psk.as_bytes().to_vec())),
            None => Authenticator::Aaa,
        };

        let mut ike = IkeSaConfiguration::new(self.local_id.to_identity()?, authenticator)
            .with_timers(self.timers.into());
        ike.child_mode = self.child_mode;
        for (i, proposal) in self.proposals.iter().enumerate() {
            ike = ike.with_proposal(proposal.to_proposal(proposal_num(i)?, ProtocolId::Ike)?);
        }
        for (i, proposal) in self.child_proposals.iter().enumerate() {
            ike = ike.with_child_proposal(proposal.to_proposal(proposal_num(i)?, ProtocolId::Esp)?);
        }
        for template in &self.allowed_ids {
            ike = ike.allow_id(template.clone());
        }
        if let Some(aaa) = &self.aaa {
            ike = ike.with_aaa(aaa.clone());
        }
        if let Some(lifetime) = self.child_lifetime {
            ike = ike.with_child_lifetime(lifetime.to_lifetime()?);
        }

        let peer = rest.iter().fold(
            PeerConfiguration::new(*first, self.role.unwrap_or(default_role), ike),
            |peer, prefix| peer.with_prefix(*prefix),
        );
        peer.validate()?;
        Ok(peer)
    }
}

fn proposal_num(index: usize) -> Result<u8> {
    u8::try_from(index + 1).map_err(|_| Error::Config("Too many proposals".to_string()))
}

impl EngineConfig {
    /// Parse a JSON document
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(load_json_str(text)?)
    }

    /// Read a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(load_json_file(path)?)
    }

    /// Validate and build the policy store
    pub fn into_policy_store(self) -> Result<PolicyStore> {
        self.general.validate()?;
        let store = PolicyStore::new(self.general);
        for peer in &self.peers {
            store.add_peer_configuration(peer.to_peer_configuration(self.general.default_role)?)?;
        }
        info!(peers = store.peer_count(), "Loaded engine configuration");
        Ok(store)
    }
}
