//! Peer policy and local configuration
//!
//! [`PolicyStore`] is the single authority on which [`PeerConfiguration`]
//! applies to a peer address, and on general engine settings. It is owned
//! by the engine context rather than being a process global, so tests can
//! run isolated stores side by side.

use crate::ipsec::child_sa::{IpsecMode, IpsecProtocol, SaLifetime};
use crate::ipsec::crypto::PrfAlgorithm;
use crate::ipsec::ikev2::id::{IdTemplate, Identity};
use crate::ipsec::ikev2::payload::AuthMethod;
use crate::ipsec::ikev2::proposal::{
    EncrTransformId, IntegTransformId, Proposal, ProtocolId, Transform,
};
use crate::ipsec::{Error, Result};
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Proposal numbers are one octet
const MAX_PROPOSALS: usize = u8::MAX as usize;

/// Local role in an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// We start the exchange
    Initiator,
    /// The peer starts the exchange
    Responder,
    /// Either; valid on a policy entry, never as a lookup key
    #[default]
    Any,
}

impl Role {
    /// Whether a policy entry with role `self` applies to lookup role `key`
    fn covers(self, key: Role) -> bool {
        self == Role::Any || self == key
    }
}

/// Retransmission and rekey timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaTimers {
    /// Initial retransmission timeout
    pub retransmit_timeout: Duration,
    /// Retransmissions before giving up
    pub retransmit_count: u32,
    /// IKE SA rekey interval
    pub ike_rekey: Duration,
    /// Idle time before a liveness check
    pub idle_timeout: Duration,
}

impl Default for SaTimers {
    fn default() -> Self {
        SaTimers {
            retransmit_timeout: Duration::from_secs(2),
            retransmit_count: 5,
            ike_rekey: Duration::from_secs(4 * 3600),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// How the peer proves its identity
#[derive(Clone)]
pub enum Authenticator {
    /// Pre-shared key (AUTH method 2)
    PreSharedKey(Zeroizing<Vec<u8>>),
    /// Delegated to the AAA server of the policy
    Aaa,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authenticator::PreSharedKey(_) => f.write_str("PreSharedKey(<redacted>)"),
            Authenticator::Aaa => f.write_str("Aaa"),
        }
    }
}

impl Authenticator {
    /// Pre-shared key authenticator
    pub fn psk(secret: &[u8]) -> Self {
        Authenticator::PreSharedKey(Zeroizing::new(secret.to_vec()))
    }

    /// AUTH payload method this authenticator expects
    pub fn method(&self) -> Option<AuthMethod> {
        match self {
            Authenticator::PreSharedKey(_) => Some(AuthMethod::SharedKeyMic),
            Authenticator::Aaa => None,
        }
    }

    /// Expected AUTH data over `signed_octets`
    pub fn expected_auth(&self, prf: PrfAlgorithm, signed_octets: &[u8]) -> Result<Vec<u8>> {
        match self {
            Authenticator::PreSharedKey(secret) => Ok(prf.psk_auth(secret, signed_octets)),
            Authenticator::Aaa => Err(Error::AuthenticationFailed(
                "authentication delegated to AAA".to_string(),
            )),
        }
    }

    /// Verify received AUTH data in constant time
    pub fn verify(&self, prf: PrfAlgorithm, signed_octets: &[u8], received: &[u8]) -> Result<()> {
        let expected = self.expected_auth(prf, signed_octets)?;
        if bool::from(expected.ct_eq(received)) {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed("AUTH payload mismatch".to_string()))
        }
    }
}

/// AAA server parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AaaParameters {
    /// Server host name or address
    pub server: String,
    /// Server port
    pub port: u16,
    /// NAS identifier sent to the server
    #[serde(default)]
    pub nas_identifier: Option<String>,
}

/// IKE SA policy
#[derive(Debug, Clone)]
pub struct IkeSaConfiguration {
    /// Acceptable IKE SA proposals
    pub proposals: Vec<Proposal>,
    /// Local identity
    pub my_id: Identity,
    /// Identities the peer may claim
    pub allowed_ids: Vec<IdTemplate>,
    /// Retransmission and rekey timers
    pub timers: SaTimers,
    /// Peer authentication
    pub authenticator: Authenticator,
    /// Optional AAA backend
    pub aaa: Option<AaaParameters>,
    /// Lifetime of Child SAs created under this policy
    pub child_lifetime: SaLifetime,
    /// Acceptable Child SA proposals; empty means AES-CBC-128 with
    /// HMAC-SHA2-256-128
    pub child_proposals: Vec<Proposal>,
    /// Encapsulation mode of Child SAs
    pub child_mode: IpsecMode,
}

impl IkeSaConfiguration {
    /// Create a policy with default timers and no allowed identities
    pub fn new(my_id: Identity, authenticator: Authenticator) -> Self {
        IkeSaConfiguration {
            proposals: Vec::new(),
            my_id,
            allowed_ids: Vec::new(),
            timers: SaTimers::default(),
            authenticator,
            aaa: None,
            child_lifetime: SaLifetime::default(),
            child_proposals: Vec::new(),
            child_mode: IpsecMode::Tunnel,
        }
    }

    /// Add an acceptable proposal
    pub fn with_proposal(mut self, proposal: Proposal) -> Self {
        self.proposals.push(proposal);
        self
    }

    /// Allow identities matching `template`
    pub fn allow_id(mut self, template: IdTemplate) -> Self {
        self.allowed_ids.push(template);
        self
    }

    /// Set timers
    pub fn with_timers(mut self, timers: SaTimers) -> Self {
        self.timers = timers;
        self
    }

    /// Set AAA parameters
    pub fn with_aaa(mut self, aaa: AaaParameters) -> Self {
        self.aaa = Some(aaa);
        self
    }

    /// Set Child SA lifetime
    pub fn with_child_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.child_lifetime = lifetime;
        self
    }

    /// Add an acceptable Child SA proposal
    pub fn with_child_proposal(mut self, proposal: Proposal) -> Self {
        self.child_proposals.push(proposal);
        self
    }

    /// Child SA proposals for `protocol`, numbered from 1
    pub fn child_proposals_for(&self, protocol: IpsecProtocol) -> Vec<Proposal> {
        let protocol_id = protocol.protocol_id();
        let mut proposals: Vec<Proposal> = self
            .child_proposals
            .iter()
            .filter(|p| p.protocol_id == protocol_id)
            .cloned()
            .collect();

        if proposals.is_empty() {
            let mut default = Proposal::new(1, protocol_id);
            if protocol == IpsecProtocol::Esp {
                default = default.add_transform(Transform::encr_with_key_len(
                    EncrTransformId::AesCbc,
                    128,
                ));
            }
            proposals.push(default.add_transform(Transform::integ(IntegTransformId::HmacSha256_128)));
        }

        proposals.truncate(MAX_PROPOSALS);
        for (proposal, num) in proposals.iter_mut().zip(1..=u8::MAX) {
            proposal.proposal_num = num;
        }
        proposals
    }

    /// True iff `id` matches at least one allowed template
    pub fn check_id(&self, id: &Identity) -> bool {
        self.allowed_ids.iter().any(|template| template.matches(id))
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.proposals.is_empty() {
            return Err(Error::Config("IKE SA policy has no proposals".to_string()));
        }
        if self.proposals.len() > MAX_PROPOSALS || self.child_proposals.len() > MAX_PROPOSALS {
            return Err(Error::Config(format!(
                "More than {} proposals in one SA payload",
                MAX_PROPOSALS
            )));
        }
        if let Some(bad) = self
            .proposals
            .iter()
            .find(|p| p.protocol_id != ProtocolId::Ike || !p.is_complete())
        {
            return Err(Error::Config(format!(
                "IKE proposal {} lacks a required transform type",
                bad.proposal_num
            )));
        }
        if let Some(bad) = self
            .child_proposals
            .iter()
            .find(|p| p.protocol_id == ProtocolId::Ike || !p.is_complete())
        {
            return Err(Error::Config(format!(
                "Child SA proposal {} lacks a required transform type",
                bad.proposal_num
            )));
        }
        if self.allowed_ids.is_empty() {
            return Err(Error::Config(
                "IKE SA policy allows no peer identities".to_string(),
            ));
        }
        if matches!(self.authenticator, Authenticator::Aaa) && self.aaa.is_none() {
            return Err(Error::Config(
                "AAA authentication requires AAA parameters".to_string(),
            ));
        }
        if let Authenticator::PreSharedKey(secret) = &self.authenticator {
            if secret.is_empty() {
                return Err(Error::Config("Empty pre-shared key".to_string()));
            }
        }
        Ok(())
    }
}

/// Policy for the peers inside a set of prefixes
#[derive(Debug, Clone)]
pub struct PeerConfiguration {
    /// Address prefixes this policy covers
    pub prefixes: Vec<IpNet>,
    /// Local role this policy applies to
    pub role: Role,
    /// IKE SA policy
    pub ike_sa_config: IkeSaConfiguration,
}

impl PeerConfiguration {
    /// Policy for one prefix
    pub fn new(prefix: IpNet, role: Role, ike_sa_config: IkeSaConfiguration) -> Self {
        PeerConfiguration {
            prefixes: vec![prefix],
            role,
            ike_sa_config,
        }
    }

    /// Cover another prefix
    pub fn with_prefix(mut self, prefix: IpNet) -> Self {
        self.prefixes.push(prefix);
        self
    }

    /// Longest covering prefix length for `addr`
    fn best_match(&self, addr: &IpAddr) -> Option<u8> {
        self.prefixes
            .iter()
            .filter(|net| net.contains(addr))
            .map(IpNet::prefix_len)
            .max()
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.prefixes.is_empty() {
            return Err(Error::Config("Peer policy covers no prefixes".to_string()));
        }
        self.ike_sa_config.validate()
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfiguration {
    /// Half-open IKE SA count at which cookies are demanded
    pub cookie_threshold: u32,
    /// Half-open IKE SA count at which new requests are refused; 0 = no limit
    pub max_half_open: u32,
    /// Role given to peer policies that do not name one
    pub default_role: Role,
}

impl Default for GeneralConfiguration {
    fn default() -> Self {
        GeneralConfiguration {
            cookie_threshold: 20,
            max_half_open: 1000,
            default_role: Role::Any,
        }
    }
}

impl GeneralConfiguration {
    /// Set the cookie threshold
    pub fn with_cookie_threshold(mut self, threshold: u32) -> Self {
        self.cookie_threshold = threshold;
        self
    }

    /// Set the half-open limit
    pub fn with_max_half_open(mut self, limit: u32) -> Self {
        self.max_half_open = limit;
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_half_open != 0 && self.cookie_threshold > self.max_half_open {
            return Err(Error::Config(format!(
                "cookie_threshold {} above max_half_open {}",
                self.cookie_threshold, self.max_half_open
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Policies {
    general: GeneralConfiguration,
    peers: Vec<PeerConfiguration>,
}

/// Authoritative store of general settings and peer policies
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: RwLock<Policies>,
}

impl PolicyStore {
    /// Create a store with no peer policies
    pub fn new(general: GeneralConfiguration) -> Self {
        PolicyStore {
            policies: RwLock::new(Policies {
                general,
                peers: Vec::new(),
            }),
        }
    }

    /// General settings
    pub fn general(&self) -> GeneralConfiguration {
        self.policies.read().general
    }

    /// Replace general settings
    pub fn set_general(&self, general: GeneralConfiguration) -> Result<()> {
        general.validate()?;
        self.policies.write().general = general;
        Ok(())
    }

    /// Copy of the policy covering `addr` for local role `role`
    ///
    /// The longest matching prefix wins; among equal prefixes the policy
    /// added first wins.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRole`] for `Role::Any`, [`Error::NoPeerConfiguration`]
    /// when nothing covers the address.
    pub fn get_peer_configuration(&self, addr: IpAddr, role: Role) -> Result<PeerConfiguration> {
        if role == Role::Any {
            return Err(Error::InvalidRole);
        }

        let policies = self.policies.read();
        let mut best: Option<(u8, &PeerConfiguration)> = None;
        for peer in policies.peers.iter().filter(|p| p.role.covers(role)) {
            if let Some(len) = peer.best_match(&addr) {
                if best.map_or(true, |(best_len, _)| len > best_len) {
                    best = Some((len, peer));
                }
            }
        }

        best.map(|(_, peer)| peer.clone())
            .ok_or_else(|| Error::NoPeerConfiguration(addr.to_string()))
    }

    /// Add a peer policy
    pub fn add_peer_configuration(&self, peer: PeerConfiguration) -> Result<()> {
        peer.validate()?;
        self.policies.write().peers.push(peer);
        Ok(())
    }

    /// Remove `prefix` from every policy covering exactly it.
    ///
    /// A policy left without prefixes is dropped. Returns whether anything
    /// was removed.
    pub fn delete_peer_configuration(&self, prefix: &IpNet) -> bool {
        let mut policies = self.policies.write();
        let mut removed = false;
        for peer in policies.peers.iter_mut() {
            let before = peer.prefixes.len();
            peer.prefixes.retain(|p| p != prefix);
            removed |= peer.prefixes.len() != before;
        }
        policies.peers.retain(|peer| !peer.prefixes.is_empty());
        removed
    }

    /// Number of peer policies
    pub fn peer_count(&self) -> usize {
        self.policies.read().peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::id::IdType;
    use crate::ipsec::ikev2::proposal::{DhTransformId, PrfTransformId, TransformType};

    fn ike_proposal() -> Proposal {
        Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128))
            .add_transform(Transform::prf(PrfTransformId::HmacSha256))
            .add_transform(Transform::integ(IntegTransformId::HmacSha256_128))
            .add_transform(Transform::dh(DhTransformId::Group14))
    }

    fn ike_config(name: &str) -> IkeSaConfiguration {
        IkeSaConfiguration::new(Identity::fqdn(name), Authenticator::psk(b"secret"))
            .with_proposal(ike_proposal())
            .allow_id(IdTemplate::wildcard(IdType::Fqdn, "*.example.com").unwrap())
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_role_any_rejected() {
        let store = PolicyStore::default();
        store
            .add_peer_configuration(PeerConfiguration::new(
                net("0.0.0.0/0"),
                Role::Any,
                ike_config("a"),
            ))
            .unwrap();

        assert!(matches!(
            store.get_peer_configuration(addr("10.0.0.1"), Role::Any),
            Err(Error::InvalidRole)
        ));
        assert!(store
            .get_peer_configuration(addr("10.0.0.1"), Role::Responder)
            .is_ok());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let store = PolicyStore::default();
        store
            .add_peer_configuration(PeerConfiguration::new(
                net("10.0.0.0/8"),
                Role::Any,
                ike_config("wide"),
            ))
            .unwrap();
        store
            .add_peer_configuration(PeerConfiguration::new(
                net("10.1.0.0/16"),
                Role::Responder,
                ike_config("narrow"),
            ))
            .unwrap();

        let hit = store
            .get_peer_configuration(addr("10.1.2.3"), Role::Responder)
            .unwrap();
        assert_eq!(hit.ike_sa_config.my_id, Identity::fqdn("narrow"));

        // Narrow entry is responder-only
        let hit = store
            .get_peer_configuration(addr("10.1.2.3"), Role::Initiator)
            .unwrap();
        assert_eq!(hit.ike_sa_config.my_id, Identity::fqdn("wide"));

        assert!(matches!(
            store.get_peer_configuration(addr("192.0.2.1"), Role::Initiator),
            Err(Error::NoPeerConfiguration(_))
        ));
    }

    #[test]
    fn test_lookup_returns_copy() {
        let store = PolicyStore::default();
        store
            .add_peer_configuration(PeerConfiguration::new(
                net("10.0.0.0/8"),
                Role::Any,
                ike_config("a"),
            ))
            .unwrap();

        let mut copy = store
            .get_peer_configuration(addr("10.0.0.1"), Role::Initiator)
            .unwrap();
        copy.ike_sa_config.allowed_ids.clear();

        let fresh = store
            .get_peer_configuration(addr("10.0.0.1"), Role::Initiator)
            .unwrap();
        assert_eq!(fresh.ike_sa_config.allowed_ids.len(), 1);
    }

    #[test]
    fn test_delete_prefix() {
        let store = PolicyStore::default();
        store
            .add_peer_configuration(
                PeerConfiguration::new(net("10.0.0.0/8"), Role::Any, ike_config("a"))
                    .with_prefix(net("172.16.0.0/12")),
            )
            .unwrap();

        assert!(store.delete_peer_configuration(&net("10.0.0.0/8")));
        assert_eq!(store.peer_count(), 1);
        assert!(store
            .get_peer_configuration(addr("10.0.0.1"), Role::Initiator)
            .is_err());
        assert!(store
            .get_peer_configuration(addr("172.16.0.1"), Role::Initiator)
            .is_ok());

        assert!(store.delete_peer_configuration(&net("172.16.0.0/12")));
        assert_eq!(store.peer_count(), 0);
        assert!(!store.delete_peer_configuration(&net("172.16.0.0/12")));
    }

    #[test]
    fn test_check_id() {
        let config = ike_config("gw");
        assert!(config.check_id(&Identity::fqdn("client.example.com")));
        assert!(!config.check_id(&Identity::fqdn("client.example.org")));
        assert!(!config.check_id(&Identity::key_id(b"client")));
    }

    #[test]
    fn test_validation() {
        let no_proposals =
            IkeSaConfiguration::new(Identity::fqdn("gw"), Authenticator::psk(b"k"))
                .allow_id(IdTemplate::Any);
        assert!(matches!(no_proposals.validate(), Err(Error::Config(_))));

        let aaa_without_params = ike_config("gw");
        let aaa_without_params = IkeSaConfiguration {
            authenticator: Authenticator::Aaa,
            ..aaa_without_params
        };
        assert!(aaa_without_params.validate().is_err());

        assert!(ike_config("gw").validate().is_ok());

        let mut no_dh = ike_proposal();
        no_dh.transforms.retain(|t| t.transform_type != TransformType::Dh);
        let partial = IkeSaConfiguration {
            proposals: vec![no_dh],
            ..ike_config("gw")
        };
        assert!(matches!(partial.validate(), Err(Error::Config(_))));

        let encr_only_child = ike_config("gw").with_child_proposal(
            Proposal::new(1, ProtocolId::Esp)
                .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128)),
        );
        assert!(matches!(encr_only_child.validate(), Err(Error::Config(_))));

        let too_many = IkeSaConfiguration {
            proposals: vec![ike_proposal(); 256],
            ..ike_config("gw")
        };
        assert!(matches!(too_many.validate(), Err(Error::Config(_))));

        let store = PolicyStore::default();
        assert!(store
            .set_general(GeneralConfiguration::default().with_cookie_threshold(5000))
            .is_err());
        assert_eq!(store.general().cookie_threshold, 20);
    }

    #[test]
    fn test_default_child_proposals() {
        let config = ike_config("gw");
        let esp = config.child_proposals_for(IpsecProtocol::Esp);
        assert_eq!(esp.len(), 1);
        assert_eq!(esp[0].protocol_id, ProtocolId::Esp);
        assert_eq!(esp[0].transforms.len(), 2);

        let ah = config.child_proposals_for(IpsecProtocol::Ah);
        assert_eq!(ah[0].protocol_id, ProtocolId::Ah);
        assert_eq!(ah[0].transforms.len(), 1);

        let custom = config.with_child_proposal(
            Proposal::new(7, ProtocolId::Esp)
                .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 256))
                .add_transform(Transform::integ(IntegTransformId::HmacSha512_256)),
        );
        let esp = custom.child_proposals_for(IpsecProtocol::Esp);
        assert_eq!(esp[0].proposal_num, 1);
        assert_eq!(esp[0].transforms[0].key_length(), Some(256));
    }

    #[test]
    fn test_psk_verify() {
        let auth = Authenticator::psk(b"secret");
        let prf = PrfAlgorithm::HmacSha256;
        let good = auth.expected_auth(prf, b"octets").unwrap();

        assert!(auth.verify(prf, b"octets", &good).is_ok());
        assert!(matches!(
            auth.verify(prf, b"octets", &[0u8; 32]),
            Err(Error::AuthenticationFailed(_))
        ));
        assert_eq!(format!("{:?}", auth), "PreSharedKey(<redacted>)");
    }
}
