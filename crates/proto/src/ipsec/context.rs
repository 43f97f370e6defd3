//! Engine context
//!
//! [`EngineContext`] bundles the pieces every component needs (policy
//! store, SA directory, metrics and the diagnostic sink) and is passed
//! explicitly instead of living in process globals. Independent contexts
//! never share state, which keeps tests isolated.
//!
//! The context does no I/O: [`EngineContext::dispatch_datagram`] takes a
//! received datagram and [`EngineContext::run_ike_sa`] returns the
//! datagrams the caller has to send.

use crate::ipsec::child_sa::ChildSaSnapshot;
use crate::ipsec::directory::{DispatchOutcome, IkeSaDirectory};
use crate::ipsec::ike_sa::{
    ChildSaRequest, Command, IkeSa, InboundMessage, IkeSaSnapshot, MobilityContext,
    OutboundMessage,
};
use crate::ipsec::ikev2::{
    ExchangeType, IkeFlags, IkeHeader, IkeMessage, IkePayload, IkeSaState, NotifyPayload,
};
use crate::ipsec::logging;
use crate::ipsec::metrics::{EngineMetrics, MetricsSnapshot};
use crate::ipsec::policy::{GeneralConfiguration, PolicyStore, Role};
use crate::ipsec::{Error, Result};
use bytes::Bytes;
use ike_platform::{LogSink, TracingSink};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Explicitly constructed engine instance
pub struct EngineContext {
    policy: PolicyStore,
    directory: IkeSaDirectory,
    metrics: EngineMetrics,
    log: Arc<dyn LogSink>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("policy", &self.policy)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Context logging through `tracing`
    pub fn new(general: GeneralConfiguration) -> Self {
        Self::with_log_sink(general, Arc::new(TracingSink))
    }

    /// Context reporting primary events to `log`
    pub fn with_log_sink(general: GeneralConfiguration, log: Arc<dyn LogSink>) -> Self {
        Self::from_policy(PolicyStore::new(general), log)
    }

    /// Context around a populated policy store
    pub fn from_policy(policy: PolicyStore, log: Arc<dyn LogSink>) -> Self {
        let metrics = EngineMetrics::new();
        let directory = IkeSaDirectory::new(
            policy.general().cookie_threshold,
            Arc::clone(&log),
            metrics.clone(),
        );
        EngineContext {
            policy,
            directory,
            metrics,
            log,
        }
    }

    /// Policy store
    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    /// IKE SA directory
    pub fn directory(&self) -> &IkeSaDirectory {
        &self.directory
    }

    /// Metrics handle
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Diagnostic sink
    pub fn log(&self) -> &dyn LogSink {
        self.log.as_ref()
    }

    /// Replace general settings, updating the cookie threshold
    pub fn set_general(&self, general: GeneralConfiguration) -> Result<()> {
        self.policy.set_general(general)?;
        self.directory.set_cookie_threshold(general.cookie_threshold);
        self.log.emit(
            "context",
            &format!(
                "General configuration updated: cookie threshold {}, half-open limit {}",
                general.cookie_threshold, general.max_half_open
            ),
            ike_platform::LogType::CONFIG,
            true,
        );
        Ok(())
    }

    /// Route a received datagram to its IKE SA
    ///
    /// IKE_SA_INIT requests create a responder SA unless the half-open
    /// limit is reached, a cookie is demanded or no policy covers the
    /// sender. Nothing is processed yet; call [`run_ike_sa`](Self::run_ike_sa)
    /// with the returned SPI.
    pub fn dispatch_datagram(&self, datagram: &[u8], source: IpAddr, local: IpAddr) -> DispatchOutcome {
        let message = match IkeMessage::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_parse_failure();
                logging::log_parse_failure(source, datagram.len(), &e.to_string());
                return DispatchOutcome::Dropped(e);
            }
        };

        let header = &message.header;
        let inbound = |message: IkeMessage| {
            Command::Inbound(Box::new(InboundMessage {
                message,
                datagram: Bytes::copy_from_slice(datagram),
                source,
            }))
        };

        if header.exchange_type == ExchangeType::IkeSaInit && message.is_request() && header.spi_r == 0 {
            return self.admit_init(message, datagram, source, local);
        }

        // Our SPI is the initiator SPI when the original initiator is not the sender
        let spi = if header.flags.is_initiator() {
            header.spi_r
        } else {
            header.spi_i
        };

        match self.directory.get_by_ike_sa_spi(spi) {
            Some(sa) => {
                sa.push_command(inbound(message), false);
                self.metrics.record_command(true);
                DispatchOutcome::Queued(spi)
            }
            _ => {
                self.metrics.record_command(false);
                debug!(ike_spi = %format!("{:016x}", spi), %source, "No IKE SA for message");
                DispatchOutcome::Dropped(Error::SaNotFound(format!("IKE SA {:016x}", spi)))
            }
        }
    }

    fn admit_init(&self, message: IkeMessage, datagram: &[u8], source: IpAddr, local: IpAddr) -> DispatchOutcome {
        let spi_i = message.header.spi_i;
        let nonce = match (message.sa(), message.nonce()) {
            (Some(_), Some(nonce)) if message.header.message_id == 0 => nonce.nonce.clone(),
            _ => {
                let e = Error::InvalidMessage(
                    "IKE_SA_INIT request needs SA and nonce payloads and message ID 0".to_string(),
                );
                self.metrics.record_parse_failure();
                logging::log_parse_failure(source, datagram.len(), &e.to_string());
                return DispatchOutcome::Dropped(e);
            }
        };
        let command = Command::Inbound(Box::new(InboundMessage {
            message: message.clone(),
            datagram: Bytes::copy_from_slice(datagram),
            source,
        }));

        // Retransmitted request
        if let Some(sa) = self.directory.find_responder(spi_i, source) {
            sa.push_command(command, false);
            self.metrics.record_command(true);
            return DispatchOutcome::Queued(sa.local_spi());
        }

        let general = self.policy.general();
        if general.max_half_open != 0 && self.directory.half_open_count() >= general.max_half_open {
            self.metrics.record_half_open_refused();
            self.log.emit(
                "directory",
                &format!("Refused IKE_SA_INIT from {}: half-open limit reached", source),
                ike_platform::LogType::ALARM | ike_platform::LogType::HALF_OPEN,
                true,
            );
            return DispatchOutcome::Refused;
        }

        if self.directory.use_cookies() {
            let valid = message
                .cookie()
                .map_or(false, |cookie| self.directory.verify_cookie(cookie, &nonce, source, spi_i));
            if !valid {
                return match self.cookie_challenge(&message, &nonce, source) {
                    Ok(outbound) => {
                        self.metrics.record_cookie_issued();
                        DispatchOutcome::CookieRequired(outbound)
                    }
                    Err(e) => DispatchOutcome::Dropped(e),
                };
            }
            self.metrics.record_cookie_verified();
        }

        let peer_config = match self.policy.get_peer_configuration(source, Role::Responder) {
            Ok(peer_config) => peer_config,
            Err(e) => {
                self.metrics.record_policy_failure();
                logging::log_policy_mismatch(self.log(), spi_i, &e.to_string());
                return DispatchOutcome::Dropped(e);
            }
        };

        let (sa, _) = self.directory.add_responder(spi_i, source, |spi| {
            IkeSa::responder(spi, spi_i, local, source, peer_config)
        });
        sa.push_command(command, false);
        self.metrics.record_command(true);
        DispatchOutcome::Queued(sa.local_spi())
    }

    fn cookie_challenge(&self, request: &IkeMessage, nonce: &[u8], source: IpAddr) -> Result<OutboundMessage> {
        let spi_i = request.header.spi_i;
        let cookie = self.directory.make_cookie(nonce, source, spi_i);
        let header = IkeHeader::new(
            ExchangeType::IkeSaInit,
            spi_i,
            0,
            IkeFlags::response(false),
            request.header.message_id,
        );
        let message =
            IkeMessage::new(header).with_payload(IkePayload::Notify(NotifyPayload::cookie(cookie)));
        let bytes = message.encode()?;
        Ok(OutboundMessage {
            destination: source,
            message,
            bytes,
        })
    }

    /// Process every queued command of an IKE SA
    ///
    /// Returns the messages to send. An SA that reached `Deleted` is
    /// removed from the directory together with its Child SAs.
    pub fn run_ike_sa(&self, spi: u64) -> Vec<OutboundMessage> {
        let sa = match self.directory.get_by_ike_sa_spi(spi) {
            Some(sa) => sa,
            None => return Vec::new(),
        };

        let mut outbound = Vec::new();
        while let Some(outcome) = sa.process_command(self) {
            outbound.extend(outcome.outbound);
        }

        if sa.state() == IkeSaState::Deleted {
            self.directory.remove_ike_sa(sa.local_spi());
        }
        outbound
    }

    // ----- operational tooling -----

    /// Find or create the IKE SA to `peer` and queue a Child SA request
    pub fn request_child_sa(&self, local: IpAddr, peer: IpAddr, request: ChildSaRequest) -> Result<u64> {
        self.directory
            .request_child_sa(&self.policy, local, peer, request)
    }

    /// [`request_child_sa`](Self::request_child_sa) with a mobility context
    pub fn request_child_sa_mobility(
        &self,
        local: IpAddr,
        peer: IpAddr,
        request: ChildSaRequest,
        mobility: MobilityContext,
    ) -> Result<u64> {
        self.directory
            .request_child_sa_mobility(&self.policy, local, peer, request, Some(mobility))
    }

    /// Queue deletion of an IKE SA
    pub fn delete_ike_sa(&self, spi: u64) -> Result<()> {
        if self
            .directory
            .push_command_by_ike_sa_spi(spi, Command::DeleteIkeSa, true)
        {
            Ok(())
        } else {
            Err(Error::SaNotFound(format!("IKE SA {:016x}", spi)))
        }
    }

    /// Queue deletion of a Child SA
    pub fn delete_child_sa(&self, spi: u32) -> Result<()> {
        if self
            .directory
            .push_command_by_child_sa_spi(spi, Command::DeleteChildSa { spi }, false)
        {
            Ok(())
        } else {
            Err(Error::SaNotFound(format!("Child SA {:08x}", spi)))
        }
    }

    /// Snapshot of every IKE SA
    pub fn snapshot(&self) -> Vec<IkeSaSnapshot> {
        self.directory.snapshot()
    }

    /// Snapshot of one Child SA
    pub fn child_sa(&self, spi: u32) -> Option<ChildSaSnapshot> {
        self.directory
            .get_by_child_sa_spi(spi)?
            .child_sas()
            .get(spi)
            .map(|child| child.snapshot())
    }

    /// Counter values
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ike_sa::{IpsecMode, IpsecProtocol};
    use crate::ipsec::ikev2::{
        DhTransformId, EncrTransformId, IdTemplate, Identity, IntegTransformId, NoncePayload,
        NotifyType, PayloadType, PrfTransformId, Proposal, ProtocolId, SaPayload, Transform,
    };
    use crate::ipsec::policy::{Authenticator, IkeSaConfiguration, PeerConfiguration};

    fn context(general: GeneralConfiguration) -> EngineContext {
        let ctx = EngineContext::new(general);
        ctx.policy()
            .add_peer_configuration(PeerConfiguration::new(
                "0.0.0.0/0".parse().unwrap(),
                Role::Any,
                IkeSaConfiguration::new(Identity::fqdn("gw"), Authenticator::psk(b"k"))
                    .with_proposal(ike_proposal())
                    .allow_id(IdTemplate::Any),
            ))
            .unwrap();
        ctx
    }

    fn ike_proposal() -> Proposal {
        Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr_with_key_len(EncrTransformId::AesCbc, 128))
            .add_transform(Transform::prf(PrfTransformId::HmacSha256))
            .add_transform(Transform::integ(IntegTransformId::HmacSha256_128))
            .add_transform(Transform::dh(DhTransformId::Group14))
    }

    fn init_request(spi_i: u64) -> IkeMessage {
        IkeMessage::new(IkeHeader::new(ExchangeType::IkeSaInit, spi_i, 0, IkeFlags::request(true), 0))
            .with_payload(IkePayload::Sa(SaPayload::new(vec![ike_proposal()])))
            .with_payload(IkePayload::Nonce(NoncePayload::new(vec![7u8; 32]).unwrap()))
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_garbage_is_dropped() {
        let ctx = context(GeneralConfiguration::default());
        let outcome = ctx.dispatch_datagram(&[0u8; 12], addr("198.51.100.7"), addr("192.0.2.1"));
        assert!(matches!(outcome, DispatchOutcome::Dropped(ref e) if e.is_parse_error()));
        assert_eq!(ctx.metrics_snapshot().parse_failures, 1);
    }

    #[test]
    fn test_unknown_spi_is_dropped() {
        let ctx = context(GeneralConfiguration::default());
        let message = IkeMessage::new(IkeHeader::new(
            ExchangeType::Informational,
            5,
            6,
            IkeFlags::request(true),
            1,
        ));
        let outcome = ctx.dispatch_datagram(&message.encode().unwrap(), addr("198.51.100.7"), addr("192.0.2.1"));
        assert!(matches!(outcome, DispatchOutcome::Dropped(Error::SaNotFound(_))));
    }

    #[test]
    fn test_cookie_challenge_creates_no_sa() {
        let ctx = context(GeneralConfiguration::default().with_cookie_threshold(0));
        let request = init_request(9);

        let outcome = ctx.dispatch_datagram(&request.encode().unwrap(), addr("198.51.100.7"), addr("192.0.2.1"));
        let challenge = match outcome {
            DispatchOutcome::CookieRequired(outbound) => outbound,
            other => panic!("expected cookie challenge, got {:?}", other),
        };
        assert!(ctx.directory().is_empty());
        assert!(challenge.message.notify(NotifyType::COOKIE).is_some());
        assert_eq!(challenge.bytes[16], u8::from(PayloadType::N));
        assert_eq!(ctx.metrics_snapshot().cookies_issued, 1);
    }

    #[test]
    fn test_malformed_init_creates_no_sa() {
        let ctx = context(GeneralConfiguration::default());
        let source = addr("198.51.100.7");
        let header = |spi_i| IkeHeader::new(ExchangeType::IkeSaInit, spi_i, 0, IkeFlags::request(true), 0);

        let no_nonce = IkeMessage::new(header(1))
            .with_payload(IkePayload::Sa(SaPayload::new(vec![ike_proposal()])));
        let no_sa = IkeMessage::new(header(2))
            .with_payload(IkePayload::Nonce(NoncePayload::new(vec![7u8; 32]).unwrap()));
        let mut late = init_request(3);
        late.header.message_id = 1;

        for request in [no_nonce, no_sa, late] {
            let outcome = ctx.dispatch_datagram(&request.encode().unwrap(), source, addr("192.0.2.1"));
            assert!(matches!(outcome, DispatchOutcome::Dropped(ref e) if e.is_parse_error()));
        }
        assert!(ctx.directory().is_empty());
        assert_eq!(ctx.directory().half_open_count(), 0);
        assert_eq!(ctx.metrics_snapshot().parse_failures, 3);
    }

    #[test]
    fn test_retransmitted_init_reaches_same_sa() {
        let ctx = context(GeneralConfiguration::default());
        let datagram = init_request(0x51).encode().unwrap();
        let source = addr("198.51.100.7");

        let first = ctx.dispatch_datagram(&datagram, source, addr("192.0.2.1"));
        let second = ctx.dispatch_datagram(&datagram, source, addr("192.0.2.1"));
        match (first, second) {
            (DispatchOutcome::Queued(a), DispatchOutcome::Queued(b)) => {
                assert_eq!(a, b);
                assert_eq!(ctx.directory().get_by_ike_sa_spi(a).unwrap().pending_commands(), 2);
            }
            other => panic!("expected both queued, got {:?}", other),
        }
        assert_eq!(ctx.directory().len(), 1);
        assert_eq!(ctx.directory().half_open_count(), 1);
    }

    #[test]
    fn test_delete_unknown_sa() {
        let ctx = context(GeneralConfiguration::default());
        assert!(matches!(ctx.delete_ike_sa(1), Err(Error::SaNotFound(_))));
        assert!(matches!(ctx.delete_child_sa(1), Err(Error::SaNotFound(_))));
    }

    #[test]
    fn test_set_general_updates_threshold() {
        let ctx = context(GeneralConfiguration::default());
        ctx.set_general(GeneralConfiguration::default().with_cookie_threshold(3))
            .unwrap();
        assert_eq!(ctx.directory().cookie_threshold(), 3);
    }

    #[test]
    fn test_request_child_sa_starts_init() {
        let ctx = context(GeneralConfiguration::default());
        let spi = ctx
            .request_child_sa(
                addr("192.0.2.1"),
                addr("198.51.100.7"),
                ChildSaRequest::new(IpsecProtocol::Esp, IpsecMode::Tunnel),
            )
            .unwrap();

        let out = ctx.run_ike_sa(spi);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.header.exchange_type, ExchangeType::IkeSaInit);
        assert_eq!(out[0].message.header.spi_i, spi);
        assert_eq!(out[0].destination, addr("198.51.100.7"));
        assert_eq!(
            ctx.directory().get_by_ike_sa_spi(spi).unwrap().state(),
            IkeSaState::InitSent
        );
    }
}
