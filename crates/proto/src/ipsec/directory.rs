//! IKE SA directory
//!
//! Owns every live [`IkeSa`], hands out SPIs, counts half-open SAs for
//! admission control and routes commands by IKE SA or Child SA SPI.
//!
//! The SPI table lock is only held to look up, insert or remove entries.
//! Lookups clone the `Arc<IkeSa>` and release the table before touching
//! the SA, so a slow SA never blocks routing to the others. Creation
//! re-checks for an existing SA and picks the SPI under the write lock.

use crate::ipsec::crypto::PrfAlgorithm;
use crate::ipsec::ike_sa::{
    ChildSaRequest, Command, IkeSa, IkeSaSnapshot, MobilityContext, OutboundMessage,
};
use crate::ipsec::ikev2::IkeSaState;
use crate::ipsec::logging;
use crate::ipsec::metrics::EngineMetrics;
use crate::ipsec::policy::{PolicyStore, Role};
use crate::ipsec::{Error, Result};
use ike_platform::LogSink;
use parking_lot::{Mutex, RwLock};
use rand::{Rng, RngCore};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Child SA SPIs 1..=255 are reserved by IANA
const MIN_CHILD_SPI: u32 = 256;

/// Cookie secret length
const COOKIE_SECRET_SIZE: usize = 32;

/// What happened to an inbound datagram
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Handed to the IKE SA with this local SPI
    Queued(u64),
    /// Stateless cookie challenge to send back; no SA was created
    CookieRequired(OutboundMessage),
    /// Half-open limit reached; nothing was created
    Refused,
    /// Malformed, unroutable or refused by policy
    Dropped(Error),
}

#[derive(Default)]
struct SaTable {
    by_spi: HashMap<u64, Arc<IkeSa>>,
    /// Responder SAs by initiator SPI and peer address
    responders: HashMap<(u64, IpAddr), u64>,
}

impl SaTable {
    fn fresh_spi(&self) -> u64 {
        let mut rng = rand::thread_rng();
        loop {
            let spi = rng.gen::<u64>();
            if spi != 0 && !self.by_spi.contains_key(&spi) {
                return spi;
            }
        }
    }

    fn insert(&mut self, sa: &Arc<IkeSa>) {
        let spi = sa.local_spi();
        assert!(
            !self.by_spi.contains_key(&spi),
            "IKE SA {:016x} already registered",
            spi
        );
        if sa.role() == Role::Responder {
            self.responders
                .entry((sa.remote_spi(), sa.peer_addr()))
                .or_insert(spi);
        }
        self.by_spi.insert(spi, Arc::clone(sa));
    }

    fn remove(&mut self, spi: u64) -> Option<Arc<IkeSa>> {
        let sa = self.by_spi.remove(&spi)?;
        let key = (sa.remote_spi(), sa.peer_addr());
        if self.responders.get(&key) == Some(&spi) {
            self.responders.remove(&key);
        }
        Some(sa)
    }

    fn responder(&self, spi_i: u64, peer: IpAddr) -> Option<Arc<IkeSa>> {
        let spi = self.responders.get(&(spi_i, peer))?;
        self.by_spi.get(spi).cloned()
    }

    fn reusable(&self, local: IpAddr, peer: IpAddr, mobility: Option<&MobilityContext>) -> Option<Arc<IkeSa>> {
        self.by_spi
            .values()
            .find(|sa| {
                sa.local_addr() == local
                    && sa.peer_addr() == peer
                    && sa.mobility() == mobility
                    && !matches!(
                        sa.state(),
                        IkeSaState::Deleting | IkeSaState::Deleted | IkeSaState::Failed
                    )
            })
            .cloned()
    }
}

/// Global routing and admission-control facade
pub struct IkeSaDirectory {
    sas: RwLock<SaTable>,
    child_spis: Mutex<HashSet<u32>>,
    half_open: AtomicU32,
    cookie_threshold: AtomicU32,
    cookie_secret: Zeroizing<Vec<u8>>,
    log: Arc<dyn LogSink>,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for IkeSaDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IkeSaDirectory")
            .field("ike_sas", &self.len())
            .field("half_open", &self.half_open_count())
            .field("cookie_threshold", &self.cookie_threshold())
            .finish()
    }
}

impl IkeSaDirectory {
    /// Create an empty directory
    pub fn new(cookie_threshold: u32, log: Arc<dyn LogSink>, metrics: EngineMetrics) -> Self {
        let mut secret = vec![0u8; COOKIE_SECRET_SIZE];
        rand::thread_rng().fill_bytes(&mut secret);

        IkeSaDirectory {
            sas: RwLock::new(SaTable::default()),
            child_spis: Mutex::new(HashSet::new()),
            half_open: AtomicU32::new(0),
            cookie_threshold: AtomicU32::new(cookie_threshold),
            cookie_secret: Zeroizing::new(secret),
            log,
            metrics,
        }
    }

    // ----- SPIs -----

    /// Fresh non-zero IKE SA SPI not used by any live SA
    pub fn next_spi(&self) -> u64 {
        self.sas.read().fresh_spi()
    }

    /// Reserve a fresh inbound Child SA SPI
    pub fn next_child_spi(&self) -> u32 {
        let mut rng = rand::thread_rng();
        let mut reserved = self.child_spis.lock();
        loop {
            let spi = rng.gen_range(MIN_CHILD_SPI..=u32::MAX);
            if reserved.insert(spi) {
                return spi;
            }
        }
    }

    /// Reserve a Child SA SPI chosen elsewhere; false if taken
    pub fn reserve_child_spi(&self, spi: u32) -> bool {
        self.child_spis.lock().insert(spi)
    }

    /// Return a Child SA SPI to the pool
    pub fn release_child_spi(&self, spi: u32) {
        self.child_spis.lock().remove(&spi);
    }

    // ----- half-open accounting -----

    /// Count a new half-open IKE SA
    pub fn inc_half_open_counter(&self) {
        let count = self.half_open.fetch_add(1, Ordering::AcqRel) + 1;
        logging::log_half_open_changed(count);
        self.metrics.record_half_open(count);
        if count == self.cookie_threshold() {
            logging::log_cookie_mode(self.log.as_ref(), true, count);
        }
    }

    /// An IKE SA left the half-open state
    pub fn dec_half_open_counter(&self) {
        let previous = self
            .half_open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let count = previous.saturating_sub(1);
        logging::log_half_open_changed(count);
        if previous == self.cookie_threshold() && previous != 0 {
            logging::log_cookie_mode(self.log.as_ref(), false, count);
        }
    }

    /// Current half-open count; may be momentarily stale
    pub fn half_open_count(&self) -> u32 {
        self.half_open.load(Ordering::Acquire)
    }

    /// Whether IKE_SA_INIT requests must carry a valid cookie
    pub fn use_cookies(&self) -> bool {
        self.half_open_count() >= self.cookie_threshold()
    }

    /// Half-open count at which cookies are demanded
    pub fn cookie_threshold(&self) -> u32 {
        self.cookie_threshold.load(Ordering::Acquire)
    }

    /// Change the cookie threshold
    pub fn set_cookie_threshold(&self, threshold: u32) {
        self.cookie_threshold.store(threshold, Ordering::Release);
    }

    // ----- cookies -----

    /// Cookie binding the initiator's nonce, address and SPI
    pub fn make_cookie(&self, nonce: &[u8], addr: IpAddr, spi_i: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(nonce.len() + 16 + 8);
        data.extend_from_slice(nonce);
        match addr {
            IpAddr::V4(v4) => data.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => data.extend_from_slice(&v6.octets()),
        }
        data.extend_from_slice(&spi_i.to_be_bytes());
        PrfAlgorithm::HmacSha256.prf(&self.cookie_secret, &data)
    }

    /// Check a returned cookie in constant time
    pub fn verify_cookie(&self, cookie: &[u8], nonce: &[u8], addr: IpAddr, spi_i: u64) -> bool {
        let expected = self.make_cookie(nonce, addr, spi_i);
        bool::from(expected.ct_eq(cookie))
    }

    // ----- table -----

    /// Register a new IKE SA, taking ownership
    ///
    /// # Panics
    ///
    /// Panics if an SA with the same local SPI is registered.
    pub fn add_ike_sa(&self, sa: IkeSa) -> Arc<IkeSa> {
        let sa = Arc::new(sa);
        self.sas.write().insert(&sa);
        self.admitted(&sa);
        sa
    }

    /// Register the responder SA for an IKE_SA_INIT from `peer`
    ///
    /// `make` builds the SA from a fresh local SPI. When an SA already
    /// answers `spi_i` from `peer` it is returned instead, with `false`.
    pub fn add_responder(
        &self,
        spi_i: u64,
        peer: IpAddr,
        make: impl FnOnce(u64) -> IkeSa,
    ) -> (Arc<IkeSa>, bool) {
        let sa = {
            let mut table = self.sas.write();
            if let Some(existing) = table.responder(spi_i, peer) {
                return (existing, false);
            }
            let sa = Arc::new(make(table.fresh_spi()));
            table.insert(&sa);
            sa
        };
        self.admitted(&sa);
        (sa, true)
    }

    fn admitted(&self, sa: &IkeSa) {
        let spi = sa.local_spi();
        if sa.state().is_half_open() {
            self.inc_half_open_counter();
        } else {
            sa.release_half_open();
        }
        let role = match sa.role() {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
            Role::Any => "any",
        };
        logging::log_ike_sa_created(self.log.as_ref(), spi, sa.peer_addr(), role);
        self.metrics.record_ike_sa_created();
    }

    /// Remove an IKE SA and destroy its Child SAs
    pub fn remove_ike_sa(&self, spi: u64) -> Option<Arc<IkeSa>> {
        let sa = self.sas.write().remove(spi)?;

        if sa.release_half_open() {
            self.dec_half_open_counter();
        }
        let children = sa.child_sas().drain();
        for child in &children {
            self.release_child_spi(child.inbound_spi);
            logging::log_child_sa_removed(spi, child.inbound_spi, "IKE SA destroyed");
        }
        self.metrics.record_child_sa_deleted(children.len());
        self.metrics.record_ike_sa_deleted();
        logging::log_ike_sa_destroyed(self.log.as_ref(), spi, children.len());
        Some(sa)
    }

    /// IKE SA by local SPI
    pub fn get_by_ike_sa_spi(&self, spi: u64) -> Option<Arc<IkeSa>> {
        self.sas.read().by_spi.get(&spi).cloned()
    }

    /// Responder SA created for this initiator SPI and address
    pub fn find_responder(&self, spi_i: u64, peer: IpAddr) -> Option<Arc<IkeSa>> {
        self.sas.read().responder(spi_i, peer)
    }

    /// IKE SA owning a Child SA with inbound or outbound SPI `spi`
    pub fn get_by_child_sa_spi(&self, spi: u32) -> Option<Arc<IkeSa>> {
        self.all()
            .into_iter()
            .find(|sa| sa.child_sas().contains(spi))
    }

    fn all(&self) -> Vec<Arc<IkeSa>> {
        self.sas.read().by_spi.values().cloned().collect()
    }

    /// Enqueue `command` on the SA with IKE SA SPI `spi`
    ///
    /// Returns whether a target was found.
    pub fn push_command_by_ike_sa_spi(&self, spi: u64, command: Command, priority: bool) -> bool {
        let delivered = match self.get_by_ike_sa_spi(spi) {
            Some(sa) => {
                sa.push_command(command, priority);
                true
            }
            None => false,
        };
        self.metrics.record_command(delivered);
        delivered
    }

    /// Enqueue `command` on the SA owning Child SA SPI `spi`
    pub fn push_command_by_child_sa_spi(&self, spi: u32, command: Command, priority: bool) -> bool {
        let delivered = match self.get_by_child_sa_spi(spi) {
            Some(sa) => {
                sa.push_command(command, priority);
                true
            }
            None => false,
        };
        self.metrics.record_command(delivered);
        delivered
    }

    /// Find or create the IKE SA between `local` and `peer` and queue a
    /// Child SA request on it. Returns the IKE SA's local SPI.
    pub fn request_child_sa(
        &self,
        policy: &PolicyStore,
        local: IpAddr,
        peer: IpAddr,
        request: ChildSaRequest,
    ) -> Result<u64> {
        self.request_child_sa_mobility(policy, local, peer, request, None)
    }

    /// [`request_child_sa`](Self::request_child_sa) under a mobility
    /// context. An SA with a different care-of address is not reused.
    pub fn request_child_sa_mobility(
        &self,
        policy: &PolicyStore,
        local: IpAddr,
        peer: IpAddr,
        request: ChildSaRequest,
        mobility: Option<MobilityContext>,
    ) -> Result<u64> {
        let found = self.sas.read().reusable(local, peer, mobility.as_ref());
        let sa = match found {
            Some(sa) => sa,
            None => {
                let peer_config = policy.get_peer_configuration(peer, Role::Initiator)?;
                let (sa, created) = {
                    let mut table = self.sas.write();
                    match table.reusable(local, peer, mobility.as_ref()) {
                        Some(sa) => (sa, false),
                        None => {
                            let sa = Arc::new(IkeSa::initiator(
                                table.fresh_spi(),
                                local,
                                peer,
                                peer_config,
                                mobility,
                            ));
                            table.insert(&sa);
                            (sa, true)
                        }
                    }
                };
                if created {
                    self.admitted(&sa);
                }
                sa
            }
        };

        sa.push_command(Command::CreateChildSa(request), false);
        self.metrics.record_command(true);
        Ok(sa.local_spi())
    }

    /// Local SPIs of every registered SA
    pub fn spis(&self) -> Vec<u64> {
        let mut spis: Vec<u64> = self.sas.read().by_spi.keys().copied().collect();
        spis.sort_unstable();
        spis
    }

    /// Snapshot of every SA, ordered by local SPI
    pub fn snapshot(&self) -> Vec<IkeSaSnapshot> {
        let mut snapshots: Vec<IkeSaSnapshot> = self.all().iter().map(|sa| sa.snapshot()).collect();
        snapshots.sort_by_key(|s| s.local_spi);
        snapshots
    }

    /// Registered SA count
    pub fn len(&self) -> usize {
        self.sas.read().by_spi.len()
    }

    /// Whether no SA is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
