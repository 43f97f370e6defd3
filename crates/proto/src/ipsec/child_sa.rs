//! Child SAs and the per-IKE-SA Child SA registry
//!
//! Child SAs are created by IKE_AUTH or CREATE_CHILD_SA and protect the
//! actual traffic. Each is identified by two SPIs: the inbound SPI we
//! allocated and the outbound SPI the peer allocated.
//!
//! # Registry layout
//!
//! [`ChildSaRegistry`] owns every Child SA in a single table keyed by the
//! inbound SPI (the canonical key). The outbound index only maps an
//! outbound SPI to that canonical key, so a Child SA is never owned twice
//! and both indices change together under one lock.

use crate::ipsec::ikev2::proposal::ProtocolId;
use crate::ipsec::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime};

/// IPsec protocol of a Child SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpsecProtocol {
    /// Encapsulating Security Payload
    Esp,
    /// Authentication Header
    Ah,
}

impl IpsecProtocol {
    /// Protocol ID used in Notify/Delete payloads
    pub fn protocol_id(self) -> ProtocolId {
        match self {
            IpsecProtocol::Esp => ProtocolId::Esp,
            IpsecProtocol::Ah => ProtocolId::Ah,
        }
    }

    /// Inverse of [`protocol_id`](Self::protocol_id); `None` for IKE
    pub fn from_protocol_id(id: ProtocolId) -> Option<Self> {
        match id {
            ProtocolId::Esp => Some(IpsecProtocol::Esp),
            ProtocolId::Ah => Some(IpsecProtocol::Ah),
            ProtocolId::Ike => None,
        }
    }
}

/// IPsec encapsulation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpsecMode {
    /// Whole IP packet encapsulated
    Tunnel,
    /// Payload only
    Transport,
}

/// Child SA lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildSaState {
    /// Negotiation in progress
    Creating,
    /// Usable for traffic
    Established,
    /// Replacement being negotiated
    Rekeying,
    /// Delete sent, waiting for the peer (half-closed)
    Deleting,
    /// Fully deleted
    Deleted,
}

/// SA lifetime limits
///
/// Soft limits trigger a rekey, hard limits a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaLifetime {
    /// Rekey after this long
    pub soft_time: Duration,
    /// Delete after this long
    pub hard_time: Duration,
    /// Rekey after this many bytes
    pub soft_bytes: Option<u64>,
    /// Delete after this many bytes
    pub hard_bytes: Option<u64>,
}

impl Default for SaLifetime {
    fn default() -> Self {
        SaLifetime {
            soft_time: Duration::from_secs(45 * 60),
            hard_time: Duration::from_secs(60 * 60),
            soft_bytes: None,
            hard_bytes: None,
        }
    }
}

impl SaLifetime {
    /// Create time-based limits
    pub fn new(soft_time: Duration, hard_time: Duration) -> Result<Self> {
        if soft_time >= hard_time {
            return Err(Error::InvalidParameter(
                "Soft lifetime must be less than hard lifetime".into(),
            ));
        }
        Ok(SaLifetime {
            soft_time,
            hard_time,
            ..SaLifetime::default()
        })
    }

    /// Add byte-based limits
    pub fn with_byte_limits(mut self, soft_bytes: u64, hard_bytes: u64) -> Result<Self> {
        if soft_bytes >= hard_bytes {
            return Err(Error::InvalidParameter(
                "Soft byte limit must be less than hard byte limit".into(),
            ));
        }
        self.soft_bytes = Some(soft_bytes);
        self.hard_bytes = Some(hard_bytes);
        Ok(self)
    }

    fn exceeded(age: Duration, bytes: u64, time: Duration, limit: Option<u64>) -> bool {
        age >= time || limit.map_or(false, |limit| bytes >= limit)
    }
}

/// A Child SA
#[derive(Debug, Clone)]
pub struct ChildSa {
    /// SPI we allocated; packets to us carry it
    pub inbound_spi: u32,
    /// SPI the peer allocated
    pub outbound_spi: u32,
    /// ESP or AH
    pub protocol: IpsecProtocol,
    /// Tunnel or transport
    pub mode: IpsecMode,
    /// Lifecycle state
    pub state: ChildSaState,
    /// Lifetime limits
    pub lifetime: SaLifetime,
    /// Inbound byte counter
    pub bytes_in: u64,
    /// Outbound byte counter
    pub bytes_out: u64,
    /// Inbound packet counter
    pub packets_in: u64,
    /// Outbound packet counter
    pub packets_out: u64,
    /// Wall-clock creation time
    pub created_at: SystemTime,
    created: Instant,
}

impl ChildSa {
    /// Create a Child SA in the `Creating` state
    pub fn new(
        inbound_spi: u32,
        outbound_spi: u32,
        protocol: IpsecProtocol,
        mode: IpsecMode,
    ) -> Self {
        ChildSa {
            inbound_spi,
            outbound_spi,
            protocol,
            mode,
            state: ChildSaState::Creating,
            lifetime: SaLifetime::default(),
            bytes_in: 0,
            bytes_out: 0,
            packets_in: 0,
            packets_out: 0,
            created_at: SystemTime::now(),
            created: Instant::now(),
        }
    }

    /// Set lifetime limits
    pub fn with_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set state
    pub fn with_state(mut self, state: ChildSaState) -> Self {
        self.state = state;
        self
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Count an inbound packet
    pub fn record_inbound(&mut self, bytes: u64) {
        self.bytes_in += bytes;
        self.packets_in += 1;
    }

    /// Count an outbound packet
    pub fn record_outbound(&mut self, bytes: u64) {
        self.bytes_out += bytes;
        self.packets_out += 1;
    }

    /// Soft lifetime reached
    pub fn should_rekey(&self) -> bool {
        self.state == ChildSaState::Established
            && SaLifetime::exceeded(
                self.age(),
                self.bytes_in + self.bytes_out,
                self.lifetime.soft_time,
                self.lifetime.soft_bytes,
            )
    }

    /// Hard lifetime reached
    pub fn is_expired(&self) -> bool {
        SaLifetime::exceeded(
            self.age(),
            self.bytes_in + self.bytes_out,
            self.lifetime.hard_time,
            self.lifetime.hard_bytes,
        )
    }

    /// Read-only view for operational tooling
    pub fn snapshot(&self) -> ChildSaSnapshot {
        ChildSaSnapshot {
            inbound_spi: self.inbound_spi,
            outbound_spi: self.outbound_spi,
            protocol: self.protocol,
            mode: self.mode,
            state: self.state,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            packets_in: self.packets_in,
            packets_out: self.packets_out,
            created_at: self.created_at,
            age_secs: self.age().as_secs(),
        }
    }
}

/// Serializable Child SA view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildSaSnapshot {
    /// Inbound SPI
    pub inbound_spi: u32,
    /// Outbound SPI
    pub outbound_spi: u32,
    /// ESP or AH
    pub protocol: IpsecProtocol,
    /// Tunnel or transport
    pub mode: IpsecMode,
    /// Lifecycle state
    pub state: ChildSaState,
    /// Inbound bytes
    pub bytes_in: u64,
    /// Outbound bytes
    pub bytes_out: u64,
    /// Inbound packets
    pub packets_in: u64,
    /// Outbound packets
    pub packets_out: u64,
    /// Creation time
    pub created_at: SystemTime,
    /// Seconds since creation
    pub age_secs: u64,
}

#[derive(Debug, Default)]
struct Tables {
    by_inbound: BTreeMap<u32, ChildSa>,
    outbound: HashMap<u32, u32>,
}

impl Tables {
    fn resolve(&self, spi: u32) -> Option<u32> {
        if self.by_inbound.contains_key(&spi) {
            Some(spi)
        } else {
            self.outbound.get(&spi).copied()
        }
    }
}

/// Dual-indexed Child SA collection owned by one IKE SA
///
/// Lookups accept either SPI; an inbound match wins over an outbound one.
/// Every method takes the lock for one map operation only.
#[derive(Debug, Default)]
pub struct ChildSaRegistry {
    tables: Mutex<Tables>,
}

impl ChildSaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `child_sa`, indexing it under both SPIs.
    ///
    /// # Panics
    ///
    /// Panics if either SPI is already registered.
    pub fn add(&self, child_sa: ChildSa) {
        let mut tables = self.tables.lock();
        let (inbound, outbound) = (child_sa.inbound_spi, child_sa.outbound_spi);

        assert!(
            !tables.by_inbound.contains_key(&inbound),
            "Child SA inbound SPI {:#010x} already registered",
            inbound
        );
        assert!(
            !tables.outbound.contains_key(&outbound),
            "Child SA outbound SPI {:#010x} already registered",
            outbound
        );

        tables.outbound.insert(outbound, inbound);
        tables.by_inbound.insert(inbound, child_sa);
    }

    /// Whether `add` would accept a Child SA with these SPIs
    pub fn can_add(&self, inbound_spi: u32, outbound_spi: u32) -> bool {
        let tables = self.tables.lock();
        !tables.by_inbound.contains_key(&inbound_spi) && !tables.outbound.contains_key(&outbound_spi)
    }

    /// Child SA whose inbound or outbound SPI equals `spi`
    pub fn get(&self, spi: u32) -> Option<ChildSa> {
        let tables = self.tables.lock();
        let key = tables.resolve(spi)?;
        tables.by_inbound.get(&key).cloned()
    }

    /// Child SA with the lowest inbound SPI
    pub fn get_first(&self) -> Option<ChildSa> {
        self.tables
            .lock()
            .by_inbound
            .values()
            .next()
            .cloned()
    }

    /// Whether `spi` is known under either index
    pub fn contains(&self, spi: u32) -> bool {
        self.tables.lock().resolve(spi).is_some()
    }

    /// Remove the Child SA with inbound SPI `inbound_spi` from both indices
    ///
    /// # Panics
    ///
    /// Panics if no Child SA has that inbound SPI.
    pub fn remove(&self, inbound_spi: u32) -> ChildSa {
        let mut tables = self.tables.lock();
        let child_sa = match tables.by_inbound.remove(&inbound_spi) {
            Some(child_sa) => child_sa,
            None => panic!(
                "Removing unknown Child SA inbound SPI {:#010x}",
                inbound_spi
            ),
        };
        let removed = tables.outbound.remove(&child_sa.outbound_spi);
        assert_eq!(
            removed,
            Some(inbound_spi),
            "Child SA outbound index out of sync"
        );
        child_sa
    }

    /// Apply `f` to the Child SA matching `spi`; false if none
    pub fn update<F>(&self, spi: u32, f: F) -> bool
    where
        F: FnOnce(&mut ChildSa),
    {
        let mut tables = self.tables.lock();
        let Some(key) = tables.resolve(spi) else {
            return false;
        };
        match tables.by_inbound.get_mut(&key) {
            Some(child_sa) => {
                f(child_sa);
                true
            }
            None => false,
        }
    }

    /// Set the state of the Child SA matching `spi`
    pub fn set_state(&self, spi: u32, state: ChildSaState) -> bool {
        self.update(spi, |child_sa| child_sa.state = state)
    }

    /// Any Child SA waiting for a delete to complete
    pub fn has_half_closed(&self) -> bool {
        self.tables
            .lock()
            .by_inbound
            .values()
            .any(|child_sa| child_sa.state == ChildSaState::Deleting)
    }

    /// Number of Child SAs
    pub fn size(&self) -> usize {
        self.tables.lock().by_inbound.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Inbound SPIs in ascending order
    pub fn inbound_spis(&self) -> Vec<u32> {
        self.tables.lock().by_inbound.keys().copied().collect()
    }

    /// Remove and return every Child SA
    pub fn drain(&self) -> Vec<ChildSa> {
        let mut tables = self.tables.lock();
        tables.outbound.clear();
        std::mem::take(&mut tables.by_inbound).into_values().collect()
    }

    /// Snapshots of every Child SA
    pub fn snapshot(&self) -> Vec<ChildSaSnapshot> {
        self.tables
            .lock()
            .by_inbound
            .values()
            .map(ChildSa::snapshot)
            .collect()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let tables = self.tables.lock();
        tables.by_inbound.len() == tables.outbound.len()
            && tables.outbound.iter().all(|(outbound, inbound)| {
                tables
                    .by_inbound
                    .get(inbound)
                    .map_or(false, |sa| sa.outbound_spi == *outbound)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn esp(inbound: u32, outbound: u32) -> ChildSa {
        ChildSa::new(inbound, outbound, IpsecProtocol::Esp, IpsecMode::Tunnel)
            .with_state(ChildSaState::Established)
    }

    #[test]
    fn test_dual_index_lookup_and_remove() {
        let registry = ChildSaRegistry::new();
        registry.add(esp(0x1001, 0x2001));

        assert_eq!(registry.get(0x1001).unwrap().outbound_spi, 0x2001);
        assert_eq!(registry.get(0x2001).unwrap().inbound_spi, 0x1001);
        assert_eq!(registry.size(), 1);

        let removed = registry.remove(0x1001);
        assert_eq!(removed.outbound_spi, 0x2001);
        assert!(registry.get(0x2001).is_none());
        assert!(registry.get(0x1001).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    #[should_panic(expected = "Removing unknown Child SA")]
    fn test_remove_missing_panics() {
        let registry = ChildSaRegistry::new();
        registry.add(esp(1, 2));
        registry.remove(3);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_inbound_panics() {
        let registry = ChildSaRegistry::new();
        registry.add(esp(1, 2));
        registry.add(esp(1, 3));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_outbound_panics() {
        let registry = ChildSaRegistry::new();
        registry.add(esp(1, 2));
        registry.add(esp(5, 2));
    }

    #[test]
    fn test_can_add() {
        let registry = ChildSaRegistry::new();
        registry.add(esp(1, 2));
        assert!(!registry.can_add(1, 9));
        assert!(!registry.can_add(9, 2));
        // Index namespaces are independent
        assert!(registry.can_add(2, 1));
    }

    #[test]
    fn test_get_first_is_lowest_inbound() {
        let registry = ChildSaRegistry::new();
        assert!(registry.get_first().is_none());

        registry.add(esp(30, 31));
        registry.add(esp(10, 11));
        registry.add(esp(20, 21));
        assert_eq!(registry.get_first().unwrap().inbound_spi, 10);
        assert_eq!(registry.inbound_spis(), vec![10, 20, 30]);
    }

    #[test]
    fn test_half_closed() {
        let registry = ChildSaRegistry::new();
        registry.add(esp(1, 2));
        assert!(!registry.has_half_closed());

        assert!(registry.set_state(2, ChildSaState::Deleting));
        assert!(registry.has_half_closed());
        assert!(!registry.set_state(99, ChildSaState::Deleting));
    }

    #[test]
    fn test_update_counters_and_snapshot() {
        let registry = ChildSaRegistry::new();
        registry.add(esp(7, 8));
        registry.update(8, |sa| sa.record_outbound(1500));
        registry.update(7, |sa| sa.record_inbound(100));

        let snap = &registry.snapshot()[0];
        assert_eq!(snap.bytes_out, 1500);
        assert_eq!(snap.packets_in, 1);
        assert_eq!(snap.state, ChildSaState::Established);
    }

    #[test]
    fn test_drain() {
        let registry = ChildSaRegistry::new();
        registry.add(esp(1, 2));
        registry.add(esp(3, 4));

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(!registry.contains(2));
    }

    #[test]
    fn test_lifetime() {
        assert!(SaLifetime::new(Duration::from_secs(10), Duration::from_secs(5)).is_err());

        let lifetime = SaLifetime::new(Duration::from_secs(3600), Duration::from_secs(7200))
            .unwrap()
            .with_byte_limits(1000, 2000)
            .unwrap();
        let mut sa = esp(1, 2).with_lifetime(lifetime);
        assert!(!sa.should_rekey());

        sa.record_outbound(1200);
        assert!(sa.should_rekey());
        assert!(!sa.is_expired());

        sa.record_inbound(900);
        assert!(sa.is_expired());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u16, u16),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u16>(), any::<u16>()).prop_map(|(i, o)| Op::Add(i, o)),
            any::<usize>().prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_indices_stay_in_sync(ops in prop::collection::vec(op(), 1..64)) {
            let registry = ChildSaRegistry::new();
            for op in ops {
                match op {
                    Op::Add(i, o) => {
                        // Separate SPI ranges keep the two directions distinct
                        let (inbound, outbound) = (i as u32, 0x10000 + o as u32);
                        if !registry.contains(inbound) && !registry.contains(outbound) {
                            registry.add(esp(inbound, outbound));
                            prop_assert!(registry.get(outbound).is_some());
                        }
                    }
                    Op::Remove(n) => {
                        let spis = registry.inbound_spis();
                        if !spis.is_empty() {
                            let victim = registry.remove(spis[n % spis.len()]);
                            prop_assert!(registry.get(victim.outbound_spi).is_none());
                        }
                    }
                }
                prop_assert!(registry.is_consistent());
            }
        }
    }
}
