//! Structured logging for engine events
//!
//! One helper per event, each emitting a `tracing` event with SPIs as hex
//! fields. Primary events (SA lifecycle, policy decisions) are also handed
//! to the context's [`LogSink`].
//!
//! # Levels
//!
//! - **DEBUG**: commands, Child SA bookkeeping
//! - **INFO**: IKE SA lifecycle, cookie mode
//! - **WARN**: malformed input, policy mismatches

use ike_platform::{LogSink, LogType};
use std::net::IpAddr;
use tracing::{debug, info, warn};

const SOURCE: &str = "ike_sa";

fn spi_hex(spi: u64) -> String {
    hex::encode(spi.to_be_bytes())
}

/// IKE SA state transition
pub fn log_ike_state_transition(sink: &dyn LogSink, spi: u64, from: &str, to: &str) {
    info!(
        ike_spi = %spi_hex(spi),
        state_from = from,
        state_to = to,
        "IKE SA state transition"
    );
    sink.emit(
        SOURCE,
        &format!("IKE SA {} {} -> {}", spi_hex(spi), from, to),
        LogType::STATE,
        true,
    );
}

/// IKE SA registered in the directory
pub fn log_ike_sa_created(sink: &dyn LogSink, spi: u64, peer: IpAddr, role: &str) {
    info!(ike_spi = %spi_hex(spi), %peer, role, "IKE SA created");
    sink.emit(
        SOURCE,
        &format!("IKE SA {} created as {} for {}", spi_hex(spi), role, peer),
        LogType::EVENT_BUS,
        true,
    );
}

/// IKE SA removed from the directory
pub fn log_ike_sa_destroyed(sink: &dyn LogSink, spi: u64, child_count: usize) {
    info!(ike_spi = %spi_hex(spi), child_count, "IKE SA destroyed");
    sink.emit(
        SOURCE,
        &format!("IKE SA {} destroyed with {} Child SAs", spi_hex(spi), child_count),
        LogType::EVENT_BUS,
        true,
    );
}

/// Child SA registered
pub fn log_child_sa_registered(ike_spi: u64, inbound: u32, outbound: u32) {
    debug!(
        ike_spi = %spi_hex(ike_spi),
        child_spi_in = %format!("{:08x}", inbound),
        child_spi_out = %format!("{:08x}", outbound),
        "Child SA registered"
    );
}

/// Child SA removed
pub fn log_child_sa_removed(ike_spi: u64, inbound: u32, reason: &str) {
    debug!(
        ike_spi = %spi_hex(ike_spi),
        child_spi_in = %format!("{:08x}", inbound),
        reason,
        "Child SA removed"
    );
}

/// Half-open counter moved
pub fn log_half_open_changed(count: u32) {
    debug!(half_open = count, "Half-open IKE SA count changed");
}

/// Cookie mode switched
pub fn log_cookie_mode(sink: &dyn LogSink, enabled: bool, half_open: u32) {
    info!(enabled, half_open, "Cookie mode changed");
    sink.emit(
        "directory",
        &format!(
            "Cookie mode {} at {} half-open SAs",
            if enabled { "on" } else { "off" },
            half_open
        ),
        LogType::HALF_OPEN,
        true,
    );
}

/// Negotiation rejected on policy
pub fn log_policy_mismatch(sink: &dyn LogSink, spi: u64, reason: &str) {
    warn!(ike_spi = %spi_hex(spi), reason, "Policy mismatch");
    sink.emit(
        "policy",
        &format!("IKE SA {}: {}", spi_hex(spi), reason),
        LogType::POLICY | LogType::WARNING,
        true,
    );
}

/// Malformed datagram dropped
pub fn log_parse_failure(peer: IpAddr, size: usize, error: &str) {
    warn!(%peer, size, error, "Dropped malformed IKE message");
}

/// Command queued for an IKE SA
pub fn log_command_enqueued(spi: u64, command: &str, urgent: bool) {
    debug!(ike_spi = %spi_hex(spi), command, urgent, "Command enqueued");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, LogType)>>);

    impl LogSink for Recorder {
        fn emit(&self, _source: &str, message: &str, log_type: LogType, _is_primary: bool) {
            self.0.lock().push((message.to_string(), log_type));
        }
    }

    #[test]
    fn test_primary_events_reach_sink() {
        let sink = Recorder::default();
        log_ike_state_transition(&sink, 0xAB, "IDLE", "INIT_DONE");
        log_policy_mismatch(&sink, 0xAB, "identity not allowed");

        let events = sink.0.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "IKE SA 00000000000000ab IDLE -> INIT_DONE");
        assert!(events[1].1.intersects(LogType::POLICY));
    }
}
