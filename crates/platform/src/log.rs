//! Diagnostic sink contract
//!
//! The engine reports its primary events through a [`LogSink`] that is
//! handed to it at construction time. Each message carries the name of the
//! emitting component, a [`LogType`] category bitmask and a flag telling
//! whether the event is part of the main flow (SA lifecycle, policy
//! decisions) or supplementary detail.
//!
//! [`TracingSink`] forwards everything to `tracing`, so an application that
//! already installed a subscriber needs nothing else.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Category bitmask attached to every emitted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LogType(u16);

impl LogType {
    /// Security alarm (flooding, forged cookies)
    pub const ALARM: LogType = LogType(0x0001);
    /// Configuration changes
    pub const CONFIG: LogType = LogType(0x0002);
    /// Cryptographic operations
    pub const CRYPTO: LogType = LogType(0x0004);
    /// Address assignment
    pub const DHCP: LogType = LogType(0x0008);
    /// Event bus traffic
    pub const EVENT_BUS: LogType = LogType(0x0010);
    /// Errors
    pub const ERROR: LogType = LogType(0x0020);
    /// Half-open SA accounting
    pub const HALF_OPEN: LogType = LogType(0x0040);
    /// IPsec (Child SA) operations
    pub const IPSEC: LogType = LogType(0x0080);
    /// Message encoding/decoding
    pub const MESSAGE: LogType = LogType(0x0100);
    /// Policy decisions
    pub const POLICY: LogType = LogType(0x0200);
    /// State transitions
    pub const STATE: LogType = LogType(0x0400);
    /// Worker threads
    pub const THREAD: LogType = LogType(0x0800);
    /// Warnings
    pub const WARNING: LogType = LogType(0x1000);
    /// Informational
    pub const INFO: LogType = LogType(0x2000);

    /// Build from raw bits
    pub const fn from_bits(bits: u16) -> Self {
        LogType(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True if any bit of `other` is set in `self`
    pub const fn intersects(self, other: LogType) -> bool {
        self.0 & other.0 != 0
    }

    /// Five-letter label of the highest-priority category present.
    ///
    /// Alarms win over everything else, informational loses to everything.
    pub fn label(self) -> String {
        const ORDER: [(LogType, &str); 14] = [
            (LogType::ALARM, "ALARM"),
            (LogType::CONFIG, "CONFG"),
            (LogType::CRYPTO, "CRYPT"),
            (LogType::DHCP, "DHCPC"),
            (LogType::EVENT_BUS, "EVBUS"),
            (LogType::ERROR, "ERROR"),
            (LogType::HALF_OPEN, "HOPEN"),
            (LogType::IPSEC, "IPSEC"),
            (LogType::MESSAGE, "MESSG"),
            (LogType::POLICY, "POLIC"),
            (LogType::STATE, "STATE"),
            (LogType::THREAD, "THRDS"),
            (LogType::WARNING, "WARNG"),
            (LogType::INFO, "INFOR"),
        ];

        ORDER
            .iter()
            .find(|(flag, _)| self.intersects(*flag))
            .map(|(_, label)| (*label).to_string())
            .unwrap_or_else(|| self.0.to_string())
    }

    /// Tracing level a message of this category should be reported at
    pub fn level(self) -> tracing::Level {
        if self.intersects(LogType::ALARM | LogType::ERROR) {
            tracing::Level::ERROR
        } else if self.intersects(LogType::WARNING) {
            tracing::Level::WARN
        } else if self.intersects(LogType::MESSAGE | LogType::THREAD | LogType::CRYPTO) {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

impl BitOr for LogType {
    type Output = LogType;

    fn bitor(self, rhs: LogType) -> LogType {
        LogType(self.0 | rhs.0)
    }
}

impl BitOrAssign for LogType {
    fn bitor_assign(&mut self, rhs: LogType) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Process diagnostic sink.
///
/// Implementations must not block for longer than a lock acquisition.
pub trait LogSink: Send + Sync {
    /// Emit one message
    fn emit(&self, source: &str, message: &str, log_type: LogType, is_primary: bool);
}

/// Sink forwarding to the `tracing` macros
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, source: &str, message: &str, log_type: LogType, is_primary: bool) {
        let category = log_type.label();
        let level = log_type.level();
        if level == tracing::Level::ERROR {
            tracing::error!(source, category = %category, primary = is_primary, "{}", message);
        } else if level == tracing::Level::WARN {
            tracing::warn!(source, category = %category, primary = is_primary, "{}", message);
        } else if level == tracing::Level::DEBUG {
            tracing::debug!(source, category = %category, primary = is_primary, "{}", message);
        } else {
            tracing::info!(source, category = %category, primary = is_primary, "{}", message);
        }
    }
}

/// Install a global `tracing` subscriber filtered by `filter`
/// (e.g. `"ike_proto=debug"`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(filter: &str) -> bool {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<String>>,
    }

    impl LogSink for RecordingSink {
        fn emit(&self, source: &str, message: &str, log_type: LogType, is_primary: bool) {
            self.lines.lock().unwrap().push(format!(
                "{}|{}|{}|{}",
                source,
                log_type.label(),
                is_primary,
                message
            ));
        }
    }

    #[test]
    fn test_label_priority() {
        assert_eq!(LogType::ALARM.label(), "ALARM");
        assert_eq!((LogType::INFO | LogType::ERROR).label(), "ERROR");
        assert_eq!((LogType::WARNING | LogType::INFO).label(), "WARNG");
        assert_eq!(LogType::HALF_OPEN.label(), "HOPEN");
        assert_eq!(LogType::default().label(), "0");
    }

    #[test]
    fn test_levels() {
        assert_eq!(LogType::ALARM.level(), tracing::Level::ERROR);
        assert_eq!(LogType::WARNING.level(), tracing::Level::WARN);
        assert_eq!(LogType::MESSAGE.level(), tracing::Level::DEBUG);
        assert_eq!(LogType::STATE.level(), tracing::Level::INFO);
    }

    #[test]
    fn test_sink_as_trait_object() {
        let sink = RecordingSink::default();
        let dyn_sink: &dyn LogSink = &sink;
        dyn_sink.emit("IkeSa", "state changed", LogType::STATE, true);

        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.as_slice(), ["IkeSa|STATE|true|state changed"]);
    }

    #[test]
    fn test_tracing_sink_does_not_panic_without_subscriber() {
        TracingSink.emit("test", "message", LogType::ALARM | LogType::HALF_OPEN, false);
    }
}
