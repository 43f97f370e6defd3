//! Fuzz target for IKE message decoding.
//!
//! Feeds arbitrary bytes to the header and payload chain parser. Malformed
//! input must come back as an error, never as a panic.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ike_message -- -max_total_time=300
//! ```

#![no_main]
use ike_proto::ipsec::ikev2::IkeMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = IkeMessage::decode(data) {
        // Anything we accept must encode again and decode to the same payloads
        if let Ok(encoded) = message.encode() {
            let reparsed = IkeMessage::decode(&encoded).expect("re-encoded message must decode");
            assert_eq!(reparsed.payloads, message.payloads);
        }
    }
});
