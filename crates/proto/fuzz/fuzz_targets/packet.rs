//! Fuzz target for handshake parsing.
//!
//! Feeds random input to the packet parser and to every handshake message
//! parser that reads its payload.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run packet -- -max_total_time=300
//! ```

#![no_main]
use kimcloud_proto::ssh::kex::{KexInit, NewKeys};
use kimcloud_proto::ssh::kex_dh::{KexDhInit, KexDhReply};
use kimcloud_proto::ssh::Packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let serialized = packet.to_bytes();
        let reparsed = Packet::from_bytes(&serialized).expect("Round-trip parsing should never fail");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    let _ = KexInit::from_bytes(data);
    let _ = KexDhInit::from_bytes(data);
    let _ = KexDhReply::from_bytes(data);
    let _ = NewKeys::from_bytes(data);
});
