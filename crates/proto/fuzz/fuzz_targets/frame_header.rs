//! Fuzz target for encrypted envelope parsing.
//!
//! Random bytes go through the envelope opener (segment lengths, MAC check)
//! and through the plaintext header and payload parsers.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run frame_header -- -max_total_time=300
//! ```

#![no_main]
use kimcloud_proto::ssh::auth::AuthRequest;
use kimcloud_proto::ssh::crypto::{SessionCipher, CLIENT_TO_SERVER};
use kimcloud_proto::ssh::envelope::{self, FrameHeader};
use kimcloud_proto::ssh::kex_dh::SharedSecret;
use kimcloud_proto::ssh::transfer::{FileData, FileStart};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = FrameHeader::from_bytes(data) {
        assert_eq!(&header.to_bytes()[..], data);
    }

    let _ = AuthRequest::from_bytes(data);
    let _ = FileStart::from_bytes(data);
    let _ = FileData::from_bytes(data);

    let mut cipher = SessionCipher::new(&SharedSecret::from_value(0x2545), CLIENT_TO_SERVER);
    let _ = envelope::open(&mut cipher, data);
});
