//! Fuzz target for packet parsing
//!
//! The header decoder and packet splitter must reject malformed datagrams
//! without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use udx_core::{Header, PacketView};

fuzz_target!(|data: &[u8]| {
    let _ = Header::decode(data);

    if let Ok(view) = PacketView::parse(data) {
        for (start, end) in view.sack_ranges() {
            let _ = end.wrapping_sub(start);
        }
        assert!(view.payload.len() < data.len());
    }
});
