#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use relay_protocol::codec::decode_packet;

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    // Drain every complete frame; must only ever return Err, never panic.
    while let Ok(Some(_)) = decode_packet(&mut buf) {}
});
