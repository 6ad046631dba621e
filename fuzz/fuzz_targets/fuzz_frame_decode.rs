#![no_main]

use std::io::Cursor;

use gossip_babbler::gossip::codec::read_frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    rt.block_on(async {
        let mut cursor = Cursor::new(data);
        let _ = read_frame(&mut cursor).await;
    });
});
