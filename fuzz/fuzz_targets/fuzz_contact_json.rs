#![no_main]

use gossip_babbler::gossip::contact::Contact;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(contact) = serde_json::from_slice::<Contact>(data) {
        if contact.is_well_formed() {
            let _ = contact.endpoint(0);
        }
    }
});
