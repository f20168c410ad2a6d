#![no_main]

use libfuzzer_sys::fuzz_target;
use ragelord_passfd::envelope::{self, ENVELOPE_LEN};

fuzz_target!(|data: &[u8]| {
    if let Ok((decoded, rest)) = envelope::decode_prefix(data) {
        assert_eq!(rest.len(), data.len() - ENVELOPE_LEN);
        // Anything that decodes re-encodes to the same header bytes.
        assert_eq!(&envelope::encode(&decoded)[..], &data[..ENVELOPE_LEN]);
        assert_eq!(envelope::decode(&data[..ENVELOPE_LEN]), Ok(decoded));
    }
    let _ = envelope::decode(data);
});
