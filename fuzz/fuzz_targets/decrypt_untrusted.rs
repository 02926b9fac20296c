#![no_main]

use encryption::{ByteRange, CryptoMode, DataKey, StreamDecryptor};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must produce errors, never panics or unverified plaintext.
fuzz_target!(|data: &[u8]| {
    let key = DataKey::from_bytes([7u8; 32]);
    for mode in [CryptoMode::AesGcmCtrV1, CryptoMode::AesCbcPkcs5Padding] {
        let Ok(decryptor) = StreamDecryptor::new(data, mode, &key) else {
            continue;
        };
        if let Ok(blocks) = decryptor.blocks(ByteRange::full(data.len() as u64)) {
            for block in blocks {
                if block.is_err() {
                    break;
                }
            }
        }
    }
});
