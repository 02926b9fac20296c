#![no_main]

use encryption::{decrypt, encrypt, CryptoMode, DataKey, ObjectHeader, DATA_KEY_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < DATA_KEY_SIZE + 1 {
        return;
    }

    let key = match DataKey::from_slice(&data[..DATA_KEY_SIZE]) {
        Ok(key) => key,
        Err(_) => return,
    };
    let mode = CryptoMode::ALL[data[DATA_KEY_SIZE] as usize % CryptoMode::ALL.len()];
    let payload = &data[DATA_KEY_SIZE + 1..];

    if let Ok(ciphertext) = encrypt(mode, &key, ObjectHeader::random(0), payload) {
        let plaintext = decrypt(mode, &key, &ciphertext).expect("own ciphertext must decrypt");
        assert_eq!(payload, plaintext.as_slice());
    }
});
