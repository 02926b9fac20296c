use encryption::mode::DEFAULT_BLOCK_SIZE;
use encryption::{
    decrypt, encrypt, init_key_files, load_data_key, ByteRange, CryptoMode, DataKey,
    EncryptionError, FileSource, KmsConfig, ObjectHeader, StreamDecryptor,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn key() -> DataKey {
    DataKey::from_bytes([0x5Au8; 32])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn round_trip_any_length(
        len in 0usize..(3 * DEFAULT_BLOCK_SIZE + 40),
        seed in any::<u8>(),
        stream_id in any::<u32>(),
        salt in any::<[u8; 16]>(),
    ) {
        let plaintext: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(seed | 1)).collect();
        for mode in CryptoMode::ALL {
            let header = ObjectHeader::new(stream_id, salt);
            let sealed = encrypt(mode, &key(), header, &plaintext).unwrap();
            prop_assert_eq!(decrypt(mode, &key(), &sealed).unwrap(), plaintext.clone());
        }
    }
}

#[test]
fn random_cuts_partition_gcm_records() {
    let mode = CryptoMode::AesGcmCtrV1;
    let plaintext: Vec<u8> = (0..(7 * DEFAULT_BLOCK_SIZE + 333))
        .map(|i| (i % 239) as u8)
        .collect();
    let sealed = encrypt(mode, &key(), ObjectHeader::random(9), &plaintext).unwrap();
    let decryptor = StreamDecryptor::new(sealed.as_slice(), mode, &key()).unwrap();
    let len = decryptor.object_len();

    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..20 {
        let mut cuts: Vec<u64> = (0..rng.random_range(1..6))
            .map(|_| rng.random_range(0..=len))
            .collect();
        cuts.push(0);
        cuts.push(len);
        cuts.sort_unstable();

        let mut joined = Vec::new();
        let mut records = 0;
        for pair in cuts.windows(2) {
            let range = ByteRange::new(pair[0], pair[1]).unwrap();
            records += decryptor.owned_records(range).count() as u64;
            joined.extend(decryptor.decrypt_range(range).unwrap());
        }
        assert_eq!(records, decryptor.record_count());
        assert_eq!(joined, plaintext, "cuts {cuts:?}");
    }
}

#[test]
fn key_files_to_file_source() {
    let dir = tempfile::tempdir().unwrap();
    let primary = dir.path().join("primary");
    let data = dir.path().join("data");
    let config = KmsConfig::simple("ledger", "ledger-secret", &primary, &data);
    let kms = config.build_service().unwrap();

    init_key_files(kms.as_ref(), config.app_id(), &primary, &data).unwrap();
    let key = load_data_key(kms.as_ref(), &primary, &data).unwrap();

    // another process with the same credentials recovers the same key
    let again = KmsConfig::simple("ledger", "ledger-secret", &primary, &data)
        .build_service()
        .unwrap();
    assert_eq!(load_data_key(again.as_ref(), &primary, &data).unwrap(), key);

    let object = dir.path().join("part-00000.csv.enc");
    let plaintext = b"id,name\n1,ada\n2,grace\n".repeat(2000);
    let sealed = encrypt(CryptoMode::AesCbcPkcs5Padding, &key, ObjectHeader::random(0), &plaintext);
    std::fs::write(&object, sealed.unwrap()).unwrap();

    let source = FileSource::open(&object).unwrap();
    let decryptor = StreamDecryptor::new(source, CryptoMode::AesCbcPkcs5Padding, &key).unwrap();
    assert_eq!(decryptor.decrypt_all().unwrap(), plaintext);
    assert!(matches!(
        decryptor.blocks(ByteRange::new(1, decryptor.object_len()).unwrap()),
        Err(EncryptionError::NotSplittable { .. })
    ));
}

#[test]
fn wrong_secret_cannot_load_key() {
    let dir = tempfile::tempdir().unwrap();
    let primary = dir.path().join("primary");
    let data = dir.path().join("data");
    let kms = KmsConfig::simple("app", "right", &primary, &data)
        .build_service()
        .unwrap();
    init_key_files(kms.as_ref(), "app", &primary, &data).unwrap();

    let wrong = KmsConfig::simple("app", "wrong", &primary, &data)
        .build_service()
        .unwrap();
    let err = load_data_key(wrong.as_ref(), &primary, &data).unwrap_err();
    assert!(matches!(err, EncryptionError::Unwrap(_)), "{err}");
}
