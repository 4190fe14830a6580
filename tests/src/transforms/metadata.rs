use lunaris_tests::{fixtures, init_tracing};
use lunaris_transform::metadata::{CffMetadata, BLOCK_RECORD_LEN, HEADER_LEN, METADATA_MAGIC};
use lunaris_transform::{flatten, ObfuscationFlags};
use lunaris_utils::errors::MetadataError;
use lunaris_utils::log::DebugLog;

fn flattened_metadata(flags: ObfuscationFlags, seed: u32) -> CffMetadata {
    init_tracing();
    let mut proto = fixtures::switch(5);
    flatten(&mut proto, flags, seed, &mut DebugLog::disabled())
        .unwrap()
        .metadata
        .unwrap()
}

fn put_i32(bytes: &mut [u8], at: usize, value: i32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[test]
fn survives_serialization() {
    let meta = flattened_metadata(
        ObfuscationFlags::CFF | ObfuscationFlags::BLOCK_SHUFFLE | ObfuscationFlags::STATE_ENCODE,
        0xA5A5,
    );
    let bytes = meta.serialize().unwrap();
    assert_eq!(bytes.len(), HEADER_LEN + meta.num_blocks * BLOCK_RECORD_LEN);
    assert_eq!(CffMetadata::deserialize(&bytes).unwrap(), meta);

    let json = serde_json::to_string(&meta).unwrap();
    assert_eq!(serde_json::from_str::<CffMetadata>(&json).unwrap(), meta);
}

#[test]
fn records_the_function_layout() {
    let meta = flattened_metadata(ObfuscationFlags::CFF, 1);
    assert_eq!(meta.num_blocks, 12);
    assert_eq!(meta.state_reg, 2);
    assert_eq!(meta.seed, 1);
    let mapping = meta.block_mapping();
    assert_eq!(mapping[0], 0);
    assert!(mapping.windows(2).all(|w| w[0] < w[1]));
    assert!(meta.blocks[0].is_entry);
}

#[test]
fn decodes_every_shuffled_state() {
    let flags = ObfuscationFlags::CFF | ObfuscationFlags::BLOCK_SHUFFLE | ObfuscationFlags::STATE_ENCODE;
    let meta = flattened_metadata(flags, 77);
    for block in &meta.blocks {
        let code = lunaris_transform::state::encode_state(block.state_id, meta.seed);
        assert_eq!(meta.decode_state(code, flags), Some(block.state_id));
    }
    // decoy states are not in the table
    let decoy = lunaris_transform::state::encode_state(meta.num_blocks + 1, meta.seed);
    assert_eq!(meta.decode_state(decoy, flags), None);
}

#[test]
fn rejects_malformed_headers() {
    let good = flattened_metadata(ObfuscationFlags::CFF, 2).serialize().unwrap();

    assert_eq!(
        CffMetadata::deserialize(&good[..HEADER_LEN - 1]),
        Err(MetadataError::Truncated {
            expected: HEADER_LEN,
            actual: HEADER_LEN - 1
        })
    );

    let mut bad = good.clone();
    bad[0] ^= 0xFF;
    assert_eq!(
        CffMetadata::deserialize(&bad),
        Err(MetadataError::BadMagic(METADATA_MAGIC ^ 0xFF))
    );

    let mut bad = good.clone();
    put_i32(&mut bad, 4, 2);
    assert_eq!(
        CffMetadata::deserialize(&bad),
        Err(MetadataError::UnsupportedVersion(2))
    );

    let mut bad = good.clone();
    put_i32(&mut bad, 8, -3);
    assert_eq!(
        CffMetadata::deserialize(&bad),
        Err(MetadataError::NegativeBlockCount(-3))
    );

    // a count larger than the payload is caught before allocating
    let mut bad = good.clone();
    put_i32(&mut bad, 8, i32::MAX);
    assert!(matches!(
        CffMetadata::deserialize(&bad),
        Err(MetadataError::Truncated { .. })
    ));

    assert!(matches!(
        CffMetadata::deserialize(&good[..good.len() - 1]),
        Err(MetadataError::Truncated { .. })
    ));
}

#[test]
fn rejects_inconsistent_blocks() {
    let good = flattened_metadata(ObfuscationFlags::CFF, 2).serialize().unwrap();
    let record = |index: usize, field: usize| HEADER_LEN + index * BLOCK_RECORD_LEN + field * 4;

    let cases = [
        (record(1, 0), -5, "negative pc"),
        (record(1, 1), 0, "empty pc range"),
        (record(2, 3), 99, "successor out of range"),
        (record(0, 6), 2, "flag is not 0 or 1"),
    ];
    for (at, value, reason) in cases {
        let mut bad = good.clone();
        put_i32(&mut bad, at, value);
        let err = CffMetadata::deserialize(&bad).unwrap_err();
        assert!(
            matches!(err, MetadataError::InvalidBlock { reason: r, .. } if r == reason),
            "{reason}: got {err:?}"
        );
    }
}
