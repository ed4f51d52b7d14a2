//! Protocol constants.

use crate::types::Hash256;

/// Maximum serialized transaction size in bytes.
pub const MAX_TX_SIZE: usize = 100_000;

/// Maximum size of the arbitrary data carried in a coinbase input.
pub const MAX_COINBASE_DATA: usize = 100;

/// Coinbase transactions on the reference chain that are byte-identical to
/// an earlier coinbase still present in the UTXO set.
///
/// The builder neither mints nor unmints these at their listed heights.
pub const DUPLICATE_COINBASES: &[(u64, [u8; 32])] = &[
    (
        91_842,
        [
            0xd5, 0xd2, 0x79, 0x87, 0xd2, 0xa3, 0xdf, 0xc7, 0x24, 0xe3, 0x59, 0x87, 0x0c, 0x66,
            0x44, 0xb4, 0x0e, 0x49, 0x7b, 0xdc, 0x05, 0x89, 0xa0, 0x33, 0x22, 0x0f, 0xe1, 0x54,
            0x29, 0xd8, 0x85, 0x99,
        ],
    ),
    (
        91_880,
        [
            0xe3, 0xbf, 0x3d, 0x07, 0xd4, 0xb0, 0x37, 0x56, 0x38, 0xd5, 0xf1, 0xdb, 0x52, 0x55,
            0xfe, 0x07, 0xba, 0x2c, 0x4c, 0xb0, 0x67, 0xcd, 0x81, 0xb8, 0x4e, 0xe9, 0x74, 0xb6,
            0x58, 0x5f, 0xb4, 0x68,
        ],
    ),
];

/// The default allowlist as owned `(height, txid)` pairs.
pub fn default_duplicate_coinbases() -> Vec<(u64, Hash256)> {
    DUPLICATE_COINBASES
        .iter()
        .map(|&(height, txid)| (height, Hash256(txid)))
        .collect()
}

/// Returns `true` if `txid` at `height` is on the allowlist `list`.
pub fn is_duplicate_coinbase(list: &[(u64, Hash256)], height: u64, txid: &Hash256) -> bool {
    list.iter().any(|(h, id)| *h == height && id == txid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_is_height_and_hash_exact() {
        let list = default_duplicate_coinbases();
        let (height, txid) = list[0];
        assert!(is_duplicate_coinbase(&list, height, &txid));
        assert!(!is_duplicate_coinbase(&list, height + 1, &txid));
        assert!(!is_duplicate_coinbase(&list, height, &Hash256::ZERO));
        assert!(!is_duplicate_coinbase(&[], height, &txid));
    }

    #[test]
    fn owned_table_matches_const() {
        let owned = default_duplicate_coinbases();
        assert_eq!(owned.len(), 2);
        for &(height, txid) in DUPLICATE_COINBASES {
            assert!(is_duplicate_coinbase(&owned, height, &Hash256(txid)));
        }
        assert_eq!(owned[1].0, 91_880);
        assert!(owned[1].1.to_string().starts_with("e3bf3d07"));
    }
}
