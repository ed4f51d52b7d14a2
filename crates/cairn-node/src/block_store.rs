//! RocksDB block source.
//!
//! Headers are keyed by block hash; transactions by `block_hash || index(BE)`
//! so a block's transactions are one prefix scan in order. Blocks stay
//! readable after they leave the active chain, which rollback replay needs.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, DB, Options, SliceTransform, WriteBatch};

use cairn_core::error::{CairnError, MissingDataError};
use cairn_core::merkle::merkle_root;
use cairn_core::traits::BlockTxSource;
use cairn_core::types::{ChainedHeader, Hash256, Transaction};

const CF_HEADERS: &str = "block_headers";
const CF_TRANSACTIONS: &str = "block_transactions";

const ALL_CFS: &[&str] = &[CF_HEADERS, CF_TRANSACTIONS];

/// Persistent store of blocks by hash.
pub struct RocksBlockStore {
    db: DB,
}

impl RocksBlockStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CairnError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                // 32-byte block hash prefix on transaction keys.
                if *name == CF_TRANSACTIONS {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(32));
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| CairnError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    /// Store `header` and its ordered transactions. Re-adding a block overwrites it.
    pub fn add_block(&self, header: &ChainedHeader, txs: &[Transaction]) -> Result<(), CairnError> {
        let headers = self.cf_handle(CF_HEADERS)?;
        let transactions = self.cf_handle(CF_TRANSACTIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(headers, header.hash.as_bytes(), encode(header)?);
        for (i, tx) in txs.iter().enumerate() {
            batch.put_cf(transactions, tx_key(&header.hash, i as u32), encode(tx)?);
        }
        self.db
            .write(batch)
            .map_err(|e| CairnError::Storage(e.to_string()))
    }

    pub fn contains(&self, block_hash: &Hash256) -> Result<bool, CairnError> {
        Ok(self.try_get_block_header(block_hash)?.is_some())
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CairnError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CairnError::Storage(format!("missing column family: {name}")))
    }
}

fn tx_key(block_hash: &Hash256, tx_index: u32) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[0..32].copy_from_slice(block_hash.as_bytes());
    key[32..36].copy_from_slice(&tx_index.to_be_bytes());
    key
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, CairnError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CairnError::Storage(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, CairnError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| CairnError::Storage(e.to_string()))
}

impl BlockTxSource for RocksBlockStore {
    fn try_get_transaction(
        &self,
        block_hash: &Hash256,
        tx_index: u32,
    ) -> Result<Option<Arc<Transaction>>, CairnError> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        self.db
            .get_cf(cf, tx_key(block_hash, tx_index))
            .map_err(|e| CairnError::Storage(e.to_string()))?
            .map(|bytes| decode(&bytes).map(Arc::new))
            .transpose()
    }

    fn read_block_transactions(
        &self,
        block_hash: &Hash256,
        expected_root: &Hash256,
    ) -> Result<Vec<(u32, Arc<Transaction>)>, CairnError> {
        if !self.contains(block_hash)? {
            return Err(MissingDataError::Block(*block_hash).into());
        }
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let mut txs = Vec::new();
        let mut txids = Vec::new();
        for item in self.db.prefix_iterator_cf(cf, block_hash.as_bytes()) {
            let (key, value) = item.map_err(|e| CairnError::Storage(e.to_string()))?;
            if !key.starts_with(block_hash.as_bytes()) {
                break;
            }
            let index_bytes: [u8; 4] = key[32..]
                .try_into()
                .map_err(|_| {
                    CairnError::Storage(format!("invalid transaction key length {}", key.len()))
                })?;
            let tx: Transaction = decode(&value)?;
            txids.push(tx.txid()?);
            txs.push((u32::from_be_bytes(index_bytes), Arc::new(tx)));
        }
        if merkle_root(&txids) != *expected_root {
            return Err(CairnError::Consistency(format!(
                "stored transactions of block {block_hash} do not match merkle root {expected_root}"
            )));
        }
        Ok(txs)
    }

    fn try_get_block_header(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<ChainedHeader>, CairnError> {
        let cf = self.cf_handle(CF_HEADERS)?;
        self.db
            .get_cf(cf, block_hash.as_bytes())
            .map_err(|e| CairnError::Storage(e.to_string()))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}
