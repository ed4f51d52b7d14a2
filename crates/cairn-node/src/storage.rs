//! RocksDB-backed chain-state storage.
//!
//! Implements [`ChainStateStorage`] with one column family per table:
//! live UTXO records, tombstones, per-block unminted records, the chain of
//! headers (keyed by big-endian height) and counters. Writes made inside a
//! transaction are buffered in an overlay that reads consult first, and are
//! committed as a single [`WriteBatch`]. Writes outside a transaction commit
//! immediately.
//!
//! Tombstones are keyed by txid followed by the big-endian confirming
//! height, so all tombstones of one txid are adjacent and height-ordered.
//!
//! The committed UTXO tables are also held in memory as a [`UtxoSnapshot`],
//! loaded once at open and patched on every commit, so taking a snapshot
//! does not scan the database.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use tracing::debug;

use cairn_core::error::CairnError;
use cairn_core::traits::ChainStateStorage;
use cairn_core::types::{ChainedHeader, Hash256};
use cairn_core::utxo::{SpentTx, SpentTxKey, UnmintedTx, UnspentTx, UtxoSnapshot};

// --- Column family names ---

const CF_UNSPENT: &str = "unspent";
const CF_SPENT: &str = "spent";
const CF_UNMINTED: &str = "unminted";
const CF_HEADERS: &str = "headers";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[CF_UNSPENT, CF_SPENT, CF_UNMINTED, CF_HEADERS, CF_METADATA];

// --- Metadata keys ---

const META_UNSPENT_COUNT: &[u8] = b"unspent_count";
const META_CHAIN_LEN: &[u8] = b"chain_len";

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    unspent_txs: u64,
    chain_len: u64,
}

/// Writes staged by an open transaction. `None` values are deletes.
#[derive(Default)]
struct Overlay {
    writes: HashMap<(&'static str, Vec<u8>), Option<Vec<u8>>>,
    counters: Counters,
}

/// A decoded write to one of the UTXO tables.
enum ViewChange {
    Unspent(Hash256, Option<UnspentTx>),
    Spent(SpentTxKey, Option<SpentTx>),
    Unminted(Hash256, Option<Vec<UnmintedTx>>),
}

/// RocksDB implementation of [`ChainStateStorage`].
pub struct RocksChainStateStorage {
    db: DB,
    counters: Counters,
    overlay: Option<Overlay>,
    /// Committed UTXO tables.
    view: UtxoSnapshot,
}

impl RocksChainStateStorage {
    /// Open or create the database at `path`, creating missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CairnError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| CairnError::Storage(e.to_string()))?;

        let mut store = Self {
            db,
            counters: Counters::default(),
            overlay: None,
            view: UtxoSnapshot::default(),
        };
        store.counters = store.read_counters()?;
        store.view = UtxoSnapshot {
            unspent: Arc::new(store.scan_decoded(CF_UNSPENT, hash_key)?),
            spent: Arc::new(store.scan_decoded(CF_SPENT, spent_key)?),
            unminted: Arc::new(store.scan_decoded(CF_UNMINTED, hash_key)?),
        };
        debug!(
            path = %path.as_ref().display(),
            unspent_txs = store.counters.unspent_txs,
            spent_txs = store.view.spent.len(),
            chain_len = store.counters.chain_len,
            "opened chain-state database"
        );
        Ok(store)
    }

    // --- Internal helpers ---

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CairnError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CairnError::Storage(format!("missing column family: {name}")))
    }

    fn read_counters(&self) -> Result<Counters, CairnError> {
        Ok(Counters {
            unspent_txs: self.get_meta_u64(META_UNSPENT_COUNT)?,
            chain_len: self.get_meta_u64(META_CHAIN_LEN)?,
        })
    }

    fn get_meta_u64(&self, key: &[u8]) -> Result<u64, CairnError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self
            .db
            .get_cf(cf, key)
            .map_err(|e| CairnError::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CairnError::Storage("invalid metadata value length".into()))?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn counters(&self) -> Counters {
        self.overlay.as_ref().map(|o| o.counters).unwrap_or(self.counters)
    }

    fn set_counters(&mut self, counters: Counters) {
        match self.overlay.as_mut() {
            Some(overlay) => overlay.counters = counters,
            None => self.counters = counters,
        }
    }

    fn get(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, CairnError> {
        if let Some(staged) = self
            .overlay
            .as_ref()
            .and_then(|o| o.writes.get(&(cf, key.to_vec())))
        {
            return Ok(staged.clone());
        }
        let handle = self.cf_handle(cf)?;
        self.db
            .get_cf(handle, key)
            .map_err(|e| CairnError::Storage(e.to_string()))
    }

    fn get_decoded<T: bincode::Decode<()>>(
        &self,
        cf: &'static str,
        key: &[u8],
    ) -> Result<Option<T>, CairnError> {
        self.get(cf, key)?.map(|bytes| decode(&bytes)).transpose()
    }

    /// Stage a write, or apply it at once when no transaction is open.
    fn put(
        &mut self,
        cf: &'static str,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    ) -> Result<(), CairnError> {
        if let Some(overlay) = self.overlay.as_mut() {
            overlay.writes.insert((cf, key), value);
            return Ok(());
        }
        let change = view_change(cf, &key, value.as_deref())?;
        let mut batch = WriteBatch::default();
        self.stage(&mut batch, cf, &key, value.as_deref())?;
        self.stage_counters(&mut batch, self.counters)?;
        self.db
            .write(batch)
            .map_err(|e| CairnError::Storage(e.to_string()))?;
        apply_view_changes(&mut self.view, change);
        Ok(())
    }

    fn stage(
        &self,
        batch: &mut WriteBatch,
        cf: &str,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<(), CairnError> {
        let handle = self.cf_handle(cf)?;
        match value {
            Some(bytes) => batch.put_cf(handle, key, bytes),
            None => batch.delete_cf(handle, key),
        }
        Ok(())
    }

    fn stage_counters(&self, batch: &mut WriteBatch, counters: Counters) -> Result<(), CairnError> {
        let meta = self.cf_handle(CF_METADATA)?;
        batch.put_cf(meta, META_UNSPENT_COUNT, counters.unspent_txs.to_le_bytes());
        batch.put_cf(meta, META_CHAIN_LEN, counters.chain_len.to_le_bytes());
        Ok(())
    }

    /// Key/values of `cf` from `from` onward while `keep` holds, with staged
    /// writes in that range applied.
    fn scan_from(
        &self,
        cf: &'static str,
        from: &[u8],
        keep: impl Fn(&[u8]) -> bool,
    ) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, CairnError> {
        let handle = self.cf_handle(cf)?;
        let mut rows = BTreeMap::new();
        let mode = IteratorMode::From(from, Direction::Forward);
        for item in self.db.iterator_cf(handle, mode) {
            let (key, value) = item.map_err(|e| CairnError::Storage(e.to_string()))?;
            if !keep(&key[..]) {
                break;
            }
            rows.insert(key.to_vec(), value.to_vec());
        }
        if let Some(overlay) = self.overlay.as_ref() {
            for ((table, key), value) in &overlay.writes {
                if *table != cf || key.as_slice() < from || !keep(key.as_slice()) {
                    continue;
                }
                match value {
                    Some(bytes) => rows.insert(key.clone(), bytes.clone()),
                    None => rows.remove(key),
                };
            }
        }
        Ok(rows)
    }

    /// Every key/value of `cf`, with staged writes applied.
    fn scan(&self, cf: &'static str) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, CairnError> {
        self.scan_from(cf, &[], |_| true)
    }

    fn scan_decoded<K: Ord, T: bincode::Decode<()>>(
        &self,
        cf: &'static str,
        key_fn: fn(&[u8]) -> Result<K, CairnError>,
    ) -> Result<BTreeMap<K, T>, CairnError> {
        self.scan(cf)?
            .into_iter()
            .map(|(key, value)| Ok((key_fn(&key)?, decode(&value)?)))
            .collect()
    }

    fn exists(&self, cf: &'static str, key: &[u8]) -> Result<bool, CairnError> {
        Ok(self.get(cf, key)?.is_some())
    }

    fn adjust_unspent(&mut self, added: bool) {
        let mut counters = self.counters();
        counters.unspent_txs = if added {
            counters.unspent_txs + 1
        } else {
            counters.unspent_txs.saturating_sub(1)
        };
        self.set_counters(counters);
    }
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

fn hash_key(bytes: &[u8]) -> Result<Hash256, CairnError> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CairnError::Storage(format!("invalid key length {}", bytes.len())))?;
    Ok(Hash256(raw))
}

fn spent_key(bytes: &[u8]) -> Result<SpentTxKey, CairnError> {
    SpentTxKey::from_bytes(bytes)
        .ok_or_else(|| CairnError::Storage(format!("invalid tombstone key length {}", bytes.len())))
}

/// Decode a write to a UTXO table. Other tables have no view.
fn view_change(
    cf: &str,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<Option<ViewChange>, CairnError> {
    let change = match cf {
        CF_UNSPENT => ViewChange::Unspent(hash_key(key)?, value.map(decode).transpose()?),
        CF_SPENT => ViewChange::Spent(spent_key(key)?, value.map(decode).transpose()?),
        CF_UNMINTED => ViewChange::Unminted(hash_key(key)?, value.map(decode).transpose()?),
        _ => return Ok(None),
    };
    Ok(Some(change))
}

fn apply_view_changes(view: &mut UtxoSnapshot, changes: impl IntoIterator<Item = ViewChange>) {
    for change in changes {
        match change {
            ViewChange::Unspent(k, v) => patch(&mut view.unspent, k, v),
            ViewChange::Spent(k, v) => patch(&mut view.spent, k, v),
            ViewChange::Unminted(k, v) => patch(&mut view.unminted, k, v),
        }
    }
}

fn patch<K: Ord + Clone, V: Clone>(table: &mut Arc<BTreeMap<K, V>>, key: K, value: Option<V>) {
    let table = Arc::make_mut(table);
    match value {
        Some(v) => {
            table.insert(key, v);
        }
        None => {
            table.remove(&key);
        }
    }
}

/// Encode a height as big-endian bytes for ordered iteration.
fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

impl ChainStateStorage for RocksChainStateStorage {
    fn try_get_unspent_tx(&self, txid: &Hash256) -> Result<Option<UnspentTx>, CairnError> {
        self.get_decoded(CF_UNSPENT, txid.as_bytes())
    }

    fn try_add_unspent_tx(&mut self, unspent: UnspentTx) -> Result<bool, CairnError> {
        if self.exists(CF_UNSPENT, unspent.txid.as_bytes())? {
            return Ok(false);
        }
        self.adjust_unspent(true);
        self.put(CF_UNSPENT, unspent.txid.as_bytes().to_vec(), Some(encode(&unspent)?))?;
        Ok(true)
    }

    fn try_remove_unspent_tx(&mut self, txid: &Hash256) -> Result<bool, CairnError> {
        if !self.exists(CF_UNSPENT, txid.as_bytes())? {
            return Ok(false);
        }
        self.adjust_unspent(false);
        self.put(CF_UNSPENT, txid.as_bytes().to_vec(), None)?;
        Ok(true)
    }

    fn try_update_unspent_tx(&mut self, unspent: UnspentTx) -> Result<bool, CairnError> {
        if !self.exists(CF_UNSPENT, unspent.txid.as_bytes())? {
            return Ok(false);
        }
        self.put(CF_UNSPENT, unspent.txid.as_bytes().to_vec(), Some(encode(&unspent)?))?;
        Ok(true)
    }

    fn try_get_spent_tx(&self, key: &SpentTxKey) -> Result<Option<SpentTx>, CairnError> {
        self.get_decoded(CF_SPENT, &key.to_bytes())
    }

    fn try_find_spent_tx(
        &self,
        txid: &Hash256,
        max_height: u64,
    ) -> Result<Option<SpentTx>, CairnError> {
        let lower = SpentTxKey::new(*txid, 0).to_bytes();
        let upper = SpentTxKey::new(*txid, max_height).to_bytes();
        let rows = self.scan_from(CF_SPENT, &lower, |key| key <= upper.as_slice())?;
        rows.values().next_back().map(|bytes| decode(bytes)).transpose()
    }

    fn try_add_spent_tx(&mut self, spent: SpentTx) -> Result<bool, CairnError> {
        let key = spent.key().to_bytes();
        if self.exists(CF_SPENT, &key)? {
            return Ok(false);
        }
        self.put(CF_SPENT, key.to_vec(), Some(encode(&spent)?))?;
        Ok(true)
    }

    fn try_remove_spent_tx(&mut self, key: &SpentTxKey) -> Result<bool, CairnError> {
        let key = key.to_bytes();
        if !self.exists(CF_SPENT, &key)? {
            return Ok(false);
        }
        self.put(CF_SPENT, key.to_vec(), None)?;
        Ok(true)
    }

    fn try_get_block_unminted_txs(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<Vec<UnmintedTx>>, CairnError> {
        self.get_decoded(CF_UNMINTED, block_hash.as_bytes())
    }

    fn try_add_block_unminted_txs(
        &mut self,
        block_hash: &Hash256,
        unminted: Vec<UnmintedTx>,
    ) -> Result<bool, CairnError> {
        if self.exists(CF_UNMINTED, block_hash.as_bytes())? {
            return Ok(false);
        }
        self.put(CF_UNMINTED, block_hash.as_bytes().to_vec(), Some(encode(&unminted)?))?;
        Ok(true)
    }

    fn try_remove_block_unminted_txs(&mut self, block_hash: &Hash256) -> Result<bool, CairnError> {
        if !self.exists(CF_UNMINTED, block_hash.as_bytes())? {
            return Ok(false);
        }
        self.put(CF_UNMINTED, block_hash.as_bytes().to_vec(), None)?;
        Ok(true)
    }

    fn read_chain(&self) -> Result<Vec<ChainedHeader>, CairnError> {
        self.scan(CF_HEADERS)?
            .values()
            .map(|bytes| decode(bytes))
            .collect()
    }

    fn add_chained_header(&mut self, header: &ChainedHeader) -> Result<(), CairnError> {
        let mut counters = self.counters();
        if header.height != counters.chain_len {
            return Err(CairnError::Storage(format!(
                "header at height {} does not extend stored chain of {} headers",
                header.height, counters.chain_len
            )));
        }
        counters.chain_len += 1;
        self.set_counters(counters);
        self.put(CF_HEADERS, height_key(header.height).to_vec(), Some(encode(header)?))
    }

    fn remove_chained_header(&mut self, header: &ChainedHeader) -> Result<(), CairnError> {
        let mut counters = self.counters();
        let tip: Option<ChainedHeader> = match counters.chain_len.checked_sub(1) {
            Some(height) => self.get_decoded(CF_HEADERS, &height_key(height))?,
            None => None,
        };
        match tip {
            Some(tip) if tip.hash == header.hash => {
                counters.chain_len -= 1;
                self.set_counters(counters);
                self.put(CF_HEADERS, height_key(header.height).to_vec(), None)
            }
            _ => Err(CairnError::Storage(format!(
                "header {} is not the stored tip",
                header.hash
            ))),
        }
    }

    fn unspent_tx_count(&self) -> Result<usize, CairnError> {
        Ok(self.counters().unspent_txs as usize)
    }

    fn snapshot(&self) -> Result<UtxoSnapshot, CairnError> {
        let mut view = self.view.clone();
        if let Some(overlay) = self.overlay.as_ref() {
            let mut staged = Vec::new();
            for ((cf, key), value) in &overlay.writes {
                staged.extend(view_change(cf, key, value.as_deref())?);
            }
            apply_view_changes(&mut view, staged);
        }
        Ok(view)
    }

    fn begin_transaction(&mut self) -> Result<(), CairnError> {
        if self.overlay.is_some() {
            return Err(CairnError::Storage("transaction already open".into()));
        }
        self.overlay = Some(Overlay {
            writes: HashMap::new(),
            counters: self.counters,
        });
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), CairnError> {
        let overlay = self
            .overlay
            .take()
            .ok_or_else(|| CairnError::Storage("commit without transaction".into()))?;
        let mut batch = WriteBatch::default();
        let mut changes = Vec::new();
        for ((cf, key), value) in &overlay.writes {
            self.stage(&mut batch, cf, key, value.as_deref())?;
            changes.extend(view_change(cf, key, value.as_deref())?);
        }
        self.stage_counters(&mut batch, overlay.counters)?;
        self.db
            .write(batch)
            .map_err(|e| CairnError::Storage(e.to_string()))?;
        self.counters = overlay.counters;
        apply_view_changes(&mut self.view, changes);
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<(), CairnError> {
        self.overlay
            .take()
            .map(|_| ())
            .ok_or_else(|| CairnError::Storage("rollback without transaction".into()))
    }

    fn in_transaction(&self) -> bool {
        self.overlay.is_some()
    }
}
