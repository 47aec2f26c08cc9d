//! Transfer record storage
//!
//! Records are never deleted; they back idempotency lookups and audit. Writers go
//! through two transactional operations:
//!
//! - `insert_new` - create a record, failing if the ID already exists
//! - `compare_and_swap` - replace a record only if its status still matches
//!
//! [`MemoryStore`] is the default. [`RocksStore`] (feature `rocksdb`) persists records
//! in a RocksDB column family with bincode values.

use crate::{
    error::{Error, Result},
    types::{TransferId, TransferRecord, TransferStatus},
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::fmt;

/// Key-value repository for transfer records
pub trait TransferStore: Send + Sync + fmt::Debug {
    /// Fetch a record
    fn get(&self, id: &TransferId) -> Result<Option<TransferRecord>>;

    /// Insert a record that must not exist yet
    fn insert_new(&self, record: TransferRecord) -> Result<()>;

    /// Replace a record whose current status equals `expected`
    fn compare_and_swap(&self, expected: TransferStatus, record: TransferRecord) -> Result<()>;

    /// All records currently in `status`
    fn with_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>>;

    /// Current status (`None` when absent)
    fn status(&self, id: &TransferId) -> Result<TransferStatus> {
        Ok(self
            .get(id)?
            .map(|record| record.status)
            .unwrap_or(TransferStatus::None))
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<TransferId, TransferRecord>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl TransferStore for MemoryStore {
    fn get(&self, id: &TransferId) -> Result<Option<TransferRecord>> {
        Ok(self.records.get(id).map(|record| record.value().clone()))
    }

    fn insert_new(&self, record: TransferRecord) -> Result<()> {
        match self.records.entry(record.transfer_id) {
            Entry::Occupied(_) => Err(Error::AlreadyPrepared(record.transfer_id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn compare_and_swap(&self, expected: TransferStatus, record: TransferRecord) -> Result<()> {
        match self.records.entry(record.transfer_id) {
            Entry::Occupied(mut slot) => {
                let current = slot.get().status;
                if current != expected {
                    return Err(Error::InvalidTransition {
                        id: record.transfer_id,
                        from: current,
                        to: record.status,
                    });
                }
                slot.insert(record);
                Ok(())
            }
            Entry::Vacant(_) => Err(Error::TransferNotFound(record.transfer_id)),
        }
    }

    fn with_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::*;
    use parking_lot::Mutex;
    use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, DB};
    use std::path::Path;

    /// Column family holding transfer records (key: transfer_id)
    const CF_TRANSFERS: &str = "transfers";

    /// RocksDB-backed store
    pub struct RocksStore {
        db: DB,
        // Serializes check-then-write sequences
        write_lock: Mutex<()>,
    }

    impl fmt::Debug for RocksStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RocksStore").finish_non_exhaustive()
        }
    }

    impl RocksStore {
        /// Open or create the database
        pub fn open(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            std::fs::create_dir_all(path)?;

            let mut db_opts = Options::default();
            db_opts.create_if_missing(true);
            db_opts.create_missing_column_families(true);

            let mut cf_opts = Options::default();
            cf_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

            let db = DB::open_cf_descriptors(
                &db_opts,
                path,
                vec![ColumnFamilyDescriptor::new(CF_TRANSFERS, cf_opts)],
            )?;

            tracing::info!("Opened transfer store at {:?}", path);

            Ok(Self {
                db,
                write_lock: Mutex::new(()),
            })
        }

        fn cf(&self) -> Result<&ColumnFamily> {
            self.db
                .cf_handle(CF_TRANSFERS)
                .ok_or_else(|| Error::Storage(format!("Column family {} not found", CF_TRANSFERS)))
        }

        fn put(&self, record: &TransferRecord) -> Result<()> {
            let value = bincode::serialize(record)?;
            self.db.put_cf(self.cf()?, record.transfer_id.as_bytes(), value)?;
            Ok(())
        }
    }

    impl TransferStore for RocksStore {
        fn get(&self, id: &TransferId) -> Result<Option<TransferRecord>> {
            match self.db.get_cf(self.cf()?, id.as_bytes())? {
                Some(value) => Ok(Some(bincode::deserialize(&value)?)),
                None => Ok(None),
            }
        }

        fn insert_new(&self, record: TransferRecord) -> Result<()> {
            let _guard = self.write_lock.lock();
            if self.get(&record.transfer_id)?.is_some() {
                return Err(Error::AlreadyPrepared(record.transfer_id));
            }
            self.put(&record)
        }

        fn compare_and_swap(&self, expected: TransferStatus, record: TransferRecord) -> Result<()> {
            let _guard = self.write_lock.lock();
            let current = self
                .get(&record.transfer_id)?
                .ok_or(Error::TransferNotFound(record.transfer_id))?;
            if current.status != expected {
                return Err(Error::InvalidTransition {
                    id: record.transfer_id,
                    from: current.status,
                    to: record.status,
                });
            }
            self.put(&record)
        }

        fn with_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>> {
            let mut records = Vec::new();
            for item in self.db.iterator_cf(self.cf()?, IteratorMode::Start) {
                let (_, value) = item?;
                let record: TransferRecord = bincode::deserialize(&value)?;
                if record.status == status {
                    records.push(record);
                }
            }
            Ok(records)
        }
    }

}
