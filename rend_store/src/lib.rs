//! Persistent record store backed by redb.
//!
//! Records live in a single ordered byte-keyed table under the key
//! `topic_bytes || node_address`; the value holds the canonically
//! encoded record together with its absolute expiry deadline. The
//! ordered key layout gives the three access patterns the registry
//! needs from one table:
//!
//! - prefix iteration over a topic,
//! - point deletes by exact key,
//! - unbiased random sampling without scanning the whole topic, by
//!   seeking to `topic || <random suffix>` and examining the
//!   neighbouring keys.
//!
//! All redb transactions run under `spawn_blocking`.

use minicbor::{CborLen, Decode, Encode};
use rand::RngCore;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, backends::InMemoryBackend};
use rend_core::record::NODE_ADDRESS_LENGTH;
use rend_core::{EndpointRecord, StorageKey, Topic};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

/// Errors surfaced by the store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("record encoding failed: {0}")]
    Encoding(String),

    #[error("stored record is corrupt: {0}")]
    CorruptRecord(String),

    #[error("storage backend error: {0}")]
    Backend(#[from] redb::Error),

    #[error("could not prepare storage directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Backend(e.into())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Backend(e.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Backend(e.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Backend(e.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Backend(e.into())
    }
}

/// What is stored under a key: the encoded record and its deadline.
#[derive(Encode, Decode, CborLen, Debug)]
#[cbor(array)]
struct StoredEntry {
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    record: Vec<u8>,

    /// Absolute expiry deadline, unix nanoseconds.
    #[n(1)]
    deadline_ns: u64,
}

/// Outcome of [`RecordStore::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Added {
    /// Key the record was stored under.
    pub key: StorageKey,
    /// Whether an entry for the same key was overwritten.
    pub replaced: bool,
}

/// Durable store of `(topic, node address) -> (record, deadline)`.
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish()
    }
}

impl RecordStore {
    /// Opens (or creates) the store at `dir/records.redb`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("records.redb"))?;
        Self::with_database(db)
    }

    /// An in-memory store, used by tests and throwaway servers.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::with_database(db)
    }

    fn with_database(db: Database) -> Result<Self, StoreError> {
        // Ensure the table exists before the first read transaction.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS)?;
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Stores `record` under `topic` with the given absolute deadline,
    /// overwriting any previous entry for the same key (the new
    /// deadline wins).
    pub async fn add(
        &self,
        topic: &Topic,
        record: &EndpointRecord,
        deadline_ns: u64,
    ) -> Result<Added, StoreError> {
        let key = StorageKey::new(topic, record.node_address());
        let record_bytes = record
            .encode()
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        let value = minicbor::to_vec(StoredEntry {
            record: record_bytes,
            deadline_ns,
        })
        .map_err(|e| StoreError::Encoding(e.to_string()))?;

        let db = self.db.clone();
        let key_bytes = key.as_bytes().to_vec();
        let replaced = tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let write_txn = db.begin_write()?;
            let replaced;
            {
                let mut table = write_txn.open_table(RECORDS)?;
                replaced = table
                    .insert(key_bytes.as_slice(), value.as_slice())?
                    .is_some();
            }
            write_txn.commit()?;
            Ok(replaced)
        })
        .await??;

        Ok(Added { key, replaced })
    }

    /// Deletes the entry under `key`. Returns whether an entry was
    /// present; deleting a missing key is not an error.
    pub async fn remove_by_key(&self, key: &StorageKey) -> Result<bool, StoreError> {
        let db = self.db.clone();
        let key_bytes = key.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let write_txn = db.begin_write()?;
            let removed;
            {
                let mut table = write_txn.open_table(RECORDS)?;
                removed = table.remove(key_bytes.as_slice())?.is_some();
            }
            write_txn.commit()?;
            Ok(removed)
        })
        .await?
    }

    /// The deadline currently stored under `key`, if any. The cleaner
    /// uses this to drop pops for entries that have been refreshed.
    pub async fn deadline_of(&self, key: &StorageKey) -> Result<Option<u64>, StoreError> {
        let db = self.db.clone();
        let key_bytes = key.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || -> Result<Option<u64>, StoreError> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RECORDS)?;
            let Some(guard) = table.get(key_bytes.as_slice())? else {
                return Ok(None);
            };
            let entry: StoredEntry = minicbor::decode(guard.value())
                .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
            Ok(Some(entry.deadline_ns))
        })
        .await?
    }

    /// Draws up to `limit` distinct records stored under `topic`,
    /// approximately uniformly, without scanning the topic.
    ///
    /// Each attempt seeks to `topic || <random address-length suffix>`
    /// and inspects the keys at-or-after and just-before the probe;
    /// node addresses are uniformly distributed in their key space, so
    /// the neighbouring stored key is a roughly uniform pick. Checking
    /// both sides removes the bias at the lower edge of the topic's
    /// range. The attempt budget is `limit * limit` probes, so a
    /// sparsely populated topic returns fewer than `limit` records
    /// rather than looping.
    pub async fn get_random(
        &self,
        topic: &str,
        limit: usize,
    ) -> Result<Vec<EndpointRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let db = self.db.clone();
        let topic_bytes = topic.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || -> Result<Vec<EndpointRecord>, StoreError> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RECORDS)?;

            let mut rng = rand::rng();
            let mut probe = vec![0u8; topic_bytes.len() + NODE_ADDRESS_LENGTH];
            probe[..topic_bytes.len()].copy_from_slice(&topic_bytes);

            let mut seen: HashSet<Vec<u8>> = HashSet::new();
            let mut records = Vec::new();
            let budget = limit.saturating_mul(limit);

            for _ in 0..budget {
                if records.len() == limit {
                    break;
                }
                rng.fill_bytes(&mut probe[topic_bytes.len()..]);

                match probe_topic(&table, &topic_bytes, &probe, &seen)? {
                    ProbeOutcome::Hit(key, value) => {
                        seen.insert(key);
                        let entry: StoredEntry = minicbor::decode(&value)
                            .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
                        let record = EndpointRecord::decode(&entry.record)
                            .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
                        records.push(record);
                    }
                    // The probe is spent: both neighbours were either
                    // already drawn or belong to a longer topic that
                    // shares this byte prefix.
                    ProbeOutcome::Miss => continue,
                    // Neither neighbour carries the prefix: nothing is
                    // stored under this topic.
                    ProbeOutcome::Empty => break,
                }
            }
            Ok(records)
        })
        .await?
    }

    /// Visits every stored entry once with its key and deadline. Used
    /// at startup to rebuild the expiry index.
    pub async fn iterate_all<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(StorageKey, u64) + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RECORDS)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let stored: StoredEntry = minicbor::decode(value.value())
                    .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
                f(
                    StorageKey::from_bytes(key.value().to_vec()),
                    stored.deadline_ns,
                );
            }
            Ok(())
        })
        .await?
    }
}

enum ProbeOutcome {
    /// A not-yet-drawn key of this topic, with its stored value.
    Hit(Vec<u8>, Vec<u8>),
    /// The probe landed next to keys that were already drawn or belong
    /// to a longer topic sharing the prefix.
    Miss,
    /// No key carries the topic prefix at all.
    Empty,
}

/// Examines the stored keys at-or-after and just-before `probe` and
/// returns the first one that belongs to the topic and has not been
/// drawn yet, preferring the at-or-after side.
///
/// A key belongs to the topic when it carries the prefix and has the
/// exact `topic + address` length; prefix-only matches come from
/// longer topics ("a" prefixes every "ab" key) and must neither be
/// returned nor be taken as proof that the topic is populated.
/// Falling back to the other neighbour when the preferred one was
/// already drawn keeps the attempt budget effective once most of a
/// topic has been sampled.
fn probe_topic(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    topic_bytes: &[u8],
    probe: &[u8],
    seen: &HashSet<Vec<u8>>,
) -> Result<ProbeOutcome, StoreError> {
    let expected_len = topic_bytes.len() + NODE_ADDRESS_LENGTH;
    let mut prefix_seen = false;

    let mut after = table.range(probe..)?;
    if let Some(entry) = after.next() {
        let (key, value) = entry?;
        let k = key.value();
        if k.starts_with(topic_bytes) {
            prefix_seen = true;
            if k.len() == expected_len && !seen.contains(k) {
                return Ok(ProbeOutcome::Hit(k.to_vec(), value.value().to_vec()));
            }
        }
    }

    let mut before = table.range(..probe)?;
    if let Some(entry) = before.next_back() {
        let (key, value) = entry?;
        let k = key.value();
        if k.starts_with(topic_bytes) {
            prefix_seen = true;
            if k.len() == expected_len && !seen.contains(k) {
                return Ok(ProbeOutcome::Hit(k.to_vec(), value.value().to_vec()));
            }
        }
    }

    Ok(if prefix_seen {
        ProbeOutcome::Miss
    } else {
        ProbeOutcome::Empty
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn record(seed: u8) -> EndpointRecord {
        let key = SigningKey::from_bytes(&[seed; 32]);
        EndpointRecord::signed(1, Vec::new(), &key).unwrap()
    }

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    async fn count(store: &RecordStore) -> usize {
        let n = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let n2 = n.clone();
        store
            .iterate_all(move |_, _| {
                n2.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            })
            .await
            .unwrap();
        n.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[tokio::test]
    async fn add_and_sample() {
        let store = RecordStore::in_memory().unwrap();
        for seed in 0..20 {
            store.add(&topic("some"), &record(seed), 1).await.unwrap();
        }
        let records = store.get_random("some", 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].node_address(), records[1].node_address());
        for r in &records {
            assert!(r.is_signed());
        }
    }

    #[tokio::test]
    async fn sampling_is_capped_by_limit_and_distinct() {
        let store = RecordStore::in_memory().unwrap();
        for seed in 0..100 {
            store.add(&topic("a"), &record(seed), 1).await.unwrap();
        }
        let records = store.get_random("a", 10).await.unwrap();
        assert_eq!(records.len(), 10);
        let addrs: HashSet<_> = records.iter().map(|r| r.node_address()).collect();
        assert_eq!(addrs.len(), 10);
    }

    #[tokio::test]
    async fn empty_and_unknown_topics_sample_nothing() {
        let store = RecordStore::in_memory().unwrap();
        store.add(&topic("here"), &record(1), 1).await.unwrap();
        assert!(store.get_random("elsewhere", 5).await.unwrap().is_empty());
        assert!(store.get_random("", 5).await.unwrap().is_empty());
        assert!(store.get_random("here", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn topics_are_isolated_even_when_one_prefixes_another() {
        let store = RecordStore::in_memory().unwrap();
        let mut a_addrs = HashSet::new();
        let mut ab_addrs = HashSet::new();
        for seed in 0..5 {
            let r = record(seed);
            a_addrs.insert(r.node_address());
            store.add(&topic("a"), &r, 1).await.unwrap();

            let r = record(seed + 10);
            ab_addrs.insert(r.node_address());
            store.add(&topic("ab"), &r, 1).await.unwrap();
        }

        let a = store.get_random("a", 5).await.unwrap();
        assert!(!a.is_empty());
        for r in &a {
            assert!(a_addrs.contains(&r.node_address()));
        }

        let ab = store.get_random("ab", 5).await.unwrap();
        assert!(!ab.is_empty());
        for r in &ab {
            assert!(ab_addrs.contains(&r.node_address()));
        }
    }

    #[tokio::test]
    async fn overwrite_keeps_one_entry_with_the_new_deadline() {
        let store = RecordStore::in_memory().unwrap();
        let r = record(3);

        let first = store.add(&topic("t"), &r, 100).await.unwrap();
        assert!(!first.replaced);
        let second = store.add(&topic("t"), &r, 200).await.unwrap();
        assert!(second.replaced);
        assert_eq!(first.key, second.key);

        assert_eq!(count(&store).await, 1);
        assert_eq!(store.deadline_of(&first.key).await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = RecordStore::in_memory().unwrap();
        let added = store.add(&topic("t"), &record(4), 1).await.unwrap();

        assert!(store.remove_by_key(&added.key).await.unwrap());
        assert!(!store.remove_by_key(&added.key).await.unwrap());
        assert_eq!(store.deadline_of(&added.key).await.unwrap(), None);
        assert_eq!(count(&store).await, 0);
    }

    #[tokio::test]
    async fn iterate_all_reports_keys_and_deadlines() {
        let store = RecordStore::in_memory().unwrap();
        let a = store.add(&topic("x"), &record(5), 111).await.unwrap();
        let b = store.add(&topic("y"), &record(6), 222).await.unwrap();

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        store
            .iterate_all(move |key, deadline| {
                seen2.lock().unwrap().push((key, deadline));
            })
            .await
            .unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by(|(_, d1), (_, d2)| d1.cmp(d2));
        assert_eq!(seen, vec![(a.key, 111), (b.key, 222)]);
    }

    #[tokio::test]
    async fn corrupt_values_are_reported_not_skipped() {
        let store = RecordStore::in_memory().unwrap();
        let added = store.add(&topic("t"), &record(7), 1).await.unwrap();

        let write_txn = store.db.begin_write().unwrap();
        {
            let mut table = write_txn.open_table(RECORDS).unwrap();
            table
                .insert(added.key.as_bytes(), b"garbage".as_slice())
                .unwrap();
        }
        write_txn.commit().unwrap();

        assert!(matches!(
            store.get_random("t", 1).await,
            Err(StoreError::CorruptRecord(_))
        ));
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let added = {
            let store = RecordStore::open(dir.path()).unwrap();
            store.add(&topic("t"), &record(8), 42).await.unwrap()
        };
        let store = RecordStore::open(dir.path()).unwrap();
        assert_eq!(store.deadline_of(&added.key).await.unwrap(), Some(42));
    }
}
