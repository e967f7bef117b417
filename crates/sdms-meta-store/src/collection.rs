//! Typed record collections.
//!
//! A [`Collection`] is one redb table keyed by the record's natural key with
//! bincode-encoded values. Reads take a read transaction; every mutating
//! operation (including the conditional ones) runs inside one write
//! transaction, which redb serializes, so a read-and-claim can never
//! interleave with another writer.

use crate::store::MetaStoreResult;
use redb::{Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::error;

type RawTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// A stored document with a unique natural key
pub trait Record: Serialize + DeserializeOwned {
    /// Natural key, unique within the collection
    fn key(&self) -> String;
}

/// Result of a conditional insert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same key exists; it was left untouched
    AlreadyExists,
}

/// Result of an upsert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Decision returned by a find-and-modify closure
#[derive(Debug)]
pub enum Change<T> {
    Keep,
    Put(T),
    Delete,
}

/// Result of an unordered bulk insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertManyReport<T> {
    pub inserted: usize,
    /// Records skipped because a record with the same key already existed
    pub already_exists: Vec<T>,
}

impl<T> Default for InsertManyReport<T> {
    fn default() -> Self {
        Self {
            inserted: 0,
            already_exists: Vec::new(),
        }
    }
}

/// Handle to one collection. Cheap to clone.
pub struct Collection<T> {
    db: Arc<Database>,
    name: Arc<str>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            name: Arc::clone(&self.name),
            _record: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

impl<T: Record> Collection<T> {
    pub(crate) fn new(db: Arc<Database>, name: impl Into<Arc<str>>) -> Self {
        Self {
            db,
            name: name.into(),
            _record: PhantomData,
        }
    }

    /// Collection name (redb table name)
    pub fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.name)
    }

    /// Create the backing table if it does not exist
    pub(crate) fn ensure_table(&self) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let _t = write_txn.open_table(self.definition())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ---- Reads ----

    pub fn get(&self, key: &str) -> MetaStoreResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;
        load(&table, key)
    }

    pub fn contains(&self, key: &str) -> MetaStoreResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;
        let found = table.get(key)?.is_some();
        Ok(found)
    }

    /// All records matching `pred`, in key order
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> MetaStoreResult<Vec<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;
        let mut result = Vec::new();
        scan(&self.name, &table, |_, record: T| {
            if pred(&record) {
                result.push(record);
            }
            true
        })?;
        Ok(result)
    }

    pub fn all(&self) -> MetaStoreResult<Vec<T>> {
        self.find(|_| true)
    }

    /// First record (in key order) matching `pred`
    pub fn find_one(&self, pred: impl Fn(&T) -> bool) -> MetaStoreResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;
        let mut found = None;
        scan(&self.name, &table, |_, record: T| {
            if pred(&record) {
                found = Some(record);
                return false;
            }
            true
        })?;
        Ok(found)
    }

    pub fn count(&self) -> MetaStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;
        Ok(table.len()?)
    }

    pub fn count_where(&self, pred: impl Fn(&T) -> bool) -> MetaStoreResult<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;
        let mut n = 0;
        scan(&self.name, &table, |_, record: T| {
            if pred(&record) {
                n += 1;
            }
            true
        })?;
        Ok(n)
    }

    /// Sum of `value` over the records matching `pred`
    pub fn sum(&self, pred: impl Fn(&T) -> bool, value: impl Fn(&T) -> u64) -> MetaStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;
        let mut total = 0u64;
        scan(&self.name, &table, |_, record: T| {
            if pred(&record) {
                total = total.saturating_add(value(&record));
            }
            true
        })?;
        Ok(total)
    }

    /// Distinct projections of the records matching `pred`
    pub fn distinct<V: Ord>(
        &self,
        pred: impl Fn(&T) -> bool,
        project: impl Fn(&T) -> V,
    ) -> MetaStoreResult<BTreeSet<V>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;
        let mut values = BTreeSet::new();
        scan(&self.name, &table, |_, record: T| {
            if pred(&record) {
                values.insert(project(&record));
            }
            true
        })?;
        Ok(values)
    }

    // ---- Writes ----

    /// Insert unless a record with the same key exists
    pub fn insert(&self, record: &T) -> MetaStoreResult<InsertOutcome> {
        let key = record.key();
        self.write(|table| {
            if table.get(key.as_str())?.is_some() {
                return Ok(InsertOutcome::AlreadyExists);
            }
            store(table, &key, record)?;
            Ok(InsertOutcome::Inserted)
        })
    }

    /// Unordered bulk insert: existing keys are skipped and reported, the
    /// rest of the batch is still written.
    pub fn insert_many(
        &self,
        records: impl IntoIterator<Item = T>,
    ) -> MetaStoreResult<InsertManyReport<T>> {
        self.write(|table| {
            let mut report = InsertManyReport::default();
            for record in records {
                let key = record.key();
                if table.get(key.as_str())?.is_some() {
                    report.already_exists.push(record);
                    continue;
                }
                store(table, &key, &record)?;
                report.inserted += 1;
            }
            Ok(report)
        })
    }

    /// Insert or replace
    pub fn put(&self, record: &T) -> MetaStoreResult<()> {
        let key = record.key();
        self.write(|table| store(table, &key, record))
    }

    /// Upsert with set-on-insert semantics: `on_insert` builds the body only
    /// when no record exists; `update` is applied in both cases.
    pub fn upsert(
        &self,
        key: &str,
        on_insert: impl FnOnce() -> T,
        update: impl FnOnce(&mut T),
    ) -> MetaStoreResult<(UpsertOutcome, T)> {
        self.write(|table| {
            let (outcome, mut record) = match load(&*table, key)? {
                Some(existing) => (UpsertOutcome::Updated, existing),
                None => (UpsertOutcome::Inserted, on_insert()),
            };
            update(&mut record);
            store(table, key, &record)?;
            Ok((outcome, record))
        })
    }

    /// Atomic find-and-modify on one key
    pub fn modify<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<T>) -> (Change<T>, R),
    ) -> MetaStoreResult<R> {
        self.write(|table| {
            let current = load(&*table, key)?;
            let (change, result) = f(current);
            match change {
                Change::Keep => {}
                Change::Put(record) => store(table, key, &record)?,
                Change::Delete => {
                    table.remove(key)?;
                }
            }
            Ok(result)
        })
    }

    /// Update an existing record; returns the updated record, `None` if absent
    pub fn update_one(&self, key: &str, f: impl FnOnce(&mut T)) -> MetaStoreResult<Option<T>>
    where
        T: Clone,
    {
        self.modify(key, |current| match current {
            Some(mut record) => {
                f(&mut record);
                let updated = record.clone();
                (Change::Put(record), Some(updated))
            }
            None => (Change::Keep, None),
        })
    }

    /// Apply `f` to every record matching `pred`; returns the number touched
    pub fn update_many(&self, pred: impl Fn(&T) -> bool, mut f: impl FnMut(&mut T)) -> MetaStoreResult<usize> {
        self.write(|table| {
            let mut matched = Vec::new();
            scan(&self.name, &*table, |key, record: T| {
                if pred(&record) {
                    matched.push((key.to_string(), record));
                }
                true
            })?;
            let n = matched.len();
            for (key, mut record) in matched {
                f(&mut record);
                store(table, &key, &record)?;
            }
            Ok(n)
        })
    }

    /// Returns `false` if the record was already gone
    pub fn delete(&self, key: &str) -> MetaStoreResult<bool> {
        self.write(|table| Ok(table.remove(key)?.is_some()))
    }

    /// Remove and return a record
    pub fn take(&self, key: &str) -> MetaStoreResult<Option<T>> {
        self.modify(key, |current| match current {
            Some(record) => (Change::Delete, Some(record)),
            None => (Change::Keep, None),
        })
    }

    pub fn delete_many(&self, pred: impl Fn(&T) -> bool) -> MetaStoreResult<usize> {
        self.write(|table| {
            let mut keys = Vec::new();
            scan(&self.name, &*table, |key, record: T| {
                if pred(&record) {
                    keys.push(key.to_string());
                }
                true
            })?;
            for key in &keys {
                table.remove(key.as_str())?;
            }
            Ok(keys.len())
        })
    }

    /// Claim the matching record with the lowest `order` and mutate it in the
    /// same transaction. Concurrent claimers never receive the same record
    /// as long as `claim` makes it stop matching `pred`.
    pub fn claim_first<K: Ord>(
        &self,
        pred: impl Fn(&T) -> bool,
        order: impl Fn(&T) -> K,
        claim: impl FnOnce(&mut T),
    ) -> MetaStoreResult<Option<T>> {
        self.write(|table| {
            let mut best: Option<(K, String, T)> = None;
            scan(&self.name, &*table, |key, record: T| {
                if pred(&record) {
                    let rank = order(&record);
                    if best.as_ref().is_none_or(|(current, _, _)| rank < *current) {
                        best = Some((rank, key.to_string(), record));
                    }
                }
                true
            })?;
            let Some((_, key, mut record)) = best else {
                return Ok(None);
            };
            claim(&mut record);
            let bytes = bincode::serialize(&record)?;
            table.insert(key.as_str(), bytes.as_slice())?;
            Ok(Some(record))
        })
    }

    /// Move every record into `dest` (converted by `convert`) in one
    /// transaction; returns the number moved
    pub fn drain_into<U: Record>(
        &self,
        dest: &Collection<U>,
        mut convert: impl FnMut(T) -> U,
    ) -> MetaStoreResult<usize> {
        let write_txn = self.db.begin_write()?;
        let moved = {
            let mut source = write_txn.open_table(self.definition())?;
            let mut target = write_txn.open_table(dest.definition())?;
            let mut records = Vec::new();
            scan(&self.name, &source, |key, record: T| {
                records.push((key.to_string(), record));
                true
            })?;
            let moved = records.len();
            for (key, record) in records {
                source.remove(key.as_str())?;
                let record = convert(record);
                store(&mut target, &record.key(), &record)?;
            }
            moved
        };
        write_txn.commit()?;
        Ok(moved)
    }

    fn write<R>(&self, f: impl FnOnce(&mut RawTable<'_>) -> MetaStoreResult<R>) -> MetaStoreResult<R> {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(self.definition())?;
            f(&mut table)?
        };
        write_txn.commit()?;
        Ok(result)
    }
}

// ---- Table helpers ----

fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> MetaStoreResult<Option<T>> {
    match table.get(key)? {
        Some(guard) => Ok(Some(bincode::deserialize(guard.value())?)),
        None => Ok(None),
    }
}

fn store<T: Serialize>(table: &mut RawTable<'_>, key: &str, record: &T) -> MetaStoreResult<()> {
    let bytes = bincode::serialize(record)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

/// Visit decoded records in key order until `visit` returns `false`.
/// Undecodable entries are logged and skipped.
fn scan<T: DeserializeOwned>(
    name: &str,
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    mut visit: impl FnMut(&str, T) -> bool,
) -> MetaStoreResult<()> {
    for entry in table.iter()? {
        let (key, value) = entry?;
        match bincode::deserialize::<T>(value.value()) {
            Ok(record) => {
                if !visit(key.value(), record) {
                    break;
                }
            }
            Err(e) => error!("Failed to decode entry '{}' in {}: {}", key.value(), name, e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        path: String,
        order: Option<u32>,
        claimed: bool,
    }

    impl Record for Job {
        fn key(&self) -> String {
            self.path.clone()
        }
    }

    fn job(path: &str, order: Option<u32>) -> Job {
        Job {
            path: path.to_string(),
            order,
            claimed: false,
        }
    }

    fn collection(dir: &std::path::Path) -> Collection<Job> {
        let db = Arc::new(Database::create(dir.join("test.redb")).unwrap());
        let coll = Collection::new(db, "jobs");
        coll.ensure_table().unwrap();
        coll
    }

    #[test]
    fn test_insert_reports_existing() {
        let dir = tempdir().unwrap();
        let coll = collection(dir.path());

        assert_eq!(coll.insert(&job("a", None)).unwrap(), InsertOutcome::Inserted);
        let mut other = job("a", Some(1));
        other.claimed = true;
        assert_eq!(coll.insert(&other).unwrap(), InsertOutcome::AlreadyExists);
        assert_eq!(coll.get("a").unwrap().unwrap(), job("a", None));
    }

    #[test]
    fn test_insert_many_is_unordered() {
        let dir = tempdir().unwrap();
        let coll = collection(dir.path());
        coll.insert(&job("b", None)).unwrap();

        let report = coll
            .insert_many(vec![job("a", None), job("b", Some(3)), job("c", None)])
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.already_exists, vec![job("b", Some(3))]);
        assert_eq!(coll.get("b").unwrap().unwrap().order, None);
        assert_eq!(coll.count().unwrap(), 3);
    }

    #[test]
    fn test_upsert_sets_body_on_insert_only() {
        let dir = tempdir().unwrap();
        let coll = collection(dir.path());

        let (outcome, first) = coll
            .upsert("a", || job("a", Some(7)), |j| j.claimed = true)
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(first.order, Some(7));

        let (outcome, second) = coll
            .upsert("a", || job("a", Some(99)), |j| j.claimed = false)
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(second.order, Some(7));
        assert!(!second.claimed);
    }

    #[test]
    fn test_delete_twice_is_not_an_error() {
        let dir = tempdir().unwrap();
        let coll = collection(dir.path());
        coll.insert(&job("a", None)).unwrap();

        assert!(coll.delete("a").unwrap());
        assert!(!coll.delete("a").unwrap());
        assert!(coll.take("a").unwrap().is_none());
    }

    #[test]
    fn test_claim_first_follows_order() {
        let dir = tempdir().unwrap();
        let coll = collection(dir.path());
        coll.insert_many(vec![job("x", Some(2)), job("y", Some(0)), job("z", None)])
            .unwrap();

        let mut claimed = Vec::new();
        while let Some(j) = coll
            .claim_first(|j| !j.claimed, |j| j.order.unwrap_or(u32::MAX), |j| j.claimed = true)
            .unwrap()
        {
            claimed.push(j.path);
        }
        assert_eq!(claimed, vec!["y", "x", "z"]);
        assert_eq!(coll.count_where(|j| j.claimed).unwrap(), 3);
    }

    #[test]
    fn test_update_and_delete_many() {
        let dir = tempdir().unwrap();
        let coll = collection(dir.path());
        coll.insert_many((0..5).map(|i| job(&format!("p{i}"), Some(i))))
            .unwrap();

        let n = coll.update_many(|j| j.order >= Some(3), |j| j.claimed = true).unwrap();
        assert_eq!(n, 2);
        assert_eq!(coll.sum(|j| j.claimed, |j| u64::from(j.order.unwrap())).unwrap(), 7);
        assert_eq!(coll.delete_many(|j| j.claimed).unwrap(), 2);
        assert_eq!(coll.count().unwrap(), 3);
        assert_eq!(coll.distinct(|_| true, |j| j.claimed).unwrap().len(), 1);
    }

    #[test]
    fn test_drain_into_moves_everything() {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::create(dir.path().join("test.redb")).unwrap());
        let source: Collection<Job> = Collection::new(Arc::clone(&db), "source");
        let dest: Collection<Job> = Collection::new(db, "dest");
        source.ensure_table().unwrap();
        dest.ensure_table().unwrap();
        source.insert_many(vec![job("a", None), job("b", None)]).unwrap();

        let moved = source
            .drain_into(&dest, |mut j| {
                j.claimed = true;
                j
            })
            .unwrap();
        assert_eq!(moved, 2);
        assert_eq!(source.count().unwrap(), 0);
        assert!(dest.get("b").unwrap().unwrap().claimed);
    }
}
