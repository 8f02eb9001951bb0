//! The durable alarm registry.
//!
//! All alarms live in one JSON document (an array of records). Every mutation
//! reads the whole document, applies an id keyed replace or remove, and swaps
//! the new document in with a temp file + fsync + rename, so a reader never
//! sees a partial write and a returned `upsert` survives a crash.
//!
//! Writers are serialized by a single lock held for exactly one
//! read-modify-write cycle. Readers share the lock with each other.

use std::{
    fs,
    hash::Hash,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError, RwLock},
};

use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    alarm::{AlarmId, AlarmRecord},
    error::StoreError,
};

pub trait GetId<T> {
    fn get_id(&self) -> &T;
}

impl GetId<AlarmId> for AlarmRecord {
    fn get_id(&self) -> &AlarmId {
        &self.id
    }
}

/// Serializable collection, stored as a plain list but keyed by id in memory
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(from = "Vec<V>", into = "Vec<V>")]
pub struct Collection<K, V>
where
    K: Eq + Hash + Clone,
    V: GetId<K> + Clone,
{
    data: IndexMap<K, V>,
}

impl<K, V> Default for Collection<K, V>
where
    K: Eq + Hash + Clone,
    V: GetId<K> + Clone,
{
    fn default() -> Self {
        Self {
            data: IndexMap::new(),
        }
    }
}

impl<K, V> Collection<K, V>
where
    K: Eq + Hash + Clone,
    V: GetId<K> + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// replaces any item with the same id, keeping its position
    pub fn insert(&mut self, item: V) -> Option<V> {
        let id = item.get_id().to_owned();
        self.data.insert(id, item)
    }

    pub fn remove(&mut self, id: &K) -> Option<V> {
        self.data.shift_remove(id)
    }

    #[must_use]
    pub fn get(&self, id: &K) -> Option<&V> {
        self.data.get(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.data.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<K, V> From<Vec<V>> for Collection<K, V>
where
    K: Eq + Hash + Clone,
    V: GetId<K> + Clone,
{
    fn from(value: Vec<V>) -> Self {
        let mut obj: Self = Self::new();
        value.into_iter().for_each(|v| {
            obj.insert(v);
        });
        obj
    }
}

impl<K, V> From<Collection<K, V>> for Vec<V>
where
    K: Eq + Hash + Clone,
    V: GetId<K> + Clone,
{
    fn from(val: Collection<K, V>) -> Self {
        Self::from_iter(val.data.into_values())
    }
}

type Alarms = Collection<AlarmId, AlarmRecord>;

#[derive(Debug)]
enum Backing {
    File(PathBuf),
    Memory(Mutex<Option<String>>),
}

#[derive(Debug)]
pub struct AlarmStore {
    backing: Backing,
    lock: RwLock<()>,
}

impl AlarmStore {
    /// a store persisted at `path`. nothing is touched on disk until the first write
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            backing: Backing::File(path.into()),
            lock: RwLock::new(()),
        }
    }

    /// a store that only lives as long as the process
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory(Mutex::new(None)),
            lock: RwLock::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(path) => Some(path),
            Backing::Memory(_) => None,
        }
    }

    /// # Errors
    /// if the document can't be read. a corrupt document reads as empty
    pub fn get(&self, id: AlarmId) -> Result<Option<AlarmRecord>, StoreError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.get(&id).cloned())
    }

    /// # Errors
    /// if the document can't be read. a corrupt document reads as empty
    pub fn list_all(&self) -> Result<Vec<AlarmRecord>, StoreError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.into())
    }

    /// inserts or replaces the record with the same id, returning the replaced one
    ///
    /// # Errors
    /// if the document can't be read or written
    pub fn upsert(&self, record: AlarmRecord) -> Result<Option<AlarmRecord>, StoreError> {
        debug!("storing alarm {record}");
        self.modify(|alarms| alarms.insert(record))
    }

    /// removing an absent id is not an error
    ///
    /// # Errors
    /// if the document can't be read or written
    pub fn remove(&self, id: AlarmId) -> Result<Option<AlarmRecord>, StoreError> {
        self.modify(|alarms| alarms.remove(&id))
    }

    /// removes each given record, but only if the stored copy is still identical.
    /// a record replaced since the snapshot was taken is left alone
    ///
    /// # Errors
    /// if the document can't be read or written
    pub fn prune_if_unchanged(&self, expired: &[AlarmRecord]) -> Result<usize, StoreError> {
        if expired.is_empty() {
            return Ok(0);
        }
        self.modify(|alarms| {
            expired
                .iter()
                .filter_map(|old| {
                    if alarms.get(&old.id) == Some(old) {
                        alarms.remove(&old.id)
                    } else {
                        None
                    }
                })
                .count()
        })
    }

    fn modify<T>(&self, f: impl FnOnce(&mut Alarms) -> T) -> Result<T, StoreError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut alarms = self.load()?;
        let out = f(&mut alarms);
        self.save(alarms)?;
        Ok(out)
    }

    fn load(&self) -> Result<Alarms, StoreError> {
        let Some(raw) = self.read_raw()? else {
            return Ok(Alarms::new());
        };
        match parse(&raw) {
            Ok(alarms) => Ok(alarms),
            Err(err) => {
                warn!("{err}, starting with an empty alarm store");
                Ok(Alarms::new())
            }
        }
    }

    fn read_raw(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match &self.backing {
            // raw bytes, so a document that isn't even utf-8 still reads as corrupt
            Backing::File(path) => match fs::read(path) {
                Ok(raw) => Ok(Some(raw)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err.into()),
            },
            Backing::Memory(doc) => Ok(doc
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|raw| raw.clone().into_bytes())),
        }
    }

    fn save(&self, alarms: Alarms) -> Result<(), StoreError> {
        let records: Vec<AlarmRecord> = alarms.into();
        let doc = serde_json::to_string(&records).map_err(StoreError::Serialize)?;
        match &self.backing {
            Backing::File(path) => write_atomic(path, &doc)?,
            Backing::Memory(slot) => {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(doc);
            }
        }
        Ok(())
    }

    /// overwrites the raw document, used to simulate outside corruption
    #[cfg(test)]
    pub(crate) fn write_raw(&self, raw: &str) -> Result<(), StoreError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        match &self.backing {
            Backing::File(path) => write_atomic(path, raw)?,
            Backing::Memory(slot) => {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw.to_string());
            }
        }
        Ok(())
    }
}

fn parse(raw: &[u8]) -> Result<Alarms, StoreError> {
    serde_json::from_slice(raw).map_err(StoreError::Corrupt)
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(format!(".tmp.{}", std::process::id()));
    let temp = PathBuf::from(temp);

    let mut file = fs::File::create(&temp)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, path)
}
