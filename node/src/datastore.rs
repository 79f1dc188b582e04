//! Key/value storage backing a DHT node.
//!
//! [`Datastore`] is the single-owner interface (writes take `&mut self`);
//! [`ThreadSafeDatastore`] is what a running node needs, since requests from
//! other peers and local lookups touch the store concurrently. Wrap any
//! `Datastore` in a [`MutexDatastore`] to get the latter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatastoreError {
    #[error("datastore backend failure: {0}")]
    Backend(String),
}

pub type DsResult<T> = std::result::Result<T, DatastoreError>;

pub trait Datastore: Send + 'static {
    fn get(&self, key: &str) -> DsResult<Option<Vec<u8>>>;

    fn put(&mut self, key: &str, value: Vec<u8>) -> DsResult<()>;

    fn delete(&mut self, key: &str) -> DsResult<()>;

    /// All keys starting with `prefix`, in ascending order.
    fn keys(&self, prefix: &str) -> DsResult<Vec<String>>;

    fn has(&self, key: &str) -> DsResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Whether the store already tolerates concurrent access on its own.
    fn is_concurrency_safe(&self) -> bool {
        false
    }

    /// Hands out the concurrent view of a store that reports
    /// [`is_concurrency_safe`](Datastore::is_concurrency_safe); any other store
    /// is given back unchanged.
    fn into_shared(self: Box<Self>) -> Result<SharedDatastore, Box<dyn Datastore>>;
}

pub trait ThreadSafeDatastore: Send + Sync + 'static {
    fn get(&self, key: &str) -> DsResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: Vec<u8>) -> DsResult<()>;

    fn delete(&self, key: &str) -> DsResult<()>;

    fn keys(&self, prefix: &str) -> DsResult<Vec<String>>;

    fn has(&self, key: &str) -> DsResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

pub type SharedDatastore = Arc<dyn ThreadSafeDatastore>;

/// In-memory, non-persistent datastore.
#[derive(Debug, Default, Clone)]
pub struct MapDatastore {
    values: BTreeMap<String, Vec<u8>>,
}

impl MapDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for MapDatastore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Datastore for MapDatastore {
    fn get(&self, key: &str) -> DsResult<Option<Vec<u8>>> {
        Ok(self.values.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> DsResult<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> DsResult<()> {
        self.values.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> DsResult<Vec<String>> {
        Ok(self
            .values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn into_shared(self: Box<Self>) -> Result<SharedDatastore, Box<dyn Datastore>> {
        Err(self)
    }
}

impl Datastore for Box<dyn Datastore> {
    fn get(&self, key: &str) -> DsResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> DsResult<()> {
        (**self).put(key, value)
    }

    fn delete(&mut self, key: &str) -> DsResult<()> {
        (**self).delete(key)
    }

    fn keys(&self, prefix: &str) -> DsResult<Vec<String>> {
        (**self).keys(prefix)
    }

    fn is_concurrency_safe(&self) -> bool {
        (**self).is_concurrency_safe()
    }

    fn into_shared(self: Box<Self>) -> Result<SharedDatastore, Box<dyn Datastore>> {
        <dyn Datastore as Datastore>::into_shared(*self)
    }
}

/// Adapts a [`SharedDatastore`] to the single-owner [`Datastore`] interface,
/// so an already concurrent store can be passed wherever a `Datastore` is
/// expected. Writes go straight through the shared `&self` interface.
#[derive(Clone)]
pub struct SharedStore(SharedDatastore);

impl SharedStore {
    pub fn new(store: SharedDatastore) -> Self {
        Self(store)
    }

    pub fn inner(&self) -> &SharedDatastore {
        &self.0
    }
}

impl From<SharedDatastore> for SharedStore {
    fn from(store: SharedDatastore) -> Self {
        Self(store)
    }
}

impl Datastore for SharedStore {
    fn get(&self, key: &str) -> DsResult<Option<Vec<u8>>> {
        self.0.get(key)
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> DsResult<()> {
        self.0.put(key, value)
    }

    fn delete(&mut self, key: &str) -> DsResult<()> {
        self.0.delete(key)
    }

    fn keys(&self, prefix: &str) -> DsResult<Vec<String>> {
        self.0.keys(prefix)
    }

    fn is_concurrency_safe(&self) -> bool {
        true
    }

    fn into_shared(self: Box<Self>) -> Result<SharedDatastore, Box<dyn Datastore>> {
        Ok(self.0)
    }
}

/// Serializes every operation on the wrapped store behind a mutex.
#[derive(Debug, Default)]
pub struct MutexDatastore<D> {
    inner: Mutex<D>,
}

impl<D: Datastore> MutexDatastore<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn shared(inner: D) -> SharedDatastore {
        Arc::new(Self::new(inner))
    }

    pub fn into_inner(self) -> D {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    // A panic while holding the lock cannot leave a half-applied write for
    // these stores, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, D> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: Datastore> ThreadSafeDatastore for MutexDatastore<D> {
    fn get(&self, key: &str) -> DsResult<Option<Vec<u8>>> {
        self.lock().get(key)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> DsResult<()> {
        self.lock().put(key, value)
    }

    fn delete(&self, key: &str) -> DsResult<()> {
        self.lock().delete(key)
    }

    fn keys(&self, prefix: &str) -> DsResult<Vec<String>> {
        self.lock().keys(prefix)
    }

    fn has(&self, key: &str) -> DsResult<bool> {
        self.lock().has(key)
    }
}
