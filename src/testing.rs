//! In-memory test doubles shared across module tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::Resource;

use crate::reconcile::{Lookup, ResourceStore};
use crate::Error;

/// A write recorded by [`MemoryStore`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreCall {
    Create(String),
    Replace(String),
    Patch(String),
}

/// [`ResourceStore`] over a map, with switchable read and write failures.
///
/// Every successful write bumps a store-wide resource version.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<String, K>>,
    writes: Mutex<Vec<StoreCall>>,
    version: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording a write
    pub fn insert(&self, obj: K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.objects.lock().unwrap().insert(name, obj);
    }

    pub fn object(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn writes(&self) -> Vec<StoreCall> {
        self.writes.lock().unwrap().clone()
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    fn store(&self, name: &str, obj: &K, call: StoreCall) -> Result<K, Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::cluster(K::kind(&()), name, "simulated write failure"));
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(version.to_string());
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), stored.clone());
        self.writes.lock().unwrap().push(call);
        Ok(stored)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Lookup<K> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Lookup::Unavailable(Error::cluster(K::kind(&()), name, "simulated outage"));
        }
        match self.object(name) {
            Some(obj) => Lookup::Found(obj),
            None => Lookup::NotFound,
        }
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let name = obj.meta().name.clone().unwrap_or_default();
        if self.object(&name).is_some() {
            return Err(Error::cluster(K::kind(&()), name, "already exists"));
        }
        self.store(&name, obj, StoreCall::Create(name.clone()))
    }

    async fn replace(&self, name: &str, obj: &K) -> Result<K, Error> {
        self.store(name, obj, StoreCall::Replace(name.to_string()))
    }

    async fn patch(&self, name: &str, obj: &K) -> Result<K, Error> {
        self.store(name, obj, StoreCall::Patch(name.to_string()))
    }
}
