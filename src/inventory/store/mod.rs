//! Embedded inventory store
//!
//! One store per provider. Collections are keyed by entity kind and keep
//! rows in insertion order. Writes go through transactions that validate
//! row revisions at commit (optimistic MVCC); readers clone committed rows
//! under a shared lock.
//!
//! When a snapshot path is configured the store is written to disk on every
//! commit and reloaded on open.

mod tx;

pub use tx::Tx;

use crate::error::{Error, Result};
use crate::inventory::model::{Model, Ref};
use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Options
// =============================================================================

/// A page of results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Zero-based page number
    pub number: usize,
    /// Rows per page; zero means unbounded
    pub size: usize,
}

impl Page {
    pub fn new(number: usize, size: usize) -> Self {
        Self { number, size }
    }

    /// Truncate `items` to this page.
    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        if self.size == 0 {
            return items;
        }
        items
            .into_iter()
            .skip(self.number.saturating_mul(self.size))
            .take(self.size)
            .collect()
    }
}

/// Selection and paging for [`Store::list`]
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub page: Option<Page>,
    pub parent: Option<Ref>,
    pub name: Option<String>,
}

impl ListOptions {
    pub fn with_page(mut self, page: Page) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_parent(mut self, parent: Ref) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub object_count: usize,
    pub counts: BTreeMap<String, usize>,
    pub commits: u64,
    pub last_update: Option<DateTime<Utc>>,
}

// =============================================================================
// Internal state
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct Row {
    pub revision: u64,
    pub value: Value,
}

#[derive(Debug, Default)]
pub(crate) struct Collection {
    rows: IndexMap<String, Row>,
    by_parent: HashMap<String, IndexSet<String>>,
    by_name: HashMap<String, IndexSet<String>>,
}

fn parent_key(value: &Value) -> Option<String> {
    value
        .get("parent")
        .and_then(|p| serde_json::from_value::<Ref>(p.clone()).ok())
        .filter(|r| !r.is_empty())
        .map(|r| r.encode())
}

fn name_of(value: &Value) -> Option<String> {
    value
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

impl Collection {
    fn unindex(&mut self, id: &str, value: &Value) {
        if let Some(key) = parent_key(value) {
            if let Some(set) = self.by_parent.get_mut(&key) {
                set.shift_remove(id);
            }
        }
        if let Some(name) = name_of(value) {
            if let Some(set) = self.by_name.get_mut(&name) {
                set.shift_remove(id);
            }
        }
    }

    fn index(&mut self, id: &str, value: &Value) {
        if let Some(key) = parent_key(value) {
            self.by_parent.entry(key).or_default().insert(id.to_string());
        }
        if let Some(name) = name_of(value) {
            self.by_name.entry(name).or_default().insert(id.to_string());
        }
    }

    pub(crate) fn put(&mut self, id: &str, row: Row) {
        if let Some(old) = self.rows.get(id) {
            let old = old.value.clone();
            self.unindex(id, &old);
        }
        self.index(id, &row.value);
        self.rows.insert(id.to_string(), row);
    }

    pub(crate) fn remove(&mut self, id: &str) {
        if let Some(old) = self.rows.shift_remove(id) {
            self.unindex(id, &old.value);
        }
    }

    pub(crate) fn revision(&self, id: &str) -> Option<u64> {
        self.rows.get(id).map(|r| r.revision)
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Row> {
        self.rows.get(id)
    }

    fn select(&self, opts: &ListOptions) -> Vec<&Row> {
        let mut candidates: Option<IndexSet<&str>> = None;
        if let Some(parent) = &opts.parent {
            let set = self
                .by_parent
                .get(&parent.encode())
                .map(|s| s.iter().map(String::as_str).collect())
                .unwrap_or_default();
            candidates = Some(set);
        }
        if let Some(name) = &opts.name {
            let set: IndexSet<&str> = self
                .by_name
                .get(name)
                .map(|s| s.iter().map(String::as_str).collect())
                .unwrap_or_default();
            candidates = Some(match candidates {
                Some(existing) => existing.intersection(&set).copied().collect(),
                None => set,
            });
        }

        match candidates {
            None => self.rows.values().collect(),
            Some(ids) => {
                let mut positions: Vec<usize> =
                    ids.iter().filter_map(|id| self.rows.get_index_of(*id)).collect();
                positions.sort_unstable();
                positions
                    .into_iter()
                    .filter_map(|i| self.rows.get_index(i).map(|(_, row)| row))
                    .collect()
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct State {
    pub collections: HashMap<String, Collection>,
    pub last_update: Option<DateTime<Utc>>,
}

impl State {
    pub(crate) fn revision(&self, kind: &str, id: &str) -> Option<u64> {
        self.collections.get(kind).and_then(|c| c.revision(id))
    }
}

/// On-disk snapshot layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    collections: BTreeMap<String, Vec<Value>>,
}

pub(crate) struct Inner {
    name: String,
    path: Option<PathBuf>,
    pub(crate) state: RwLock<State>,
    opened: AtomicBool,
    exclusive: AtomicBool,
    commits: AtomicU64,
    /// Committed rows not yet in the snapshot
    dirty: AtomicBool,
}

// =============================================================================
// Store
// =============================================================================

/// Per-provider inventory store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .finish()
    }
}

impl Store {
    /// Create an ephemeral store.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Create a store snapshotted to `path`.
    pub fn persistent(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::build(name.into(), Some(path.into()))
    }

    fn build(name: String, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                path,
                state: RwLock::new(State::default()),
                opened: AtomicBool::new(false),
                exclusive: AtomicBool::new(false),
                commits: AtomicU64::new(0),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.path.is_some()
    }

    /// Acquire the store. An exclusive open claims the single writer role
    /// and fails with `Conflict` while another writer holds it. Persisted
    /// rows are loaded on the first open.
    pub fn open(&self, exclusive: bool) -> Result<()> {
        if exclusive
            && self
                .inner
                .exclusive
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Err(Error::conflict("Store", &self.inner.name));
        }

        if !self.inner.opened.swap(true, Ordering::AcqRel) {
            if let Some(path) = &self.inner.path {
                self.load(path)?;
            }
        }
        debug!(store = %self.inner.name, exclusive, "Store opened");
        Ok(())
    }

    /// Release the store, flushing the snapshot when persistent.
    pub fn close(&self) -> Result<()> {
        self.inner.exclusive.store(false, Ordering::Release);
        self.flush()?;
        debug!(store = %self.inner.name, "Store closed");
        Ok(())
    }

    /// Drop every row and the on-disk snapshot.
    pub fn purge(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            *state = State::default();
        }
        if let Some(path) = &self.inner.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(store = %self.inner.name, "Store purged");
        Ok(())
    }

    /// Begin a write transaction.
    pub fn begin(&self) -> Tx<'_> {
        Tx::new(self)
    }

    pub fn insert<M: Model>(&self, m: &mut M) -> Result<()> {
        let mut tx = self.begin();
        tx.insert(m)?;
        tx.commit()
    }

    pub fn update<M: Model>(&self, m: &mut M) -> Result<()> {
        let mut tx = self.begin();
        tx.update(m)?;
        tx.commit()
    }

    pub fn delete<M: Model>(&self, m: &M) -> Result<()> {
        let mut tx = self.begin();
        tx.delete(m);
        tx.commit()
    }

    /// Populate `m` by primary key.
    pub fn get<M: Model>(&self, m: &mut M) -> Result<()> {
        let state = self.inner.state.read();
        let row = state
            .collections
            .get(M::KIND)
            .and_then(|c| c.get(m.pk()))
            .ok_or_else(|| Error::not_found(M::KIND, m.pk()))?;
        *m = serde_json::from_value(row.value.clone())?;
        Ok(())
    }

    /// Fetch by primary key.
    pub fn find<M: Model>(&self, id: &str) -> Result<M> {
        let mut m = M::with_id(id);
        self.get(&mut m)?;
        Ok(m)
    }

    /// Filtered, paged enumeration in insertion order.
    pub fn list<M: Model>(&self, opts: &ListOptions) -> Result<Vec<M>> {
        let values: Vec<Value> = {
            let state = self.inner.state.read();
            match state.collections.get(M::KIND) {
                Some(c) => c.select(opts).into_iter().map(|r| r.value.clone()).collect(),
                None => Vec::new(),
            }
        };
        let values = match opts.page {
            Some(page) => page.slice(values),
            None => values,
        };
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Error::from))
            .collect()
    }

    /// Number of rows matching the selection, ignoring paging.
    pub fn count<M: Model>(&self, opts: &ListOptions) -> usize {
        let state = self.inner.state.read();
        state
            .collections
            .get(M::KIND)
            .map(|c| c.select(opts).len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.inner.state.read();
        let counts: BTreeMap<String, usize> = state
            .collections
            .iter()
            .map(|(k, c)| (k.clone(), c.rows.len()))
            .collect();
        StoreStats {
            object_count: counts.values().sum(),
            counts,
            commits: self.inner.commits.load(Ordering::Relaxed),
            last_update: state.last_update,
        }
    }

    /// Rows are visible once applied, so a failed snapshot write does not
    /// fail the commit. The store stays dirty and the next commit or
    /// `close` writes it again.
    pub(crate) fn committed(&self) {
        self.inner.commits.fetch_add(1, Ordering::Relaxed);
        self.inner.dirty.store(true, Ordering::Release);
        if let Err(e) = self.flush() {
            warn!(store = %self.inner.name, error = %e, "Snapshot write failed, will retry");
        }
    }

    /// Whether committed rows are missing from the snapshot.
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Write the snapshot when persistent.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        let snapshot = {
            let state = self.inner.state.read();
            let mut snapshot = Snapshot {
                last_update: state.last_update,
                ..Default::default()
            };
            for (kind, c) in &state.collections {
                snapshot
                    .collections
                    .insert(kind.clone(), c.rows.values().map(|r| r.value.clone()).collect());
            }
            snapshot
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&snapshot)?)?;
        std::fs::rename(&tmp, path)?;
        self.inner.dirty.store(false, Ordering::Release);
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<()> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!(store = %self.inner.name, error = %e, "Discarding unreadable snapshot");
                return Ok(());
            }
        };

        let mut state = self.inner.state.write();
        *state = State::default();
        state.last_update = snapshot.last_update;
        let mut loaded = 0usize;
        for (kind, values) in snapshot.collections {
            let collection = state.collections.entry(kind).or_default();
            for value in values {
                let Some(id) = value.get("id").and_then(Value::as_str).map(str::to_string) else {
                    continue;
                };
                let revision = value.get("revision").and_then(Value::as_u64).unwrap_or(1);
                collection.put(&id, Row { revision, value });
                loaded += 1;
            }
        }
        info!(store = %self.inner.name, rows = loaded, "Loaded inventory snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::model::{Folder, Host, Vm};
    use assert_matches::assert_matches;

    fn host(id: &str, name: &str, parent: &str) -> Host {
        let mut h = Host::with_id(id);
        h.base.name = name.into();
        h.base.parent = Ref::new("Cluster", parent);
        h
    }

    #[test]
    fn test_insert_get_delete() {
        let store = Store::new("test");
        let mut h = host("host-1", "esx1", "c1");
        store.insert(&mut h).unwrap();
        assert_eq!(h.base.revision, 1);

        let mut dup = host("host-1", "esx1", "c1");
        assert_matches!(store.insert(&mut dup), Err(Error::Conflict { .. }));

        let got: Host = store.find("host-1").unwrap();
        assert_eq!(got.base.name, "esx1");

        store.delete(&got).unwrap();
        store.delete(&got).unwrap();
        assert_matches!(store.find::<Host>("host-1"), Err(Error::NotFound { .. }));
    }

    #[test]
    fn test_update_detects_stale_revision() {
        let store = Store::new("test");
        let mut h = host("host-1", "esx1", "c1");
        store.insert(&mut h).unwrap();

        let mut reader_copy: Host = store.find("host-1").unwrap();
        h.maintenance = true;
        store.update(&mut h).unwrap();
        assert_eq!(h.base.revision, 2);

        reader_copy.base.name = "renamed".into();
        assert_matches!(store.update(&mut reader_copy), Err(Error::Conflict { .. }));

        let mut missing = Host::with_id("nope");
        assert_matches!(store.update(&mut missing), Err(Error::NotFound { .. }));
    }

    #[test]
    fn test_list_indices_and_paging() {
        let store = Store::new("test");
        for i in 0..10 {
            let parent = if i % 2 == 0 { "even" } else { "odd" };
            store.insert(&mut host(&format!("host-{}", i), &format!("h{}", i), parent)).unwrap();
        }

        let all: Vec<Host> = store.list(&ListOptions::default()).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[3].base.id, "host-3");

        let even: Vec<Host> = store
            .list(&ListOptions::default().with_parent(Ref::new("Cluster", "even")))
            .unwrap();
        let ids: Vec<&str> = even.iter().map(|h| h.base.id.as_str()).collect();
        assert_eq!(ids, vec!["host-0", "host-2", "host-4", "host-6", "host-8"]);

        let page: Vec<Host> = store
            .list(&ListOptions::default().with_page(Page::new(1, 4)))
            .unwrap();
        let ids: Vec<&str> = page.iter().map(|h| h.base.id.as_str()).collect();
        assert_eq!(ids, vec!["host-4", "host-5", "host-6", "host-7"]);

        let by_name: Vec<Host> = store.list(&ListOptions::default().with_name("h7")).unwrap();
        assert_eq!(by_name.len(), 1);

        // Reparenting moves the row between parent index buckets.
        let mut moved: Host = store.find("host-1").unwrap();
        moved.base.parent = Ref::new("Cluster", "even");
        store.update(&mut moved).unwrap();
        assert_eq!(
            store.count::<Host>(&ListOptions::default().with_parent(Ref::new("Cluster", "even"))),
            6
        );
        assert!(store.list::<Vm>(&ListOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn test_exclusive_open() {
        let store = Store::new("test");
        store.open(true).unwrap();
        assert_matches!(store.open(true), Err(Error::Conflict { .. }));
        store.open(false).unwrap();
        store.close().unwrap();
        store.open(true).unwrap();
    }

    #[test]
    fn test_persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider-uid.json");

        let store = Store::persistent("p", &path);
        store.open(true).unwrap();
        let mut f = Folder::with_id("group-d1");
        f.base.name = "Datacenters".into();
        store.insert(&mut f).unwrap();
        store.close().unwrap();

        let reopened = Store::persistent("p", &path);
        reopened.open(false).unwrap();
        let got: Folder = reopened.find("group-d1").unwrap();
        assert_eq!(got.base.name, "Datacenters");
        assert_eq!(reopened.stats().object_count, 1);

        reopened.purge().unwrap();
        assert!(!path.exists());
        assert_eq!(reopened.stats().object_count, 0);
    }

    #[test]
    fn test_snapshot_failure_keeps_commit() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // The parent "directory" is a regular file, so every snapshot write fails.
        let store = Store::persistent("p", file.path().join("provider-uid.json"));

        let mut vm = Vm::with_id("vm-1");
        store.insert(&mut vm).unwrap();
        assert_eq!(store.find::<Vm>("vm-1").unwrap().base.revision, 1);
        assert!(store.is_dirty());
        assert_eq!(store.stats().commits, 1);

        assert_matches!(store.close(), Err(Error::Io(_)));
        assert!(store.is_dirty());
    }
}
