//! Write transactions
//!
//! A transaction stages writes and reads its own staged rows. Commit takes
//! the store write lock, replays every staged operation against the
//! committed revisions and applies all of them or none.

use super::{Row, Store};
use crate::error::{Error, Result};
use crate::inventory::model::Model;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;

type Key = (&'static str, String);

#[derive(Debug)]
enum Op {
    Insert { key: Key, row: Row },
    Update { key: Key, expected: u64, row: Row },
    Delete { key: Key },
}

/// A batch of writes committed atomically
pub struct Tx<'a> {
    store: &'a Store,
    ops: Vec<Op>,
    staged: HashMap<Key, Option<Row>>,
}

impl<'a> Tx<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self {
            store,
            ops: Vec::new(),
            staged: HashMap::new(),
        }
    }

    fn key<M: Model>(m: &M) -> Key {
        (M::KIND, m.pk().to_string())
    }

    /// Revision visible to this transaction
    fn revision(&self, key: &Key) -> Option<u64> {
        match self.staged.get(key) {
            Some(staged) => staged.as_ref().map(|r| r.revision),
            None => self.store.inner.state.read().revision(key.0, &key.1),
        }
    }

    fn row<M: Model>(m: &mut M, revision: u64) -> Result<Row> {
        m.base_mut().revision = revision;
        Ok(Row {
            revision,
            value: serde_json::to_value(&*m)?,
        })
    }

    /// Populate `m` from staged or committed state.
    pub fn get<M: Model>(&self, m: &mut M) -> Result<()> {
        let key = Self::key(m);
        let value: Option<Value> = match self.staged.get(&key) {
            Some(staged) => staged.as_ref().map(|r| r.value.clone()),
            None => {
                let state = self.store.inner.state.read();
                state
                    .collections
                    .get(key.0)
                    .and_then(|c| c.get(&key.1))
                    .map(|r| r.value.clone())
            }
        };
        let value = value.ok_or_else(|| Error::not_found(M::KIND, m.pk()))?;
        *m = serde_json::from_value(value)?;
        Ok(())
    }

    /// Stage an insert; `Conflict` if the key exists.
    pub fn insert<M: Model>(&mut self, m: &mut M) -> Result<()> {
        let key = Self::key(m);
        if self.revision(&key).is_some() {
            return Err(Error::conflict(M::KIND, m.pk()));
        }
        let row = Self::row(m, 1)?;
        self.staged.insert(key.clone(), Some(row.clone()));
        self.ops.push(Op::Insert { key, row });
        Ok(())
    }

    /// Stage an update; `Conflict` if the row changed since `m` was read.
    pub fn update<M: Model>(&mut self, m: &mut M) -> Result<()> {
        let key = Self::key(m);
        let current = self
            .revision(&key)
            .ok_or_else(|| Error::not_found(M::KIND, m.pk()))?;
        let expected = m.base().revision;
        if current != expected {
            return Err(Error::conflict(M::KIND, m.pk()));
        }
        let row = Self::row(m, expected + 1)?;
        self.staged.insert(key.clone(), Some(row.clone()));
        self.ops.push(Op::Update { key, expected, row });
        Ok(())
    }

    /// Stage a delete. Absent rows are ignored.
    pub fn delete<M: Model>(&mut self, m: &M) {
        let key = Self::key(m);
        self.staged.insert(key.clone(), None);
        self.ops.push(Op::Delete { key });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every staged write, or none of them.
    pub fn commit(self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.store.inner.state.write();

            let mut view: HashMap<&Key, Option<u64>> = HashMap::new();
            for op in &self.ops {
                match op {
                    Op::Insert { key, row } => {
                        let current = view
                            .get(key)
                            .copied()
                            .unwrap_or_else(|| state.revision(key.0, &key.1));
                        if current.is_some() {
                            return Err(Error::conflict(key.0, &key.1));
                        }
                        view.insert(key, Some(row.revision));
                    }
                    Op::Update { key, expected, row } => {
                        let current = view
                            .get(key)
                            .copied()
                            .unwrap_or_else(|| state.revision(key.0, &key.1));
                        match current {
                            None => return Err(Error::not_found(key.0, &key.1)),
                            Some(rev) if rev != *expected => {
                                return Err(Error::conflict(key.0, &key.1))
                            }
                            Some(_) => {}
                        }
                        view.insert(key, Some(row.revision));
                    }
                    Op::Delete { key } => {
                        view.insert(key, None);
                    }
                }
            }
            drop(view);

            for op in self.ops {
                match op {
                    Op::Insert { key, row } | Op::Update { key, row, .. } => {
                        state.collections.entry(key.0.to_string()).or_default().put(&key.1, row);
                    }
                    Op::Delete { key } => {
                        if let Some(c) = state.collections.get_mut(key.0) {
                            c.remove(&key.1);
                        }
                    }
                }
            }
            state.last_update = Some(Utc::now());
        }
        self.store.committed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::model::{Folder, Ref, Vm};
    use assert_matches::assert_matches;

    #[test]
    fn test_read_your_writes() {
        let store = Store::new("t");
        let mut tx = store.begin();
        let mut vm = Vm::with_id("vm-1");
        tx.insert(&mut vm).unwrap();

        let mut read = Vm::with_id("vm-1");
        tx.get(&mut read).unwrap();
        read.base.name = "one".into();
        tx.update(&mut read).unwrap();
        assert_eq!(read.base.revision, 2);

        assert!(store.find::<Vm>("vm-1").is_err());
        tx.commit().unwrap();
        assert_eq!(store.find::<Vm>("vm-1").unwrap().base.name, "one");
    }

    #[test]
    fn test_commit_is_all_or_nothing() {
        let store = Store::new("t");
        let mut f = Folder::with_id("f1");
        store.insert(&mut f).unwrap();

        let mut stale = f.clone();
        let mut tx = store.begin();
        let mut vm = Vm::with_id("vm-1");
        tx.insert(&mut vm).unwrap();
        stale.children.push(Ref::new("VM", "vm-1"));
        tx.update(&mut stale).unwrap();

        // A concurrent writer bumps the folder before commit.
        f.base.name = "moved".into();
        store.update(&mut f).unwrap();

        assert_matches!(tx.commit(), Err(Error::Conflict { .. }));
        assert!(store.find::<Vm>("vm-1").is_err());
    }

    #[test]
    fn test_delete_then_insert() {
        let store = Store::new("t");
        let mut vm = Vm::with_id("vm-1");
        store.insert(&mut vm).unwrap();

        let mut tx = store.begin();
        tx.delete(&vm);
        let mut again = Vm::with_id("vm-1");
        tx.insert(&mut again).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.find::<Vm>("vm-1").unwrap().base.revision, 1);
    }
}
