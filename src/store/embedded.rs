//! The embedded storage engine.

use super::journal::{Journal, JournalOp};
use super::notify::NotificationRegistry;
use super::{
    ChangeCallback, FetchRequest, NewRow, NotificationHandle, Predicate, Row, RowId, Store,
    UnitOfWork,
};
use crate::error::{Result, StoreError};
use crate::types::Timestamp;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Journal file name inside the store directory.
const JOURNAL_FILE: &str = "records.journal";

/// Store configuration.
///
/// Passed explicitly to every facade; there is no process-wide store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Keep everything in memory; nothing touches the filesystem.
    pub in_memory: bool,

    /// Directory of a durable store. Ignored when `in_memory` is set.
    pub path: PathBuf,

    /// fsync the journal after every committed unit of work.
    pub sync_on_commit: bool,
}

impl StoreConfig {
    /// Ephemeral store, e.g. for tests and previews.
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Default::default()
        }
    }

    /// Durable store rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            in_memory: false,
            path: PathBuf::from("./records"),
            sync_on_commit: true,
        }
    }
}

/// State only touched while holding the write lock.
struct WriteState {
    next_row_id: u64,
    journal: Option<Journal>,
}

/// Committed rows plus a unique index on the timestamp column.
#[derive(Default)]
struct Table {
    rows: BTreeMap<RowId, Row>,
    /// Rows without a timestamp are not indexed.
    by_timestamp: BTreeMap<Timestamp, RowId>,
}

impl Table {
    fn apply(&mut self, op: &JournalOp) {
        match op {
            JournalOp::Insert(row) => self.insert(row.clone()),
            JournalOp::Delete(ids) => {
                for id in ids {
                    self.remove(*id);
                }
            }
        }
    }

    fn insert(&mut self, row: Row) {
        if let Some(ts) = row.timestamp {
            self.by_timestamp.insert(ts, row.id);
        }
        self.rows.insert(row.id, row);
    }

    fn remove(&mut self, id: RowId) -> bool {
        match self.rows.remove(&id) {
            Some(row) => {
                if let Some(ts) = row.timestamp {
                    self.by_timestamp.remove(&ts);
                }
                true
            }
            None => false,
        }
    }
}

/// In-memory row set with serialized units of work, change notifications and
/// an optional journal.
pub struct EmbeddedStore {
    config: StoreConfig,

    /// Committed rows.
    table: RwLock<Table>,

    /// Serializes units of work.
    write_lock: Mutex<WriteState>,

    registry: NotificationRegistry,

    /// Lock file for exclusive access (durable stores only).
    _lock_file: Option<File>,
}

impl EmbeddedStore {
    /// Open the store described by `config`, replaying its journal if it is
    /// durable.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if config.in_memory {
            return Ok(Self::with_state(config, Table::default(), 1, None, None));
        }

        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let (journal, entries) =
            Journal::open(config.path.join(JOURNAL_FILE), config.sync_on_commit)?;

        let mut table = Table::default();
        // Highest id ever assigned, including rows deleted since.
        let mut max_row_id = 0;
        for op in entries.iter().flat_map(|entry| &entry.ops) {
            if let JournalOp::Insert(row) = op {
                max_row_id = max_row_id.max(row.id.0);
            }
            table.apply(op);
        }

        debug!(
            path = %config.path.display(),
            entries = entries.len(),
            rows = table.rows.len(),
            "store replayed"
        );

        Ok(Self::with_state(
            config,
            table,
            max_row_id + 1,
            Some(journal),
            Some(lock_file),
        ))
    }

    /// Ephemeral store.
    pub fn in_memory() -> Self {
        Self::with_state(StoreConfig::in_memory(), Table::default(), 1, None, None)
    }

    fn with_state(
        config: StoreConfig,
        table: Table,
        next_row_id: u64,
        journal: Option<Journal>,
        lock_file: Option<File>,
    ) -> Self {
        Self {
            config,
            table: RwLock::new(table),
            write_lock: Mutex::new(WriteState {
                next_row_id,
                journal,
            }),
            registry: NotificationRegistry::new(),
            _lock_file: lock_file,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of committed rows.
    pub fn len(&self) -> usize {
        self.table.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live change-notification registrations.
    pub fn observer_count(&self) -> usize {
        self.registry.len()
    }

    /// Rewrite the journal so it holds only the live rows. No-op for
    /// in-memory stores.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.write_lock.lock();
        if let Some(journal) = state.journal.as_mut() {
            let rows: Vec<Row> = self.table.read().rows.values().cloned().collect();
            journal.compact(&rows)?;
        }
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Store for EmbeddedStore {
    fn perform(&self, work: &mut dyn FnMut(&mut dyn UnitOfWork) -> Result<()>) -> Result<()> {
        let mut state = self.write_lock.lock();

        let (ops, next_row_id) = {
            let committed = self.table.read();
            let mut tx = Transaction::new(&committed, state.next_row_id);
            work(&mut tx)?;
            (tx.ops, tx.next_row_id)
        };

        if ops.is_empty() {
            return Ok(());
        }

        // Nothing is applied in memory unless the journal took the entry.
        if let Some(journal) = state.journal.as_mut() {
            journal.append(ops.clone())?;
        }
        state.next_row_id = next_row_id;

        let mut table = self.table.write();
        for op in &ops {
            table.apply(op);
        }

        // Still under the write lock: observers see commits in order.
        let table = RwLockWriteGuard::downgrade(table);
        self.registry.notify(|request| request.apply(table.rows.values()));

        Ok(())
    }

    fn fetch(&self, request: &FetchRequest) -> Result<Vec<Row>> {
        Ok(request.apply(self.table.read().rows.values()))
    }

    fn register_change_notification(
        &self,
        request: FetchRequest,
        callback: ChangeCallback,
    ) -> NotificationHandle {
        let baseline = request.apply(self.table.read().rows.values());
        let handle = self.registry.register(request, callback, Some(baseline));
        debug!(handle = handle.0, "change notification registered");
        handle
    }

    fn unregister(&self, handle: NotificationHandle) {
        if self.registry.unregister(handle) {
            debug!(handle = handle.0, "change notification unregistered");
        }
    }
}

/// Staged changes of one unit of work, layered over the committed table.
struct Transaction<'a> {
    committed: &'a Table,
    /// Rows inserted by this unit of work.
    staged: Table,
    /// Committed rows deleted by this unit of work.
    deleted: BTreeSet<RowId>,
    next_row_id: u64,
    ops: Vec<JournalOp>,
}

impl<'a> Transaction<'a> {
    fn new(committed: &'a Table, next_row_id: u64) -> Self {
        Self {
            committed,
            staged: Table::default(),
            deleted: BTreeSet::new(),
            next_row_id,
            ops: Vec::new(),
        }
    }

    fn live_rows(&self) -> impl Iterator<Item = &Row> {
        self.committed
            .rows
            .values()
            .filter(move |row| !self.deleted.contains(&row.id))
            .chain(self.staged.rows.values())
    }

    fn timestamp_taken(&self, ts: Timestamp) -> bool {
        self.staged.by_timestamp.contains_key(&ts)
            || self
                .committed
                .by_timestamp
                .get(&ts)
                .is_some_and(|id| !self.deleted.contains(id))
    }
}

impl UnitOfWork for Transaction<'_> {
    fn insert(&mut self, row: NewRow) -> Result<Row> {
        if let Some(ts) = row.timestamp {
            if self.timestamp_taken(ts) {
                return Err(StoreError::DuplicateTimestamp(ts));
            }
        }

        let row = Row {
            id: RowId(self.next_row_id),
            timestamp: row.timestamp,
        };
        self.next_row_id += 1;

        self.staged.insert(row.clone());
        self.ops.push(JournalOp::Insert(row.clone()));
        Ok(row)
    }

    fn delete_where(&mut self, predicate: &Predicate) -> Result<usize> {
        let ids: Vec<RowId> = self
            .live_rows()
            .filter(|row| predicate.matches(row))
            .map(|row| row.id)
            .collect();

        for id in &ids {
            if !self.staged.remove(*id) {
                self.deleted.insert(*id);
            }
        }

        let removed = ids.len();
        if removed > 0 {
            self.ops.push(JournalOp::Delete(ids));
        }
        Ok(removed)
    }

    fn fetch(&self, request: &FetchRequest) -> Result<Vec<Row>> {
        Ok(request.apply(self.live_rows()))
    }
}
