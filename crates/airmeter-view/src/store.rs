//! Keyed, independently subscribable cells holding the viewer's state.
//!
//! Every mutation goes through [`Cell::set`] or [`Cell::update`]. Both run
//! under the cell's own lock, so a functional update always sees the latest
//! committed value, and only subscribers of the touched cell are woken.

use airmeter_core::{Cursor, Message, PublisherId, Reading};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

pub struct Cell<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> Cell<T> {
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(value);
        Self { tx }
    }

    /// Current value. Callers get their own copy.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replaces the value; subscribers are notified only if it changed.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        })
    }

    /// Applies `modify` to the latest value. `modify` returns whether it
    /// changed anything; subscribers are notified only then.
    pub fn update<F>(&self, modify: F) -> bool
    where
        F: FnOnce(&mut T) -> bool,
    {
        self.tx.send_if_modified(modify)
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

/// Lazily populated map of cells. Reading an absent key yields the family
/// default without allocating a cell.
pub struct CellFamily<K, T> {
    cells: Mutex<HashMap<K, Arc<Cell<T>>>>,
    default: fn(&K) -> T,
}

impl<K, T> CellFamily<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + PartialEq,
{
    pub fn new(default: fn(&K) -> T) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            default,
        }
    }

    pub fn get(&self, key: &K) -> T {
        match self.existing(key) {
            Some(cell) => cell.get(),
            None => (self.default)(key),
        }
    }

    pub fn set(&self, key: &K, value: T) -> bool {
        self.cell(key).set(value)
    }

    pub fn update<F>(&self, key: &K, modify: F) -> bool
    where
        F: FnOnce(&mut T) -> bool,
    {
        self.cell(key).update(modify)
    }

    pub fn subscribe(&self, key: &K) -> watch::Receiver<T> {
        self.cell(key).subscribe()
    }

    /// Whether the cell has been written or subscribed to.
    pub fn contains(&self, key: &K) -> bool {
        self.existing(key).is_some()
    }

    pub fn keys(&self) -> Vec<K> {
        self.lock().keys().cloned().collect()
    }

    fn existing(&self, key: &K) -> Option<Arc<Cell<T>>> {
        self.lock().get(key).cloned()
    }

    fn cell(&self, key: &K) -> Arc<Cell<T>> {
        let mut cells = self.lock();
        cells
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Cell::new((self.default)(key))))
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Arc<Cell<T>>>> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Active message log. `archived` counts every message moved to the archive
/// so far, which makes it the sequence number of `entries[0]`; the archive
/// holds messages `0..archived` in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    pub archived: usize,
    pub entries: Vec<Message>,
}

impl MessageLog {
    /// Sequence number the next appended message will get.
    pub fn next_seq(&self) -> usize {
        self.archived + self.entries.len()
    }
}

/// Assembled state of one publisher, handed to renderers.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherView {
    pub publisher: PublisherId,
    pub latest: Option<Reading>,
    pub earliest: Option<u64>,
    pub cursors: Vec<Cursor>,
    pub live: Vec<Reading>,
    pub pages: Vec<(Cursor, Vec<Reading>)>,
}

impl PublisherView {
    /// Cached history and live readings ordered by `read_time`. Readings
    /// sharing a timestamp keep page-then-live order.
    pub fn timeline(&self) -> Vec<Reading> {
        let mut merged: Vec<Reading> = self
            .pages
            .iter()
            .flat_map(|(_, readings)| readings.iter().cloned())
            .chain(self.live.iter().cloned())
            .collect();
        merged.sort_by_key(|reading| reading.read_time);
        merged
    }
}

pub struct Store {
    roster: Cell<Vec<PublisherId>>,
    messages: Cell<MessageLog>,
    archive: Cell<Vec<Message>>,
    latest: CellFamily<PublisherId, Option<Reading>>,
    earliest: CellFamily<PublisherId, Option<u64>>,
    cursors: CellFamily<PublisherId, BTreeSet<Cursor>>,
    windows: CellFamily<Cursor, Option<Vec<Reading>>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            roster: Cell::new(Vec::new()),
            messages: Cell::new(MessageLog::default()),
            archive: Cell::new(Vec::new()),
            latest: CellFamily::new(|_| None),
            earliest: CellFamily::new(|_| None),
            cursors: CellFamily::new(|publisher| BTreeSet::from([Cursor::live(*publisher)])),
            windows: CellFamily::new(|_| None),
        }
    }

    /// Publishers currently known to the relay.
    pub fn roster(&self) -> &Cell<Vec<PublisherId>> {
        &self.roster
    }

    /// Active message log.
    pub fn messages(&self) -> &Cell<MessageLog> {
        &self.messages
    }

    pub fn archive(&self) -> &Cell<Vec<Message>> {
        &self.archive
    }

    pub fn latest(&self) -> &CellFamily<PublisherId, Option<Reading>> {
        &self.latest
    }

    /// Per-publisher low-water mark anchoring the next history page.
    pub fn earliest(&self) -> &CellFamily<PublisherId, Option<u64>> {
        &self.earliest
    }

    pub fn cursors(&self) -> &CellFamily<PublisherId, BTreeSet<Cursor>> {
        &self.cursors
    }

    pub fn windows(&self) -> &CellFamily<Cursor, Option<Vec<Reading>>> {
        &self.windows
    }

    pub fn live_window(&self, publisher: PublisherId) -> Vec<Reading> {
        self.windows
            .get(&Cursor::live(publisher))
            .unwrap_or_default()
    }

    pub fn snapshot(&self, publisher: PublisherId) -> PublisherView {
        let cursors: Vec<Cursor> = self.cursors.get(&publisher).into_iter().collect();
        let pages = cursors
            .iter()
            .filter(|cursor| !cursor.is_live())
            .filter_map(|cursor| self.windows.get(cursor).map(|readings| (*cursor, readings)))
            .collect();
        PublisherView {
            publisher,
            latest: self.latest.get(&publisher),
            earliest: self.earliest.get(&publisher),
            live: self.live_window(publisher),
            cursors,
            pages,
        }
    }
}
