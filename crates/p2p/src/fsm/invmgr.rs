//! Transaction inventory pool.
//!
//! Deduplicates transaction observations across the whole peer pool. Entries
//! decay in two-tick windows: everything that existed at the previous tick is
//! dropped on the next one, so an entry lives between 20 and 40 seconds.
//! That is approximate on purpose: it avoids per-entry timestamps and is
//! enough to suppress duplicates within the network's propagation horizon.
use std::collections::{HashMap, VecDeque};

use bitcoin::{Transaction, Txid};

use crate::net::{LocalDuration, LocalTime};

use super::output::SetTimer;

/// Time between decay ticks.
pub const DECAY_INTERVAL: LocalDuration = LocalDuration::from_secs(20);

/// Recently-seen transactions, deduplicated across peers.
///
/// Invariant: `order` and `index` always hold the same set of txids.
#[derive(Debug)]
pub struct InventoryManager<U> {
    /// Observation order of the current entries.
    order: VecDeque<Txid>,
    /// Keyed entries for O(1) membership.
    index: HashMap<Txid, Transaction>,
    /// Number of entries that existed at the previous tick.
    prev_len: usize,
    /// Last time a decay tick ran. `None` while the pool is stopped.
    last_decay: Option<LocalTime>,
    upstream: U,
}

impl<U: SetTimer> InventoryManager<U> {
    /// Create a new inventory manager.
    pub fn new(upstream: U) -> Self {
        Self {
            order: VecDeque::new(),
            index: HashMap::new(),
            prev_len: 0,
            last_decay: None,
            upstream,
        }
    }

    /// Whether the decay timer is running.
    pub fn is_running(&self) -> bool {
        self.last_decay.is_some()
    }

    /// Start the decay timer. Called on the first peer admission.
    pub fn start(&mut self, now: LocalTime) {
        if self.last_decay.is_none() {
            self.last_decay = Some(now);
            self.upstream.set_timer(DECAY_INTERVAL);
        }
    }

    /// Stop the decay timer. Entries are kept but no longer age.
    pub fn stop(&mut self) {
        self.last_decay = None;
    }

    /// Record a transaction observation. Returns `true` if this is the first
    /// time the transaction is seen.
    pub fn insert(&mut self, tx: &Transaction) -> bool {
        let txid = tx.txid();

        if self.index.contains_key(&txid) {
            return false;
        }
        self.order.push_back(txid);
        self.index.insert(txid, tx.clone());

        true
    }

    /// Check whether a transaction is in the pool.
    pub fn contains(&self, txid: &Txid) -> bool {
        self.index.contains_key(txid)
    }

    /// Look up a transaction by id.
    pub fn get(&self, txid: &Txid) -> Option<&Transaction> {
        self.index.get(txid)
    }

    /// Number of transactions currently held.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Called when a timer expires. Runs a decay tick if one is due and
    /// re-arms the timer.
    pub fn received_wake(&mut self, now: LocalTime) {
        let Some(last) = self.last_decay else {
            return;
        };

        if now - last >= DECAY_INTERVAL {
            self.decay();
            self.last_decay = Some(now);
        }
        self.upstream.set_timer(DECAY_INTERVAL);
    }

    /// Drop the entries that already existed at the previous tick.
    fn decay(&mut self) {
        for _ in 0..self.prev_len {
            if let Some(txid) = self.order.pop_front() {
                self.index.remove(&txid);
            }
        }
        self.prev_len = self.order.len();
    }
}
