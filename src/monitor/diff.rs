// Connection-table diffing
//
// Tracks every flow key seen in the previous snapshot. A key is reported the
// first time it shows up and never again while it stays in the table, even
// if its state changes (LISTENING -> ESTABLISHED is not a new flow).

use crate::connection::{ConnectionRecord, FlowKey};
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct DiffEngine {
    last_known: HashMap<FlowKey, ConnectionRecord>,
}

impl DiffEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `snapshot` into the working set and return the rows whose key
    /// was not known before, minus listeners and TIME_WAIT leftovers.
    ///
    /// Rows already known get their original `first_seen` written back into
    /// `snapshot`. Keys missing from `snapshot` are forgotten.
    pub fn apply(&mut self, snapshot: &mut [ConnectionRecord]) -> Vec<ConnectionRecord> {
        let mut new_flows = Vec::new();
        let mut present = HashSet::with_capacity(snapshot.len());

        for row in snapshot.iter_mut() {
            present.insert(row.key);

            match self.last_known.get_mut(&row.key) {
                Some(known) => {
                    row.first_seen = known.first_seen;
                    known.state = row.state;
                    known.owner_pid = row.owner_pid;
                    known.last_seen = row.last_seen;
                }
                None => {
                    self.last_known.insert(row.key, row.clone());
                    if !row.state.is_silent() {
                        new_flows.push(row.clone());
                    }
                }
            }
        }

        let before = self.last_known.len();
        self.last_known.retain(|key, _| present.contains(key));
        let closed = before - self.last_known.len();
        if closed > 0 || !new_flows.is_empty() {
            log::debug!(
                "Diff: {} new, {} closed, {} tracked",
                new_flows.len(),
                closed,
                self.last_known.len()
            );
        }

        new_flows
    }

    /// Forget every tracked flow
    pub fn reset(&mut self) {
        self.last_known.clear();
    }

    pub fn tracked(&self) -> usize {
        self.last_known.len()
    }

    pub fn is_tracked(&self, key: &FlowKey) -> bool {
        self.last_known.contains_key(key)
    }
}
