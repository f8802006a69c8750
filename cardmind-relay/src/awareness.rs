//! Ephemeral per-client presence ("awareness") for one document.
//!
//! Each client id carries a monotonically increasing clock. Merging follows
//! last-writer-wins per client, never per field:
//!
//! ```text
//! incoming (id, clock, state)
//!       │
//!       ├── clock >  stored ─────────────────────────► apply
//!       ├── clock == stored, state absent, present ──► apply (removal)
//!       └── otherwise ───────────────────────────────► ignore
//! ```
//!
//! Removed clients keep their clock as a tombstone so that late, stale
//! entries cannot resurrect them. The tracker lives as long as its session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::protocol::{AwarenessEntryUpdate, AwarenessUpdate};

/// Stored presence for one client.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub clock: u64,
    /// `None` once the client has been removed.
    pub state: Option<Value>,
    /// Last time an update for this client was applied.
    pub last_seen: Instant,
}

/// Outcome of merging entries into the tracker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessChange {
    /// Entries that were accepted, in input order. This is what gets relayed.
    pub applied: Vec<AwarenessEntryUpdate>,
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// The accepted entries as a wire update.
    pub fn to_update(&self) -> AwarenessUpdate {
        AwarenessUpdate::new(self.applied.clone())
    }
}

/// Presence map for one document session.
#[derive(Debug, Default)]
pub struct AwarenessTracker {
    entries: HashMap<u64, AwarenessEntry>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch of incoming entries.
    pub fn apply_delta(&mut self, update: &AwarenessUpdate, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for incoming in &update.entries {
            let id = incoming.client_id;
            let present = match self.entries.get(&id) {
                Some(current) => {
                    let present = current.state.is_some();
                    let newer = incoming.clock > current.clock;
                    let equal_removal =
                        incoming.clock == current.clock && incoming.is_removal() && present;
                    if !newer && !equal_removal {
                        log::trace!(
                            "Awareness: stale entry for client {id} (clock {} <= {})",
                            incoming.clock,
                            current.clock
                        );
                        continue;
                    }
                    present
                }
                None => false,
            };

            self.entries.insert(
                id,
                AwarenessEntry {
                    clock: incoming.clock,
                    state: incoming.state.clone(),
                    last_seen: now,
                },
            );

            match (present, incoming.is_removal()) {
                // Tombstone for a client we never saw, or a repeat removal.
                (false, true) => continue,
                (false, false) => change.added.push(id),
                (true, false) => change.updated.push(id),
                (true, true) => change.removed.push(id),
            }
            change.applied.push(incoming.clone());
        }

        change
    }

    /// Remove every listed client that is currently present.
    ///
    /// Synthesizes `(clock + 1, absent)` for each and applies it.
    pub fn remove_clients<I>(&mut self, clients: I, now: Instant) -> AwarenessChange
    where
        I: IntoIterator<Item = u64>,
    {
        let removals: Vec<AwarenessEntryUpdate> = clients
            .into_iter()
            .filter_map(|id| {
                self.entries
                    .get(&id)
                    .filter(|e| e.state.is_some())
                    .map(|e| AwarenessEntryUpdate::removal(id, e.clock + 1))
            })
            .collect();
        self.apply_delta(&AwarenessUpdate::new(removals), now)
    }

    /// Remove clients whose last applied update is at least `timeout` old.
    pub fn expire_stale(&mut self, timeout: Duration, now: Instant) -> AwarenessChange {
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.is_some() && now.saturating_duration_since(e.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        if !stale.is_empty() {
            log::debug!("Awareness: expiring {} idle clients", stale.len());
        }
        self.remove_clients(stale, now)
    }

    /// Every present client, for a newly attached connection.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let mut entries: Vec<AwarenessEntryUpdate> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.is_some())
            .map(|(id, e)| AwarenessEntryUpdate::new(*id, e.clock, e.state.clone()))
            .collect();
        entries.sort_by_key(|e| e.client_id);
        AwarenessUpdate::new(entries)
    }

    pub fn get(&self, client_id: u64) -> Option<&AwarenessEntry> {
        self.entries.get(&client_id)
    }

    /// Current state of a present client.
    pub fn state(&self, client_id: u64) -> Option<&Value> {
        self.entries.get(&client_id).and_then(|e| e.state.as_ref())
    }

    /// Number of present clients.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
