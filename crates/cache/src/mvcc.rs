// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The per-entry lock-candidate list. Transactions claim an entry by
//! adding a candidate `(version, node, thread)`; the head non-reentrant
//! candidate owns the entry. The list is tiny in practice, so it lives in
//! a `SmallVec` inside the entry extras.

use ember_core::EntryVersion;
use smallvec::SmallVec;
use uuid::Uuid;

/// A lock claim on an entry by a specific `(node, thread, version)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub version: EntryVersion,
    pub node_id: Uuid,
    pub thread_id: u64,
    /// Same thread already holds a candidate; this one rides along.
    pub reentry: bool,
    pub local: bool,
    /// Local candidate enlisted on behalf of a near-cache transaction.
    pub near_local: bool,
    /// For DHT candidates mapped from a near node: the near node's id.
    pub other_node_id: Option<Uuid>,
}

/// Result of a list mutation, as far as ownership is concerned. The entry
/// turns these into LOCKED/UNLOCKED events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    pub previous: Option<Candidate>,
    pub current: Option<Candidate>,
}

impl OwnerChange {
    pub fn changed(&self) -> bool {
        match (&self.previous, &self.current) {
            (None, None) => false,
            (Some(p), Some(c)) => p.version != c.version,
            _ => true,
        }
    }
}

/// Ordered candidate list. Insertion order is claim order; the owner is
/// the head non-reentrant candidate, of which there is at most one at any
/// time by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MvccList {
    candidates: SmallVec<[Candidate; 2]>,
}

impl MvccList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// True when no candidates remain other than ones at `excl`.
    pub fn is_empty_excluding(&self, excl: &EntryVersion) -> bool {
        self.candidates.iter().all(|c| c.version == *excl)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// The owning candidate: head of the list, skipping reentries.
    pub fn owner(&self) -> Option<&Candidate> {
        self.candidates.iter().find(|c| !c.reentry)
    }

    pub fn is_owned_by(&self, version: &EntryVersion) -> bool {
        self.owner().is_some_and(|o| o.version == *version)
    }

    pub fn is_locally_owned_by_thread(&self, node_id: &Uuid, thread_id: u64) -> bool {
        self.owner()
            .is_some_and(|o| o.local && o.node_id == *node_id && o.thread_id == thread_id)
    }

    /// The local candidate belonging to a thread, reentrant or not.
    pub fn local_candidate(&self, thread_id: u64) -> Option<&Candidate> {
        self.candidates
            .iter()
            .find(|c| c.local && c.thread_id == thread_id)
    }

    pub fn candidate(&self, version: &EntryVersion) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.version == *version)
    }

    /// Versions claimed by a given node. Used when deciding whether a near
    /// reader can be dropped.
    pub fn versions_for_node(&self, node_id: &Uuid) -> Vec<EntryVersion> {
        self.candidates
            .iter()
            .filter(|c| c.node_id == *node_id)
            .map(|c| c.version)
            .collect()
    }

    /// Add a local candidate. If the same thread already holds one, the new
    /// candidate is flagged as a reentry and never becomes the owner on its
    /// own.
    pub fn add_local(
        &mut self,
        version: EntryVersion,
        node_id: Uuid,
        thread_id: u64,
        near_local: bool,
    ) -> OwnerChange {
        let previous = self.owner().cloned();
        let reentry = self.local_candidate(thread_id).is_some();
        self.candidates.push(Candidate {
            version,
            node_id,
            thread_id,
            reentry,
            local: true,
            near_local,
            other_node_id: None,
        });
        OwnerChange {
            previous,
            current: self.owner().cloned(),
        }
    }

    pub fn add_remote(
        &mut self,
        version: EntryVersion,
        node_id: Uuid,
        thread_id: u64,
        other_node_id: Option<Uuid>,
    ) -> OwnerChange {
        let previous = self.owner().cloned();
        self.candidates.push(Candidate {
            version,
            node_id,
            thread_id,
            reentry: false,
            local: false,
            near_local: false,
            other_node_id,
        });
        OwnerChange {
            previous,
            current: self.owner().cloned(),
        }
    }

    /// Remove all candidates at a version. Returns the resulting ownership
    /// transition (previous/current may coincide if a waiter was removed).
    pub fn remove(&mut self, version: &EntryVersion) -> OwnerChange {
        let previous = self.owner().cloned();
        self.candidates.retain(|c| c.version != *version);
        OwnerChange {
            previous,
            current: self.owner().cloned(),
        }
    }
}
