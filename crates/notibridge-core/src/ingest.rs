//! Per-device notification set.
//!
//! Applies `init`/`posted`/`removed` lifecycle events, keeping at most one
//! entry per identity key in insertion order. Every mutator reports whether
//! the set actually changed so callers only re-filter and notify on change.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{IdentityKey, Notification, NotificationAction};

/// Unread/total counters for a notification list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub unread: usize,
    pub total: usize,
}

/// Ordered, deduplicated notification set for one device.
#[derive(Debug, Clone, Default)]
pub struct NotificationSet {
    entries: Vec<Notification>,
    read: HashSet<IdentityKey>,
}

impl NotificationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Notification] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&Notification> {
        self.entries.iter().find(|n| n.matches_key(key))
    }

    /// Merge a reconciliation snapshot.
    ///
    /// Entries in the batch are upserted; entries absent from the batch are
    /// retained, since events produced between disconnect and resync would
    /// otherwise be lost.
    pub fn apply_init(&mut self, batch: Vec<Notification>) -> bool {
        let mut changed = false;
        for notification in batch {
            changed |= self.upsert(notification);
        }
        debug!(total = self.entries.len(), changed, "Applied init batch");
        changed
    }

    /// Apply a single lifecycle event. A missing action counts as `posted`.
    pub fn apply_event(&mut self, event: Notification) -> bool {
        match event.action.unwrap_or(NotificationAction::Posted) {
            NotificationAction::Init | NotificationAction::Posted => self.upsert(event),
            NotificationAction::Removed => self.remove_matching(&event) > 0,
            NotificationAction::Unknown => {
                warn!(
                    package = %event.package_name,
                    id = %event.id,
                    "Ignoring notification event with unknown action"
                );
                false
            }
        }
    }

    /// Insert, or replace in place when the identity key already exists.
    fn upsert(&mut self, notification: Notification) -> bool {
        let key = notification.key();
        match self.entries.iter_mut().find(|n| n.matches_key(&key)) {
            Some(existing) if *existing == notification => false,
            Some(existing) => {
                *existing = notification;
                true
            }
            None => {
                self.entries.push(notification);
                true
            }
        }
    }

    /// Remove entries targeted by a `removed` event.
    ///
    /// With a package name the full identity key must match; without one
    /// every entry carrying the id is removed.
    fn remove_matching(&mut self, event: &Notification) -> usize {
        if event.package_name.is_empty() {
            self.remove_where(|n| n.id == event.id)
        } else {
            let key = event.key();
            self.remove_where(|n| n.matches_key(&key))
        }
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&Notification) -> bool) -> usize {
        let before = self.entries.len();
        let read = &mut self.read;
        self.entries.retain(|n| {
            if pred(n) {
                read.remove(&n.key());
                false
            } else {
                true
            }
        });
        before - self.entries.len()
    }

    /// Remove every entry with this id, whatever the package.
    pub fn delete(&mut self, id: &str) -> bool {
        self.remove_where(|n| n.id == id) > 0
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.entries.is_empty();
        self.entries.clear();
        self.read.clear();
        changed
    }

    /// Mark entries read by id. Unknown ids are ignored.
    pub fn mark_read(&mut self, ids: &[String]) -> bool {
        let mut changed = false;
        for n in self.entries.iter().filter(|n| ids.contains(&n.id)) {
            changed |= self.read.insert(n.key());
        }
        changed
    }

    pub fn is_read(&self, key: &IdentityKey) -> bool {
        self.read.contains(key)
    }

    /// Counters over `list`, typically the filtered view of this set.
    pub fn counts_for(&self, list: &[Notification]) -> Counts {
        let unread = list.iter().filter(|n| !self.read.contains(&n.key())).count();
        Counts {
            unread,
            total: list.len(),
        }
    }
}

/// Copy of `list` ordered newest first by timestamp; ties keep input order.
pub fn newest_first(list: &[Notification]) -> Vec<Notification> {
    let mut sorted = list.to_vec();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    sorted
}
