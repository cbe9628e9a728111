//! Presentation slots for running mini apps: reuse, free slot, or evict the lowest priority.

use std::cmp::Ordering;

use tracing::{debug, info};

use crate::catalog::MiniAppDescriptor;
use crate::config::CoreConfig;

struct RunningApp {
    app: MiniAppDescriptor,
    /// First-seen order, for priority ties.
    seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotAssignment {
    /// App already had this slot; `replaced` when the new descriptor carried a newer version.
    Existing { slot: usize, replaced: bool },
    Free { slot: usize },
    Evicted { slot: usize, evicted: String },
}

impl SlotAssignment {
    pub fn slot(&self) -> usize {
        match self {
            SlotAssignment::Existing { slot, .. }
            | SlotAssignment::Free { slot }
            | SlotAssignment::Evicted { slot, .. } => *slot,
        }
    }
}

pub struct MiniAppProcessLauncher {
    slots: Vec<Option<RunningApp>>,
    next_seq: u64,
}

impl MiniAppProcessLauncher {
    pub fn new(config: &CoreConfig) -> Self {
        let n = config.presentation_slots.max(1);
        Self {
            slots: (0..n).map(|_| None).collect(),
            next_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_of(&self, app_id: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|r| r.app.app_id == app_id))
    }

    pub fn running(&self) -> impl Iterator<Item = &MiniAppDescriptor> {
        self.slots.iter().flatten().map(|r| &r.app)
    }

    pub fn select_slot(&mut self, app: &MiniAppDescriptor) -> SlotAssignment {
        if let Some(slot) = self.slot_of(&app.app_id) {
            let mut replaced = false;
            if let Some(running) = self.slots[slot].as_mut() {
                if compare_versions(version_of(app), version_of(&running.app)) == Ordering::Greater
                {
                    running.app = app.clone();
                    replaced = true;
                }
            }
            debug!(app_id = %app.app_id, slot, replaced, "reusing presentation slot");
            return SlotAssignment::Existing { slot, replaced };
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = RunningApp {
            app: app.clone(),
            seq,
        };

        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(entry);
            return SlotAssignment::Free { slot };
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (i, r.app.priority, r.seq)))
            .min_by_key(|&(_, priority, seq)| (priority, seq))
            .map(|(i, _, _)| i)
            .unwrap_or(0);
        let evicted = self.slots[victim]
            .replace(entry)
            .map(|r| r.app.app_id)
            .unwrap_or_default();
        info!(app_id = %app.app_id, %evicted, slot = victim, "evicting lowest-priority app");
        SlotAssignment::Evicted {
            slot: victim,
            evicted,
        }
    }

    /// Free the app's slot. Returns the slot it held.
    pub fn release(&mut self, app_id: &str) -> Option<usize> {
        let slot = self.slot_of(app_id)?;
        self.slots[slot] = None;
        Some(slot)
    }
}

fn version_of(app: &MiniAppDescriptor) -> &str {
    app.version
        .as_deref()
        .or(app.etag.as_deref())
        .unwrap_or("")
}

/// Dotted version compare: numeric components numerically, others as strings, missing as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => {
                let l = l.unwrap_or("0");
                let r = r.unwrap_or("0");
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
