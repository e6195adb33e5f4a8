//! This module contains the structures that accumulate code sizes
//! while the listing APIs are traversed.
//!
//! Sizes are kept per version, per item (function or layer) and as a
//! grand total. Totals are adjusted on every insert so they always match
//! the sum of what is stored.
//!

use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

/// The kinds of code artifact we measure.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum ItemKind {
    Functions,
    Layers,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ItemKind::Functions => write!(f, "Functions"),
            ItemKind::Layers => write!(f, "Layers"),
        }
    }
}

/// Code sizes of every version of a single function or layer.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ItemSizes {
    versions: BTreeMap<String, u64>,
    total: u64,
}

impl ItemSizes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the size of one version.
    ///
    /// A version that was already recorded is replaced, the total is
    /// adjusted by the difference so a version is never counted twice.
    /// Returns the signed change applied to the total.
    pub fn record(&mut self, version: impl Into<String>, size: u64) -> i128 {
        match self.versions.insert(version.into(), size) {
            Some(previous) => {
                self.total = self.total - previous + size;
                i128::from(size) - i128::from(previous)
            }
            None => {
                self.total += size;
                i128::from(size)
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn versions(&self) -> &BTreeMap<String, u64> {
        &self.versions
    }

    pub fn get(&self, version: &str) -> Option<u64> {
        self.versions.get(version).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// The result of one full traversal of a listing API.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SizeAggregate {
    items: BTreeMap<String, ItemSizes>,
    total: u64,
}

impl SizeAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges the sizes of an item into the aggregate.
    ///
    /// If the item is already present the version maps are combined,
    /// the previously accumulated versions are kept.
    pub fn merge(&mut self, name: impl Into<String>, sizes: ItemSizes) {
        match self.items.entry(name.into()) {
            Entry::Vacant(slot) => {
                self.total += sizes.total;
                slot.insert(sizes);
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                for (version, size) in sizes.versions {
                    let delta = existing.record(version, size);
                    self.total = apply_delta(self.total, delta);
                }
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn items(&self) -> &BTreeMap<String, ItemSizes> {
        &self.items
    }

    pub fn item(&self, name: &str) -> Option<&ItemSizes> {
        self.items.get(name)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// The delta always comes from an item whose own total stays non-negative,
// so the grand total cannot underflow.
fn apply_delta(total: u64, delta: i128) -> u64 {
    (i128::from(total) + delta) as u64
}
