//! In-memory DMX state
//!
//! Each universe lives behind its own lock so writers to different universes
//! only contend on the short map lookup. Universes are created on first write
//! and never removed.

use dashmap::DashMap;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Channel, ChannelValue, Universe, UNIVERSE_SIZE};

/// Point-in-time copy of every known universe, ordered by universe number
pub type UniverseSnapshot = BTreeMap<u16, Universe>;

/// Concurrency-safe table of universe number -> channel values
#[derive(Debug, Default)]
pub struct UniverseStore {
    universes: DashMap<u16, Arc<RwLock<Universe>>>,
}

impl UniverseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or lazily create the slot for a universe.
    /// The map guard is released before the caller touches the slot.
    fn slot(&self, universe: u16) -> Arc<RwLock<Universe>> {
        self.universes
            .entry(universe)
            .or_insert_with(|| Arc::new(RwLock::new([0u8; UNIVERSE_SIZE])))
            .clone()
    }

    /// Set one channel, creating the universe if needed
    pub fn set_channel(&self, universe: u16, channel: Channel, value: u8) {
        let slot = self.slot(universe);
        slot.write()[channel.index()] = value;
    }

    /// Apply a batch of updates.
    ///
    /// All affected universes are locked together for the whole batch, so a
    /// concurrent [`get`](Self::get) sees each universe either entirely before
    /// or entirely after it. Entries apply in order; later writes to the same
    /// channel win.
    pub fn set_channel_values(&self, values: &[ChannelValue]) {
        if values.is_empty() {
            return;
        }

        let mut universes: Vec<u16> = values.iter().map(|v| v.universe).collect();
        universes.sort_unstable();
        universes.dedup();

        // Lock in ascending universe order so two batches never deadlock.
        let slots: Vec<(u16, Arc<RwLock<Universe>>)> =
            universes.iter().map(|&u| (u, self.slot(u))).collect();
        let mut guards: Vec<(u16, RwLockWriteGuard<'_, Universe>)> =
            slots.iter().map(|(u, slot)| (*u, slot.write())).collect();

        for v in values {
            if let Ok(pos) = guards.binary_search_by_key(&v.universe, |(u, _)| *u) {
                guards[pos].1[v.channel.index()] = v.value;
            }
        }
    }

    /// Deep copy of all universes; safe to iterate while writers continue
    pub fn get(&self) -> UniverseSnapshot {
        let slots: Vec<(u16, Arc<RwLock<Universe>>)> = self
            .universes
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        slots
            .into_iter()
            .map(|(universe, slot)| (universe, *slot.read()))
            .collect()
    }

    /// Copy of a single universe, if it has been written
    pub fn get_universe(&self, universe: u16) -> Option<Universe> {
        let slot = self.universes.get(&universe)?.value().clone();
        let data = *slot.read();
        Some(data)
    }

    /// Number of universes written so far
    pub fn len(&self) -> usize {
        self.universes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.universes.is_empty()
    }
}
