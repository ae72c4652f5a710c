// Copyright 2026 The cardfat Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The fixed-size sector cache (component B): the only shared mutable
//! substrate every other component reads and writes through.

use bitflags::bitflags;
use cardfat_device::{BlockDevice, ReadOutcome, WriteOutcome, SECTOR_SIZE};
use log::{error, trace};

bitflags! {
    /// Flags passed to [`SectorCache::acquire`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u8 {
        /// The on-disk contents must be present before success is reported.
        const READ        = 0b0000_0001;
        /// The caller intends to modify the sector; marks it `Dirty`.
        const WRITE        = 0b0000_0010;
        /// Pin the slot so it cannot be flushed or evicted.
        const LOCK         = 0b0000_0100;
        /// Clear a previously-set lock.
        const UNLOCK       = 0b0000_1000;
        /// Prefer this slot for eviction once clean (only honored on a fill).
        const DISCARDABLE  = 0b0001_0000;
        /// Increment the retain-count, preventing discard until released.
        const RETAIN       = 0b0010_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Reading,
    InSync,
    Dirty,
    Writing,
}

struct CacheSlot {
    sector_index: u32,
    state: SlotState,
    last_use: u32,
    locked: bool,
    retain_count: u16,
    discardable: bool,
    data: [u8; SECTOR_SIZE],
}

impl CacheSlot {
    const fn empty() -> Self {
        Self {
            sector_index: 0,
            state: SlotState::Empty,
            last_use: 0,
            locked: false,
            retain_count: 0,
            discardable: false,
            data: [0u8; SECTOR_SIZE],
        }
    }

    fn evictable(&self) -> bool {
        matches!(self.state, SlotState::InSync) && !self.locked && self.retain_count == 0
    }
}

/// Outcome of [`SectorCache::acquire`].
pub enum AcquireResult {
    Success(usize),
    InProgress,
    /// An invariant was violated (e.g. a completion landed on an
    /// unexpected state). The filesystem must escalate to `Fatal`.
    Fatal,
}

/// A fixed-size, N-slot sector cache with LRU-with-pinning eviction.
pub struct SectorCache<const N: usize> {
    slots: [CacheSlot; N],
    tick: u32,
    dirty_count: u32,
}

impl<const N: usize> SectorCache<N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| CacheSlot::empty()),
            tick: 0,
            dirty_count: 0,
        }
    }

    pub fn dirty_count(&self) -> u32 {
        self.dirty_count
    }

    fn find_slot(&self, sector: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.state != SlotState::Empty && slot.sector_index == sector)
    }

    /// Allocation policy: existing slot > empty slot > clean+unlocked
    /// discardable slot > clean+unlocked slot with the smallest `last_use`.
    fn choose_victim(&self) -> Option<usize> {
        if let Some(index) = self.slots.iter().position(|slot| slot.state == SlotState::Empty) {
            return Some(index);
        }

        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.evictable() && slot.discardable)
        {
            return Some(index);
        }

        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.evictable())
            .min_by_key(|(_, slot)| slot.last_use)
            .map(|(index, _)| index)
    }

    pub fn data(&self, slot_index: usize) -> &[u8; SECTOR_SIZE] {
        &self.slots[slot_index].data
    }

    pub fn data_mut(&mut self, slot_index: usize) -> &mut [u8; SECTOR_SIZE] {
        &mut self.slots[slot_index].data
    }

    pub fn sector_of(&self, slot_index: usize) -> u32 {
        self.slots[slot_index].sector_index
    }

    pub fn mark_dirty(&mut self, slot_index: usize) {
        let slot = &mut self.slots[slot_index];
        if slot.state != SlotState::Dirty {
            self.dirty_count += 1;
        }
        slot.state = SlotState::Dirty;
    }

    pub fn release_retain(&mut self, slot_index: usize) {
        let slot = &mut self.slots[slot_index];
        slot.retain_count = slot.retain_count.saturating_sub(1);
    }

    /// Attempt to acquire `sector` under the given `flags`. Submits an
    /// async read to `device` if the contents are requested but not yet
    /// cached.
    pub fn acquire<D: BlockDevice>(
        &mut self,
        device: &mut D,
        sector: u32,
        flags: CacheFlags,
    ) -> AcquireResult {
        self.tick += 1;
        let tick = self.tick;

        let slot_index = match self.find_slot(sector) {
            Some(index) => index,
            None => match self.choose_victim() {
                Some(index) => index,
                None => return AcquireResult::InProgress,
            },
        };

        let slot = &mut self.slots[slot_index];

        if slot.state == SlotState::Empty || slot.sector_index != sector {
            // Fresh allocation of this slot for `sector`.
            slot.sector_index = sector;
            if flags.contains(CacheFlags::READ) {
                match device.submit_read(sector) {
                    ReadOutcome::Pending => {
                        slot.state = SlotState::Reading;
                        return AcquireResult::InProgress;
                    }
                    ReadOutcome::Busy => return AcquireResult::InProgress,
                }
            } else if flags.contains(CacheFlags::WRITE) {
                slot.state = SlotState::Dirty;
                self.dirty_count += 1;
            } else {
                slot.state = SlotState::InSync;
            }
            slot.discardable = flags.contains(CacheFlags::DISCARDABLE);
        }

        let slot = &mut self.slots[slot_index];
        match slot.state {
            SlotState::Reading | SlotState::Writing => return AcquireResult::InProgress,
            SlotState::Empty => {
                error!("cache slot {slot_index} still empty after fill attempt");
                return AcquireResult::Fatal;
            }
            SlotState::InSync | SlotState::Dirty => {}
        }

        slot.last_use = tick;

        if flags.contains(CacheFlags::WRITE) && slot.state == SlotState::InSync {
            slot.state = SlotState::Dirty;
            self.dirty_count += 1;
        }
        if flags.contains(CacheFlags::LOCK) {
            slot.locked = true;
        }
        if flags.contains(CacheFlags::UNLOCK) {
            slot.locked = false;
        }
        if flags.contains(CacheFlags::RETAIN) {
            slot.retain_count += 1;
        }

        AcquireResult::Success(slot_index)
    }

    /// Dispatch writes for dirty, unlocked slots. Returns true iff there is
    /// nothing left to write right now (all dirty slots are locked, or
    /// there are none).
    pub fn flush<D: BlockDevice>(&mut self, device: &mut D) -> bool {
        let mut nothing_to_do = true;

        for slot in self.slots.iter_mut() {
            if slot.state != SlotState::Dirty || slot.locked {
                continue;
            }

            nothing_to_do = false;
            match device.submit_write(slot.sector_index, &slot.data) {
                WriteOutcome::Pending => slot.state = SlotState::Writing,
                WriteOutcome::Busy => {}
            }
        }

        nothing_to_do
    }

    /// Drain device completions, advancing the per-slot state machine. Must
    /// be called every `poll()` before any component relies on cache state.
    pub fn pump<D: BlockDevice>(&mut self, device: &mut D) -> Result<(), ()> {
        while let Some((sector, data)) = device.take_completed_read() {
            let Some(slot_index) = self
                .slots
                .iter()
                .position(|slot| slot.sector_index == sector && slot.state == SlotState::Reading)
            else {
                error!("read completion for sector {sector} matched no Reading slot");
                return Err(());
            };
            let slot = &mut self.slots[slot_index];
            slot.data = data;
            slot.state = SlotState::InSync;
            trace!("sector {sector} filled into cache slot {slot_index}");
        }

        while let Some(sector) = device.take_completed_write() {
            let Some(slot_index) = self
                .slots
                .iter()
                .position(|slot| slot.sector_index == sector && slot.state == SlotState::Writing)
            else {
                // A slot re-dirtied during its own Writing phase is expected
                // to have moved back to Dirty already and no longer match
                // `Writing` here; that is not a fault.
                continue;
            };
            let slot = &mut self.slots[slot_index];
            slot.state = SlotState::InSync;
            self.dirty_count = self.dirty_count.saturating_sub(1);
            trace!("sector {sector} write completed for cache slot {slot_index}");
        }

        Ok(())
    }
}

impl<const N: usize> Default for SectorCache<N> {
    fn default() -> Self {
        Self::new()
    }
}
