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

//! The block device interface consumed by the filesystem core.
//!
//! A real device (SD card over SPI/SDIO, etc.) is expected to queue at most a
//! handful of requests and report completion on a later `poll()`. Nothing here
//! blocks: `submit_read`/`submit_write` only say whether the request was
//! accepted, and the caller comes back on a later poll to collect the result.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

pub use cardfat_err::DeviceError;

/// Every volume this crate understands uses 512-byte sectors.
pub const SECTOR_SIZE: usize = 512;

/// Result of submitting a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Accepted; call `take_completed_read` on a later poll to collect it.
    Pending,
    /// The device has no room for another request right now; resubmit later.
    Busy,
}

/// Result of submitting a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Accepted; call `take_completed_write` on a later poll to confirm it landed.
    Pending,
    /// The device has no room for another request right now; resubmit later.
    Busy,
}

/// Non-blocking 512-byte-sector block device.
///
/// Implementations own their own in-flight queue. `poll` advances that queue
/// by one step (e.g. services one DMA completion interrupt's worth of work);
/// it never blocks waiting on hardware.
pub trait BlockDevice {
    /// Total number of addressable sectors on the device.
    fn sector_count(&self) -> u32;

    /// Submit a read of `sector`. The data becomes available through
    /// `take_completed_read` after a sufficient number of `poll` calls.
    fn submit_read(&mut self, sector: u32) -> ReadOutcome;

    /// Submit a write of `sector`. The bytes are copied out of `data`
    /// immediately, so the caller's buffer is free to reuse right away; the
    /// *device* still needs further polling before the write is durable.
    fn submit_write(&mut self, sector: u32, data: &[u8; SECTOR_SIZE]) -> WriteOutcome;

    /// Advance whatever in-flight work the device is doing by one step.
    fn poll(&mut self);

    /// Pop the next completed read, if any.
    fn take_completed_read(&mut self) -> Option<(u32, [u8; SECTOR_SIZE])>;

    /// Pop the next completed write's sector number, if any.
    fn take_completed_write(&mut self) -> Option<u32>;
}

enum Pending {
    Read { sector: u32, ready_at: u32 },
    Write { sector: u32, ready_at: u32 },
}

/// A RAM-backed device for tests and simulation. Reads and writes can be
/// given an artificial latency (in `poll()` ticks) so callers can exercise
/// the `Pending`/`InProgress` paths of the filesystem core without real
/// hardware.
pub struct MemoryBlockDevice {
    sectors: Vec<[u8; SECTOR_SIZE]>,
    tick: u32,
    latency: u32,
    queue_depth: usize,
    in_flight: VecDeque<Pending>,
    completed_reads: VecDeque<(u32, [u8; SECTOR_SIZE])>,
    completed_writes: VecDeque<u32>,
}

impl MemoryBlockDevice {
    pub fn new(sector_count: u32) -> Self {
        Self::with_latency(sector_count, 0)
    }

    /// `latency` is the number of `poll()` calls a request needs before it
    /// shows up in `take_completed_read`/`take_completed_write`.
    pub fn with_latency(sector_count: u32, latency: u32) -> Self {
        Self {
            sectors: vec![[0u8; SECTOR_SIZE]; sector_count as usize],
            tick: 0,
            latency,
            queue_depth: 4,
            in_flight: VecDeque::new(),
            completed_reads: VecDeque::new(),
            completed_writes: VecDeque::new(),
        }
    }

    /// Raw access for test setup (e.g. planting an MBR/BPB image).
    pub fn raw_sectors_mut(&mut self) -> &mut [[u8; SECTOR_SIZE]] {
        &mut self.sectors
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn sector_count(&self) -> u32 {
        self.sectors.len() as u32
    }

    fn submit_read(&mut self, sector: u32) -> ReadOutcome {
        if self.in_flight.len() >= self.queue_depth {
            return ReadOutcome::Busy;
        }
        self.in_flight.push_back(Pending::Read {
            sector,
            ready_at: self.tick + self.latency,
        });
        ReadOutcome::Pending
    }

    fn submit_write(&mut self, sector: u32, data: &[u8; SECTOR_SIZE]) -> WriteOutcome {
        if self.in_flight.len() >= self.queue_depth {
            return WriteOutcome::Busy;
        }
        if let Some(slot) = self.sectors.get_mut(sector as usize) {
            *slot = *data;
        }
        self.in_flight.push_back(Pending::Write {
            sector,
            ready_at: self.tick + self.latency,
        });
        WriteOutcome::Pending
    }

    fn poll(&mut self) {
        self.tick += 1;

        let mut still_pending = VecDeque::new();
        while let Some(request) = self.in_flight.pop_front() {
            let (ready_at, done) = match &request {
                Pending::Read { ready_at, .. } | Pending::Write { ready_at, .. } => {
                    (*ready_at, *ready_at <= self.tick)
                }
            };
            if done {
                match request {
                    Pending::Read { sector, .. } => {
                        let data = self
                            .sectors
                            .get(sector as usize)
                            .copied()
                            .unwrap_or([0u8; SECTOR_SIZE]);
                        self.completed_reads.push_back((sector, data));
                    }
                    Pending::Write { sector, .. } => {
                        self.completed_writes.push_back(sector);
                    }
                }
            } else {
                let _ = ready_at;
                still_pending.push_back(request);
            }
        }
        self.in_flight = still_pending;
    }

    fn take_completed_read(&mut self) -> Option<(u32, [u8; SECTOR_SIZE])> {
        self.completed_reads.pop_front()
    }

    fn take_completed_write(&mut self) -> Option<u32> {
        self.completed_writes.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_device_completes_on_first_poll() {
        let mut dev = MemoryBlockDevice::new(16);
        dev.raw_sectors_mut()[3][0] = 0xAB;
        assert_eq!(dev.submit_read(3), ReadOutcome::Pending);
        dev.poll();
        let (sector, data) = dev.take_completed_read().unwrap();
        assert_eq!(sector, 3);
        assert_eq!(data[0], 0xAB);
    }

    #[test]
    fn latency_delays_completion() {
        let mut dev = MemoryBlockDevice::with_latency(4, 3);
        dev.submit_read(0);
        dev.poll();
        dev.poll();
        assert!(dev.take_completed_read().is_none());
        dev.poll();
        assert!(dev.take_completed_read().is_some());
    }

    #[test]
    fn write_is_visible_to_later_reads_immediately() {
        let mut dev = MemoryBlockDevice::with_latency(4, 5);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0x42;
        dev.submit_write(1, &buf);
        dev.submit_read(1);
        dev.poll();
        let (_, data) = dev.take_completed_read().unwrap();
        assert_eq!(data[0], 0x42);
    }
}
