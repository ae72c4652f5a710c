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

//! Shared fixture: a from-scratch, valid FAT16 MBR+BPB image planted onto a
//! `MemoryBlockDevice`, plus small driving helpers so tests don't each
//! reimplement the poll-until-done loop.

use cardfat::{FilesystemState, Status};
use cardfat_device::{MemoryBlockDevice, SECTOR_SIZE};

pub type Fs = cardfat::Filesystem<MemoryBlockDevice>;

const PARTITION_START: u32 = 1;
const RESERVED_SECTORS: u32 = 1;
const NUM_FATS: u32 = 1;
const FAT_SECTORS: u32 = 17;
const ROOT_ENTRIES: u32 = 512;
const ROOT_DIR_SECTORS: u32 = ROOT_ENTRIES * 32 / SECTOR_SIZE as u32;
const CLUSTER_START: u32 = RESERVED_SECTORS + NUM_FATS * FAT_SECTORS + ROOT_DIR_SECTORS;
const DATA_CLUSTERS: u32 = 4_100;
const TOTAL_PARTITION_SECTORS: u32 = CLUSTER_START + DATA_CLUSTERS;
pub const DEVICE_SECTORS: u32 = PARTITION_START + TOTAL_PARTITION_SECTORS;

fn write_mbr(sectors: &mut [[u8; SECTOR_SIZE]]) {
    let sector = &mut sectors[0];
    sector[446 + 4] = 0x0C; // FAT32 LBA type byte; the mount scan only checks this marker
    sector[446 + 8..446 + 12].copy_from_slice(&PARTITION_START.to_le_bytes());
    sector[510] = 0x55;
    sector[511] = 0xAA;
}

fn write_bpb(sectors: &mut [[u8; SECTOR_SIZE]]) {
    let sector = &mut sectors[PARTITION_START as usize];
    sector[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
    sector[13] = 1; // sectors per cluster
    sector[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
    sector[16] = NUM_FATS as u8;
    sector[17..19].copy_from_slice(&(ROOT_ENTRIES as u16).to_le_bytes());
    sector[22..24].copy_from_slice(&(FAT_SECTORS as u16).to_le_bytes());
    sector[32..36].copy_from_slice(&TOTAL_PARTITION_SECTORS.to_le_bytes());
    sector[510] = 0x55;
    sector[511] = 0xAA;
}

/// A device with a valid, empty FAT16 volume, large enough for the
/// freefile scan to find a real reserve but small enough to build quickly.
pub fn fat16_device() -> MemoryBlockDevice {
    let mut device = MemoryBlockDevice::new(DEVICE_SECTORS);
    write_mbr(device.raw_sectors_mut());
    write_bpb(device.raw_sectors_mut());
    device
}

/// Drive `fs.init()` to completion, panicking if it ends up `Fatal`.
pub fn mount(fs: &mut Fs) {
    fs.init();
    for _ in 0..20_000 {
        match fs.state() {
            FilesystemState::Ready => return,
            FilesystemState::Fatal => panic!("mount failed: {:?}", fs.fatal_reason()),
            _ => fs.poll(),
        }
    }
    panic!("mount did not converge");
}

/// Retry `attempt` against `fs`, calling `fs.poll()` between `InProgress`
/// results, until it succeeds or fails outright.
pub fn drive<T>(fs: &mut Fs, mut attempt: impl FnMut(&mut Fs) -> Status<T>) -> T {
    for _ in 0..20_000 {
        match attempt(fs) {
            Status::Success(value) => return value,
            Status::Failure => panic!("operation failed"),
            Status::InProgress => fs.poll(),
        }
    }
    panic!("operation did not converge");
}
