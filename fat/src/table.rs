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

//! The FAT accessor (component C): cluster <-> FAT sector/entry
//! decomposition, next-cluster read/write, and the free/occupied cluster
//! scan that the freefile and file engines build on.

use cardfat_device::BlockDevice;

use crate::bpb::FatType;
use crate::cache::CacheFlags;
use crate::{Filesystem, Status};

pub const FAT16_EOC_WRITE: u32 = 0xFFFF;
pub const FAT32_EOC_WRITE: u32 = 0x0FFF_FFFF;

fn is_eoc(fs_type: FatType, entry: u32) -> bool {
    match fs_type {
        FatType::Fat16 => entry >= 0xFFF8,
        FatType::Fat32 => (entry & 0x0FFF_FFFF) >= 0x0FFF_FFF8,
    }
}

/// Conditions usable with [`Filesystem::find_cluster_with_condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterSearchCondition {
    /// The cluster is free, and it is the first entry of its FAT sector
    /// (the search steps in whole-sector strides).
    FreeSectorAtBeginningOfFatSector,
    /// The cluster is free (steps one cluster at a time).
    FreeSector,
    /// The cluster is occupied, or the scan ran off the end of the volume
    /// (steps one cluster at a time).
    OccupiedSector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindClusterResult {
    Found,
    NotFound,
    InProgress,
    Fatal,
}

/// Resumable cursor for [`Filesystem::find_cluster_with_condition`]. Carries
/// the position a logical scan started from so a scan that wraps past
/// end-of-volume can recognize it has come all the way back around — without
/// this, a scan seeded anywhere but the very start of the cluster heap never
/// terminates on a full volume, since the wrap point alone doesn't identify
/// where the scan began.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClusterScan {
    start: u32,
    cursor: u32,
    wrapped: bool,
}

impl ClusterScan {
    pub(crate) fn new(start: u32) -> Self {
        Self { start, cursor: start, wrapped: false }
    }

    pub(crate) fn cursor(&self) -> u32 {
        self.cursor
    }
}

impl<D: BlockDevice, const CACHE_SECTORS: usize, const MAX_FILES: usize>
    Filesystem<D, CACHE_SECTORS, MAX_FILES>
{
    /// Decompose cluster `c` into `(fat_sector_index, entry_index)`.
    pub(crate) fn fat_position_for_cluster(&self, cluster: u32) -> (u32, u32) {
        let geometry = self.geometry();
        match geometry.fs_type {
            FatType::Fat16 => (cluster >> 8, cluster & 0xFF),
            FatType::Fat32 => ((cluster & 0x0FFF_FFFF) >> 7, cluster & 0x7F),
        }
    }

    pub(crate) fn fat_entries_per_sector(&self) -> u32 {
        self.geometry().entries_per_fat_sector()
    }

    /// Read the raw next-cluster link for `cluster`. The caller classifies
    /// the result as free (0), EOC, or a data cluster.
    pub(crate) fn fat_get_next(&mut self, cluster: u32) -> Status<u32> {
        let (fat_sector_index, entry_index) = self.fat_position_for_cluster(cluster);
        let physical_sector = self.geometry().fat_sector_to_physical(0, fat_sector_index);

        let slot = match self.cache.acquire(&mut self.device, physical_sector, CacheFlags::READ) {
            crate::cache::AcquireResult::Success(slot) => slot,
            crate::cache::AcquireResult::InProgress => return Status::InProgress,
            crate::cache::AcquireResult::Fatal => return Status::Failure,
        };

        let data = self.cache.data(slot);
        let next = match self.geometry().fs_type {
            FatType::Fat16 => {
                let offset = entry_index as usize * 2;
                u16::from_le_bytes([data[offset], data[offset + 1]]) as u32
            }
            FatType::Fat32 => {
                let offset = entry_index as usize * 4;
                u32::from_le_bytes([
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    data[offset + 3],
                ]) & 0x0FFF_FFFF
            }
        };

        Status::Success(next)
    }

    /// Classify a raw value read by `fat_get_next` as free / EOC / data.
    pub(crate) fn is_end_of_chain(&self, entry: u32) -> bool {
        is_eoc(self.geometry().fs_type, entry)
    }

    /// Write the next-cluster link for `cluster` through the cache
    /// (read-modify-write of the hosting FAT sector).
    pub(crate) fn fat_set_next(&mut self, cluster: u32, value: u32) -> Status<()> {
        self.fat_set_next_flagged(cluster, value, CacheFlags::empty())
    }

    /// As [`Self::fat_set_next`], with extra cache flags (e.g.
    /// `DISCARDABLE` for the freefile's bulk supercluster-chain writes)
    /// OR'd into the acquire.
    pub(crate) fn fat_set_next_flagged(&mut self, cluster: u32, value: u32, extra_flags: CacheFlags) -> Status<()> {
        let (fat_sector_index, entry_index) = self.fat_position_for_cluster(cluster);
        let physical_sector = self.geometry().fat_sector_to_physical(0, fat_sector_index);

        let slot = match self.cache.acquire(
            &mut self.device,
            physical_sector,
            CacheFlags::READ | CacheFlags::WRITE | extra_flags,
        ) {
            crate::cache::AcquireResult::Success(slot) => slot,
            crate::cache::AcquireResult::InProgress => return Status::InProgress,
            crate::cache::AcquireResult::Fatal => return Status::Failure,
        };

        let fs_type = self.geometry().fs_type;
        let data = self.cache.data_mut(slot);
        match fs_type {
            FatType::Fat16 => {
                let offset = entry_index as usize * 2;
                let bytes = (value as u16).to_le_bytes();
                data[offset] = bytes[0];
                data[offset + 1] = bytes[1];
            }
            FatType::Fat32 => {
                let offset = entry_index as usize * 4;
                // Preserve the reserved top 4 bits of the existing entry.
                let existing = u32::from_le_bytes([
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    data[offset + 3],
                ]);
                let merged = (existing & 0xF000_0000) | (value & 0x0FFF_FFFF);
                let bytes = merged.to_le_bytes();
                data[offset..offset + 4].copy_from_slice(&bytes);
            }
        }
        self.cache.mark_dirty(slot);

        Status::Success(())
    }

    /// The freefile's cluster range, skipped by every free/occupied cluster
    /// scan so the contiguous reserve is never handed to another file.
    #[cfg(feature = "freefile")]
    fn freefile_cluster_range(&self) -> Option<(u32, u32)> {
        let size = self.free_file.directory_entry.file_size();
        if size == 0 {
            return None;
        }
        let start = self.free_file.directory_entry.first_cluster();
        let clusters = size / self.geometry().cluster_size_bytes();
        Some((start, start + clusters))
    }

    #[cfg(not(feature = "freefile"))]
    fn freefile_cluster_range(&self) -> Option<(u32, u32)> {
        None
    }

    /// Scan forward from `scan`'s cursor for a cluster matching `condition`,
    /// wrapping to the start of the cluster heap at end-of-volume. On
    /// `Found`, `scan.cursor()` holds the result; on `InProgress`, `scan` is
    /// left in the state to resume the same logical scan from (the caller
    /// must persist it across the `InProgress` return, the same way
    /// `search_cursor` fields are already threaded through phase state).
    pub(crate) fn find_cluster_with_condition(
        &mut self,
        scan: &mut ClusterScan,
        condition: ClusterSearchCondition,
    ) -> FindClusterResult {
        let entries_per_sector = self.fat_entries_per_sector();
        let last_cluster = self.geometry().num_clusters + 2;

        loop {
            if scan.cursor >= last_cluster {
                scan.cursor = entries_per_sector; // cluster 0/1 are reserved, never eligible
                scan.wrapped = true;
            }
            if scan.wrapped && scan.cursor >= scan.start {
                return FindClusterResult::NotFound;
            }

            if let Some((start, end)) = self.freefile_cluster_range() {
                if scan.cursor >= start && scan.cursor < end {
                    scan.cursor = end;
                    continue;
                }
            }

            match self.fat_get_next(scan.cursor) {
                Status::InProgress => return FindClusterResult::InProgress,
                Status::Failure => return FindClusterResult::Fatal,
                Status::Success(entry) => {
                    let free = entry == 0;
                    let matched = match condition {
                        ClusterSearchCondition::FreeSectorAtBeginningOfFatSector => free,
                        ClusterSearchCondition::FreeSector => free,
                        ClusterSearchCondition::OccupiedSector => {
                            !free || scan.cursor + 1 >= last_cluster
                        }
                    };

                    if matched {
                        return FindClusterResult::Found;
                    }
                }
            }

            scan.cursor += match condition {
                ClusterSearchCondition::FreeSectorAtBeginningOfFatSector => entries_per_sector,
                ClusterSearchCondition::FreeSector | ClusterSearchCondition::OccupiedSector => 1,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpb::Geometry;
    use cardfat_device::MemoryBlockDevice;

    fn fat16_fs() -> Filesystem<MemoryBlockDevice, 4, 4> {
        Filesystem::new(MemoryBlockDevice::new(16))
    }

    fn fat32_fs() -> Filesystem<MemoryBlockDevice, 4, 4> {
        let mut fs = Filesystem::new(MemoryBlockDevice::new(16));
        fs.geometry.fs_type = FatType::Fat32;
        fs
    }

    /// A two-FAT-sector volume (Fat32: 128 entries per sector, 140
    /// clusters) for exercising `find_cluster_with_condition`'s wraparound
    /// directly. A scan seeded inside the second FAT sector (`>=128`) only
    /// ever revisits clusters `128..142` when it wraps, so tests only need
    /// to populate that range.
    fn small_fs() -> Filesystem<MemoryBlockDevice, 4, 4> {
        let mut fs = Filesystem::new(MemoryBlockDevice::new(16));
        fs.geometry = Geometry {
            fs_type: FatType::Fat32,
            sectors_per_cluster: 1,
            num_fats: 1,
            fat_start_sector: 1,
            fat_sectors: 2,
            cluster_start_sector: 3,
            num_clusters: 140,
            root_directory_cluster: 2,
            root_directory_start_sector: 0,
            root_directory_sectors: 0,
            partition_start_sector: 0,
        };
        fs
    }

    fn drive_set(fs: &mut Filesystem<MemoryBlockDevice, 4, 4>, cluster: u32, value: u32) {
        for _ in 0..32 {
            match fs.fat_set_next(cluster, value) {
                Status::Success(()) => return,
                Status::Failure => panic!("unexpected failure"),
                Status::InProgress => {
                    fs.device.poll();
                    fs.cache.pump(&mut fs.device).unwrap();
                }
            }
        }
        panic!("did not converge within 32 polls");
    }

    fn drive_find(
        fs: &mut Filesystem<MemoryBlockDevice, 4, 4>,
        scan: &mut ClusterScan,
        condition: ClusterSearchCondition,
    ) -> FindClusterResult {
        for _ in 0..64 {
            match fs.find_cluster_with_condition(scan, condition) {
                FindClusterResult::InProgress => {
                    fs.device.poll();
                    fs.cache.pump(&mut fs.device).unwrap();
                }
                other => return other,
            }
        }
        panic!("did not converge within 64 polls");
    }

    #[test]
    fn fat16_cluster_position_splits_at_byte_256() {
        let fs = fat16_fs();
        assert_eq!(fs.fat_position_for_cluster(0), (0, 0));
        assert_eq!(fs.fat_position_for_cluster(255), (0, 255));
        assert_eq!(fs.fat_position_for_cluster(256), (1, 0));
    }

    #[test]
    fn fat32_cluster_position_splits_at_128_entries() {
        let fs = fat32_fs();
        assert_eq!(fs.fat_position_for_cluster(127), (0, 127));
        assert_eq!(fs.fat_position_for_cluster(128), (1, 0));
    }

    #[test]
    fn is_end_of_chain_matches_fat_specific_thresholds() {
        let fs16 = fat16_fs();
        assert!(!fs16.is_end_of_chain(0xFFF7));
        assert!(fs16.is_end_of_chain(0xFFF8));

        let fs32 = fat32_fs();
        assert!(!fs32.is_end_of_chain(0x0FFF_FFF7));
        assert!(fs32.is_end_of_chain(FAT32_EOC_WRITE));
    }

    #[test]
    fn find_cluster_with_condition_terminates_on_a_full_volume_scan_started_mid_volume() {
        let mut fs = small_fs();
        for cluster in 128..142u32 {
            drive_set(&mut fs, cluster, 0x0FFF_FFFF);
        }

        // Seed the scan well past the start of the second FAT sector, so a
        // naive wrap-to-`entries_per_sector` check (rather than back to the
        // original start) would never notice the scan has come full circle.
        let mut scan = ClusterScan::new(130);
        let result = drive_find(&mut fs, &mut scan, ClusterSearchCondition::FreeSector);
        assert_eq!(result, FindClusterResult::NotFound);
    }

    #[test]
    fn find_cluster_with_condition_finds_a_free_cluster_after_wrapping() {
        let mut fs = small_fs();
        for cluster in 128..142u32 {
            drive_set(&mut fs, cluster, 0x0FFF_FFFF);
        }
        drive_set(&mut fs, 128, 0);

        let mut scan = ClusterScan::new(130);
        let result = drive_find(&mut fs, &mut scan, ClusterSearchCondition::FreeSector);
        assert_eq!(result, FindClusterResult::Found);
        assert_eq!(scan.cursor(), 128);
    }
}
