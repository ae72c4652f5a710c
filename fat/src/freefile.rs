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

//! The freefile allocator (component D): a mount-time scan for the largest
//! contiguous free region, donated whole-supercluster-at-a-time to files
//! opened in contiguous mode. Entirely absent unless the `freefile` feature
//! is enabled.

use cardfat_device::BlockDevice;

use crate::bpb::FatType;
use crate::cache::{AcquireResult, CacheFlags};
use crate::file::{FileHandle, FileMode, Operation};
use crate::table::{ClusterScan, ClusterSearchCondition, FindClusterResult};
use crate::{Filesystem, Status};

/// Trimmed off the tail of the discovered hole before it is handed to the
/// freefile, so a nearly-full volume still leaves headroom for ordinary
/// (non-contiguous) allocation.
pub(crate) const FREEFILE_LEAVE_CLUSTERS: u32 = 100;

#[derive(Debug, Clone, Copy)]
pub(crate) enum HoleSearchPhase {
    FindHole,
    /// `scan` is this hole's own resumable cursor, seeded fresh from
    /// `hole_start` when the hole is first found and threaded unchanged
    /// across `InProgress` returns — it must never be rebuilt from
    /// `hole_start` on re-entry, or the occupied-cluster search restarts
    /// from the hole's beginning on every cache miss.
    GrowHole { hole_start: u32, scan: ClusterScan },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum AppendSuperclusterPhase {
    UpdateFreefileDirectory,
    UpdateFileDirectory,
}

impl<D: BlockDevice, const CACHE_SECTORS: usize, const MAX_FILES: usize>
    Filesystem<D, CACHE_SECTORS, MAX_FILES>
{
    /// One step of the find-hole/grow-hole search for the largest
    /// contiguous free region. Call repeatedly (threading `phase`,
    /// `find_scan`, `best_start`, `best_length` through the mount substate)
    /// until it returns anything but `InProgress`.
    pub(crate) fn largest_contiguous_free_block_step(
        &mut self,
        phase: &mut HoleSearchPhase,
        find_scan: &mut ClusterScan,
        best_start: &mut u32,
        best_length: &mut u32,
    ) -> Status<()> {
        let entries_per_sector = self.fat_entries_per_sector();

        loop {
            match *phase {
                HoleSearchPhase::FindHole => {
                    match self.find_cluster_with_condition(
                        find_scan,
                        ClusterSearchCondition::FreeSectorAtBeginningOfFatSector,
                    ) {
                        FindClusterResult::Found => {
                            let hole_start = find_scan.cursor();
                            *phase = HoleSearchPhase::GrowHole {
                                hole_start,
                                scan: ClusterScan::new(hole_start),
                            };
                        }
                        FindClusterResult::NotFound => return Status::Success(()),
                        FindClusterResult::InProgress => return Status::InProgress,
                        FindClusterResult::Fatal => return Status::Failure,
                    }
                }
                HoleSearchPhase::GrowHole { hole_start, mut scan } => {
                    match self.find_cluster_with_condition(&mut scan, ClusterSearchCondition::OccupiedSector) {
                        FindClusterResult::Found | FindClusterResult::NotFound => {
                            let hole_end = scan.cursor();
                            let length = hole_end.saturating_sub(hole_start);
                            if length > *best_length {
                                *best_length = length;
                                *best_start = hole_start;
                            }
                            *find_scan = ClusterScan::new(
                                hole_end.div_ceil(entries_per_sector) * entries_per_sector,
                            );
                            *phase = HoleSearchPhase::FindHole;
                        }
                        FindClusterResult::InProgress => {
                            *phase = HoleSearchPhase::GrowHole { hole_start, scan };
                            return Status::InProgress;
                        }
                        FindClusterResult::Fatal => return Status::Failure,
                    }
                }
            }
        }
    }

    /// Write a contiguous FAT chain of `length` clusters starting at
    /// `start`, terminated by an end-of-chain marker. Marks the touched FAT
    /// sectors discardable: this chain is written once at mount time and
    /// essentially never re-read as a whole.
    pub(crate) fn write_supercluster_chain_step(
        &mut self,
        start: u32,
        length: u32,
        index: &mut u32,
    ) -> Status<()> {
        while *index < length {
            let cluster = start + *index;
            let next = if *index + 1 == length {
                match self.geometry().fs_type {
                    FatType::Fat16 => crate::table::FAT16_EOC_WRITE,
                    FatType::Fat32 => crate::table::FAT32_EOC_WRITE,
                }
            } else {
                cluster + 1
            };

            match self.fat_set_next_flagged(cluster, next, CacheFlags::DISCARDABLE) {
                Status::Success(()) => *index += 1,
                Status::InProgress => return Status::InProgress,
                Status::Failure => return Status::Failure,
            }
        }

        Status::Success(())
    }

    /// Steal the first supercluster from the freefile reserve and link it
    /// onto `file`'s chain. Falls back to the regular (non-contiguous)
    /// allocator if the reserve has shrunk below one supercluster.
    pub(crate) fn append_supercluster(&mut self, file: &mut FileHandle) -> Status<()> {
        loop {
            let operation = core::mem::take(&mut file.operation);
            let (phase, allocated_cluster) = match operation {
                Operation::AppendSupercluster { phase, allocated_cluster } => (phase, allocated_cluster),
                _ => {
                    let supercluster_clusters = self.fat_entries_per_sector();
                    let reserve_size = self.free_file.directory_entry.file_size();
                    if reserve_size < self.geometry().supercluster_size_bytes() {
                        file.mode.remove(FileMode::CONTIGUOUS);
                        return self.append_free_cluster_regular(file);
                    }
                    let stolen_start = self.free_file.directory_entry.first_cluster();
                    let _ = supercluster_clusters;
                    (AppendSuperclusterPhase::UpdateFreefileDirectory, stolen_start)
                }
            };

            match phase {
                AppendSuperclusterPhase::UpdateFreefileDirectory => {
                    let supercluster_clusters = self.fat_entries_per_sector();
                    let cluster_size = self.geometry().cluster_size_bytes();

                    let new_start = allocated_cluster + supercluster_clusters;
                    let new_size =
                        self.free_file.directory_entry.file_size() - supercluster_clusters * cluster_size;
                    self.free_file.directory_entry.set_first_cluster(new_start);
                    self.free_file.directory_entry.set_file_size(new_size);

                    let position = self.free_file.entry_position;
                    let entry = self.free_file.directory_entry;
                    match self.save_directory_entry(position, &entry) {
                        Status::Success(()) => {
                            file.operation = Operation::AppendSupercluster {
                                phase: AppendSuperclusterPhase::UpdateFileDirectory,
                                allocated_cluster,
                            };
                        }
                        Status::InProgress => {
                            file.operation = Operation::AppendSupercluster {
                                phase: AppendSuperclusterPhase::UpdateFreefileDirectory,
                                allocated_cluster,
                            };
                            return Status::InProgress;
                        }
                        Status::Failure => return Status::Failure,
                    }
                }
                AppendSuperclusterPhase::UpdateFileDirectory => {
                    let supercluster_clusters = self.fat_entries_per_sector();

                    if file.previous_cluster != 0 {
                        match self.fat_set_next(file.previous_cluster, allocated_cluster) {
                            Status::Success(()) => {}
                            Status::InProgress => {
                                file.operation = Operation::AppendSupercluster {
                                    phase: AppendSuperclusterPhase::UpdateFileDirectory,
                                    allocated_cluster,
                                };
                                return Status::InProgress;
                            }
                            Status::Failure => return Status::Failure,
                        }
                    }

                    if file.first_cluster == 0 {
                        file.first_cluster = allocated_cluster;
                    }
                    if file.directory_entry.first_cluster() == 0 {
                        file.directory_entry.set_first_cluster(file.first_cluster);
                    }

                    // The stolen block is already a single contiguous,
                    // pre-linked chain (written by write_supercluster_chain_step
                    // at mount time); the new tail is its last cluster.
                    file.cursor_cluster = allocated_cluster;
                    file.previous_cluster = allocated_cluster + supercluster_clusters - 1;

                    return Status::Success(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpb::{FatType, Geometry};
    use cardfat_device::MemoryBlockDevice;

    fn fat16_fs() -> Filesystem<MemoryBlockDevice, 4, 4> {
        let mut fs = Filesystem::new(MemoryBlockDevice::new(16));
        fs.geometry = Geometry {
            fs_type: FatType::Fat16,
            sectors_per_cluster: 1,
            num_fats: 1,
            fat_start_sector: 1,
            fat_sectors: 1,
            cluster_start_sector: 2,
            num_clusters: 200,
            root_directory_cluster: 0,
            root_directory_start_sector: 1,
            root_directory_sectors: 1,
            partition_start_sector: 0,
        };
        fs
    }

    fn drive_until_success(fs: &mut Filesystem<MemoryBlockDevice, 4, 4>, index: &mut u32, start: u32, length: u32) {
        for _ in 0..32 {
            match fs.write_supercluster_chain_step(start, length, index) {
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

    fn drive_fat_get_next(fs: &mut Filesystem<MemoryBlockDevice, 4, 4>, cluster: u32) -> u32 {
        for _ in 0..32 {
            match fs.fat_get_next(cluster) {
                Status::Success(value) => return value,
                Status::Failure => panic!("unexpected failure"),
                Status::InProgress => {
                    fs.device.poll();
                    fs.cache.pump(&mut fs.device).unwrap();
                }
            }
        }
        panic!("did not converge within 32 polls");
    }

    #[test]
    fn write_supercluster_chain_links_contiguous_run_and_terminates() {
        let mut fs = fat16_fs();
        let mut index = 0;
        drive_until_success(&mut fs, &mut index, 10, 4);

        assert_eq!(drive_fat_get_next(&mut fs, 10), 11);
        assert_eq!(drive_fat_get_next(&mut fs, 12), 13);
        let terminator = drive_fat_get_next(&mut fs, 13);
        assert!(fs.is_end_of_chain(terminator));
    }

    #[test]
    fn leave_clusters_reserve_is_positive_and_sector_sized() {
        assert!(FREEFILE_LEAVE_CLUSTERS > 0);
    }
}
