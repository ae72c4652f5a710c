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

//! An asynchronous FAT16/FAT32 filesystem core for block-oriented storage
//! (SD cards and similar) on memory-constrained, single-threaded hosts.
//!
//! Every public operation either completes synchronously or returns
//! [`Status::InProgress`]; the caller is expected to call [`Filesystem::poll`]
//! on a regular cadence (e.g. once per main-loop iteration) and retry. No
//! threads, no blocking I/O, no heap allocation beyond what [`BlockDevice`]
//! implementations choose to use themselves.

#![cfg_attr(not(test), no_std)]

mod bpb;
mod cache;
mod dir;
#[cfg(feature = "freefile")]
mod freefile;
mod table;

mod file;

pub use bpb::FatType;
pub use cardfat_err::FatalError;
pub use file::{FileId, FileMode, SeekWhence};

use bpb::Geometry;
use cache::SectorCache;
use cardfat_device::BlockDevice;
#[cfg(feature = "freefile")]
use dir::{ATTR_HIDDEN, ATTR_SYSTEM};
use file::FileHandle;
use log::{info, warn};

#[cfg(feature = "freefile")]
use freefile::{HoleSearchPhase, FREEFILE_LEAVE_CLUSTERS};
#[cfg(feature = "freefile")]
use table::ClusterScan;

/// The outcome of any non-blocking filesystem operation. Distinct from
/// [`cardfat_err::Error`], which is reserved for crate-boundary and
/// mount-time fatal conditions; `Status` is the workhorse return type
/// threaded through the cache, FAT, directory, and file layers.
#[derive(Debug, Clone, Copy)]
pub enum Status<T> {
    Success(T),
    InProgress,
    Failure,
}

/// Coarse lifecycle state of a [`Filesystem`], returned by [`Filesystem::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemState {
    /// `init` has not been called (or `destroy` has completed).
    Unmounted,
    /// Mounting: MBR/BPB parse and (if enabled) the freefile scan are in
    /// progress.
    Initializing,
    /// Mounted; `fopen`/`fread`/`fwrite`/... are available.
    Ready,
    /// An invariant was violated. No further operations are serviced;
    /// remount by constructing a fresh `Filesystem`.
    Fatal,
}

#[derive(Clone, Copy)]
enum InitSubstate {
    ReadMbr,
    ReadBpb {
        partition_start_sector: u32,
    },
    #[cfg(feature = "freefile")]
    FreefileOpen,
    #[cfg(feature = "freefile")]
    FreefileSearch {
        phase: HoleSearchPhase,
        scan: ClusterScan,
        best_start: u32,
        best_length: u32,
    },
    #[cfg(feature = "freefile")]
    FreefileWriteChain {
        start: u32,
        length: u32,
        index: u32,
    },
    #[cfg(feature = "freefile")]
    FreefileSaveDirEntry {
        start: u32,
        length: u32,
    },
    Ready,
}

/// The filesystem core. Owns the sector cache and every open file handle in
/// fixed-size arrays — `CACHE_SECTORS` and `MAX_FILES` size the arena to the
/// embedder's RAM budget; there is no dynamic growth.
pub struct Filesystem<D: BlockDevice, const CACHE_SECTORS: usize = 8, const MAX_FILES: usize = 8> {
    device: D,
    cache: SectorCache<CACHE_SECTORS>,
    geometry: Geometry,
    state: FilesystemState,
    substate: InitSubstate,
    last_fatal: Option<FatalError>,
    last_cluster_allocated: u32,
    filesystem_full: bool,
    current_directory: FileHandle,
    #[cfg(feature = "freefile")]
    free_file: FileHandle,
    open_files: [FileHandle; MAX_FILES],
}

impl<D: BlockDevice, const CACHE_SECTORS: usize, const MAX_FILES: usize>
    Filesystem<D, CACHE_SECTORS, MAX_FILES>
{
    pub fn new(device: D) -> Self {
        Self {
            device,
            cache: SectorCache::new(),
            geometry: Geometry::unmounted(),
            state: FilesystemState::Unmounted,
            substate: InitSubstate::ReadMbr,
            last_fatal: None,
            last_cluster_allocated: 1,
            filesystem_full: false,
            current_directory: FileHandle::default(),
            #[cfg(feature = "freefile")]
            free_file: FileHandle::default(),
            open_files: core::array::from_fn(|_| FileHandle::default()),
        }
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Reclaim the underlying device, e.g. to power it down or hand it to a
    /// different owner after [`Self::destroy`] completes.
    pub fn into_inner(self) -> D {
        self.device
    }

    pub fn state(&self) -> FilesystemState {
        self.state
    }

    pub fn fatal_reason(&self) -> Option<FatalError> {
        self.last_fatal
    }

    pub fn is_full(&self) -> bool {
        self.filesystem_full
    }

    #[cfg(feature = "freefile")]
    pub fn contiguous_free_space(&self) -> u32 {
        self.free_file.directory_entry.file_size()
    }

    #[cfg(not(feature = "freefile"))]
    pub fn contiguous_free_space(&self) -> u32 {
        0
    }

    /// Begin mounting. Subsequent `poll()` calls drive the MBR/BPB parse and
    /// (if enabled) the freefile scan; `state()` becomes `Ready` once done.
    pub fn init(&mut self) {
        self.state = FilesystemState::Initializing;
        self.substate = InitSubstate::ReadMbr;
        self.last_cluster_allocated = 1;
        self.last_fatal = None;
        self.poll();
    }

    fn fail_mount(&mut self, reason: FatalError) {
        warn!("mount failed: {reason}");
        self.last_fatal = Some(reason);
        self.state = FilesystemState::Fatal;
    }

    /// Drive one step of the device, cache, and (depending on `state()`)
    /// mount or file-operation machinery. Call this on every iteration of
    /// the embedding application's main loop.
    pub fn poll(&mut self) {
        self.device.poll();
        if self.cache.pump(&mut self.device).is_err() {
            self.fail_mount(FatalError::CacheStateMismatch);
            return;
        }

        match self.state {
            FilesystemState::Initializing => self.init_continue(),
            FilesystemState::Ready => {
                let _ = self.cache.flush(&mut self.device);
            }
            FilesystemState::Unmounted | FilesystemState::Fatal => {}
        }
    }

    /// Flush dirty cache contents to the device. Returns `true` once
    /// everything is clean (nothing dirty and nothing in flight).
    pub fn flush(&mut self) -> bool {
        self.device.poll();
        let _ = self.cache.pump(&mut self.device);
        let nothing_dispatched = self.cache.flush(&mut self.device);
        nothing_dispatched && self.cache.dirty_count() == 0
    }

    /// Close the freefile and every open handle, flush, and reset to
    /// `Unmounted`. Call repeatedly until it returns `true`.
    pub fn destroy(&mut self) -> bool {
        if self.state == FilesystemState::Ready {
            #[cfg(feature = "freefile")]
            {
                let free_file_open = self.free_file.is_open();
                if free_file_open {
                    let position = self.free_file.entry_position;
                    let entry = self.free_file.directory_entry;
                    let _ = self.save_directory_entry(position, &entry);
                }
            }
            for index in 0..MAX_FILES {
                if self.open_files[index].is_open() {
                    let _ = self.fclose(FileId(index));
                }
            }
        }

        if !self.flush() {
            return false;
        }

        self.geometry = Geometry::unmounted();
        self.state = FilesystemState::Unmounted;
        self.substate = InitSubstate::ReadMbr;
        self.last_fatal = None;
        self.filesystem_full = false;
        self.current_directory = FileHandle::default();
        #[cfg(feature = "freefile")]
        {
            self.free_file = FileHandle::default();
        }
        self.open_files = core::array::from_fn(|_| FileHandle::default());
        true
    }

    fn init_continue(&mut self) {
        loop {
            match self.substate {
                InitSubstate::ReadMbr => match self.cache.acquire(&mut self.device, 0, cache::CacheFlags::READ) {
                    cache::AcquireResult::Success(slot) => {
                        let sector = *self.cache.data(slot);
                        match bpb::parse_mbr(&sector) {
                            Ok(partition_start_sector) => {
                                self.substate = InitSubstate::ReadBpb { partition_start_sector };
                            }
                            Err(reason) => {
                                self.fail_mount(reason);
                                return;
                            }
                        }
                    }
                    cache::AcquireResult::InProgress => return,
                    cache::AcquireResult::Fatal => {
                        self.fail_mount(FatalError::CacheStateMismatch);
                        return;
                    }
                },
                InitSubstate::ReadBpb { partition_start_sector } => {
                    match self.cache.acquire(&mut self.device, partition_start_sector, cache::CacheFlags::READ) {
                        cache::AcquireResult::Success(slot) => {
                            let sector = *self.cache.data(slot);
                            match bpb::parse_bpb(&sector, partition_start_sector) {
                                Ok(geometry) => {
                                    self.geometry = geometry;
                                    self.current_directory = root_directory_handle(&self.geometry);

                                    #[cfg(feature = "freefile")]
                                    {
                                        self.substate = InitSubstate::FreefileOpen;
                                    }
                                    #[cfg(not(feature = "freefile"))]
                                    {
                                        self.substate = InitSubstate::Ready;
                                    }
                                }
                                Err(reason) => {
                                    self.fail_mount(reason);
                                    return;
                                }
                            }
                        }
                        cache::AcquireResult::InProgress => return,
                        cache::AcquireResult::Fatal => {
                            self.fail_mount(FatalError::CacheStateMismatch);
                            return;
                        }
                    }
                }
                #[cfg(feature = "freefile")]
                InitSubstate::FreefileOpen => {
                    let mut directory = core::mem::take(&mut self.current_directory);
                    let mut free_file = core::mem::take(&mut self.free_file);
                    let attrib = ATTR_SYSTEM | ATTR_HIDDEN;
                    let mode = file::FileMode::CREATE | file::FileMode::READ | file::FileMode::WRITE;
                    let result = self.create_file_internal(&mut directory, &mut free_file, "FREESPAC", attrib, mode);
                    self.current_directory = directory;
                    self.free_file = free_file;

                    match result {
                        Status::Success(()) => {
                            if self.free_file.directory_entry.file_size() > 0 {
                                info!("freefile reserve already present, skipping scan");
                                self.substate = InitSubstate::Ready;
                            } else {
                                self.substate = InitSubstate::FreefileSearch {
                                    phase: HoleSearchPhase::FindHole,
                                    scan: ClusterScan::new(self.fat_entries_per_sector()),
                                    best_start: 0,
                                    best_length: 0,
                                };
                            }
                        }
                        Status::InProgress => return,
                        Status::Failure => {
                            // No room even for the freefile's own directory
                            // entry; mount anyway, just with no reserve.
                            self.substate = InitSubstate::Ready;
                        }
                    }
                }
                #[cfg(feature = "freefile")]
                InitSubstate::FreefileSearch {
                    mut phase,
                    mut scan,
                    mut best_start,
                    mut best_length,
                } => {
                    match self.largest_contiguous_free_block_step(
                        &mut phase,
                        &mut scan,
                        &mut best_start,
                        &mut best_length,
                    ) {
                        Status::Success(()) => {
                            let trimmed = best_length.saturating_sub(FREEFILE_LEAVE_CLUSTERS);
                            let entries_per_sector = self.fat_entries_per_sector();
                            let rounded = (trimmed / entries_per_sector) * entries_per_sector;
                            if rounded == 0 {
                                self.substate = InitSubstate::Ready;
                            } else {
                                self.substate = InitSubstate::FreefileWriteChain {
                                    start: best_start,
                                    length: rounded,
                                    index: 0,
                                };
                            }
                        }
                        Status::InProgress => {
                            self.substate = InitSubstate::FreefileSearch {
                                phase,
                                scan,
                                best_start,
                                best_length,
                            };
                            return;
                        }
                        Status::Failure => {
                            self.fail_mount(FatalError::CorruptFatChain);
                            return;
                        }
                    }
                }
                #[cfg(feature = "freefile")]
                InitSubstate::FreefileWriteChain { start, length, mut index } => {
                    match self.write_supercluster_chain_step(start, length, &mut index) {
                        Status::Success(()) => {
                            self.substate = InitSubstate::FreefileSaveDirEntry { start, length };
                        }
                        Status::InProgress => {
                            self.substate = InitSubstate::FreefileWriteChain { start, length, index };
                            return;
                        }
                        Status::Failure => {
                            self.fail_mount(FatalError::CorruptFatChain);
                            return;
                        }
                    }
                }
                #[cfg(feature = "freefile")]
                InitSubstate::FreefileSaveDirEntry { start, length } => {
                    self.free_file.directory_entry.set_first_cluster(start);
                    self.free_file
                        .directory_entry
                        .set_file_size(length * self.geometry().cluster_size_bytes());
                    self.free_file.first_cluster = start;

                    let position = self.free_file.entry_position;
                    let entry = self.free_file.directory_entry;
                    match self.save_directory_entry(position, &entry) {
                        Status::Success(()) => {
                            self.substate = InitSubstate::Ready;
                        }
                        Status::InProgress => return,
                        Status::Failure => {
                            self.fail_mount(FatalError::CorruptFatChain);
                            return;
                        }
                    }
                }
                InitSubstate::Ready => {
                    info!("mount complete");
                    self.state = FilesystemState::Ready;
                    return;
                }
            }
        }
    }
}

fn root_directory_handle(geometry: &Geometry) -> FileHandle {
    let file_type = if geometry.fs_type == FatType::Fat16 {
        file::FileType::Fat16RootDirectory
    } else {
        file::FileType::Directory
    };
    let first_cluster = geometry.root_directory_cluster;
    FileHandle {
        file_type,
        first_cluster,
        cursor_cluster: if file_type == file::FileType::Fat16RootDirectory {
            0
        } else {
            first_cluster
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardfat_device::MemoryBlockDevice;

    fn plant_minimal_fat32_image(device: &mut MemoryBlockDevice) {
        // A from-scratch valid MBR+BPB is involved enough that full mount
        // coverage lives in the crate's integration tests; this unit test
        // only exercises the pieces that do not require a real volume.
        let _ = device;
    }

    #[test]
    fn fresh_filesystem_starts_unmounted() {
        let device = MemoryBlockDevice::new(16);
        let fs: Filesystem<_, 4, 4> = Filesystem::new(device);
        assert_eq!(fs.state(), FilesystemState::Unmounted);
    }

    #[test]
    fn flush_on_empty_cache_is_immediately_clean() {
        let device = MemoryBlockDevice::new(16);
        let mut fs: Filesystem<_, 4, 4> = Filesystem::new(device);
        plant_minimal_fat32_image(&mut fs.device);
        assert!(fs.flush());
    }
}
