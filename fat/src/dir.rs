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

//! The directory engine (component E): 32-byte on-disk entries, iteration,
//! allocation and the 8.3 filename conversion.

use cardfat_device::{BlockDevice, SECTOR_SIZE};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::cache::CacheFlags;
use crate::file::{FileHandle, FileType};
use crate::{Filesystem, Status};

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;

pub const DIRECTORY_ENTRY_SIZE: usize = 32;
pub const ENTRY_DELETED: u8 = 0xE5;
pub const ENTRY_TERMINATOR: u8 = 0x00;

/// The on-disk 32-byte FAT directory entry, decoded without relying on host
/// byte order. Timestamp fields are carried through verbatim but never
/// interpreted by this crate.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawDirEntry {
    pub name: [u8; 11],
    pub attrib: u8,
    ntres: u8,
    crt_time_tenth: u8,
    crt_time: U16,
    crt_date: U16,
    lst_acc_date: U16,
    first_cluster_high: U16,
    wrt_time: U16,
    wrt_date: U16,
    first_cluster_low: U16,
    file_size: U32,
}

impl Default for RawDirEntry {
    fn default() -> Self {
        Self::empty()
    }
}

impl RawDirEntry {
    pub const fn empty() -> Self {
        Self {
            name: [b' '; 11],
            attrib: 0,
            ntres: 0,
            crt_time_tenth: 0,
            crt_time: U16::new(0),
            crt_date: U16::new(0),
            lst_acc_date: U16::new(0),
            first_cluster_high: U16::new(0),
            wrt_time: U16::new(0),
            wrt_date: U16::new(0),
            first_cluster_low: U16::new(0),
            file_size: U32::new(0),
        }
    }

    pub fn first_cluster(&self) -> u32 {
        (self.first_cluster_high.get() as u32) << 16 | self.first_cluster_low.get() as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.first_cluster_high = U16::new((cluster >> 16) as u16);
        self.first_cluster_low = U16::new(cluster as u16);
    }

    pub fn file_size(&self) -> u32 {
        self.file_size.get()
    }

    pub fn set_file_size(&mut self, size: u32) {
        self.file_size = U32::new(size);
    }

    pub fn is_empty_or_terminator(&self) -> bool {
        self.name[0] == ENTRY_DELETED || self.name[0] == ENTRY_TERMINATOR
    }

    pub fn is_terminator(&self) -> bool {
        self.name[0] == ENTRY_TERMINATOR
    }

    pub fn mark_deleted(&mut self) {
        self.name[0] = ENTRY_DELETED;
    }
}

/// `"name.ext"` to the on-disk 11-byte space-padded, upper-cased form. No
/// attempt is made to support long file names (see crate docs).
pub fn convert_filename_to_fat_style(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext),
        None => (name, ""),
    };

    for (slot, byte) in out[0..8].iter_mut().zip(stem.bytes()) {
        *slot = byte.to_ascii_uppercase();
    }
    for (slot, byte) in out[8..11].iter_mut().zip(ext.bytes()) {
        *slot = byte.to_ascii_uppercase();
    }

    out
}

/// A position within a directory: `cluster_number = 0` denotes the FAT16
/// root-directory region (addressed by sector, not cluster). `entry_index`
/// starts at -1 so the first `find_next` call lands on entry 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct Finder {
    pub cluster_number: u32,
    pub sector_number: u32,
    pub entry_index: i32,
}

pub(crate) enum FindNextOutcome {
    Entry { cache_slot: usize, offset: usize },
    EndOfDirectory,
}

impl<D: BlockDevice, const CACHE_SECTORS: usize, const MAX_FILES: usize>
    Filesystem<D, CACHE_SECTORS, MAX_FILES>
{
    pub(crate) fn find_first(&mut self, directory: &mut FileHandle, finder: &mut Finder) {
        let _ = self.fseek_from_start(directory, 0);
        finder.entry_index = -1;
    }

    /// Advance `finder` to the next 32-byte slot in `directory`, returning
    /// the cache location of the entry, or `EndOfDirectory` once the
    /// directory's allocated extent is exhausted.
    pub(crate) fn find_next(
        &mut self,
        directory: &mut FileHandle,
        finder: &mut Finder,
    ) -> Status<FindNextOutcome> {
        const ENTRIES_PER_SECTOR: i32 = (SECTOR_SIZE / DIRECTORY_ENTRY_SIZE) as i32;

        if finder.entry_index == ENTRIES_PER_SECTOR - 1 {
            if self.fseek_atomic(directory, SECTOR_SIZE as i32) {
                finder.entry_index = -1;
            } else {
                return Status::InProgress;
            }
        }

        match self.file_get_cursor_sector_for_read(directory) {
            Status::Success(cache_slot) => {
                finder.entry_index += 1;
                finder.cluster_number = directory.cursor_cluster;
                finder.sector_number = self.sector_index_in_cluster(directory.cursor_offset);
                Status::Success(FindNextOutcome::Entry {
                    cache_slot,
                    offset: finder.entry_index as usize * DIRECTORY_ENTRY_SIZE,
                })
            }
            Status::Failure => {
                if self.is_end_of_allocated_file(directory) {
                    Status::Success(FindNextOutcome::EndOfDirectory)
                } else {
                    Status::InProgress
                }
            }
            Status::InProgress => Status::InProgress,
        }
    }

    fn read_entry(&self, outcome: &FindNextOutcome) -> Option<RawDirEntry> {
        match *outcome {
            FindNextOutcome::Entry { cache_slot, offset } => {
                let bytes = &self.cache.data(cache_slot)[offset..offset + DIRECTORY_ENTRY_SIZE];
                RawDirEntry::read_from_bytes(bytes).ok()
            }
            FindNextOutcome::EndOfDirectory => None,
        }
    }

    pub(crate) fn read_entry_at(&mut self, directory: &mut FileHandle, finder: &mut Finder) -> Status<Option<RawDirEntry>> {
        match self.find_next(directory, finder) {
            Status::Success(outcome) => Status::Success(self.read_entry(&outcome)),
            Status::InProgress => Status::InProgress,
            Status::Failure => Status::Failure,
        }
    }

    /// Locate a free slot for a new entry: a deleted entry, or the
    /// directory's terminator slot. Extends the directory by one cluster
    /// (zero-filled) if the terminator is also the last slot and there is
    /// no deleted entry to reuse. FAT16 root directories cannot be extended
    /// and fail instead.
    pub(crate) fn allocate_directory_entry(
        &mut self,
        directory: &mut FileHandle,
        finder: &mut Finder,
    ) -> Status<(usize, usize)> {
        loop {
            match self.find_next(directory, finder) {
                Status::InProgress => return Status::InProgress,
                Status::Failure => return Status::Failure,
                Status::Success(FindNextOutcome::Entry { cache_slot, offset }) => {
                    let entry = RawDirEntry::read_from_bytes(
                        &self.cache.data(cache_slot)[offset..offset + DIRECTORY_ENTRY_SIZE],
                    )
                    .expect("directory entries are always 32 bytes");
                    if entry.is_empty_or_terminator() {
                        self.cache.mark_dirty(cache_slot);
                        return Status::Success((cache_slot, offset));
                    }
                }
                Status::Success(FindNextOutcome::EndOfDirectory) => {
                    if directory.file_type == FileType::Fat16RootDirectory {
                        return Status::Failure;
                    }

                    match self.extend_directory_with_free_cluster(directory) {
                        Status::Success(()) => {
                            finder.entry_index = -1;
                        }
                        Status::InProgress => return Status::InProgress,
                        Status::Failure => return Status::Failure,
                    }
                }
            }
        }
    }

    /// Append one zero-filled cluster to `directory` so the terminator
    /// invariant is preserved in the new space, then rewind the cursor to
    /// the start of that cluster.
    fn extend_directory_with_free_cluster(&mut self, directory: &mut FileHandle) -> Status<()> {
        match self.append_free_cluster(directory) {
            Status::InProgress => return Status::InProgress,
            Status::Failure => return Status::Failure,
            Status::Success(()) => {}
        }

        let sectors_per_cluster = self.geometry().sectors_per_cluster;
        for _ in 0..sectors_per_cluster {
            let physical_sector = self.file_get_cursor_physical_sector(directory);
            let slot = match self.cache.acquire(&mut self.device, physical_sector, CacheFlags::WRITE) {
                crate::cache::AcquireResult::Success(slot) => slot,
                crate::cache::AcquireResult::InProgress => return Status::InProgress,
                crate::cache::AcquireResult::Fatal => return Status::Failure,
            };
            self.cache.data_mut(slot).fill(0);
            self.cache.mark_dirty(slot);
            directory.cursor_offset += SECTOR_SIZE as u32;
        }

        directory.cursor_offset -= sectors_per_cluster * SECTOR_SIZE as u32;
        Status::Success(())
    }

    /// Read-modify-write `file.directory_entry` into its on-disk location.
    pub(crate) fn save_directory_entry(&mut self, position: (u32, u32, i32), entry: &RawDirEntry) -> Status<()> {
        let (cluster_number, sector_number, entry_index) = position;
        let physical_sector = self.directory_sector_to_physical(cluster_number, sector_number);

        let slot = match self.cache.acquire(
            &mut self.device,
            physical_sector,
            CacheFlags::READ | CacheFlags::WRITE,
        ) {
            crate::cache::AcquireResult::Success(slot) => slot,
            crate::cache::AcquireResult::InProgress => return Status::InProgress,
            crate::cache::AcquireResult::Fatal => return Status::Failure,
        };

        if entry_index < 0 {
            return Status::Failure;
        }
        let offset = entry_index as usize * DIRECTORY_ENTRY_SIZE;
        self.cache.data_mut(slot)[offset..offset + DIRECTORY_ENTRY_SIZE]
            .copy_from_slice(entry.as_bytes());
        self.cache.mark_dirty(slot);

        Status::Success(())
    }

    pub(crate) fn directory_sector_to_physical(&self, cluster_number: u32, sector_number: u32) -> u32 {
        if cluster_number == 0 {
            self.geometry().partition_start_sector
                + self.geometry().root_directory_start_sector
                + sector_number
        } else {
            self.geometry().cluster_to_physical_sector(cluster_number) + sector_number
        }
    }
}
