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

//! The file engine (component F): handle state, cursor/seek arithmetic,
//! read/write, and the create/close/unlink lifecycle. Every operation either
//! finishes synchronously or parks its resumption state on the handle's
//! `operation` field and returns [`Status::InProgress`].

use bitflags::bitflags;
use cardfat_device::{BlockDevice, SECTOR_SIZE};

use crate::bpb::FatType;
use crate::cache::{AcquireResult, CacheFlags};
use crate::dir::{
    convert_filename_to_fat_style, Finder, RawDirEntry, ATTR_ARCHIVE, ATTR_DIRECTORY,
};
use crate::table::{ClusterScan, ClusterSearchCondition, FindClusterResult};
use crate::{Filesystem, Status};

bitflags! {
    /// Flags passed to [`Filesystem::fopen`] (mirrors the `fopen` mode
    /// string: `r`, `w`, `a`, `+`, and the non-standard `s` contiguous hint).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u16 {
        const READ             = 0b0000_0001;
        const WRITE            = 0b0000_0010;
        const APPEND           = 0b0000_0100;
        const CREATE           = 0b0000_1000;
        /// Request the freefile's contiguous reserve (`s` mode); ignored
        /// when the `freefile` feature is disabled.
        const CONTIGUOUS       = 0b0001_0000;
        /// Keep the file's directory sector pinned in cache for the life of
        /// the handle, trading a cache slot for cheaper repeated writes.
        const RETAIN_DIRECTORY = 0b0010_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    #[default]
    None,
    Normal,
    Fat16RootDirectory,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// Opaque handle into a [`Filesystem`]'s open-file arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub(crate) usize);

#[derive(Debug, Clone, Copy)]
pub(crate) enum CreateFilePhase {
    FindFile,
    CreateNewFile,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum AppendFreeClusterPhase {
    FindFreeSpace,
    UpdateFat,
    UpdateFileDirectory,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum InitSubdirectoryPhase {
    AddFreeCluster,
    WriteSectors { sector_in_cluster: u32 },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum UnlinkPhase {
    /// Walking the chain, freeing `cluster` next. `cluster == 0` means the
    /// chain is fully freed and only the directory entry remains.
    FreeClusters { cluster: u32 },
    MarkDeleted,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Operation {
    None,
    CreateFile {
        phase: CreateFilePhase,
        attrib: u8,
        mode: FileMode,
        finder: Finder,
    },
    AppendFreeCluster {
        phase: AppendFreeClusterPhase,
        scan: ClusterScan,
        allocated_cluster: u32,
    },
    #[cfg(feature = "freefile")]
    AppendSupercluster {
        phase: crate::freefile::AppendSuperclusterPhase,
        allocated_cluster: u32,
    },
    InitSubdirectory {
        phase: InitSubdirectoryPhase,
        parent_cluster: u32,
    },
    Unlink {
        phase: UnlinkPhase,
    },
}

impl Default for Operation {
    fn default() -> Self {
        Operation::None
    }
}

/// A single open file, directory, or the FAT16 root pseudo-directory. Lives
/// in the filesystem's fixed-size arena; never heap-allocated.
#[derive(Debug, Clone, Copy)]
pub struct FileHandle {
    pub(crate) file_type: FileType,
    pub(crate) mode: FileMode,
    pub(crate) first_cluster: u32,
    pub(crate) cursor_cluster: u32,
    pub(crate) previous_cluster: u32,
    pub(crate) cursor_offset: u32,
    pub(crate) directory_entry: RawDirEntry,
    /// `(cluster_number, sector_number, entry_index)` of this file's own
    /// entry in its parent directory; `cluster_number = 0` means the FAT16
    /// root. `entry_index = -1` marks a handle with no backing entry yet
    /// (the freefile's synthetic handle, the root pseudo-directory).
    pub(crate) entry_position: (u32, u32, i32),
    pub(crate) retained_directory_sector: Option<u32>,
    pub(crate) operation: Operation,
}

impl Default for FileHandle {
    fn default() -> Self {
        Self {
            file_type: FileType::None,
            mode: FileMode::empty(),
            first_cluster: 0,
            cursor_cluster: 0,
            previous_cluster: 0,
            cursor_offset: 0,
            directory_entry: RawDirEntry::default(),
            entry_position: (0, 0, -1),
            retained_directory_sector: None,
            operation: Operation::None,
        }
    }
}

impl FileHandle {
    pub fn is_open(&self) -> bool {
        self.file_type != FileType::None
    }

    pub fn size(&self) -> u32 {
        self.directory_entry.file_size()
    }

    pub fn tell(&self) -> u32 {
        self.cursor_offset
    }
}

impl<D: BlockDevice, const CACHE_SECTORS: usize, const MAX_FILES: usize>
    Filesystem<D, CACHE_SECTORS, MAX_FILES>
{
    pub(crate) fn sector_index_in_cluster(&self, cursor_offset: u32) -> u32 {
        (cursor_offset / SECTOR_SIZE as u32) % self.geometry().sectors_per_cluster
    }

    pub(crate) fn file_get_cursor_physical_sector(&self, file: &FileHandle) -> u32 {
        if file.file_type == FileType::Fat16RootDirectory {
            self.geometry().partition_start_sector
                + self.geometry().root_directory_start_sector
                + file.cursor_offset / SECTOR_SIZE as u32
        } else {
            self.geometry().cluster_to_physical_sector(file.cursor_cluster)
                + self.sector_index_in_cluster(file.cursor_offset)
        }
    }

    pub(crate) fn is_end_of_allocated_file(&self, file: &FileHandle) -> bool {
        if file.file_type == FileType::Fat16RootDirectory {
            file.cursor_offset >= self.geometry().root_directory_sectors * SECTOR_SIZE as u32
        } else {
            file.cursor_cluster == 0
        }
    }

    fn rewind_to_start(&self, file: &mut FileHandle) {
        file.cursor_offset = 0;
        file.previous_cluster = 0;
        file.cursor_cluster = if file.file_type == FileType::Fat16RootDirectory {
            0
        } else {
            file.first_cluster
        };
    }

    /// A seek bounded to at most one FAT lookup: within the current
    /// cluster, or exactly onto the next cluster boundary. Returns `false`
    /// when satisfying `delta` would need a multi-cluster walk, signalling
    /// the caller to fall back to the queued path.
    pub(crate) fn fseek_atomic(&mut self, file: &mut FileHandle, delta: i32) -> bool {
        if file.file_type == FileType::Fat16RootDirectory {
            file.cursor_offset = (file.cursor_offset as i64 + delta as i64).max(0) as u32;
            return true;
        }

        let cluster_size = self.geometry().cluster_size_bytes();
        let offset_in_cluster = file.cursor_offset % cluster_size;
        let new_offset_in_cluster = offset_in_cluster as i64 + delta as i64;

        if new_offset_in_cluster >= 0 && (new_offset_in_cluster as u32) < cluster_size {
            file.cursor_offset = (file.cursor_offset as i64 + delta as i64) as u32;
            return true;
        }

        if new_offset_in_cluster as i64 == cluster_size as i64 {
            return match self.fat_get_next(file.cursor_cluster) {
                Status::Success(next) => {
                    file.previous_cluster = file.cursor_cluster;
                    file.cursor_cluster = next;
                    file.cursor_offset = (file.cursor_offset as i64 + delta as i64) as u32;
                    true
                }
                _ => false,
            };
        }

        false
    }

    fn seek_forward_to(&mut self, file: &mut FileHandle, target: u32) -> Status<()> {
        if file.file_type == FileType::Fat16RootDirectory {
            file.cursor_offset = target;
            return Status::Success(());
        }

        let cluster_size = self.geometry().cluster_size_bytes();
        loop {
            if file.cursor_offset >= target || file.cursor_cluster == 0 {
                file.cursor_offset = target;
                return Status::Success(());
            }

            let current_cluster_end = (file.cursor_offset / cluster_size + 1) * cluster_size;
            if target <= current_cluster_end {
                file.cursor_offset = target;
                return Status::Success(());
            }

            match self.fat_get_next(file.cursor_cluster) {
                Status::Success(next) => {
                    file.previous_cluster = file.cursor_cluster;
                    file.cursor_offset = current_cluster_end;
                    if next == 0 || self.is_end_of_chain(next) {
                        file.cursor_cluster = 0;
                        return Status::Success(());
                    }
                    file.cursor_cluster = next;
                }
                Status::InProgress => return Status::InProgress,
                Status::Failure => return Status::Failure,
            }
        }
    }

    pub(crate) fn fseek_from_start(&mut self, file: &mut FileHandle, offset: u32) -> Status<()> {
        self.rewind_to_start(file);
        self.seek_forward_to(file, offset)
    }

    pub(crate) fn fseek_internal(
        &mut self,
        file: &mut FileHandle,
        offset: i32,
        whence: SeekWhence,
    ) -> Status<()> {
        match whence {
            SeekWhence::Set => self.fseek_from_start(file, offset.max(0) as u32),
            SeekWhence::Cur => {
                if offset < 0 {
                    let target = (file.cursor_offset as i64 + offset as i64).max(0) as u32;
                    self.fseek_from_start(file, target)
                } else {
                    let target = file.cursor_offset + offset as u32;
                    self.seek_forward_to(file, target)
                }
            }
            SeekWhence::End => {
                let target = (file.size() as i64 + offset as i64).max(0) as u32;
                self.fseek_from_start(file, target)
            }
        }
    }

    pub(crate) fn file_get_cursor_sector_for_read(&mut self, file: &mut FileHandle) -> Status<usize> {
        if self.is_end_of_allocated_file(file) {
            return Status::Failure;
        }

        let physical_sector = self.file_get_cursor_physical_sector(file);
        match self.cache.acquire(&mut self.device, physical_sector, CacheFlags::READ) {
            AcquireResult::Success(slot) => Status::Success(slot),
            AcquireResult::InProgress => Status::InProgress,
            AcquireResult::Fatal => Status::Failure,
        }
    }

    fn file_lock_cursor_sector_for_write(&mut self, file: &mut FileHandle) -> Status<usize> {
        if self.is_end_of_allocated_file(file) {
            match self.append_free_cluster(file) {
                Status::Success(()) => {}
                Status::InProgress => return Status::InProgress,
                Status::Failure => return Status::Failure,
            }
        }

        let partial_sector_overwrite = file.cursor_offset % SECTOR_SIZE as u32 != 0;
        let mut flags = CacheFlags::WRITE;
        if partial_sector_overwrite {
            flags |= CacheFlags::READ;
        }

        let physical_sector = self.file_get_cursor_physical_sector(file);
        match self.cache.acquire(&mut self.device, physical_sector, flags) {
            AcquireResult::Success(slot) => Status::Success(slot),
            AcquireResult::InProgress => Status::InProgress,
            AcquireResult::Fatal => Status::Failure,
        }
    }

    /// Allocate and link a single free cluster onto the end of `file`'s
    /// chain, stealing a supercluster from the freefile reserve when the
    /// handle was opened in contiguous mode.
    pub(crate) fn append_free_cluster(&mut self, file: &mut FileHandle) -> Status<()> {
        #[cfg(feature = "freefile")]
        if file.mode.contains(FileMode::CONTIGUOUS) {
            return self.append_supercluster(file);
        }

        self.append_free_cluster_regular(file)
    }

    /// The non-contiguous path: scan the FAT for one free cluster and link
    /// it on. Resumable: progress is parked in `file.operation` across
    /// `InProgress` returns.
    pub(crate) fn append_free_cluster_regular(&mut self, file: &mut FileHandle) -> Status<()> {
        loop {
            let operation = core::mem::take(&mut file.operation);
            let (phase, scan, allocated_cluster) = match operation {
                Operation::AppendFreeCluster {
                    phase,
                    scan,
                    allocated_cluster,
                } => (phase, scan, allocated_cluster),
                _ => (
                    AppendFreeClusterPhase::FindFreeSpace,
                    ClusterScan::new(self.last_cluster_allocated),
                    0,
                ),
            };

            match phase {
                AppendFreeClusterPhase::FindFreeSpace => {
                    let mut scan = scan;
                    match self.find_cluster_with_condition(&mut scan, ClusterSearchCondition::FreeSector) {
                        FindClusterResult::Found => {
                            let cluster = scan.cursor();
                            file.operation = Operation::AppendFreeCluster {
                                phase: AppendFreeClusterPhase::UpdateFat,
                                scan,
                                allocated_cluster: cluster,
                            };
                        }
                        FindClusterResult::NotFound => {
                            self.filesystem_full = true;
                            return Status::Failure;
                        }
                        FindClusterResult::InProgress => {
                            file.operation = Operation::AppendFreeCluster {
                                phase: AppendFreeClusterPhase::FindFreeSpace,
                                scan,
                                allocated_cluster,
                            };
                            return Status::InProgress;
                        }
                        FindClusterResult::Fatal => return Status::Failure,
                    }
                }
                AppendFreeClusterPhase::UpdateFat => {
                    let eoc = match self.geometry().fs_type {
                        FatType::Fat16 => crate::table::FAT16_EOC_WRITE,
                        FatType::Fat32 => crate::table::FAT32_EOC_WRITE,
                    };
                    match self.fat_set_next(allocated_cluster, eoc) {
                        Status::Success(()) => {}
                        Status::InProgress => {
                            file.operation = Operation::AppendFreeCluster {
                                phase: AppendFreeClusterPhase::UpdateFat,
                                scan,
                                allocated_cluster,
                            };
                            return Status::InProgress;
                        }
                        Status::Failure => return Status::Failure,
                    }

                    if file.previous_cluster != 0 {
                        match self.fat_set_next(file.previous_cluster, allocated_cluster) {
                            Status::Success(()) => {}
                            Status::InProgress => {
                                file.operation = Operation::AppendFreeCluster {
                                    phase: AppendFreeClusterPhase::UpdateFat,
                                    scan,
                                    allocated_cluster,
                                };
                                return Status::InProgress;
                            }
                            Status::Failure => return Status::Failure,
                        }
                    }

                    self.last_cluster_allocated = allocated_cluster;
                    if file.first_cluster == 0 {
                        file.first_cluster = allocated_cluster;
                    }
                    file.cursor_cluster = allocated_cluster;
                    file.previous_cluster = allocated_cluster;

                    file.operation = Operation::AppendFreeCluster {
                        phase: AppendFreeClusterPhase::UpdateFileDirectory,
                        scan,
                        allocated_cluster,
                    };
                }
                AppendFreeClusterPhase::UpdateFileDirectory => {
                    if file.directory_entry.first_cluster() == 0 {
                        file.directory_entry.set_first_cluster(file.first_cluster);
                    }
                    return Status::Success(());
                }
            }
        }
    }

    pub(crate) fn file_get_next_cluster(&mut self, cluster: u32) -> Status<u32> {
        self.fat_get_next(cluster)
    }

    /// Read up to `buffer.len()` bytes starting at the cursor, advancing it
    /// by the number of bytes actually copied.
    pub fn fread(&mut self, id: FileId, buffer: &mut [u8]) -> Status<usize> {
        let mut file = core::mem::take(&mut self.open_files[id.0]);
        let result = self.fread_inner(&mut file, buffer);
        self.open_files[id.0] = file;
        result
    }

    fn fread_inner(&mut self, file: &mut FileHandle, buffer: &mut [u8]) -> Status<usize> {
        let mut total = 0usize;
        let file_remaining = file.size().saturating_sub(file.cursor_offset) as usize;
        let want = buffer.len().min(file_remaining);

        while total < want {
            let slot = match self.file_get_cursor_sector_for_read(file) {
                Status::Success(slot) => slot,
                Status::InProgress => {
                    return if total > 0 { Status::Success(total) } else { Status::InProgress };
                }
                Status::Failure => break,
            };

            let offset_in_sector = (file.cursor_offset % SECTOR_SIZE as u32) as usize;
            let available_in_sector = SECTOR_SIZE - offset_in_sector;
            let to_copy = available_in_sector.min(want - total);

            buffer[total..total + to_copy]
                .copy_from_slice(&self.cache.data(slot)[offset_in_sector..offset_in_sector + to_copy]);
            total += to_copy;

            if !self.fseek_atomic(file, to_copy as i32) {
                match self.seek_forward_to(file, file.cursor_offset + to_copy as u32) {
                    Status::Success(()) => {}
                    Status::InProgress => return Status::Success(total),
                    Status::Failure => break,
                }
            }
        }

        Status::Success(total)
    }

    /// Write `buffer` at the cursor, extending the file (and its chain) as
    /// needed. Updates the in-memory `fileSize` optimistically as bytes
    /// land; the on-disk directory entry is only made durable on `fclose`
    /// or `flush`, matching the original's crash-recovery contract.
    pub fn fwrite(&mut self, id: FileId, buffer: &[u8]) -> Status<usize> {
        let mut file = core::mem::take(&mut self.open_files[id.0]);
        let result = self.fwrite_inner(&mut file, buffer);
        self.open_files[id.0] = file;
        result
    }

    fn fwrite_inner(&mut self, file: &mut FileHandle, buffer: &[u8]) -> Status<usize> {
        let mut total = 0usize;

        while total < buffer.len() {
            let slot = match self.file_lock_cursor_sector_for_write(file) {
                Status::Success(slot) => slot,
                Status::InProgress => {
                    return if total > 0 { Status::Success(total) } else { Status::InProgress };
                }
                Status::Failure => return if total > 0 { Status::Success(total) } else { Status::Failure },
            };

            let offset_in_sector = (file.cursor_offset % SECTOR_SIZE as u32) as usize;
            let available_in_sector = SECTOR_SIZE - offset_in_sector;
            let to_copy = available_in_sector.min(buffer.len() - total);

            self.cache.data_mut(slot)[offset_in_sector..offset_in_sector + to_copy]
                .copy_from_slice(&buffer[total..total + to_copy]);
            self.cache.mark_dirty(slot);
            total += to_copy;

            if !self.fseek_atomic(file, to_copy as i32) {
                match self.seek_forward_to(file, file.cursor_offset + to_copy as u32) {
                    Status::Success(()) => {}
                    Status::InProgress => break,
                    Status::Failure => break,
                }
            }

            if file.cursor_offset > file.size() {
                file.directory_entry.set_file_size(file.cursor_offset);
            }
        }

        Status::Success(total)
    }

    /// Allocate a closed handle slot, or `None` if the arena is full.
    pub(crate) fn allocate_file_handle(&mut self) -> Option<usize> {
        self.open_files.iter().position(|f| f.file_type == FileType::None)
    }

    fn init_subdirectory(&mut self, file: &mut FileHandle, parent_cluster: u32) -> Status<()> {
        loop {
            let operation = core::mem::take(&mut file.operation);
            let phase = match operation {
                Operation::InitSubdirectory { phase, .. } => phase,
                _ => InitSubdirectoryPhase::AddFreeCluster,
            };

            match phase {
                InitSubdirectoryPhase::AddFreeCluster => match self.append_free_cluster(file) {
                    Status::Success(()) => {
                        file.operation = Operation::InitSubdirectory {
                            phase: InitSubdirectoryPhase::WriteSectors { sector_in_cluster: 0 },
                            parent_cluster,
                        };
                    }
                    Status::InProgress => {
                        file.operation = Operation::InitSubdirectory {
                            phase: InitSubdirectoryPhase::AddFreeCluster,
                            parent_cluster,
                        };
                        return Status::InProgress;
                    }
                    Status::Failure => return Status::Failure,
                },
                InitSubdirectoryPhase::WriteSectors { sector_in_cluster } => {
                    let sectors_per_cluster = self.geometry().sectors_per_cluster;
                    if sector_in_cluster >= sectors_per_cluster {
                        return Status::Success(());
                    }

                    let physical_sector =
                        self.geometry().cluster_to_physical_sector(file.first_cluster) + sector_in_cluster;
                    let slot = match self.cache.acquire(&mut self.device, physical_sector, CacheFlags::WRITE) {
                        AcquireResult::Success(slot) => slot,
                        AcquireResult::InProgress => {
                            file.operation = Operation::InitSubdirectory {
                                phase: InitSubdirectoryPhase::WriteSectors { sector_in_cluster },
                                parent_cluster,
                            };
                            return Status::InProgress;
                        }
                        AcquireResult::Fatal => return Status::Failure,
                    };

                    let data = self.cache.data_mut(slot);
                    data.fill(0);
                    if sector_in_cluster == 0 {
                        let mut dot_name = [b' '; 11];
                        dot_name[0] = b'.';
                        let mut dot = RawDirEntry::empty();
                        dot.name = dot_name;
                        dot.attrib = ATTR_DIRECTORY;
                        dot.set_first_cluster(file.first_cluster);
                        data[0..32].copy_from_slice(zerocopy::IntoBytes::as_bytes(&dot));

                        let mut dotdot_name = [b' '; 11];
                        dotdot_name[0] = b'.';
                        dotdot_name[1] = b'.';
                        let mut dotdot = RawDirEntry::empty();
                        dotdot.name = dotdot_name;
                        dotdot.attrib = ATTR_DIRECTORY;
                        dotdot.set_first_cluster(parent_cluster);
                        data[32..64].copy_from_slice(zerocopy::IntoBytes::as_bytes(&dotdot));
                    }
                    self.cache.mark_dirty(slot);

                    file.operation = Operation::InitSubdirectory {
                        phase: InitSubdirectoryPhase::WriteSectors {
                            sector_in_cluster: sector_in_cluster + 1,
                        },
                        parent_cluster,
                    };
                }
            }
        }
    }

    pub(crate) fn create_file_internal(
        &mut self,
        directory: &mut FileHandle,
        file: &mut FileHandle,
        name: &str,
        attrib: u8,
        mode: FileMode,
    ) -> Status<()> {
        let fat_name = convert_filename_to_fat_style(name);

        loop {
            let operation = core::mem::take(&mut file.operation);
            let (phase, mut finder) = match operation {
                Operation::CreateFile { phase, finder, .. } => (phase, finder),
                _ => {
                    let mut finder = Finder::default();
                    self.find_first(directory, &mut finder);
                    (CreateFilePhase::FindFile, finder)
                }
            };

            match phase {
                CreateFilePhase::FindFile => {
                    match self.read_entry_at(directory, &mut finder) {
                        Status::InProgress => {
                            file.operation = Operation::CreateFile {
                                phase: CreateFilePhase::FindFile,
                                attrib,
                                mode,
                                finder,
                            };
                            return Status::InProgress;
                        }
                        Status::Failure => return Status::Failure,
                        Status::Success(None) => {
                            file.operation = Operation::CreateFile {
                                phase: CreateFilePhase::CreateNewFile,
                                attrib,
                                mode,
                                finder,
                            };
                        }
                        Status::Success(Some(entry)) => {
                            if entry.is_empty_or_terminator() {
                                file.operation = Operation::CreateFile {
                                    phase: CreateFilePhase::FindFile,
                                    attrib,
                                    mode,
                                    finder,
                                };
                                continue;
                            }
                            if entry.name == fat_name {
                                file.file_type = FileType::Normal;
                                file.directory_entry = entry;
                                file.first_cluster = entry.first_cluster();
                                file.entry_position =
                                    (finder.cluster_number, finder.sector_number, finder.entry_index);
                                self.finish_open(file, mode);
                                return Status::Success(());
                            }
                            file.operation = Operation::CreateFile {
                                phase: CreateFilePhase::FindFile,
                                attrib,
                                mode,
                                finder,
                            };
                        }
                    }
                }
                CreateFilePhase::CreateNewFile => {
                    if !mode.contains(FileMode::CREATE) {
                        return Status::Failure;
                    }

                    self.find_first(directory, &mut finder);
                    match self.allocate_directory_entry(directory, &mut finder) {
                        Status::InProgress => {
                            file.operation = Operation::CreateFile {
                                phase: CreateFilePhase::CreateNewFile,
                                attrib,
                                mode,
                                finder,
                            };
                            return Status::InProgress;
                        }
                        Status::Failure => return Status::Failure,
                        Status::Success((_cache_slot, _offset)) => {
                            let mut entry = RawDirEntry::empty();
                            entry.name = fat_name;
                            entry.attrib = attrib;

                            file.directory_entry = entry;
                            file.file_type = if attrib & ATTR_DIRECTORY != 0 {
                                FileType::Directory
                            } else {
                                FileType::Normal
                            };
                            file.first_cluster = 0;
                            file.entry_position =
                                (finder.cluster_number, finder.sector_number, finder.entry_index);

                            self.finish_open(file, mode);
                            return Status::Success(());
                        }
                    }
                }
            }
        }
    }

    fn finish_open(&mut self, file: &mut FileHandle, mode: FileMode) {
        file.mode = mode;
        file.cursor_offset = 0;
        file.cursor_cluster = file.first_cluster;
        file.previous_cluster = 0;

        if file.size() > 0 {
            file.mode.remove(FileMode::CONTIGUOUS);
        }
        if mode.contains(FileMode::APPEND) {
            let size = file.size();
            let _ = self.fseek_from_start(file, size);
        }
    }

    /// Open (and, depending on `mode`, create) a file or directory by 8.3
    /// name in the current directory. Mirrors `fopen`'s mode-string
    /// semantics: `r`, `w` (create+truncate), `a` (create+append), with
    /// `+` widening to read/write and `s` requesting the freefile's
    /// contiguous reserve.
    pub fn fopen(&mut self, name: &str, mode: FileMode) -> Status<FileId> {
        let Some(index) = self.allocate_file_handle() else {
            return Status::Failure;
        };

        let mut directory = core::mem::take(&mut self.current_directory);
        let mut file = FileHandle::default();
        let result = self.create_file_internal(&mut directory, &mut file, name, ATTR_ARCHIVE, mode);
        self.current_directory = directory;

        match result {
            Status::Success(()) => {
                self.open_files[index] = file;
                Status::Success(FileId(index))
            }
            Status::InProgress => {
                // Parking an in-flight create under an un-returned handle
                // would leak the arena slot; the caller retries `fopen`
                // wholesale, matching `afatfs_fopen`'s synchronous return.
                Status::InProgress
            }
            Status::Failure => Status::Failure,
        }
    }

    pub fn mkdir(&mut self, name: &str) -> Status<FileId> {
        let Some(index) = self.allocate_file_handle() else {
            return Status::Failure;
        };

        let mut directory = core::mem::take(&mut self.current_directory);
        let parent_cluster = directory.first_cluster;
        let mut file = FileHandle::default();
        let mode = FileMode::CREATE | FileMode::READ | FileMode::WRITE;
        let result = self.create_file_internal(&mut directory, &mut file, name, ATTR_DIRECTORY, mode);
        self.current_directory = directory;

        match result {
            Status::Success(()) => match self.init_subdirectory(&mut file, parent_cluster) {
                Status::Success(()) => {
                    self.open_files[index] = file;
                    Status::Success(FileId(index))
                }
                Status::InProgress => Status::InProgress,
                Status::Failure => Status::Failure,
            },
            Status::InProgress => Status::InProgress,
            Status::Failure => Status::Failure,
        }
    }

    pub fn chdir(&mut self, target: Option<FileId>) -> Status<()> {
        match target {
            None => {
                let file_type = if self.geometry().fs_type == FatType::Fat16 {
                    FileType::Fat16RootDirectory
                } else {
                    FileType::Directory
                };
                let first_cluster = self.geometry().root_directory_cluster;
                self.current_directory = FileHandle {
                    file_type,
                    first_cluster,
                    cursor_cluster: if file_type == FileType::Fat16RootDirectory { 0 } else { first_cluster },
                    ..Default::default()
                };
                Status::Success(())
            }
            Some(id) => {
                if self.open_files[id.0].file_type != FileType::Directory {
                    return Status::Failure;
                }
                self.current_directory = self.open_files[id.0];
                Status::Success(())
            }
        }
    }

    pub fn fseek(&mut self, id: FileId, offset: i32, whence: SeekWhence) -> Status<()> {
        let mut file = core::mem::take(&mut self.open_files[id.0]);
        let result = self.fseek_internal(&mut file, offset, whence);
        self.open_files[id.0] = file;
        result
    }

    pub fn ftell(&self, id: FileId) -> u32 {
        self.open_files[id.0].tell()
    }

    pub fn feof(&self, id: FileId) -> bool {
        let file = &self.open_files[id.0];
        file.cursor_offset >= file.size()
    }

    /// Flush the directory entry and release the handle. Directories are
    /// never written back here (their entry carries no size to reconcile).
    pub fn fclose(&mut self, id: FileId) -> Status<()> {
        let mut file = core::mem::take(&mut self.open_files[id.0]);

        if file.file_type == FileType::None {
            return Status::Success(());
        }

        if file.file_type != FileType::Directory && file.entry_position.2 >= 0 {
            match self.save_directory_entry(file.entry_position, &file.directory_entry) {
                Status::Success(()) => {}
                Status::InProgress => {
                    self.open_files[id.0] = file;
                    return Status::InProgress;
                }
                Status::Failure => {
                    self.open_files[id.0] = FileHandle::default();
                    return Status::Failure;
                }
            }
        }

        file = FileHandle::default();
        self.open_files[id.0] = file;
        Status::Success(())
    }

    /// Walk the cluster chain freeing every link in the FAT, then mark the
    /// directory entry deleted and release the handle. Resumable across
    /// `InProgress` returns the same way `append_free_cluster_regular` is.
    pub fn funlink(&mut self, id: FileId) -> Status<()> {
        let mut file = core::mem::take(&mut self.open_files[id.0]);
        if file.file_type == FileType::None {
            return Status::Success(());
        }

        loop {
            let operation = core::mem::take(&mut file.operation);
            let phase = match operation {
                Operation::Unlink { phase } => phase,
                _ => UnlinkPhase::FreeClusters { cluster: file.first_cluster },
            };

            match phase {
                UnlinkPhase::FreeClusters { cluster } => {
                    if cluster == 0 {
                        file.operation = Operation::Unlink { phase: UnlinkPhase::MarkDeleted };
                        continue;
                    }

                    let next = match self.fat_get_next(cluster) {
                        Status::Success(next) => next,
                        Status::InProgress => {
                            file.operation =
                                Operation::Unlink { phase: UnlinkPhase::FreeClusters { cluster } };
                            self.open_files[id.0] = file;
                            return Status::InProgress;
                        }
                        Status::Failure => {
                            self.open_files[id.0] = FileHandle::default();
                            return Status::Failure;
                        }
                    };

                    match self.fat_set_next(cluster, 0) {
                        Status::Success(()) => {
                            let next_cluster = if next == 0 || self.is_end_of_chain(next) {
                                0
                            } else {
                                next
                            };
                            file.operation = Operation::Unlink {
                                phase: UnlinkPhase::FreeClusters { cluster: next_cluster },
                            };
                        }
                        Status::InProgress => {
                            file.operation =
                                Operation::Unlink { phase: UnlinkPhase::FreeClusters { cluster } };
                            self.open_files[id.0] = file;
                            return Status::InProgress;
                        }
                        Status::Failure => {
                            self.open_files[id.0] = FileHandle::default();
                            return Status::Failure;
                        }
                    }
                }
                UnlinkPhase::MarkDeleted => {
                    file.directory_entry.mark_deleted();
                    return match self.save_directory_entry(file.entry_position, &file.directory_entry) {
                        Status::Success(()) => {
                            self.open_files[id.0] = FileHandle::default();
                            Status::Success(())
                        }
                        Status::InProgress => {
                            file.operation = Operation::Unlink { phase: UnlinkPhase::MarkDeleted };
                            self.open_files[id.0] = file;
                            Status::InProgress
                        }
                        Status::Failure => {
                            self.open_files[id.0] = FileHandle::default();
                            Status::Failure
                        }
                    };
                }
            }
        }
    }
}
