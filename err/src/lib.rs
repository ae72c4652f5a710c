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

//! Error types shared by the block device interface and the filesystem core.

#![cfg_attr(not(test), no_std)]

/// Errors surfaced by a block device implementation.
///
/// These never carry the meaning "try again" — that is expressed instead by the
/// `InProgress` / `Busy` return values of the device methods themselves.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("sector out of range")]
    OutOfRange,
    #[error("device rejected the request")]
    Rejected,
}

/// A detected invariant violation. Once raised, the filesystem transitions to
/// `Fatal` and refuses all further operations.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    #[error("cache slot completed in an unexpected state")]
    CacheStateMismatch,
    #[error("boot sector is not a valid FAT16/FAT32 volume")]
    CorruptBootSector,
    #[error("FAT12 volumes are not supported")]
    Fat12Unsupported,
    #[error("FAT entry content is not consistent with volume geometry")]
    CorruptFatChain,
    #[error("partition table has no FAT32 entry")]
    NoFatPartition,
}

/// Reasons a request made to an open file or the façade can fail locally,
/// without touching on-disk state.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    #[error("no file handle available, MAX_OPEN_FILES reached")]
    OutOfHandles,
    #[error("file already has an operation in progress")]
    Busy,
    #[error("requested access mode is not open on this file")]
    BadMode,
    #[error("no such file or directory")]
    NotFound,
    #[error("entry is a directory")]
    IsADirectory,
    #[error("entry is not a directory")]
    NotADirectory,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("directory is full and cannot be extended")]
    DirectoryFull,
    #[error("volume has no space left for this allocation")]
    VolumeFull,
    #[error("operation not supported in this build")]
    Unsupported,
}

/// Top-level error returned by the filesystem core.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("device: {0}")]
    Device(#[from] DeviceError),
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
    #[error("file: {0}")]
    File(#[from] FileError),
}

pub type Result<T> = core::result::Result<T, Error>;
