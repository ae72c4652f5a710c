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

//! MBR partition scanning and BPB parsing, producing the [`Geometry`] that
//! everything above the sector cache is built on.

use cardfat_err::FatalError;
use cardfat_device::SECTOR_SIZE;
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, KnownLayout,
};

/// A FAT16/FAT32 volume classified by its cluster count, per the Microsoft
/// rule of thumb: at most 4,084 clusters is FAT12 (unsupported here), at
/// most 65,524 is FAT16, otherwise FAT32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat16,
    Fat32,
}

/// Volume geometry derived once at mount time from the BPB. Every sector
/// address elsewhere in the crate is computed from these fields rather than
/// re-deriving anything from the raw boot sector.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub fs_type: FatType,
    pub sectors_per_cluster: u32,
    pub num_fats: u32,
    /// Sector (relative to the partition) of the first FAT.
    pub fat_start_sector: u32,
    /// Sectors occupied by a single copy of the FAT.
    pub fat_sectors: u32,
    /// Sector (relative to the partition) where the cluster heap begins,
    /// i.e. where cluster #2 lives.
    pub cluster_start_sector: u32,
    /// Total addressable clusters, clusters 2..=num_clusters+1.
    pub num_clusters: u32,
    /// FAT32 only: cluster number of the root directory.
    pub root_directory_cluster: u32,
    /// FAT16 only: sector (relative to the partition) where the fixed-size
    /// root directory begins.
    pub root_directory_start_sector: u32,
    /// FAT16 only: length of the fixed-size root directory, in sectors.
    pub root_directory_sectors: u32,
    /// Sector (relative to the device, not the partition) where the
    /// partition begins; added to every sector address the geometry above
    /// computes to get a physical device sector.
    pub partition_start_sector: u32,
}

impl Geometry {
    /// A harmless placeholder used before mount completes. `sectors_per_cluster`
    /// is kept at 1 so arithmetic built on it (division, modulo) never panics
    /// if a component is reached before the state machine gates it.
    pub(crate) fn unmounted() -> Self {
        Self {
            fs_type: FatType::Fat16,
            sectors_per_cluster: 1,
            num_fats: 0,
            fat_start_sector: 0,
            fat_sectors: 0,
            cluster_start_sector: 0,
            num_clusters: 0,
            root_directory_cluster: 0,
            root_directory_start_sector: 0,
            root_directory_sectors: 0,
            partition_start_sector: 0,
        }
    }

    pub fn entries_per_fat_sector(&self) -> u32 {
        match self.fs_type {
            FatType::Fat16 => SECTOR_SIZE as u32 / 2,
            FatType::Fat32 => SECTOR_SIZE as u32 / 4,
        }
    }

    pub fn cluster_size_bytes(&self) -> u32 {
        self.sectors_per_cluster * SECTOR_SIZE as u32
    }

    pub fn supercluster_size_bytes(&self) -> u32 {
        self.entries_per_fat_sector() * self.cluster_size_bytes()
    }

    /// Physical (device-relative) sector of the first sector of `cluster`.
    pub fn cluster_to_physical_sector(&self, cluster: u32) -> u32 {
        self.partition_start_sector
            + self.cluster_start_sector
            + (cluster.saturating_sub(2)) * self.sectors_per_cluster
    }

    pub fn fat_sector_to_physical(&self, fat_index: u32, sector_in_fat: u32) -> u32 {
        self.partition_start_sector
            + self.fat_start_sector
            + fat_index * self.fat_sectors
            + sector_in_fat
    }
}

#[repr(C)]
#[derive(Debug, FromBytes, KnownLayout, Immutable)]
struct MbrPartitionEntry {
    status: u8,
    chs_first: [u8; 3],
    partition_type: u8,
    chs_last: [u8; 3],
    lba_first_sector: U32,
    sector_count: U32,
}

const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;
const FAT32_PARTITION_TYPES: [u8; 2] = [0x0B, 0x0C];

/// Scan the four MBR partition table entries for the first FAT32-typed one
/// and return its starting LBA, relative to the device.
pub fn parse_mbr(sector: &[u8; SECTOR_SIZE]) -> Result<u32, FatalError> {
    if sector[510] != 0x55 || sector[511] != 0xAA {
        return Err(FatalError::CorruptBootSector);
    }

    for entry_index in 0..4 {
        let offset = PARTITION_TABLE_OFFSET + entry_index * PARTITION_ENTRY_SIZE;
        let entry = MbrPartitionEntry::ref_from_bytes(&sector[offset..offset + PARTITION_ENTRY_SIZE])
            .map_err(|_| FatalError::CorruptBootSector)?;

        if FAT32_PARTITION_TYPES.contains(&entry.partition_type) {
            return Ok(entry.lba_first_sector.get());
        }
    }

    Err(FatalError::NoFatPartition)
}

/// The fields of the BIOS Parameter Block this crate actually consults.
/// Fields it never reads (media descriptor, geometry for INT 13h, volume
/// label) are still present so the struct matches the on-disk layout
/// byte-for-byte, but are left undocumented.
#[repr(C)]
#[derive(Debug, FromBytes, KnownLayout, Immutable)]
pub(crate) struct BootSector {
    bs_jmpboot: [u8; 3],
    bs_oemname: [u8; 8],

    /// Count of bytes per sector. This crate only supports 512.
    bpb_bytspersec: U16,
    /// Number of sectors per allocation unit. Must be a power of two in
    /// 1..=128.
    bpb_secperclus: u8,
    /// Count of reserved sectors before the first FAT, including sector 0.
    bpb_rsvdseccnt: U16,
    /// Count of FAT copies. This crate expects 2, matching the volumes it
    /// targets, but tolerates 1.
    bpb_numfats: u8,
    /// FAT12/FAT16: count of 32-byte root directory entries. Zero on FAT32.
    bpb_rootentcnt: U16,
    /// Old 16-bit total sector count; zero when `bpb_totsec32` is used.
    bpb_totsec16: U16,
    bpb_media: u8,
    /// FAT12/FAT16 sectors per FAT. Zero on FAT32.
    bpb_fatsz16: U16,

    bpb_secpertrk: U16,
    bpb_numheads: U16,
    bpb_hiddsec: U32,

    /// New 32-bit total sector count.
    bpb_totsec32: U32,

    /// FAT32 sectors per FAT.
    bpb_fatsz32: U32,
    bpb_extflags: U16,
    bpb_fsver: U16,
    /// FAT32: cluster number of the first cluster of the root directory.
    bpb_rootclus: U32,
    bpb_fsinfo: U16,
    bpb_bkbootsec: U16,
    bpb_reserved: [u8; 12],

    bs_drvnum: u8,
    bs_reserved1: u8,
    bs_bootsig: u8,
    bs_volid: U32,
    bs_vollab: [u8; 11],
    bs_filsystype: [u8; 8],

    bs_boot: [u8; 420],
    signature_word: [u8; 2],
}

fn is_power_of_two(value: u32) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Parse the BPB at the start of the partition (already read into `sector`)
/// into a [`Geometry`], classifying the volume as FAT16 or FAT32 by its
/// cluster count.
pub fn parse_bpb(sector: &[u8; SECTOR_SIZE], partition_start_sector: u32) -> Result<Geometry, FatalError> {
    let boot_sector =
        BootSector::ref_from_bytes(sector.as_slice()).map_err(|_| FatalError::CorruptBootSector)?;

    if boot_sector.signature_word != [0x55, 0xAA] {
        return Err(FatalError::CorruptBootSector);
    }

    let bytes_per_sector = boot_sector.bpb_bytspersec.get() as u32;
    if bytes_per_sector as usize != SECTOR_SIZE {
        return Err(FatalError::CorruptBootSector);
    }

    let sectors_per_cluster = boot_sector.bpb_secperclus as u32;
    if !is_power_of_two(sectors_per_cluster) || sectors_per_cluster > 128 {
        return Err(FatalError::CorruptBootSector);
    }

    let num_fats = boot_sector.bpb_numfats as u32;
    if num_fats == 0 {
        return Err(FatalError::CorruptBootSector);
    }

    let reserved_sectors = boot_sector.bpb_rsvdseccnt.get() as u32;
    if reserved_sectors == 0 {
        return Err(FatalError::CorruptBootSector);
    }

    let fat_sectors = if boot_sector.bpb_fatsz16.get() != 0 {
        boot_sector.bpb_fatsz16.get() as u32
    } else {
        boot_sector.bpb_fatsz32.get()
    };
    if fat_sectors == 0 {
        return Err(FatalError::CorruptBootSector);
    }

    let total_sectors = if boot_sector.bpb_totsec16.get() != 0 {
        boot_sector.bpb_totsec16.get() as u32
    } else {
        boot_sector.bpb_totsec32.get()
    };

    let root_entry_count = boot_sector.bpb_rootentcnt.get() as u32;
    let root_directory_sectors =
        ((root_entry_count * 32) + (SECTOR_SIZE as u32 - 1)) / SECTOR_SIZE as u32;

    let fat_start_sector = reserved_sectors;
    let root_directory_start_sector = fat_start_sector + num_fats * fat_sectors;
    let cluster_start_sector = root_directory_start_sector + root_directory_sectors;

    let data_sectors = total_sectors.saturating_sub(cluster_start_sector);
    let num_clusters = data_sectors / sectors_per_cluster;

    let fs_type = if num_clusters <= 4_084 {
        return Err(FatalError::Fat12Unsupported);
    } else if num_clusters <= 65_524 {
        FatType::Fat16
    } else {
        FatType::Fat32
    };

    Ok(Geometry {
        fs_type,
        sectors_per_cluster,
        num_fats,
        fat_start_sector,
        fat_sectors,
        cluster_start_sector,
        num_clusters,
        root_directory_cluster: boot_sector.bpb_rootclus.get(),
        root_directory_start_sector,
        root_directory_sectors,
        partition_start_sector,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mbr_sector(partition_type: u8, lba_first: u32) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[PARTITION_TABLE_OFFSET + 4] = partition_type;
        sector[PARTITION_TABLE_OFFSET + 8..PARTITION_TABLE_OFFSET + 12]
            .copy_from_slice(&lba_first.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    fn bpb_sector(sectors_per_cluster: u8, num_fats: u8, fat_sectors: u16, root_entries: u16, total_sectors: u32) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        sector[13] = sectors_per_cluster;
        sector[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved sectors
        sector[16] = num_fats;
        sector[17..19].copy_from_slice(&root_entries.to_le_bytes());
        sector[19..21].copy_from_slice(&0u16.to_le_bytes()); // totsec16 unused
        sector[22..24].copy_from_slice(&fat_sectors.to_le_bytes());
        sector[32..36].copy_from_slice(&total_sectors.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn parse_mbr_finds_fat32_partition() {
        let sector = mbr_sector(0x0C, 2048);
        assert_eq!(parse_mbr(&sector).unwrap(), 2048);
    }

    #[test]
    fn parse_mbr_rejects_missing_signature() {
        let mut sector = mbr_sector(0x0C, 2048);
        sector[511] = 0;
        assert!(matches!(parse_mbr(&sector), Err(FatalError::CorruptBootSector)));
    }

    #[test]
    fn parse_mbr_rejects_volume_with_no_fat_partition() {
        let sector = mbr_sector(0x07, 2048); // NTFS, not recognised here
        assert!(matches!(parse_mbr(&sector), Err(FatalError::NoFatPartition)));
    }

    #[test]
    fn parse_bpb_classifies_small_volume_as_fat16() {
        // root dir: 512 entries * 32 bytes / 512 = 32 sectors.
        // cluster_start = 1 + 1*17 + 32 = 50; num_clusters = (4150-50)/1 = 4100.
        let sector = bpb_sector(1, 1, 17, 512, 4150);
        let geometry = parse_bpb(&sector, 0).unwrap();
        assert_eq!(geometry.fs_type, FatType::Fat16);
        assert_eq!(geometry.num_clusters, 4100);
        assert_eq!(geometry.cluster_start_sector, 50);
    }

    #[test]
    fn parse_bpb_rejects_fat12_sized_volume() {
        // cluster_start = 1 + 1*4 + 32 = 37; num_clusters = (2037-37)/1 = 2000.
        let sector = bpb_sector(1, 1, 4, 512, 2037);
        assert!(matches!(parse_bpb(&sector, 0), Err(FatalError::Fat12Unsupported)));
    }

    #[test]
    fn parse_bpb_classifies_large_volume_as_fat32() {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        sector[13] = 1; // sectors per cluster
        sector[14..16].copy_from_slice(&32u16.to_le_bytes()); // reserved sectors
        sector[16] = 2; // num fats
        sector[17..19].copy_from_slice(&0u16.to_le_bytes()); // root_entries: 0 on FAT32
        sector[36..40].copy_from_slice(&513u32.to_le_bytes()); // bpb_fatsz32
        sector[44..48].copy_from_slice(&2u32.to_le_bytes()); // bpb_rootclus
        let total_sectors = 32 + 2 * 513 + 66_000;
        sector[32..36].copy_from_slice(&total_sectors.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;

        let geometry = parse_bpb(&sector, 0).unwrap();
        assert_eq!(geometry.fs_type, FatType::Fat32);
        assert_eq!(geometry.root_directory_cluster, 2);
        assert_eq!(geometry.num_clusters, 66_000);
    }

    #[test]
    fn parse_bpb_rejects_bad_sectors_per_cluster() {
        let sector = bpb_sector(3, 1, 17, 512, 4150);
        assert!(matches!(parse_bpb(&sector, 0), Err(FatalError::CorruptBootSector)));
    }
}
