// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! MBR partition table authoring and the byte-level layout of the output
//! image. Everything downstream (FAT32, ext4, the loader writer) receives its
//! byte ranges from [`ImageLayout`].

use std::io::{self, Read, Seek, Write};

use mbrman::{MBRPartitionEntry, CHS, MBR};
use thiserror::Error;

pub const SECTOR_SIZE: u32 = 512;

/// First sector of the boot partition. The space below it (minus the MBR
/// itself) belongs to the vendor bootloaders.
pub const BOOT_START_SECTOR: u32 = 2048;

/// Fixed size of the FAT32 boot partition.
pub const BOOT_PART_SIZE: u64 = 256 * 1024 * 1024;

/// Reserved space at the head of the image for MBR + bootloader blobs. Every
/// loader offset schedule must stay below this.
pub const LOADER_REGION_SIZE: u64 = 16 * 1024 * 1024;

/// MBR partition type for FAT32 with LBA addressing.
const PART_TYPE_FAT32_LBA: u8 = 0x0c;
/// MBR partition type for native Linux filesystems.
const PART_TYPE_LINUX: u8 = 0x83;

/// Fixed disk signature so that identical inputs produce identical images.
const DISK_SIGNATURE: [u8; 4] = [0x73, 0x62, 0x63, 0x66];

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid root partition size: {0} MiB")]
    InvalidSize(u32),
    #[error("MBR error")]
    Mbr(#[from] mbrman::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Byte-level geometry of the output image, computed once per build from the
/// requested root partition size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    size_mb: u32,
}

impl ImageLayout {
    pub fn new(size_mb: u32) -> Result<Self> {
        if size_mb == 0 || size_mb > 16384 {
            return Err(Error::InvalidSize(size_mb));
        }

        Ok(Self { size_mb })
    }

    /// Total size of the image file: 16 MiB loader region + 256 MiB boot
    /// partition + the root partition payload.
    pub fn total_size(&self) -> u64 {
        (16 + 256 + u64::from(self.size_mb)) * MIB
    }

    pub fn root_start_sector(&self) -> u32 {
        BOOT_START_SECTOR + (BOOT_PART_SIZE / u64::from(SECTOR_SIZE)) as u32
    }

    pub fn root_sectors(&self) -> u32 {
        (u64::from(self.size_mb) * MIB / u64::from(SECTOR_SIZE)) as u32
    }

    /// Byte window of the FAT32 boot partition.
    pub fn boot_window(&self) -> (u64, u64) {
        (
            u64::from(BOOT_START_SECTOR) * u64::from(SECTOR_SIZE),
            BOOT_PART_SIZE,
        )
    }

    /// Byte window of the ext4 root partition.
    pub fn root_window(&self) -> (u64, u64) {
        (
            u64::from(self.root_start_sector()) * u64::from(SECTOR_SIZE),
            u64::from(self.size_mb) * MIB,
        )
    }

    /// Write the MBR with both primary partitions. The CHS fields are left
    /// empty; consumers of these images address by LBA only.
    pub fn write_mbr(&self, file: &mut (impl Read + Write + Seek)) -> Result<()> {
        let mut mbr = MBR::new_from(file, SECTOR_SIZE, DISK_SIGNATURE)?;

        mbr[1] = MBRPartitionEntry {
            boot: mbrman::BOOT_ACTIVE,
            first_chs: CHS::empty(),
            sys: PART_TYPE_FAT32_LBA,
            last_chs: CHS::empty(),
            starting_lba: BOOT_START_SECTOR,
            sectors: (BOOT_PART_SIZE / u64::from(SECTOR_SIZE)) as u32,
        };
        mbr[2] = MBRPartitionEntry {
            boot: mbrman::BOOT_INACTIVE,
            first_chs: CHS::empty(),
            sys: PART_TYPE_LINUX,
            last_chs: CHS::empty(),
            starting_lba: self.root_start_sector(),
            sectors: self.root_sectors(),
        };

        mbr.write_into(file)?;

        Ok(())
    }
}
