// Copyright 2024 Kevin Ludwig
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

//! On-disk structures of MBR-partitioned FAT16/FAT32 volumes.
//!
//! Everything here is little-endian and packed; every multi-byte field uses a
//! byte-order type so the structures have alignment 1 and can be viewed over
//! any 512-byte buffer.

use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// FAT16 end of chain value used by Microsoft.
pub const FAT16_EOC: u16 = 0xFFFF;
/// Minimum value for FAT16 EOC. Use to test for EOC.
pub const FAT16_EOC_MIN: u16 = 0xFFF8;
/// FAT32 end of chain value used by Microsoft.
pub const FAT32_EOC: u32 = 0x0FFF_FFFF;
/// Minimum value for FAT32 EOC. Use to test for EOC.
pub const FAT32_EOC_MIN: u32 = 0x0FFF_FFF8;
/// Mask for a FAT32 entry. Entries are 28 bits.
pub const FAT32_MASK: u32 = 0x0FFF_FFFF;

/// Escape for a name whose first byte is a legitimate 0xE5.
pub const DIR_NAME_0XE5: u8 = 0x05;
/// name[0] value for an entry that is free after being deleted.
pub const DIR_NAME_DELETED: u8 = 0xE5;
/// name[0] value for an entry that is free and no allocated entries follow.
pub const DIR_NAME_FREE: u8 = 0x00;

/// File is read-only.
pub const DIR_ATT_READ_ONLY: u8 = 0x01;
/// File should be hidden in directory listings.
pub const DIR_ATT_HIDDEN: u8 = 0x02;
/// Entry is for a system file.
pub const DIR_ATT_SYSTEM: u8 = 0x04;
/// Directory entry contains the volume label.
pub const DIR_ATT_VOLUME_ID: u8 = 0x08;
/// Entry is for a directory.
pub const DIR_ATT_DIRECTORY: u8 = 0x10;
/// Old DOS archive bit for backup support.
pub const DIR_ATT_ARCHIVE: u8 = 0x20;
/// Attribute value of a long name entry, matched under
/// [`DIR_ATT_LONG_NAME_MASK`].
pub const DIR_ATT_LONG_NAME: u8 = 0x0F;
pub const DIR_ATT_LONG_NAME_MASK: u8 = 0x3F;

/// Mask for file/subdirectory tests.
const DIR_ATT_FILE_TYPE_MASK: u8 = DIR_ATT_VOLUME_ID | DIR_ATT_DIRECTORY;

/// Default directory entry date, 2000-01-01.
pub const DEFAULT_DATE: u16 = ((2000 - 1980) << 9) | (1 << 5) | 1;
/// Default directory entry time, midnight.
pub const DEFAULT_TIME: u16 = 0;

/// One slot of the MBR partition table.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PartitionEntry {
    /// Boot indicator. 0x00, or 0x80 for the active partition; any other
    /// value marks the table entry invalid.
    pub boot: u8,
    /// Head part of the CHS address of the first block. Only used by old PC
    /// BIOSes, as are the other CHS fields.
    pub begin_head: u8,
    /// Sector (6 bits) and cylinder (10 bits) of the first block.
    pub begin_sector_cylinder: U16,
    /// Partition type.
    pub kind: u8,
    /// Head part of the CHS address of the last block.
    pub end_head: u8,
    /// Sector and cylinder of the last block.
    pub end_sector_cylinder: U16,
    /// Logical block address of the first block in the partition.
    pub first_sector: U32,
    /// Length of the partition, in blocks.
    pub total_sectors: U32,
}

/// Master boot record, the first block of most cards.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MasterBootRecord {
    /// Code area for the master boot program.
    pub code_area: [u8; 440],
    /// Optional Windows NT disk signature. May contain more boot code.
    pub disk_signature: U32,
    /// Usually zero but may be more boot code.
    pub usually_zero: U16,
    pub part: [PartitionEntry; 4],
    /// Must be 0x55, 0xAA.
    pub signature: [u8; 2],
}

/// Boot sector of a FAT16 or FAT32 volume, BIOS parameter block included.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BootSector {
    /// X86 jump to the boot program.
    pub jmp_to_boot_code: [u8; 3],
    /// Informational only, indicates what formatted the volume.
    pub oem_name: [u8; 8],
    /// Count of bytes per sector. This driver only supports 512.
    pub bytes_per_sector: U16,
    /// Blocks per allocation unit. Must be a power of two in [1, 128].
    pub sectors_per_cluster: u8,
    /// Number of blocks before the first FAT. Must not be zero.
    pub reserved_sector_count: U16,
    /// Count of FAT copies on the volume, typically 2.
    pub fat_count: u8,
    /// Count of 32-byte entries in the root directory. Nonzero for FAT16,
    /// zero for FAT32.
    pub root_dir_entry_count: U16,
    /// Old 16-bit total block count; zero means [`total_sectors_32`] holds
    /// the count. Always zero on FAT32.
    ///
    /// [`total_sectors_32`]: BootSector::total_sectors_32
    pub total_sectors_16: U16,
    /// Media determination dating back to MS-DOS 1.x, 0xF0 or 0xF8-0xFF.
    pub media_type: u8,
    /// Blocks per FAT on FAT16 volumes; zero on FAT32.
    pub sectors_per_fat_16: U16,
    /// Sectors per track for interrupt 0x13. Not used otherwise.
    pub sectors_per_track: U16,
    /// Number of heads for interrupt 0x13. Not used otherwise.
    pub head_count: U16,
    /// Blocks preceding the partition holding this volume.
    pub hidden_sectors: U32,
    /// New 32-bit total block count, covering all four volume regions.
    pub total_sectors_32: U32,
    /// Blocks per FAT on FAT32 volumes.
    pub sectors_per_fat_32: U32,
    /// FAT32 mirroring control. Bit 7 clear means the FAT is mirrored at
    /// runtime into all copies.
    pub fat32_flags: U16,
    /// FAT32 version, only 0.0 is defined.
    pub fat32_version: U16,
    /// Cluster number of the first cluster of the FAT32 root directory,
    /// usually but not necessarily 2.
    pub fat32_root_cluster: U32,
    /// Block number of the FSINFO structure in the reserved area, usually 1.
    pub fat32_fs_info: U16,
    /// If nonzero, the block number of a copy of the boot record, usually 6.
    pub fat32_back_boot_block: U16,
    /// Reserved for future expansion, zero-filled by formatters.
    pub fat32_reserved: [u8; 12],
    /// For interrupt 0x13, 0x80 for hard drives.
    pub drive_number: u8,
    /// Used by Windows NT, should be zero for FAT.
    pub reserved1: u8,
    /// 0x29 if the next three fields are valid.
    pub boot_signature: u8,
    /// Usually generated by combining date and time.
    pub volume_serial_number: U32,
    /// Should match the volume label in the root directory.
    pub volume_label: [u8; 11],
    /// Informational only - don't depend on it.
    pub file_system_type: [u8; 8],
    /// X86 boot code.
    pub boot_code: [u8; 420],
    /// Must be 0x55, 0xAA.
    pub signature: [u8; 2],
}

/// A 32-byte FAT directory entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DirEntry {
    /// Short 8.3 name: eight name bytes then three extension bytes, both
    /// blank filled.
    pub name: [u8; 11],
    /// Entry attributes, see the `DIR_ATT_` constants. The upper two bits
    /// are reserved.
    pub attributes: u8,
    /// Reserved for Windows NT.
    pub reserved_nt: u8,
    /// Tenths of a second part of the creation time, 0-199.
    pub creation_time_tenths: u8,
    /// Time file was created, 2 second granularity.
    pub creation_time: U16,
    /// Date file was created.
    pub creation_date: U16,
    /// Date of last read or write. There is no last access time.
    pub last_access_date: U16,
    /// High word of the entry's first cluster number, always zero on FAT16.
    pub first_cluster_high: U16,
    /// Time of last write. File creation is considered a write.
    pub last_write_time: U16,
    /// Date of last write.
    pub last_write_date: U16,
    /// Low word of the entry's first cluster number.
    pub first_cluster_low: U16,
    /// File size in bytes.
    pub file_size: U32,
}

impl DirEntry {
    pub fn is_long_name(&self) -> bool {
        self.attributes & DIR_ATT_LONG_NAME_MASK == DIR_ATT_LONG_NAME
    }

    /// Entry is for a file.
    pub fn is_file(&self) -> bool {
        self.attributes & DIR_ATT_FILE_TYPE_MASK == 0
    }

    /// Entry is for a subdirectory.
    pub fn is_subdir(&self) -> bool {
        self.attributes & DIR_ATT_FILE_TYPE_MASK == DIR_ATT_DIRECTORY
    }

    pub fn first_cluster(&self) -> u32 {
        (self.first_cluster_high.get() as u32) << 16 | self.first_cluster_low.get() as u32
    }
}
