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

//! Builders for freshly formatted in-memory card images.

#![allow(dead_code)]

use tessera_bus_std::MemoryBlockDevice;
use tessera_fat::layout::{BootSector, DirEntry, FAT16_EOC, FAT32_EOC};
use zerocopy::{
    little_endian::{U16, U32},
    FromZeros, IntoBytes,
};

pub const FAT32_RESERVED: u32 = 32;
pub const FAT32_BLOCKS_PER_FAT: u32 = 520;
pub const FAT32_DATA_START: u32 = FAT32_RESERVED + 2 * FAT32_BLOCKS_PER_FAT;
pub const FAT32_CLUSTER_COUNT: u32 = 65600;
pub const FAT32_TOTAL_BLOCKS: u32 = FAT32_DATA_START + FAT32_CLUSTER_COUNT;

/// A FAT32 volume with two mirrored FATs, one block per cluster and the root
/// directory in cluster 2.
pub fn fat32_device() -> MemoryBlockDevice {
    let mut device = MemoryBlockDevice::new(FAT32_TOTAL_BLOCKS);

    let mut boot_sector = BootSector::new_zeroed();
    boot_sector.bytes_per_sector = U16::new(512);
    boot_sector.sectors_per_cluster = 1;
    boot_sector.reserved_sector_count = U16::new(FAT32_RESERVED as u16);
    boot_sector.fat_count = 2;
    boot_sector.total_sectors_32 = U32::new(FAT32_TOTAL_BLOCKS);
    boot_sector.sectors_per_fat_32 = U32::new(FAT32_BLOCKS_PER_FAT);
    boot_sector.fat32_root_cluster = U32::new(2);
    boot_sector.signature = [0x55, 0xAA];
    device.block_mut(0).copy_from_slice(boot_sector.as_bytes());

    // media, reserved and root directory entries
    set_fat32(&mut device, 0, 0x0FFF_FFF8);
    set_fat32(&mut device, 1, 0x0FFF_FFFF);
    set_fat32(&mut device, 2, FAT32_EOC);
    device
}

/// Stores a FAT32 entry into both FAT copies, bypassing the volume layer.
pub fn set_fat32(device: &mut MemoryBlockDevice, cluster: u32, value: u32) {
    for copy in 0..2 {
        let block = FAT32_RESERVED + copy * FAT32_BLOCKS_PER_FAT + cluster / 128;
        let offset = (cluster % 128) as usize * 4;
        device.block_mut(block)[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Reads a FAT32 entry straight from FAT copy `copy`.
pub fn get_fat32(device: &MemoryBlockDevice, copy: u32, cluster: u32) -> u32 {
    let block = FAT32_RESERVED + copy * FAT32_BLOCKS_PER_FAT + cluster / 128;
    let offset = (cluster % 128) as usize * 4;
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&device.block(block)[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub const FAT16_RESERVED: u32 = 1;
pub const FAT16_BLOCKS_PER_FAT: u32 = 32;
pub const FAT16_ROOT_START: u32 = FAT16_RESERVED + 2 * FAT16_BLOCKS_PER_FAT;
pub const FAT16_CLUSTER_COUNT: u32 = 4200;

/// A FAT16 volume with two mirrored FATs, one block per cluster and a fixed
/// root directory of `root_entries` slots.
pub fn fat16_device(root_entries: u16) -> MemoryBlockDevice {
    let root_blocks = (root_entries as u32 * 32).div_ceil(512);
    let total_blocks = FAT16_ROOT_START + root_blocks + FAT16_CLUSTER_COUNT;
    let mut device = MemoryBlockDevice::new(total_blocks);

    let mut boot_sector = BootSector::new_zeroed();
    boot_sector.bytes_per_sector = U16::new(512);
    boot_sector.sectors_per_cluster = 1;
    boot_sector.reserved_sector_count = U16::new(FAT16_RESERVED as u16);
    boot_sector.fat_count = 2;
    boot_sector.root_dir_entry_count = U16::new(root_entries);
    boot_sector.total_sectors_16 = U16::new(total_blocks as u16);
    boot_sector.sectors_per_fat_16 = U16::new(FAT16_BLOCKS_PER_FAT as u16);
    boot_sector.signature = [0x55, 0xAA];
    device.block_mut(0).copy_from_slice(boot_sector.as_bytes());

    set_fat16(&mut device, 0, 0xFFF8);
    set_fat16(&mut device, 1, FAT16_EOC);
    device
}

pub fn set_fat16(device: &mut MemoryBlockDevice, cluster: u32, value: u16) {
    for copy in 0..2 {
        let block = FAT16_RESERVED + copy * FAT16_BLOCKS_PER_FAT + cluster / 256;
        let offset = (cluster % 256) as usize * 2;
        device.block_mut(block)[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }
}

/// A blank-padded directory entry for seeding images.
pub fn dir_entry(name: &[u8; 11], first_cluster: u32, size: u32, attributes: u8) -> DirEntry {
    let mut entry = DirEntry::new_zeroed();
    entry.name = *name;
    entry.attributes = attributes;
    entry.first_cluster_low = U16::new(first_cluster as u16);
    entry.first_cluster_high = U16::new((first_cluster >> 16) as u16);
    entry.file_size = U32::new(size);
    entry
}

pub fn put_dir_entry(device: &mut MemoryBlockDevice, block: u32, slot: usize, entry: &DirEntry) {
    device.block_mut(block)[slot * 32..slot * 32 + 32].copy_from_slice(entry.as_bytes());
}
