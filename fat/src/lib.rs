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

mod file;
pub mod layout;

pub use file::{File, FileKind, OpenFlags};
pub use tessera_err::*;

use log::error;
use tessera_bus::{BlockDevice, BLOCK_SIZE};
use zerocopy::{
    little_endian::{U16, U32},
    transmute_mut,
};

use crate::layout::{
    BootSector, DirEntry, MasterBootRecord, FAT16_EOC_MIN, FAT32_EOC, FAT32_EOC_MIN, FAT32_MASK,
};

/// Cache action that leaves the occupant clean.
pub(crate) const CACHE_FOR_READ: u8 = 0;
/// Cache action that marks the occupant for write-back.
pub(crate) const CACHE_FOR_WRITE: u8 = 1;

/// Cache block number meaning no block is cached.
pub(crate) const CACHE_EMPTY: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat16,
    Fat32,
}

/// A mounted FAT16 or FAT32 volume over a block device.
///
/// The volume owns the device and a single-slot block cache shared by the
/// FAT, directory and partial-data accesses of every file opened on it. A
/// block read after a write of the same LBA observes the written bytes even
/// before the cache is flushed to media.
pub struct Volume<BD: BlockDevice> {
    pub(crate) device: BD,

    pub(crate) fat_type: FatType,
    pub(crate) fat_count: u8,
    pub(crate) blocks_per_cluster: u8,
    pub(crate) cluster_size_shift: u8,
    pub(crate) blocks_per_fat: u32,
    pub(crate) fat_start_block: u32,
    pub(crate) root_dir_entry_count: u16,
    pub(crate) root_dir_start: u32,
    pub(crate) data_start_block: u32,
    pub(crate) cluster_count: u32,

    pub(crate) cache_buffer: [u8; BLOCK_SIZE],
    pub(crate) cache_block_number: u32,
    pub(crate) cache_dirty: u8,
    pub(crate) cache_mirror_block: u32,
}

impl<BD: BlockDevice> Volume<BD> {
    /// Mounts the first MBR partition, falling back to treating block zero
    /// as the boot sector of an unpartitioned card.
    pub fn mount(device: BD) -> Result<Self> {
        let mut volume = Self::with_device(device);
        if volume.init(1).is_err() {
            volume.init(0)?;
        }
        Ok(volume)
    }

    /// Mounts MBR partition `partition` (1-4), or the whole device when 0.
    pub fn mount_partition(device: BD, partition: u8) -> Result<Self> {
        let mut volume = Self::with_device(device);
        volume.init(partition)?;
        Ok(volume)
    }

    fn with_device(device: BD) -> Self {
        Self {
            device,
            fat_type: FatType::Fat16,
            fat_count: 0,
            blocks_per_cluster: 0,
            cluster_size_shift: 0,
            blocks_per_fat: 0,
            fat_start_block: 0,
            root_dir_entry_count: 0,
            root_dir_start: 0,
            data_start_block: 0,
            cluster_count: 0,
            cache_buffer: [0; BLOCK_SIZE],
            cache_block_number: CACHE_EMPTY,
            cache_dirty: 0,
            cache_mirror_block: 0,
        }
    }

    fn init(&mut self, partition: u8) -> Result<()> {
        self.cache_dirty = 0;
        self.cache_block_number = CACHE_EMPTY;
        self.cache_mirror_block = 0;

        if partition > 4 {
            error!("Partition index ({partition}) shall be within [0, 4]");
            return Err(VolumeError::InvalidPartition.into());
        }

        let mut volume_start_block = 0;
        if partition > 0 {
            self.cache_raw_block(0, CACHE_FOR_READ)?;
            let mbr = self.cache_mbr();
            let signature = mbr.signature;
            let entry = mbr.part[partition as usize - 1];
            if signature != [0x55, 0xAA]
                || entry.boot & 0x7F != 0
                || entry.total_sectors.get() < 100
                || entry.first_sector.get() == 0
            {
                error!("MBR partition {partition} is not a valid FAT partition");
                return Err(VolumeError::InvalidPartition.into());
            }
            volume_start_block = entry.first_sector.get();
        }

        self.cache_raw_block(volume_start_block, CACHE_FOR_READ)?;
        let bpb = self.cache_boot_sector();
        let bytes_per_sector = bpb.bytes_per_sector.get();
        let sectors_per_cluster = bpb.sectors_per_cluster;
        let reserved_sector_count = bpb.reserved_sector_count.get();
        let fat_count = bpb.fat_count;
        let root_dir_entry_count = bpb.root_dir_entry_count.get();
        let total_sectors_16 = bpb.total_sectors_16.get();
        let sectors_per_fat_16 = bpb.sectors_per_fat_16.get();
        let total_sectors_32 = bpb.total_sectors_32.get();
        let sectors_per_fat_32 = bpb.sectors_per_fat_32.get();
        let fat32_root_cluster = bpb.fat32_root_cluster.get();

        if bytes_per_sector != BLOCK_SIZE as u16 {
            error!("Bytes per sector ({bytes_per_sector}) shall be 512");
            return Err(VolumeError::InvalidBootSector.into());
        }
        if fat_count == 0 || reserved_sector_count == 0 || sectors_per_cluster == 0 {
            error!("Boot sector has a zero FAT count, reserved count or cluster size");
            return Err(VolumeError::InvalidBootSector.into());
        }
        self.fat_count = fat_count;
        self.blocks_per_cluster = sectors_per_cluster;

        // shift that is the same as multiply by blocks_per_cluster
        let mut shift = 0;
        while u32::from(sectors_per_cluster) != 1 << shift {
            if shift > 7 {
                error!("Sectors per cluster ({sectors_per_cluster}) shall be a power of two within [1, 128]");
                return Err(VolumeError::InvalidBootSector.into());
            }
            shift += 1;
        }
        self.cluster_size_shift = shift;

        self.blocks_per_fat = if sectors_per_fat_16 != 0 {
            sectors_per_fat_16 as u32
        } else {
            sectors_per_fat_32
        };
        self.fat_start_block = volume_start_block + reserved_sector_count as u32;

        // count for FAT16, zero for FAT32
        self.root_dir_entry_count = root_dir_entry_count;

        // directory start for FAT16, data start for FAT32
        self.root_dir_start = self.fat_start_block + fat_count as u32 * self.blocks_per_fat;

        self.data_start_block =
            self.root_dir_start + (32 * root_dir_entry_count as u32).div_ceil(BLOCK_SIZE as u32);

        let total_blocks = if total_sectors_16 != 0 {
            total_sectors_16 as u32
        } else {
            total_sectors_32
        };
        self.cluster_count =
            (total_blocks - (self.data_start_block - volume_start_block)) >> shift;

        // FAT type is determined by cluster count alone
        self.fat_type = if self.cluster_count < 4085 {
            error!(
                "Cluster count ({}) makes this a FAT12 volume, which is not supported",
                self.cluster_count
            );
            return Err(VolumeError::UnsupportedFatType.into());
        } else if self.cluster_count < 65525 {
            FatType::Fat16
        } else {
            self.root_dir_start = fat32_root_cluster;
            FatType::Fat32
        };
        Ok(())
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn blocks_per_cluster(&self) -> u8 {
        self.blocks_per_cluster
    }

    pub fn blocks_per_fat(&self) -> u32 {
        self.blocks_per_fat
    }

    pub fn fat_start_block(&self) -> u32 {
        self.fat_start_block
    }

    pub fn root_dir_entry_count(&self) -> u16 {
        self.root_dir_entry_count
    }

    /// First block of the FAT16 root directory region, or the FAT32 root
    /// directory cluster number.
    pub fn root_dir_start(&self) -> u32 {
        self.root_dir_start
    }

    pub fn data_start_block(&self) -> u32 {
        self.data_start_block
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    /// Releases the block device. Unflushed cache contents are discarded.
    pub fn into_device(self) -> BD {
        self.device
    }

    /// Looks up the FAT entry of `cluster`.
    pub fn fat_get(&mut self, cluster: u32) -> Result<u32> {
        if cluster > self.cluster_count + 1 {
            return Err(VolumeError::BadCluster.into());
        }
        let lba = self.fat_start_block
            + match self.fat_type {
                FatType::Fat16 => cluster >> 8,
                FatType::Fat32 => cluster >> 7,
            };
        self.cache_raw_block(lba, CACHE_FOR_READ)?;
        Ok(match self.fat_type {
            FatType::Fat16 => self.cache_fat16()[(cluster & 0xFF) as usize].get() as u32,
            FatType::Fat32 => self.cache_fat32()[(cluster & 0x7F) as usize].get() & FAT32_MASK,
        })
    }

    /// Stores a FAT entry. The second FAT copy is brought up to date by the
    /// next blocking flush.
    pub fn fat_put(&mut self, cluster: u32, value: u32) -> Result<()> {
        // clusters 0 and 1 are reserved
        if cluster < 2 || cluster > self.cluster_count + 1 {
            return Err(VolumeError::BadCluster.into());
        }
        let lba = self.fat_start_block
            + match self.fat_type {
                FatType::Fat16 => cluster >> 8,
                FatType::Fat32 => cluster >> 7,
            };
        self.cache_raw_block(lba, CACHE_FOR_READ)?;
        match self.fat_type {
            FatType::Fat16 => {
                self.cache_fat16()[(cluster & 0xFF) as usize] = U16::new(value as u16)
            }
            FatType::Fat32 => self.cache_fat32()[(cluster & 0x7F) as usize] = U32::new(value),
        }
        self.cache_set_dirty();

        // mirror second FAT
        if self.fat_count > 1 {
            self.cache_mirror_block = lba + self.blocks_per_fat;
        }
        Ok(())
    }

    /// Marks `cluster` as the end of its chain.
    pub fn fat_put_eoc(&mut self, cluster: u32) -> Result<()> {
        self.fat_put(cluster, FAT32_EOC)
    }

    pub fn is_eoc(&self, cluster: u32) -> bool {
        cluster
            >= match self.fat_type {
                FatType::Fat16 => FAT16_EOC_MIN as u32,
                FatType::Fat32 => FAT32_EOC_MIN,
            }
    }

    /// Byte length of the chain headed by `cluster`.
    pub fn chain_size(&mut self, cluster: u32) -> Result<u32> {
        let mut cluster = cluster;
        let mut size = 0;
        loop {
            cluster = self.fat_get(cluster)?;
            size += (BLOCK_SIZE as u32) << self.cluster_size_shift;
            if self.is_eoc(cluster) {
                break;
            }
        }
        Ok(size)
    }

    /// Writes back the cached block if it is dirty. A blocking flush also
    /// mirrors a pending FAT block and clears the dirty state; a non-blocking
    /// flush leaves both for a later blocking one.
    pub fn cache_flush(&mut self, blocking: bool) -> Result<()> {
        if self.cache_dirty != 0 {
            self.device
                .write_block(self.cache_block_number, &self.cache_buffer, blocking)?;
            if !blocking {
                return Ok(());
            }

            // mirror FAT tables
            if self.cache_mirror_block != 0 {
                self.device
                    .write_block(self.cache_mirror_block, &self.cache_buffer, blocking)?;
                self.cache_mirror_block = 0;
            }
            self.cache_dirty = 0;
        }
        Ok(())
    }

    /// Brings `block_number` into the cache, evicting the current occupant
    /// with a non-blocking flush, and ORs `action` into the dirty state.
    pub(crate) fn cache_raw_block(&mut self, block_number: u32, action: u8) -> Result<()> {
        if self.cache_block_number != block_number {
            self.cache_evict()?;
            self.device.read_block(block_number, &mut self.cache_buffer)?;
            self.cache_block_number = block_number;
        }
        self.cache_dirty |= action;
        Ok(())
    }

    /// Fills the cache with a zeroed `block_number` without reading it,
    /// marked for write-back.
    pub(crate) fn cache_zero_block(&mut self, block_number: u32) -> Result<()> {
        self.cache_evict()?;
        self.cache_buffer.fill(0);
        self.cache_block_number = block_number;
        self.cache_set_dirty();
        Ok(())
    }

    /// Non-blocking flush before the buffer is repurposed. A pending FAT
    /// mirror must be written now, while the buffer still holds the FAT
    /// block it mirrors.
    pub(crate) fn cache_evict(&mut self) -> Result<()> {
        self.cache_flush(false)?;
        if self.cache_mirror_block != 0 {
            self.device
                .write_block(self.cache_mirror_block, &self.cache_buffer, false)?;
            self.cache_mirror_block = 0;
        }
        Ok(())
    }

    pub(crate) fn cache_set_dirty(&mut self) {
        self.cache_dirty |= CACHE_FOR_WRITE;
    }

    pub(crate) fn cache_fat16(&mut self) -> &mut [U16; 256] {
        transmute_mut!(&mut self.cache_buffer)
    }

    pub(crate) fn cache_fat32(&mut self) -> &mut [U32; 128] {
        transmute_mut!(&mut self.cache_buffer)
    }

    pub(crate) fn cache_dir(&mut self, index: u8) -> &mut DirEntry {
        let entries: &mut [DirEntry; 16] = transmute_mut!(&mut self.cache_buffer);
        &mut entries[index as usize]
    }

    fn cache_mbr(&mut self) -> &mut MasterBootRecord {
        transmute_mut!(&mut self.cache_buffer)
    }

    fn cache_boot_sector(&mut self) -> &mut BootSector {
        transmute_mut!(&mut self.cache_buffer)
    }

    /// Block within its cluster holding byte `position` of a file.
    pub(crate) fn block_of_cluster(&self, position: u32) -> u8 {
        ((position >> 9) & (self.blocks_per_cluster as u32 - 1)) as u8
    }

    /// First block of `cluster` in the data region.
    pub(crate) fn cluster_start_block(&self, cluster: u32) -> u32 {
        self.data_start_block + ((cluster - 2) << self.cluster_size_shift)
    }
}

#[cfg(test)]
mod tests {
    use tessera_bus_std::MemoryBlockDevice;

    use super::*;

    #[test]
    fn cache_evicts_with_write_back() {
        let mut volume = Volume::with_device(MemoryBlockDevice::new(4));
        volume.cache_raw_block(1, CACHE_FOR_WRITE).unwrap();
        volume.cache_buffer[0] = 0xA5;

        // reading another block writes the dirty occupant back
        volume.cache_raw_block(2, CACHE_FOR_READ).unwrap();
        assert_eq!(volume.into_device().block(1)[0], 0xA5);
    }

    #[test]
    fn cache_hit_keeps_buffer() {
        let mut device = MemoryBlockDevice::new(4);
        device.block_mut(3)[7] = 0x77;
        let mut volume = Volume::with_device(device);

        volume.cache_raw_block(3, CACHE_FOR_READ).unwrap();
        volume.cache_buffer[7] = 0x99;

        // a hit must not reload from the device
        volume.cache_raw_block(3, CACHE_FOR_READ).unwrap();
        assert_eq!(volume.cache_buffer[7], 0x99);
    }

    #[test]
    fn read_action_does_not_dirty() {
        let mut volume = Volume::with_device(MemoryBlockDevice::new(4));
        volume.cache_raw_block(1, CACHE_FOR_READ).unwrap();
        volume.cache_buffer[0] = 0xEE;
        volume.cache_flush(true).unwrap();
        assert_eq!(volume.into_device().block(1)[0], 0);
    }
}
