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

use std::{fs::File, io, os::unix::fs::FileExt};

use tessera_bus::{BlockDevice, Result, BLOCK_SIZE};

/// Block device backed by a host file, typically a card image.
pub struct FileBlockDevice {
    file: File,
}

impl FileBlockDevice {
    pub fn open(file_path: &str) -> io::Result<Self> {
        Ok(Self {
            file: File::options().read(true).write(true).open(file_path)?,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&mut self, lba: u32, dst: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.file
            .read_exact_at(dst, lba as u64 * BLOCK_SIZE as u64)
            .unwrap();
        Ok(())
    }

    fn write_block(&mut self, lba: u32, src: &[u8; BLOCK_SIZE], _blocking: bool) -> Result<()> {
        self.file
            .write_all_at(src, lba as u64 * BLOCK_SIZE as u64)
            .unwrap();
        Ok(())
    }

    fn read_data(&mut self, lba: u32, offset: u16, dst: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(dst, lba as u64 * BLOCK_SIZE as u64 + offset as u64)
            .unwrap();
        Ok(())
    }
}

/// Block device backed by host memory, for tests and RAM disks.
pub struct MemoryBlockDevice {
    data: Vec<u8>,
}

impl MemoryBlockDevice {
    /// Creates a zero-filled device of `block_count` blocks.
    pub fn new(block_count: u32) -> Self {
        Self {
            data: vec![0; block_count as usize * BLOCK_SIZE],
        }
    }

    pub fn block_count(&self) -> u32 {
        (self.data.len() / BLOCK_SIZE) as u32
    }

    /// Raw bytes of one block, bypassing the device interface.
    pub fn block(&self, lba: u32) -> &[u8] {
        let offset = lba as usize * BLOCK_SIZE;
        &self.data[offset..offset + BLOCK_SIZE]
    }

    pub fn block_mut(&mut self, lba: u32) -> &mut [u8] {
        let offset = lba as usize * BLOCK_SIZE;
        &mut self.data[offset..offset + BLOCK_SIZE]
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_block(&mut self, lba: u32, dst: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        dst.copy_from_slice(self.block(lba));
        Ok(())
    }

    fn write_block(&mut self, lba: u32, src: &[u8; BLOCK_SIZE], _blocking: bool) -> Result<()> {
        self.block_mut(lba).copy_from_slice(src);
        Ok(())
    }

    fn read_data(&mut self, lba: u32, offset: u16, dst: &mut [u8]) -> Result<()> {
        let offset = lba as usize * BLOCK_SIZE + offset as usize;
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
        Ok(())
    }
}
