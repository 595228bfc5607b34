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

use bitflags::bitflags;
use tessera_bus::{BlockDevice, BLOCK_SIZE};
use zerocopy::{
    little_endian::{U16, U32},
    FromZeros,
};

use crate::{
    layout::{
        DirEntry, DEFAULT_DATE, DEFAULT_TIME, DIR_ATT_DIRECTORY, DIR_ATT_READ_ONLY,
        DIR_NAME_DELETED, DIR_NAME_FREE,
    },
    FatType, FileError, Result, Volume, CACHE_EMPTY, CACHE_FOR_READ, CACHE_FOR_WRITE,
};

bitflags! {
    /// GNU style open flags.
    pub struct OpenFlags: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        /// The cursor is moved to the end of the file prior to each write.
        const APPEND = 0x04;
        /// Synchronous writes, every write flushes through to the card.
        const SYNC = 0x08;
        /// Create the file if nonexistent.
        const CREAT = 0x10;
        /// With `CREAT`, fail if the file exists.
        const EXCL = 0x20;
        /// Truncate the file to zero length on open.
        const TRUNC = 0x40;

        const RDWR = Self::READ.bits | Self::WRITE.bits;
    }
}

bitflags! {
    /// Access bits of an open file plus internal bookkeeping state.
    struct FileFlags: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const APPEND = 0x04;
        const SYNC = 0x08;
        // full blocks are written without waiting for the card
        const NON_BLOCKING_WRITE = 0x10;
        // a new cluster was added to the file
        const CLUSTER_ADDED = 0x20;
        // bypass the volume cache on block-sized reads
        const UNBUFFERED_READ = 0x40;
        // the directory entry is stale and needs a sync
        const DIR_DIRTY = 0x80;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// The file has not been opened.
    Closed,
    Normal,
    /// The fixed root directory region of a FAT16 volume.
    Root16,
    /// The root directory cluster chain of a FAT32 volume.
    Root32,
    SubDir,
}

/// An open file or directory on a FAT volume.
///
/// A file is plain data; every operation borrows the volume it was opened on,
/// and passing a different volume is a logic error. Cluster chain extensions
/// become reachable through the directory entry only after [`sync`]; unsynced
/// growth is lost on power failure.
///
/// [`sync`]: File::sync
pub struct File {
    kind: FileKind,
    flags: FileFlags,
    first_cluster: u32,
    file_size: u32,
    cur_cluster: u32,
    cur_position: u32,
    dir_block: u32,
    dir_index: u8,
    alloc_search_start: u32,
    date_time: Option<fn() -> (u16, u16)>,
}

impl File {
    pub fn new() -> Self {
        Self {
            kind: FileKind::Closed,
            flags: FileFlags::empty(),
            first_cluster: 0,
            file_size: 0,
            cur_cluster: 0,
            cur_position: 0,
            dir_block: 0,
            dir_index: 0,
            alloc_search_start: 2,
            date_time: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.kind != FileKind::Closed
    }

    pub fn is_dir(&self) -> bool {
        matches!(
            self.kind,
            FileKind::Root16 | FileKind::Root32 | FileKind::SubDir
        )
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::Normal
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn cur_position(&self) -> u32 {
        self.cur_position
    }

    /// Head of the cluster chain, zero for an empty file and for the FAT16
    /// root directory.
    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    /// Registers a callback supplying FAT date/time words for directory
    /// entry timestamps. Without one, timestamps stay at the default.
    pub fn date_time_callback(&mut self, date_time: fn() -> (u16, u16)) {
        self.date_time = Some(date_time);
    }

    /// Routes block-sized reads around the volume cache.
    pub fn set_unbuffered_read(&mut self, enabled: bool) {
        self.flags.set(FileFlags::UNBUFFERED_READ, enabled);
    }

    /// Opens the root directory of `volume`. Fails on an already open file.
    pub fn open_root<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>) -> Result<()> {
        if self.is_open() {
            return Err(FileError::AlreadyOpen.into());
        }

        match volume.fat_type() {
            FatType::Fat16 => {
                self.kind = FileKind::Root16;
                self.first_cluster = 0;
                self.file_size = 32 * volume.root_dir_entry_count() as u32;
            }
            FatType::Fat32 => {
                self.kind = FileKind::Root32;
                self.first_cluster = volume.root_dir_start();
                self.file_size = volume.chain_size(self.first_cluster)?;
            }
        }
        self.flags = FileFlags::READ;
        self.cur_cluster = 0;
        self.cur_position = 0;

        // the root has no directory entry
        self.dir_block = 0;
        self.dir_index = 0;
        Ok(())
    }

    /// Opens the entry named `name` in the directory `dir`, creating it when
    /// `CREAT` and `WRITE` are both given and the name is absent.
    pub fn open<BD: BlockDevice>(
        &mut self,
        volume: &mut Volume<BD>,
        dir: &mut File,
        name: &str,
        oflag: OpenFlags,
    ) -> Result<()> {
        if self.is_open() {
            return Err(FileError::AlreadyOpen.into());
        }

        let dname = make_83_name(name)?;
        dir.rewind();

        // first deleted or free slot, reusable on create
        let mut empty_slot = None;

        while dir.cur_position < dir.file_size {
            let index = ((dir.cur_position >> 5) & 0xF) as u8;
            let entry = dir.read_dir_cache(volume)?;

            if entry.name[0] == DIR_NAME_FREE || entry.name[0] == DIR_NAME_DELETED {
                if empty_slot.is_none() {
                    empty_slot = Some((volume.cache_block_number, index));
                }
                // done if no entries follow
                if entry.name[0] == DIR_NAME_FREE {
                    break;
                }
            } else if entry.name == dname {
                if oflag.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(FileError::Exists.into());
                }
                return self.open_cached_entry(volume, index, oflag);
            }
        }

        // only create a file if asked to, and only for writing
        if !oflag.contains(OpenFlags::CREAT | OpenFlags::WRITE) {
            return Err(FileError::NotFound.into());
        }

        let index = if let Some((block, index)) = empty_slot {
            volume.cache_raw_block(block, CACHE_FOR_WRITE)?;
            index
        } else {
            if dir.kind == FileKind::Root16 {
                // the FAT16 root directory region cannot grow
                return Err(FileError::DirFull.into());
            }

            // extend the directory, the new cluster's first block stays
            // cached for write
            dir.add_dir_cluster(volume)?;
            0
        };

        // initialize as an empty file
        let (date, time) = (DEFAULT_DATE, DEFAULT_TIME);
        let entry = volume.cache_dir(index);
        *entry = DirEntry::new_zeroed();
        entry.name = dname;
        entry.creation_date = U16::new(date);
        entry.creation_time = U16::new(time);
        entry.last_access_date = entry.creation_date;
        entry.last_write_date = entry.creation_date;
        entry.last_write_time = entry.creation_time;

        self.open_cached_entry(volume, index, oflag)
    }

    /// Opens the directory entry at `dir_index` of the cached block.
    fn open_cached_entry<BD: BlockDevice>(
        &mut self,
        volume: &mut Volume<BD>,
        dir_index: u8,
        oflag: OpenFlags,
    ) -> Result<()> {
        let entry = *volume.cache_dir(dir_index);

        // write or truncate is an error for a directory or read-only file
        if entry.attributes & (DIR_ATT_READ_ONLY | DIR_ATT_DIRECTORY) != 0
            && oflag.intersects(OpenFlags::WRITE | OpenFlags::TRUNC)
        {
            return Err(FileError::NonWritable.into());
        }

        // remember where the entry lives on the card
        self.dir_index = dir_index;
        self.dir_block = volume.cache_block_number;

        self.first_cluster = entry.first_cluster();
        if entry.is_file() {
            self.file_size = entry.file_size.get();
            self.kind = FileKind::Normal;
        } else if entry.is_subdir() {
            self.file_size = volume.chain_size(self.first_cluster)?;
            self.kind = FileKind::SubDir;
        } else {
            return Err(FileError::NotFileOrSubdir.into());
        }

        // keep the access bits for read/write
        self.flags = FileFlags::from_bits_truncate(
            (oflag & (OpenFlags::RDWR | OpenFlags::SYNC | OpenFlags::APPEND)).bits(),
        );
        self.cur_cluster = 0;
        self.cur_position = 0;

        if oflag.contains(OpenFlags::TRUNC) {
            return self.truncate(volume, 0);
        }
        Ok(())
    }

    /// Reads up to `dst.len()` bytes at the cursor, clamped to the bytes left
    /// in the file. At end of file nothing is read and the cursor stays.
    pub fn read<BD: BlockDevice>(
        &mut self,
        volume: &mut Volume<BD>,
        dst: &mut [u8],
    ) -> Result<usize> {
        if !self.is_open() || !self.flags.contains(FileFlags::READ) {
            return Err(FileError::NonReadable.into());
        }

        let nbyte = dst.len().min((self.file_size - self.cur_position) as usize);
        let mut done = 0;
        while done < nbyte {
            let offset = (self.cur_position & 0x1FF) as usize;
            let block = self.current_block(volume)?;
            let n = (nbyte - done).min(BLOCK_SIZE - offset);
            let chunk = &mut dst[done..done + n];

            // no buffering needed for whole blocks, or when asked not to
            if (self.flags.contains(FileFlags::UNBUFFERED_READ) || n == BLOCK_SIZE)
                && block != volume.cache_block_number
            {
                volume.device.read_data(block, offset as u16, chunk)?;
            } else {
                volume.cache_raw_block(block, CACHE_FOR_READ)?;
                chunk.copy_from_slice(&volume.cache_buffer[offset..offset + n]);
            }
            self.cur_position += n as u32;
            done += n;
        }
        Ok(nbyte)
    }

    /// Reads the byte at the cursor, `None` at end of file.
    pub fn read_byte<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>) -> Result<Option<u8>> {
        let mut byte = [0];
        Ok(if self.read(volume, &mut byte)? == 1 {
            Some(byte[0])
        } else {
            None
        })
    }

    /// Writes `src` at the cursor, extending the cluster chain on demand.
    /// The directory entry is not updated until [`sync`].
    ///
    /// [`sync`]: File::sync
    pub fn write<BD: BlockDevice>(
        &mut self,
        volume: &mut Volume<BD>,
        src: &[u8],
    ) -> Result<usize> {
        if self.kind != FileKind::Normal || !self.flags.contains(FileFlags::WRITE) {
            return Err(FileError::NonWritable.into());
        }

        if self.flags.contains(FileFlags::APPEND) && self.cur_position != self.file_size {
            self.seek_set(volume, self.file_size)?;
        }

        let mut done = 0;
        while done < src.len() {
            let block_of_cluster = volume.block_of_cluster(self.cur_position);
            let offset = (self.cur_position & 0x1FF) as usize;
            if block_of_cluster == 0 && offset == 0 {
                // start of a new cluster
                if self.cur_cluster == 0 {
                    if self.first_cluster == 0 {
                        // first cluster of the file
                        self.add_cluster(volume)?;
                    } else {
                        self.cur_cluster = self.first_cluster;
                    }
                } else {
                    let next = volume.fat_get(self.cur_cluster)?;
                    if volume.is_eoc(next) {
                        self.add_cluster(volume)?;
                    } else {
                        self.cur_cluster = next;
                    }
                }
            }
            let n = (src.len() - done).min(BLOCK_SIZE - offset);
            let block = volume.cluster_start_block(self.cur_cluster) + block_of_cluster as u32;
            let chunk = &src[done..done + n];

            if n == BLOCK_SIZE {
                // whole block, skip the cache but keep it coherent: the
                // write supersedes whatever the cache held for this block
                if volume.cache_block_number == block {
                    volume.cache_block_number = CACHE_EMPTY;
                    volume.cache_dirty = 0;
                }
                if let Some(chunk) = chunk.first_chunk::<BLOCK_SIZE>() {
                    let blocking = !self.flags.contains(FileFlags::NON_BLOCKING_WRITE);
                    volume.device.write_block(block, chunk, blocking)?;
                }
            } else {
                if offset == 0 && self.cur_position >= self.file_size {
                    // a brand new block needs no read-back
                    volume.cache_evict()?;
                    volume.cache_block_number = block;
                    volume.cache_set_dirty();
                } else {
                    // rewrite part of a block
                    volume.cache_raw_block(block, CACHE_FOR_WRITE)?;
                }
                volume.cache_buffer[offset..offset + n].copy_from_slice(chunk);
            }
            self.cur_position += n as u32;
            done += n;
        }

        if self.cur_position > self.file_size {
            self.file_size = self.cur_position;
            self.flags |= FileFlags::DIR_DIRTY;
        } else if self.date_time.is_some() && !src.is_empty() {
            self.flags |= FileFlags::DIR_DIRTY;
        }
        if self.flags.contains(FileFlags::SYNC) {
            self.sync(volume, true)?;
        }
        Ok(src.len())
    }

    /// Moves the cursor to `pos`, walking the cluster chain as needed.
    pub fn seek_set<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>, pos: u32) -> Result<()> {
        if !self.is_open() {
            return Err(FileError::NotOpen.into());
        }
        if pos > self.file_size {
            return Err(FileError::SeekPastEnd.into());
        }

        if self.kind == FileKind::Root16 {
            self.cur_position = pos;
            return Ok(());
        }
        if pos == 0 {
            self.cur_cluster = 0;
            self.cur_position = 0;
            return Ok(());
        }

        // cluster index of the target and of the cursor
        let shift = volume.cluster_size_shift + 9;
        let n_new = (pos - 1) >> shift;
        let mut hops = if self.cur_position == 0 || n_new < (self.cur_position - 1) >> shift {
            // must follow the chain from the first cluster
            self.cur_cluster = self.first_cluster;
            n_new
        } else {
            n_new - ((self.cur_position - 1) >> shift)
        };
        while hops > 0 {
            self.cur_cluster = volume.fat_get(self.cur_cluster)?;
            hops -= 1;
        }
        self.cur_position = pos;
        Ok(())
    }

    pub fn rewind(&mut self) {
        self.cur_position = 0;
        self.cur_cluster = 0;
    }

    /// Shortens a file open for writing to `length` bytes, freeing the
    /// clusters past the new end and restoring the cursor to
    /// `min(cursor, length)`.
    pub fn truncate<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>, length: u32) -> Result<()> {
        if self.kind != FileKind::Normal || !self.flags.contains(FileFlags::WRITE) {
            return Err(FileError::NonWritable.into());
        }
        if length > self.file_size {
            return Err(FileError::TruncatePastEnd.into());
        }
        if self.file_size == 0 {
            return Ok(());
        }

        let new_pos = self.cur_position.min(length);
        self.seek_set(volume, length)?;

        if length == 0 {
            // free everything
            self.free_chain(volume, self.first_cluster)?;
            self.first_cluster = 0;
        } else {
            let to_free = volume.fat_get(self.cur_cluster)?;
            if !volume.is_eoc(to_free) {
                // free the tail and end the chain at the cursor cluster
                self.free_chain(volume, to_free)?;
                volume.fat_put_eoc(self.cur_cluster)?;
            }
        }
        self.file_size = length;
        self.flags |= FileFlags::DIR_DIRTY;

        self.sync(volume, false)?;
        self.seek_set(volume, new_pos)
    }

    /// Writes the directory entry back if it is stale and flushes the cache.
    /// A blocking sync leaves both FAT copies consistent on media.
    pub fn sync<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>, blocking: bool) -> Result<()> {
        if !self.is_open() {
            return Err(FileError::NotOpen.into());
        }

        if self.flags.contains(FileFlags::DIR_DIRTY) {
            volume.cache_raw_block(self.dir_block, CACHE_FOR_WRITE)?;
            let date_time = self.date_time.map(|date_time| date_time());
            let entry = volume.cache_dir(self.dir_index);

            // do not set the size of directory files
            if self.kind == FileKind::Normal {
                entry.file_size = U32::new(self.file_size);
            }
            entry.first_cluster_low = U16::new(self.first_cluster as u16);
            entry.first_cluster_high = U16::new((self.first_cluster >> 16) as u16);
            if let Some((date, time)) = date_time {
                entry.last_write_date = U16::new(date);
                entry.last_write_time = U16::new(time);
                entry.last_access_date = U16::new(date);
            }
            self.flags.remove(FileFlags::DIR_DIRTY);
        }

        if !blocking {
            self.flags.remove(FileFlags::NON_BLOCKING_WRITE);
        }
        volume.cache_flush(blocking)
    }

    /// Syncs and closes the file.
    pub fn close<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>) -> Result<()> {
        self.sync(volume, false)?;
        self.kind = FileKind::Closed;
        Ok(())
    }

    /// Block holding the byte at the cursor, advancing the cursor cluster
    /// over cluster boundaries.
    fn current_block<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>) -> Result<u32> {
        if self.kind == FileKind::Root16 {
            return Ok(volume.root_dir_start() + (self.cur_position >> 9));
        }

        let block_of_cluster = volume.block_of_cluster(self.cur_position);
        if block_of_cluster == 0 && self.cur_position & 0x1FF == 0 {
            // start of a new cluster
            if self.cur_position == 0 {
                self.cur_cluster = self.first_cluster;
            } else {
                self.cur_cluster = volume.fat_get(self.cur_cluster)?;
            }
        }
        Ok(volume.cluster_start_block(self.cur_cluster) + block_of_cluster as u32)
    }

    /// Caches the directory entry at the cursor and returns a copy,
    /// advancing the cursor past it.
    fn read_dir_cache<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>) -> Result<DirEntry> {
        if !self.is_dir() {
            return Err(FileError::NotADirectory.into());
        }

        let index = ((self.cur_position >> 5) & 0xF) as u8;
        let block = self.current_block(volume)?;
        volume.cache_raw_block(block, CACHE_FOR_READ)?;
        let entry = *volume.cache_dir(index);
        self.cur_position += 32;
        Ok(entry)
    }

    /// Frees the chain headed by `cluster`.
    fn free_chain<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>, cluster: u32) -> Result<()> {
        let mut cluster = cluster;
        loop {
            let next = volume.fat_get(cluster)?;
            volume.fat_put(cluster, 0)?;
            cluster = next;
            if volume.is_eoc(cluster) {
                break;
            }
        }
        Ok(())
    }

    /// Appends one cluster to the file's chain, linking the directory entry
    /// to it when it is the file's first.
    fn add_cluster<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>) -> Result<()> {
        self.cur_cluster = self.alloc_contiguous(volume, 1, self.cur_cluster)?;

        if self.first_cluster == 0 {
            self.first_cluster = self.cur_cluster;
            self.flags |= FileFlags::DIR_DIRTY;
        }
        self.flags |= FileFlags::CLUSTER_ADDED;
        Ok(())
    }

    /// Appends one zeroed cluster to a directory. The first block of the new
    /// cluster is left in the cache, marked for write-back.
    fn add_dir_cluster<BD: BlockDevice>(&mut self, volume: &mut Volume<BD>) -> Result<()> {
        self.add_cluster(volume)?;

        let block = volume.cluster_start_block(self.cur_cluster);
        for i in (0..volume.blocks_per_cluster() as u32).rev() {
            volume.cache_zero_block(block + i)?;
        }
        self.file_size += (BLOCK_SIZE as u32) << volume.cluster_size_shift;
        Ok(())
    }

    /// Finds and claims a run of `count` free clusters.
    ///
    /// With a nonzero `cur_cluster` the search first tries to grow that chain
    /// contiguously and links it to the new run; otherwise it starts at the
    /// allocation hint. The scan wraps past the last cluster back to 2 and
    /// fails once every cluster has been probed. Returns the first cluster of
    /// the run.
    fn alloc_contiguous<BD: BlockDevice>(
        &mut self,
        volume: &mut Volume<BD>,
        count: u32,
        cur_cluster: u32,
    ) -> Result<u32> {
        let (mut bgn_cluster, set_start) = if cur_cluster != 0 {
            // try to keep the file contiguous
            (cur_cluster + 1, false)
        } else {
            // likely place for a free cluster, remembered for next time
            (self.alloc_search_start, count == 1)
        };

        let mut end_cluster = bgn_cluster;
        let fat_end = volume.cluster_count() + 1;
        let mut probed = 0;
        loop {
            // checked every cluster without finding space
            if probed >= volume.cluster_count() {
                return Err(FileError::NoFreeClusters.into());
            }
            // past the end - restart from the beginning of the FAT
            if end_cluster > fat_end {
                bgn_cluster = 2;
                end_cluster = 2;
            }
            if volume.fat_get(end_cluster)? != 0 {
                // in use, the run must begin after it
                bgn_cluster = end_cluster + 1;
            } else if end_cluster - bgn_cluster + 1 == count {
                break;
            }
            probed += 1;
            end_cluster += 1;
        }

        // mark the end of the chain, then link the run backwards
        volume.fat_put_eoc(end_cluster)?;
        while end_cluster > bgn_cluster {
            volume.fat_put(end_cluster - 1, end_cluster)?;
            end_cluster -= 1;
        }
        if cur_cluster != 0 {
            // connect the chains
            volume.fat_put(cur_cluster, bgn_cluster)?;
        }

        if set_start {
            self.alloc_search_start = bgn_cluster + 1;
        }
        Ok(bgn_cluster)
    }
}

impl Default for File {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonicalizes `name` into the blank-padded 8.3 directory entry form.
fn make_83_name(name: &str) -> Result<[u8; 11]> {
    let mut out = [b' '; 11];
    let mut i = 0;
    // highest allowed index, 7 before the dot and 10 after
    let mut n = 7;
    for &c in name.as_bytes() {
        if c == b'.' {
            if n == 10 {
                // only one dot allowed
                return Err(FileError::IllegalName.into());
            }
            n = 10;
            i = 8;
        } else {
            if b"|<>^+=?/[];,*\"\\".contains(&c) {
                return Err(FileError::IllegalName.into());
            }
            // fit the current part, printable ASCII only
            if i > n || c < 0x21 || c > 0x7E {
                return Err(FileError::IllegalName.into());
            }
            out[i] = c.to_ascii_uppercase();
            i += 1;
        }
    }
    // a name is required, an extension is optional
    if out[0] == b' ' {
        return Err(FileError::IllegalName.into());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use tessera_bus_std::MemoryBlockDevice;
    use zerocopy::IntoBytes;

    use super::*;
    use crate::layout::BootSector;

    #[test]
    fn names_are_folded_and_padded() {
        assert_eq!(&make_83_name("boot").unwrap(), b"BOOT       ");
        assert_eq!(&make_83_name("readme.txt").unwrap(), b"README  TXT");
        assert_eq!(&make_83_name("A1_~!.$").unwrap(), b"A1_~!   $  ");
    }

    #[test]
    fn names_are_validated() {
        assert!(make_83_name("").is_err());
        assert!(make_83_name(".txt").is_err());
        assert!(make_83_name("two.dots.txt").is_err());
        assert!(make_83_name("overlonged").is_err());
        assert!(make_83_name("file.text").is_err());
        assert!(make_83_name("sp ace").is_err());
        assert!(make_83_name("semi;colon").is_err());
        assert!(make_83_name("back\\slash").is_err());
    }

    const FAT_BLOCKS: u32 = 17;
    const TOTAL_BLOCKS: u32 = 4109;

    /// Smallest viable FAT16 volume: one reserved block, a single FAT,
    /// a one-block root directory and 4090 single-block clusters.
    fn fat16_volume() -> Volume<MemoryBlockDevice> {
        let mut device = MemoryBlockDevice::new(TOTAL_BLOCKS);
        let mut boot_sector = BootSector::new_zeroed();
        boot_sector.bytes_per_sector = U16::new(512);
        boot_sector.sectors_per_cluster = 1;
        boot_sector.reserved_sector_count = U16::new(1);
        boot_sector.fat_count = 1;
        boot_sector.root_dir_entry_count = U16::new(16);
        boot_sector.total_sectors_16 = U16::new(TOTAL_BLOCKS as u16);
        boot_sector.sectors_per_fat_16 = U16::new(FAT_BLOCKS as u16);
        boot_sector.signature = [0x55, 0xAA];
        device.block_mut(0).copy_from_slice(boot_sector.as_bytes());

        // media and reserved entries
        set_fat16(&mut device, 0, 0xFFF8);
        set_fat16(&mut device, 1, 0xFFFF);

        let volume = Volume::mount(device).unwrap();
        assert_eq!(volume.fat_type(), FatType::Fat16);
        volume
    }

    fn set_fat16(device: &mut MemoryBlockDevice, cluster: u32, value: u16) {
        let block = 1 + cluster / 256;
        let offset = (cluster % 256) as usize * 2;
        device.block_mut(block)[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn alloc_skips_too_short_runs() {
        let mut volume = fat16_volume();
        // free gaps at {5, 6} and {9, 10, 11}
        for cluster in [2, 3, 4, 7, 8] {
            volume.fat_put(cluster, 0xFFFF).unwrap();
        }

        let mut file = File::new();
        let bgn = file.alloc_contiguous(&mut volume, 3, 0).unwrap();

        assert_eq!(bgn, 9);
        assert_eq!(volume.fat_get(9).unwrap(), 10);
        assert_eq!(volume.fat_get(10).unwrap(), 11);
        let tail = volume.fat_get(11).unwrap();
        assert!(volume.is_eoc(tail));
        // the two-cluster gap is untouched
        assert_eq!(volume.fat_get(5).unwrap(), 0);
        assert_eq!(volume.fat_get(6).unwrap(), 0);

        // freeing the run restores the FAT
        file.free_chain(&mut volume, bgn).unwrap();
        for cluster in [9, 10, 11] {
            assert_eq!(volume.fat_get(cluster).unwrap(), 0);
        }
    }

    #[test]
    fn alloc_updates_search_hint_for_single_clusters() {
        let mut volume = fat16_volume();
        volume.fat_put(2, 0xFFFF).unwrap();

        let mut file = File::new();
        let bgn = file.alloc_contiguous(&mut volume, 1, 0).unwrap();
        assert_eq!(bgn, 3);
        assert_eq!(file.alloc_search_start, 4);
    }

    #[test]
    fn alloc_extends_chains_contiguously() {
        let mut volume = fat16_volume();
        volume.fat_put_eoc(4).unwrap();

        let mut file = File::new();
        let bgn = file.alloc_contiguous(&mut volume, 1, 4).unwrap();
        assert_eq!(bgn, 5);
        assert_eq!(volume.fat_get(4).unwrap(), 5);
        let tail = volume.fat_get(5).unwrap();
        assert!(volume.is_eoc(tail));
    }

    #[test]
    fn alloc_fails_when_fat_is_exhausted() {
        let mut volume = fat16_volume();
        for cluster in 2..volume.cluster_count() + 2 {
            volume.fat_put(cluster, 0xFFFF).unwrap();
        }

        let mut file = File::new();
        assert!(file.alloc_contiguous(&mut volume, 1, 0).is_err());
    }

    #[test]
    fn free_chain_zeroes_every_link() {
        let mut volume = fat16_volume();
        volume.fat_put(5, 6).unwrap();
        volume.fat_put(6, 7).unwrap();
        volume.fat_put_eoc(7).unwrap();

        let mut file = File::new();
        file.free_chain(&mut volume, 5).unwrap();
        for cluster in [5, 6, 7] {
            assert_eq!(volume.fat_get(cluster).unwrap(), 0);
        }
    }
}
