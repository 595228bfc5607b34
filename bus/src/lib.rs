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

pub use tessera_err::*;

/// Size of a block, the sole unit of I/O to a card.
pub const BLOCK_SIZE: usize = 512;

/// Blocking SPI transfer primitives, MSB first, mode 0.
///
/// The host owns clock configuration: the SD initialization handshake expects
/// the bus at 250 kHz; the rate may be raised once [`SpiBus::write`] of the
/// last handshake frame has completed.
pub trait SpiBus {
    fn write(&mut self, bytes: &[u8]);

    /// Clocks out `fill` for every byte of `buf` and stores what comes back.
    fn read_into(&mut self, fill: u8, buf: &mut [u8]);
}

/// Chip-select line of an SPI peripheral. Idle high, active low.
pub trait ChipSelect {
    fn set_high(&mut self);

    fn set_low(&mut self);
}

/// Millisecond busy-wait, the granularity all card timeouts are counted in.
pub trait Delay {
    fn delay_ms(&mut self, ms: u32);
}

/// A device addressable in 512-byte blocks by 32-bit LBA.
pub trait BlockDevice {
    fn read_block(&mut self, lba: u32, dst: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Writes one block. With `blocking` the call returns only once the
    /// device reports the data durable; without it the device may still be
    /// programming when the call returns.
    fn write_block(&mut self, lba: u32, src: &[u8; BLOCK_SIZE], blocking: bool) -> Result<()>;

    /// Reads `dst.len()` bytes starting `offset` bytes into a block.
    /// `offset + dst.len()` must not exceed [`BLOCK_SIZE`].
    fn read_data(&mut self, lba: u32, offset: u16, dst: &mut [u8]) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn read_block(&mut self, lba: u32, dst: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        (**self).read_block(lba, dst)
    }

    fn write_block(&mut self, lba: u32, src: &[u8; BLOCK_SIZE], blocking: bool) -> Result<()> {
        (**self).write_block(lba, src, blocking)
    }

    fn read_data(&mut self, lba: u32, offset: u16, dst: &mut [u8]) -> Result<()> {
        (**self).read_data(lba, offset, dst)
    }
}
