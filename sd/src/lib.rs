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

//! SPI-mode SD/SDHC block device driver.
//!
//! The reference wiring puts MISO on pin 4, CS on 5, SCK on 2 and MOSI on 3;
//! any blocking SPI peripheral and chip-select line satisfy the traits.

use log::debug;
use tessera_bus::{BlockDevice, ChipSelect, Delay, Error, Result, SdError, SpiBus, BLOCK_SIZE};

/// GO_IDLE_STATE - reset card to idle state
const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify card interface operating condition
const CMD8: u8 = 0x08;
/// SEND_STATUS - read card status register
const CMD13: u8 = 0x0D;
/// READ_SINGLE_BLOCK - read one data block
const CMD17: u8 = 0x11;
/// WRITE_BLOCK - write one data block
const CMD24: u8 = 0x18;
/// APP_CMD - escape for application specific command
const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COND - send operating condition, start initialization
const ACMD41: u8 = 0x29;

const R1_READY_STATE: u8 = 0x00;
const R1_IDLE_STATE: u8 = 0x01;
const R1_ILLEGAL_COMMAND: u8 = 0x04;
const DATA_START_BLOCK: u8 = 0xFE;
const DATA_RES_MASK: u8 = 0x1F;
const DATA_RES_ACCEPTED: u8 = 0x05;

/// Initialization timeout in milliseconds.
pub const SD_INIT_TIMEOUT: u32 = 2000;
/// Erase timeout in milliseconds.
pub const SD_ERASE_TIMEOUT: u32 = 10000;
/// Read timeout in milliseconds.
pub const SD_READ_TIMEOUT: u32 = 300;
/// Write timeout in milliseconds.
pub const SD_WRITE_TIMEOUT: u32 = 600;

/// Refuse writes to block zero, the MBR of most cards.
const SD_PROTECT_BLOCK_ZERO: bool = true;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    /// Standard capacity V1 card, byte addressed.
    Sd1,
    /// Standard capacity V2 card, byte addressed.
    Sd2,
    /// High capacity card, block addressed.
    Sdhc,
}

/// SPI-attached SD/SDHC card.
///
/// One instance owns one card: the chip-select line scopes every transaction,
/// and a partial-block read may hold the bus between calls, so no other
/// peripheral may use the SPI bus while a transaction is open.
pub struct SdCard<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,

    card_type: CardType,
    status: u8,
    reading: bool,
    block: u32,
    offset: u16,
    partial_block_read: bool,
    last_error: Option<SdError>,
}

impl<SPI: SpiBus, CS: ChipSelect, D: Delay> SdCard<SPI, CS, D> {
    pub fn new(spi: SPI, cs: CS, delay: D) -> Self {
        Self {
            spi,
            cs,
            delay,
            card_type: CardType::Sd1,
            status: 0,
            reading: false,
            block: 0,
            offset: 0,
            partial_block_read: false,
            last_error: None,
        }
    }

    /// Runs the card through the SPI-mode initialization handshake.
    ///
    /// The bus must be clocked at 250 kHz or slower until this returns; the
    /// host may raise the rate afterwards. On failure the chip select is
    /// released and the card must be reinitialized before further use.
    pub fn init(&mut self) -> Result<()> {
        self.status = 0;
        self.reading = false;
        self.offset = 0;
        self.partial_block_read = false;
        self.last_error = None;

        // wake the card with 80 clocks, chip select and MOSI high
        self.cs.set_high();
        for _ in 0..10 {
            self.spi.write(&[0xFF]);
        }

        let mut elapsed = 0;
        while self.command(CMD0, 0) != R1_IDLE_STATE {
            if elapsed > SD_INIT_TIMEOUT {
                return Err(self.fail(SdError::Cmd0));
            }
            elapsed += 1;
            self.delay.delay_ms(1);
        }

        if self.command(CMD8, 0x1AA) & R1_ILLEGAL_COMMAND != 0 {
            self.card_type = CardType::Sd1;
        } else {
            // read the rest of the R7 response, the last byte echoes the
            // check pattern
            for _ in 0..4 {
                self.status = self.receive();
            }
            if self.status != 0xAA {
                return Err(self.fail(SdError::Cmd8));
            }
            self.card_type = CardType::Sd2;
        }
        debug!("Card voltage check done, {:?}", self.card_type);

        let arg = if self.card_type == CardType::Sd2 {
            0x4000_0000
        } else {
            0
        };
        let mut elapsed = 0;
        while self.acommand(ACMD41, arg) != R1_READY_STATE {
            if elapsed > SD_INIT_TIMEOUT {
                return Err(self.fail(SdError::Acmd41));
            }
            elapsed += 1;
            self.delay.delay_ms(1);
        }

        // SD2 cards report high capacity through the OCR CCS bit
        if self.card_type == CardType::Sd2 {
            if self.command(CMD58, 0) != 0 {
                return Err(self.fail(SdError::Cmd58));
            }
            if self.receive() & 0xC0 == 0xC0 {
                self.card_type = CardType::Sdhc;
            }
            // discard rest of ocr - contains allowed voltage range
            for _ in 0..3 {
                self.receive();
            }
        }
        debug!("Card initialized, {:?}", self.card_type);

        self.cs.set_high();
        Ok(())
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Kind of the most recent failure, sticky until the next [`init`].
    ///
    /// [`init`]: SdCard::init
    pub fn last_error(&self) -> Option<SdError> {
        self.last_error
    }

    /// Allows a read transaction to stay open below byte 512 so that
    /// consecutive reads of the same block skip the command round trip.
    /// Disabling closes any open transaction.
    pub fn set_partial_block_read(&mut self, enabled: bool) {
        if !enabled {
            self.flush_read();
        }
        self.partial_block_read = enabled;
    }

    /// Reads `dst.len()` bytes starting `offset` bytes into `block`.
    pub fn read_data(&mut self, block: u32, offset: u16, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        if offset as usize + dst.len() > BLOCK_SIZE {
            return Err(self.fail(SdError::ReadRange));
        }
        if !self.reading || block != self.block || offset < self.offset {
            self.block = block;
            // byte address if not SDHC card
            let arg = if self.card_type != CardType::Sdhc {
                block << 9
            } else {
                block
            };
            if self.command(CMD17, arg) != 0 {
                return Err(self.fail(SdError::Cmd17));
            }
            self.wait_start_block()?;
            self.offset = 0;
            self.reading = true;
        }

        // skip data before offset
        while self.offset < offset {
            self.receive();
            self.offset += 1;
        }
        self.spi.read_into(0xFF, dst);
        self.offset += dst.len() as u16;

        if !self.partial_block_read || self.offset >= BLOCK_SIZE as u16 {
            self.flush_read();
        }
        Ok(())
    }

    pub fn read_block(&mut self, block: u32, dst: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.read_data(block, 0, dst)
    }

    /// Writes one block. Without `blocking` the card may still be programming
    /// flash when this returns; the next command waits for it.
    pub fn write_block(&mut self, block: u32, src: &[u8; BLOCK_SIZE], blocking: bool) -> Result<()> {
        if SD_PROTECT_BLOCK_ZERO && block == 0 {
            return Err(self.fail(SdError::WriteBlockZero));
        }
        // byte address if not SDHC card
        let arg = if self.card_type != CardType::Sdhc {
            block << 9
        } else {
            block
        };
        if self.command(CMD24, arg) != 0 {
            return Err(self.fail(SdError::Cmd24));
        }
        self.write_data(DATA_START_BLOCK, src)?;

        if blocking {
            // wait for flash programming to complete
            if !self.wait_not_busy(SD_WRITE_TIMEOUT) {
                return Err(self.fail(SdError::WriteTimeout));
            }
            // response is r2 so get and check two bytes for nonzero
            if self.command(CMD13, 0) != 0 || self.receive() != 0 {
                return Err(self.fail(SdError::WriteProgramming));
            }
        }
        self.cs.set_high();
        Ok(())
    }

    /// Sends a command frame and polls for the R1 response.
    fn command(&mut self, cmd: u8, arg: u32) -> u8 {
        // end any in-progress partial read before selecting the card
        self.flush_read();
        self.cs.set_low();
        self.wait_not_busy(SD_READ_TIMEOUT);

        // CRC is only checked for CMD0 and CMD8 in SPI mode
        let crc = match cmd {
            CMD0 => 0x95,
            CMD8 => 0x87,
            _ => 0xFF,
        };
        self.spi.write(&[
            0x40 | cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            crc,
        ]);

        for _ in 0..0x100 {
            self.status = self.receive();
            if self.status & 0x80 == 0 {
                break;
            }
        }
        self.status
    }

    /// Sends an application specific command, CMD55 then `cmd`.
    fn acommand(&mut self, cmd: u8, arg: u32) -> u8 {
        self.command(CMD55, 0);
        self.command(cmd, arg)
    }

    fn receive(&mut self) -> u8 {
        let mut buf = [0];
        self.spi.read_into(0xFF, &mut buf);
        buf[0]
    }

    /// Consumes the rest of an open read transaction, checksum included, and
    /// releases the chip select.
    fn flush_read(&mut self) {
        if !self.reading {
            return;
        }
        // 512 data bytes plus 2 checksum bytes
        while self.offset < 514 {
            self.receive();
            self.offset += 1;
        }
        self.cs.set_high();
        self.reading = false;
    }

    fn wait_start_block(&mut self) -> Result<()> {
        let mut elapsed = 0;
        loop {
            self.status = self.receive();
            if self.status != 0xFF {
                break;
            }
            if elapsed > SD_READ_TIMEOUT {
                return Err(self.fail(SdError::ReadTimeout));
            }
            elapsed += 1;
            self.delay.delay_ms(1);
        }
        if self.status != DATA_START_BLOCK {
            return Err(self.fail(SdError::Read));
        }
        Ok(())
    }

    /// Waits for the card to leave the busy state, releasing the data line.
    fn wait_not_busy(&mut self, timeout_ms: u32) -> bool {
        let mut elapsed = 0;
        loop {
            if self.receive() == 0xFF {
                return true;
            }
            self.delay.delay_ms(1);
            elapsed += 1;
            if elapsed >= timeout_ms {
                return false;
            }
        }
    }

    fn write_data(&mut self, token: u8, src: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.spi.write(&[0xFF, 0xFF, token]);
        self.spi.write(src);
        // checksum stub, the card ignores it without CMD59
        self.spi.write(&[0xFF, 0xFF]);

        self.status = self.receive();
        if self.status & DATA_RES_MASK != DATA_RES_ACCEPTED {
            return Err(self.fail(SdError::Write));
        }
        Ok(())
    }

    fn fail(&mut self, error: SdError) -> Error {
        self.cs.set_high();
        self.reading = false;
        self.last_error = Some(error);
        Error::Sd(error)
    }
}

impl<SPI: SpiBus, CS: ChipSelect, D: Delay> BlockDevice for SdCard<SPI, CS, D> {
    fn read_block(&mut self, lba: u32, dst: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        SdCard::read_block(self, lba, dst)
    }

    fn write_block(&mut self, lba: u32, src: &[u8; BLOCK_SIZE], blocking: bool) -> Result<()> {
        SdCard::write_block(self, lba, src, blocking)
    }

    fn read_data(&mut self, lba: u32, offset: u16, dst: &mut [u8]) -> Result<()> {
        SdCard::read_data(self, lba, offset, dst)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// SPI double that records outgoing bytes and plays back a scripted
    /// response stream, idling high once the script runs dry.
    struct ScriptedSpi {
        written: Vec<u8>,
        responses: VecDeque<u8>,
    }

    impl ScriptedSpi {
        fn new() -> Self {
            Self {
                written: Vec::new(),
                responses: VecDeque::new(),
            }
        }

        /// Scripts one command round trip: a not-busy filler byte, then the
        /// response bytes.
        fn script_command(&mut self, response: &[u8]) {
            self.responses.push_back(0xFF);
            self.responses.extend(response);
        }
    }

    impl SpiBus for ScriptedSpi {
        fn write(&mut self, bytes: &[u8]) {
            self.written.extend_from_slice(bytes);
        }

        fn read_into(&mut self, _fill: u8, buf: &mut [u8]) {
            for byte in buf {
                *byte = self.responses.pop_front().unwrap_or(0xFF);
            }
        }
    }

    struct Pin {
        low: bool,
    }

    impl ChipSelect for Pin {
        fn set_high(&mut self) {
            self.low = false;
        }

        fn set_low(&mut self) {
            self.low = true;
        }
    }

    struct FakeDelay {
        slept_ms: u32,
    }

    impl Delay for FakeDelay {
        fn delay_ms(&mut self, ms: u32) {
            self.slept_ms += ms;
        }
    }

    fn card() -> SdCard<ScriptedSpi, Pin, FakeDelay> {
        SdCard::new(ScriptedSpi::new(), Pin { low: false }, FakeDelay { slept_ms: 0 })
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    #[test]
    fn init_detects_sdhc() {
        let mut card = card();
        card.spi.script_command(&[R1_IDLE_STATE]); // CMD0
        card.spi
            .script_command(&[R1_IDLE_STATE, 0x00, 0x00, 0x01, 0xAA]); // CMD8
        card.spi.script_command(&[R1_IDLE_STATE]); // CMD55
        card.spi.script_command(&[R1_IDLE_STATE]); // ACMD41, busy
        card.spi.script_command(&[R1_IDLE_STATE]); // CMD55
        card.spi.script_command(&[R1_READY_STATE]); // ACMD41, ready
        card.spi
            .script_command(&[R1_READY_STATE, 0xC0, 0xFF, 0x80, 0x00]); // CMD58

        card.init().unwrap();

        assert_eq!(card.card_type(), CardType::Sdhc);
        assert!(!card.cs.low);
        // CMD0 and CMD8 carry real checksums
        assert!(contains(&card.spi.written, &[0x40, 0, 0, 0, 0, 0x95]));
        assert!(contains(&card.spi.written, &[0x48, 0, 0, 0x01, 0xAA, 0x87]));
    }

    #[test]
    fn init_detects_sd1_on_illegal_cmd8() {
        let mut card = card();
        card.spi.script_command(&[R1_IDLE_STATE]); // CMD0
        card.spi.script_command(&[R1_ILLEGAL_COMMAND | R1_IDLE_STATE]); // CMD8
        card.spi.script_command(&[R1_IDLE_STATE]); // CMD55
        card.spi.script_command(&[R1_READY_STATE]); // ACMD41

        card.init().unwrap();

        assert_eq!(card.card_type(), CardType::Sd1);
        // ACMD41 argument must not request high capacity
        assert!(contains(&card.spi.written, &[0x69, 0, 0, 0, 0, 0xFF]));
    }

    #[test]
    fn read_block_round_trip() {
        let mut card = card();
        card.card_type = CardType::Sdhc;

        let data: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        card.spi.script_command(&[R1_READY_STATE]); // CMD17
        card.spi.responses.push_back(DATA_START_BLOCK);
        card.spi.responses.extend(&data);
        card.spi.responses.extend(&[0xAB, 0xCD]); // checksum

        let mut dst = [0; BLOCK_SIZE];
        card.read_block(7, &mut dst).unwrap();

        assert_eq!(&dst[..], &data[..]);
        assert!(!card.reading);
        assert!(!card.cs.low);
        // SDHC addresses by block index
        assert!(contains(&card.spi.written, &[0x51, 0, 0, 0, 7, 0xFF]));
    }

    #[test]
    fn read_shifts_address_for_standard_capacity() {
        let mut card = card();
        card.card_type = CardType::Sd2;

        card.spi.script_command(&[R1_READY_STATE]);
        card.spi.responses.push_back(DATA_START_BLOCK);
        for _ in 0..514 {
            card.spi.responses.push_back(0);
        }

        let mut dst = [0; BLOCK_SIZE];
        card.read_block(2, &mut dst).unwrap();

        // block 2 becomes byte address 1024
        assert!(contains(&card.spi.written, &[0x51, 0, 0, 0x04, 0, 0xFF]));
    }

    #[test]
    fn partial_reads_share_one_transaction() {
        let mut card = card();
        card.card_type = CardType::Sdhc;
        card.set_partial_block_read(true);

        let data: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        card.spi.script_command(&[R1_READY_STATE]);
        card.spi.responses.push_back(DATA_START_BLOCK);
        card.spi.responses.extend(&data);
        card.spi.responses.extend(&[0, 0]);

        let mut first = [0; 4];
        card.read_data(3, 10, &mut first).unwrap();
        assert_eq!(first, [10, 11, 12, 13]);
        assert!(card.reading);
        assert_eq!(card.offset, 14);

        // same block, later offset: no second CMD17
        let mut second = [0; 4];
        card.read_data(3, 20, &mut second).unwrap();
        assert_eq!(second, [20, 21, 22, 23]);
        assert_eq!(card.offset, 24);

        let command_count = card
            .spi
            .written
            .iter()
            .filter(|&&byte| byte == (0x40 | CMD17))
            .count();
        assert_eq!(command_count, 1);

        card.set_partial_block_read(false);
        assert!(!card.reading);
        assert!(!card.cs.low);
    }

    #[test]
    fn read_data_rejects_out_of_range() {
        let mut card = card();
        let mut dst = [0; 4];
        assert!(card.read_data(3, 510, &mut dst).is_err());
        assert_eq!(card.last_error(), Some(SdError::ReadRange));
    }

    #[test]
    fn write_block_frames_data() {
        let mut card = card();
        card.card_type = CardType::Sdhc;

        card.spi.script_command(&[R1_READY_STATE]); // CMD24
        card.spi.responses.push_back(DATA_RES_ACCEPTED | 0xE0); // data response
        card.spi.responses.push_back(0xFF); // not busy
        card.spi.script_command(&[R1_READY_STATE, 0x00]); // CMD13, r2

        let src = [0x5A; BLOCK_SIZE];
        card.write_block(9, &src, true).unwrap();

        assert!(!card.cs.low);
        let token_at = card
            .spi
            .written
            .iter()
            .position(|&byte| byte == DATA_START_BLOCK)
            .unwrap();
        assert_eq!(&card.spi.written[token_at + 1..token_at + 513], &src[..]);
        assert_eq!(card.spi.written[token_at + 513..token_at + 515], [0xFF, 0xFF]);
    }

    #[test]
    fn write_block_zero_is_protected() {
        let mut card = card();
        let src = [0; BLOCK_SIZE];
        assert!(card.write_block(0, &src, true).is_err());
        assert_eq!(card.last_error(), Some(SdError::WriteBlockZero));
        assert!(card.spi.written.is_empty());
    }

    #[test]
    fn missing_start_token_times_out() {
        let mut card = card();
        card.card_type = CardType::Sdhc;
        card.spi.script_command(&[R1_READY_STATE]); // CMD17, then silence

        let mut dst = [0; BLOCK_SIZE];
        assert!(card.read_block(1, &mut dst).is_err());
        assert_eq!(card.last_error(), Some(SdError::ReadTimeout));
        assert!(card.delay.slept_ms > SD_READ_TIMEOUT);
        assert!(!card.cs.low);
    }
}
