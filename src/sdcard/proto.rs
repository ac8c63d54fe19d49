//! Constants, CRCs and register layouts from the SD and MMC Specifications
//!
//! Based on SdFat, under the following terms:
//!
//! > Copyright (c) 2011-2018 Bill Greiman
//! > This file is part of the SdFat library for SD memory cards.
//! >
//! > MIT License
//! >
//! > Permission is hereby granted, free of charge, to any person obtaining a
//! > copy of this software and associated documentation files (the "Software"),
//! > to deal in the Software without restriction, including without limitation
//! > the rights to use, copy, modify, merge, publish, distribute, sublicense,
//! > and/or sell copies of the Software, and to permit persons to whom the
//! > Software is furnished to do so, subject to the following conditions:
//! >
//! > The above copyright notice and this permission notice shall be included
//! > in all copies or substantial portions of the Software.
//! >
//! > THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//! > OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//! > FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//! > AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//! > LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//! > FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//! > DEALINGS IN THE SOFTWARE.

//==============================================================================

use byteorder::{BigEndian, ByteOrder};

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_OP_COND - MMC initialization, used when the card rejects ACMD41
pub const CMD1: u8 = 0x01;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the Card Identification register
pub const CMD10: u8 = 0x0A;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SEND_STATUS - read the card status register
pub const CMD13: u8 = 0x0D;
/// SET_BLOCKLEN - set the block length for byte-addressed cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking
pub const CMD59: u8 = 0x3B;
/// SD_STATUS - read the 512-bit SD Status register
pub const ACMD13: u8 = 0x0D;
/// SET_WR_BLK_ERASE_COUNT - set the number of write blocks to be
/// pre-erased before writing
pub const ACMD23: u8 = 0x17;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// Returned in place of an R1 when the card never answered. Bit 7 of a real
/// R1 is always clear, so this can not be confused with a response.
pub const R1_INVALID: u8 = 0x80;

/// The value clocked in while nothing is being driven on the data line.
pub const IDLE_BYTE: u8 = 0xFF;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// CMD8 argument: 2.7-3.6V supply and the 0xAA check pattern
pub const IF_COND_CHECK: u32 = 0x1AA;

/// ACMD41 argument: host supports high capacity cards
pub const ACMD41_HCS: u32 = 0x4000_0000;

/// OCR bit 30: card uses block addressing
pub const OCR_CCS: u32 = 0x4000_0000;

/// Valid CRC byte for `CMD0` with a zero argument.
pub const CMD0_CRC: u8 = 0x95;

/// Valid CRC byte for `CMD8` with the [`IF_COND_CHECK`] argument.
pub const CMD8_CRC: u8 = 0x87;

/// CRC byte sent with every other command while CRC checking is off. Only
/// the stop bit is meaningful.
pub const PLACEHOLDER_CRC: u8 = 0x01;

/// Length of the SD Status register in bytes. Only the first 16 are kept.
pub const SD_STATUS_LEN: usize = 64;

//==============================================================================

/// Build the six bytes of a command frame: start and transmission bits,
/// index, big-endian argument, CRC-7 and stop bit.
///
/// With `use_crc` off the CRC comes from a table that is only valid for
/// `CMD0` and `CMD8`, the two commands a card checks before CRC checking
/// has been relaxed.
pub fn command_frame(command: u8, arg: u32, use_crc: bool) -> [u8; 6] {
    let mut buf = [0x40 | (command & 0x3F), 0, 0, 0, 0, 0];
    BigEndian::write_u32(&mut buf[1..5], arg);
    buf[5] = if use_crc {
        crc7(&buf[0..5])
    } else {
        match command {
            CMD0 => CMD0_CRC,
            CMD8 => CMD8_CRC,
            _ => PLACEHOLDER_CRC,
        }
    };
    buf
}

/// Card Specific Data, version 1 (SD v1, byte-addressed SD v2 and MMC)
#[derive(Default, Clone)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2 (block-addressed SD v2)
#[derive(Default, Clone)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
#[derive(Debug, Clone)]
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl Csd {
    /// Sort a raw CSD by its CSD_STRUCTURE field.
    ///
    /// Returns `None` for structure versions this driver does not know.
    pub fn parse(data: [u8; 16]) -> Option<Csd> {
        match crate::structure::extract_bits(&data, 127, 126) {
            0 => Some(Csd::V1(CsdV1 { data })),
            1 => Some(Csd::V2(CsdV2 { data })),
            _ => None,
        }
    }

    /// Returns the card capacity in 512-byte blocks, or `None` if it does
    /// not fit in 32 bits
    pub fn card_capacity_blocks(&self) -> Option<u32> {
        match self {
            Csd::V1(csd) => Some(csd.card_capacity_blocks()),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }
}

impl CsdV1 {
    define_field!(csd_ver, u8, 127, 126);
    define_field!(data_read_access_time1, u8, 119, 112);
    define_field!(data_read_access_time2, u8, 111, 104);
    define_field!(max_data_transfer_rate, u8, 103, 96);
    define_field!(card_command_classes, u16, 95, 84);
    define_field!(read_block_length, u8, 83, 80);
    define_field!(read_partial_blocks, bool, 79);
    define_field!(write_block_misalignment, bool, 78);
    define_field!(read_block_misalignment, bool, 77);
    define_field!(dsr_implemented, bool, 76);
    define_field!(device_size, u32, 73, 62);
    define_field!(max_read_current_vdd_min, u8, 61, 59);
    define_field!(max_read_current_vdd_max, u8, 58, 56);
    define_field!(max_write_current_vdd_min, u8, 55, 53);
    define_field!(max_write_current_vdd_max, u8, 52, 50);
    define_field!(device_size_multiplier, u8, 49, 47);
    define_field!(erase_single_block_enabled, bool, 46);
    define_field!(erase_sector_size, u8, 45, 39);
    define_field!(write_protect_group_size, u8, 38, 32);
    define_field!(write_protect_group_enable, bool, 31);
    define_field!(write_speed_factor, u8, 28, 26);
    define_field!(max_write_data_length, u8, 25, 22);
    define_field!(write_partial_blocks, bool, 21);
    define_field!(file_format_group_set, bool, 15);
    define_field!(copy_flag_set, bool, 14);
    define_field!(permanent_write_protection, bool, 13);
    define_field!(temporary_write_protection, bool, 12);
    define_field!(file_format, u8, 11, 10);
    define_field!(crc, u8, 7, 0);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.card_capacity_bytes() / 512) as u32
    }

    /// Returns the erase granularity in 512-byte blocks
    pub fn erase_unit_blocks(&self) -> u32 {
        u32::from(self.erase_sector_size()) + 1
    }
}

impl CsdV2 {
    define_field!(csd_ver, u8, 127, 126);
    define_field!(data_read_access_time1, u8, 119, 112);
    define_field!(data_read_access_time2, u8, 111, 104);
    define_field!(max_data_transfer_rate, u8, 103, 96);
    define_field!(card_command_classes, u16, 95, 84);
    define_field!(read_block_length, u8, 83, 80);
    define_field!(read_partial_blocks, bool, 79);
    define_field!(write_block_misalignment, bool, 78);
    define_field!(read_block_misalignment, bool, 77);
    define_field!(dsr_implemented, bool, 76);
    define_field!(device_size, u32, 69, 48);
    define_field!(erase_single_block_enabled, bool, 46);
    define_field!(erase_sector_size, u8, 45, 39);
    define_field!(write_protect_group_size, u8, 38, 32);
    define_field!(write_protect_group_enable, bool, 31);
    define_field!(write_speed_factor, u8, 28, 26);
    define_field!(max_write_data_length, u8, 25, 22);
    define_field!(write_partial_blocks, bool, 21);
    define_field!(file_format_group_set, bool, 15);
    define_field!(copy_flag_set, bool, 14);
    define_field!(permanent_write_protection, bool, 13);
    define_field!(temporary_write_protection, bool, 12);
    define_field!(file_format, u8, 11, 10);
    define_field!(crc, u8, 7, 0);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks, or `None` if it does
    /// not fit in 32 bits
    ///
    /// Only a C_SIZE of 0x3FFFFF (a garbled or 2 TiB card) overflows.
    pub fn card_capacity_blocks(&self) -> Option<u32> {
        u32::try_from((u64::from(self.device_size()) + 1) * 1024).ok()
    }

    /// Returns the erase granularity from the CSD alone, in 512-byte blocks
    ///
    /// Prefer the AU size from the SD Status register when the card gives one.
    pub fn erase_unit_blocks(&self) -> u32 {
        u32::from(self.erase_sector_size()) + 1
    }
}

impl core::fmt::Debug for CsdV1 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CsdV1")
            .field("device_size", &self.device_size())
            .field("device_size_multiplier", &self.device_size_multiplier())
            .field("read_block_length", &self.read_block_length())
            .field("erase_sector_size", &self.erase_sector_size())
            .finish()
    }
}

impl core::fmt::Debug for CsdV2 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CsdV2")
            .field("device_size", &self.device_size())
            .field("erase_sector_size", &self.erase_sector_size())
            .finish()
    }
}

/// Allocation unit sizes in 512-byte blocks, indexed by AU_SIZE.
///
/// Entry 0 means the card does not define its AU size.
pub const AU_SIZE_BLOCKS: [u32; 16] = [
    0, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 24576, 32768, 49152, 65536, 131072,
];

/// The first 16 bytes of the 64-byte SD Status register (ACMD13).
///
/// Bit numbers below are the register's bits 511..384 shifted down by 384.
#[derive(Default, Clone)]
pub struct SdStatus {
    /// The leading 16 bytes of the SD Status
    pub data: [u8; 16],
}

impl SdStatus {
    define_field!(dat_bus_width, u8, 127, 126);
    define_field!(secured_mode, bool, 125);
    define_field!(sd_card_type, u16, 111, 96);
    define_field!(size_of_protected_area, u32, 95, 64);
    define_field!(speed_class, u8, 63, 56);
    define_field!(performance_move, u8, 55, 48);
    define_field!(au_size, u8, 47, 44);
    define_field!(erase_size, u16, 39, 24);
    define_field!(erase_timeout, u8, 23, 18);
    define_field!(erase_offset, u8, 17, 16);

    /// The allocation unit in 512-byte blocks, or `None` if not defined.
    pub fn au_blocks(&self) -> Option<u32> {
        match AU_SIZE_BLOCKS[usize::from(self.au_size() & 0x0F)] {
            0 => None,
            blocks => Some(blocks),
        }
    }
}

/// Perform the 7-bit CRC used on the SD card
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Perform the X25 CRC calculation, as used for data blocks.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc = ((crc >> 8) & 0xFF) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
