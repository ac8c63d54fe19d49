//! Bit-field access for SD/MMC card registers.
//!
//! Card registers (CSD, CID, the first 16 bytes of the SD Status) arrive
//! most-significant byte first, and the SD specifications number their bits
//! from 127 (first bit on the wire) down to 0. A field is named by its
//! inclusive `[msb:lsb]` range in that numbering.

/// Extract the unsigned integer held in bits `[msb:lsb]` of a 16-byte
/// register buffer stored in wire order.
///
/// Bit `n` lives in byte `15 - n / 8`. The covered bytes are concatenated
/// most-significant first, shifted right by `lsb % 8` and masked to
/// `msb - lsb + 1` bits. Fields may be at most 32 bits wide.
///
/// ```
/// # use sdspi_disk::extract_bits;
/// let mut register = [0u8; 16];
/// register[0] = 0x40;
/// assert_eq!(extract_bits(&register, 127, 126), 0b01);
/// ```
pub fn extract_bits(register: &[u8; 16], msb: u32, lsb: u32) -> u32 {
    debug_assert!(msb < 128 && lsb <= msb && msb - lsb < 32);
    let first = 15 - (msb / 8) as usize;
    let last = 15 - (lsb / 8) as usize;
    let mut acc = 0u64;
    for &byte in &register[first..=last] {
        acc = (acc << 8) | u64::from(byte);
    }
    acc >>= lsb % 8;
    let width = msb - lsb + 1;
    (acc & ((1u64 << width) - 1)) as u32
}

macro_rules! define_field {
    ($name:ident, bool, $bit:expr) => {
        /// Get the value from the $name field
        pub fn $name(&self) -> bool {
            $crate::structure::extract_bits(&self.data, $bit, $bit) != 0
        }
    };
    ($name:ident, $type:ty, $msb:expr, $lsb:expr) => {
        /// Get the value from the $name field
        pub fn $name(&self) -> $type {
            $crate::structure::extract_bits(&self.data, $msb, $lsb) as $type
        }
    };
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
