//! The disk-I/O facade.
//!
//! A FAT filesystem drives its media through five calls: `init`, `status`,
//! `read`, `write` and `control`. Each takes the drive number it was
//! registered under. [`DiskIo`] is that contract, and [`SdCard`]
//! implements it.

use embedded_hal::delay::DelayNs;

use crate::blockdevice::{BLOCK_LEN, BLOCK_LEN_U32};
use crate::sdcard::{self, transport::Transport, ErrorKind, SdCard};

use crate::{debug, warn};

bitflags::bitflags! {
    /// Card state flags, as returned by [`DiskIo::init`] and
    /// [`DiskIo::status`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CardStatus: u8 {
        /// The card has not been identified
        const NOT_INITIALIZED = 0x01;
        /// No card in the slot
        const NO_MEDIA = 0x02;
        /// The card is write protected
        const WRITE_PROTECTED = 0x04;
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for CardStatus {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "CardStatus({=u8:#x})", self.bits())
    }
}

/// The failure codes of the disk-I/O contract. Success is `Ok(())`.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DiskError {
    /// A read or write failed on the bus or on the card
    Error = 1,
    /// The medium is write protected
    WriteProtected = 2,
    /// The card has not been initialised
    NotReady = 3,
    /// The drive, buffer, count or control code is invalid
    ParameterError = 4,
}

impl DiskError {
    /// The numeric result code.
    ///
    /// ```
    /// # use sdspi_disk::DiskError;
    /// assert_eq!(DiskError::NotReady.code(), 3);
    /// ```
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<sdcard::Error> for DiskError {
    fn from(error: sdcard::Error) -> DiskError {
        match error.kind() {
            ErrorKind::NotReady => DiskError::NotReady,
            ErrorKind::InvalidParameter => DiskError::ParameterError,
            _ => DiskError::Error,
        }
    }
}

/// The requests [`DiskIo::control`] understands.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    /// Flush any write cache
    Sync = 0,
    /// Number of 512-byte sectors on the card
    GetSectorCount = 1,
    /// Sector size in bytes
    GetSectorSize = 2,
    /// Erase block size in sectors
    GetBlockSize = 3,
    /// A range of sectors no longer holds data
    Trim = 4,
}

impl TryFrom<u8> for ControlCode {
    type Error = DiskError;

    fn try_from(code: u8) -> Result<ControlCode, DiskError> {
        match code {
            0 => Ok(ControlCode::Sync),
            1 => Ok(ControlCode::GetSectorCount),
            2 => Ok(ControlCode::GetSectorSize),
            3 => Ok(ControlCode::GetBlockSize),
            4 => Ok(ControlCode::Trim),
            _ => Err(DiskError::ParameterError),
        }
    }
}

/// The five-call contract between a filesystem and its media.
pub trait DiskIo {
    /// Bring the drive up. Returns the state flags afterwards; an empty
    /// set means the drive is ready.
    fn init(&self, drive: u8) -> CardStatus;

    /// The current state flags of the drive.
    fn status(&self, drive: u8) -> CardStatus;

    /// Read `count` sectors starting at `sector`. `buffer` holds at least
    /// `count * 512` bytes.
    fn read(&self, drive: u8, buffer: &mut [u8], sector: u32, count: u32) -> Result<(), DiskError>;

    /// Write `count` sectors starting at `sector`. `buffer` holds at least
    /// `count * 512` bytes.
    fn write(&self, drive: u8, buffer: &[u8], sector: u32, count: u32) -> Result<(), DiskError>;

    /// Miscellaneous requests, see [`ControlCode`]. Queries store their
    /// answer in `param`.
    fn control(&self, drive: u8, code: u8, param: &mut u32) -> Result<(), DiskError>;
}

impl<T, D> SdCard<T, D>
where
    T: Transport,
    D: DelayNs,
{
    fn check_drive(&self, drive: u8) -> Result<(), DiskError> {
        if drive == self.options().drive {
            Ok(())
        } else {
            warn!("No drive {}", drive);
            Err(DiskError::ParameterError)
        }
    }

    fn check_request(&self, drive: u8, buffer_len: usize, count: u32) -> Result<(), DiskError> {
        self.check_drive(drive)?;
        let needed = (count as usize).checked_mul(BLOCK_LEN);
        match needed {
            Some(needed) if count > 0 && buffer_len >= needed => Ok(()),
            _ => Err(DiskError::ParameterError),
        }
    }
}

impl<T, D> DiskIo for SdCard<T, D>
where
    T: Transport,
    D: DelayNs,
{
    fn init(&self, drive: u8) -> CardStatus {
        if self.check_drive(drive).is_err() {
            return CardStatus::NOT_INITIALIZED;
        }
        if let Err(_e) = self.acquire() {
            warn!("init failed: {:?}", _e);
        }
        self.card_status()
    }

    fn status(&self, drive: u8) -> CardStatus {
        if drive == self.options().drive {
            self.card_status()
        } else {
            CardStatus::NOT_INITIALIZED
        }
    }

    fn read(&self, drive: u8, buffer: &mut [u8], sector: u32, count: u32) -> Result<(), DiskError> {
        self.check_request(drive, buffer.len(), count)?;
        self.read_blocks(sector, count, buffer)?;
        Ok(())
    }

    fn write(&self, drive: u8, buffer: &[u8], sector: u32, count: u32) -> Result<(), DiskError> {
        self.check_request(drive, buffer.len(), count)?;
        let status = self.card_status();
        if status.contains(CardStatus::NOT_INITIALIZED) {
            return Err(DiskError::NotReady);
        }
        if status.contains(CardStatus::WRITE_PROTECTED) {
            return Err(DiskError::WriteProtected);
        }
        self.write_blocks(sector, count, buffer)?;
        Ok(())
    }

    fn control(&self, drive: u8, code: u8, param: &mut u32) -> Result<(), DiskError> {
        self.check_drive(drive)?;
        let code = ControlCode::try_from(code)?;
        debug!("control {:?}", code);
        match code {
            // Nothing is cached and erase hints are not passed on
            ControlCode::Sync | ControlCode::Trim => {}
            ControlCode::GetSectorSize => *param = BLOCK_LEN_U32,
            ControlCode::GetSectorCount => {
                *param = self.geometry().ok_or(DiskError::NotReady)?.sector_count;
            }
            ControlCode::GetBlockSize => {
                *param = self
                    .geometry()
                    .ok_or(DiskError::NotReady)?
                    .erase_unit_sectors;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sdcard::{Error, TimeoutKind};

    #[test]
    fn status_bits() {
        assert_eq!(CardStatus::NOT_INITIALIZED.bits(), 1);
        assert_eq!(CardStatus::NO_MEDIA.bits(), 2);
        assert_eq!(CardStatus::WRITE_PROTECTED.bits(), 4);
        assert_eq!(
            (CardStatus::NOT_INITIALIZED | CardStatus::WRITE_PROTECTED).bits(),
            5
        );
    }

    #[test]
    fn result_codes() {
        assert_eq!(DiskError::Error.code(), 1);
        assert_eq!(DiskError::WriteProtected.code(), 2);
        assert_eq!(DiskError::NotReady.code(), 3);
        assert_eq!(DiskError::ParameterError.code(), 4);
    }

    #[test]
    fn driver_errors_to_result_codes() {
        assert_eq!(DiskError::from(Error::NotReady), DiskError::NotReady);
        assert_eq!(DiskError::from(Error::BufferTooSmall), DiskError::ParameterError);
        assert_eq!(DiskError::from(Error::AddressOutOfRange), DiskError::ParameterError);
        assert_eq!(DiskError::from(Error::Transport), DiskError::Error);
        assert_eq!(DiskError::from(Error::WriteRejected(0x0D)), DiskError::Error);
        assert_eq!(
            DiskError::from(Error::Timeout(TimeoutKind::Busy)),
            DiskError::Error
        );
        assert_eq!(DiskError::from(Error::CrcError(0, 1)), DiskError::Error);
    }

    #[test]
    fn control_codes() {
        assert_eq!(ControlCode::try_from(0), Ok(ControlCode::Sync));
        assert_eq!(ControlCode::try_from(1), Ok(ControlCode::GetSectorCount));
        assert_eq!(ControlCode::try_from(2), Ok(ControlCode::GetSectorSize));
        assert_eq!(ControlCode::try_from(3), Ok(ControlCode::GetBlockSize));
        assert_eq!(ControlCode::try_from(4), Ok(ControlCode::Trim));
        for code in 5..=u8::MAX {
            assert_eq!(ControlCode::try_from(code), Err(DiskError::ParameterError));
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
