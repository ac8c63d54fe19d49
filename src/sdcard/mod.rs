//! Implements the SD/MMC Protocol over SPI, on top of a [`Transport`].
//!
//! This is currently optimised for readability and debugability, not
//! performance.
//!
//! [`Transport`]: transport::Transport

pub mod proto;
pub mod transport;

use byteorder::{BigEndian, ByteOrder};
use core::cell::RefCell;
use embedded_hal::delay::DelayNs;
use proto::*;
use transport::{Chunks, ClockProfile, Exchange, Transport, TransportError};

use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx, BLOCK_LEN, BLOCK_LEN_U32};
use crate::diskio::CardStatus;

// ****************************************************************************
// Imports
// ****************************************************************************

use crate::{debug, trace, warn};

// ****************************************************************************
// Types and Implementations
// ****************************************************************************

/// Driver for an SD or MMC Card on an SPI bus.
///
/// Built from a [`Transport`] and something that can sleep for a number of
/// microseconds.
///
/// The card is not touched until [`SdCard::acquire`] (or the disk-I/O
/// `init`) is called. Reads and writes on a card that has not been
/// identified fail with [`Error::NotReady`]; there is no implicit
/// identification.
///
/// All the APIs take `&self` - mutability is handled using an inner `RefCell`.
pub struct SdCard<T, D>
where
    T: Transport,
    D: DelayNs,
{
    inner: RefCell<SdCardInner<T, D>>,
}

impl<T, D> SdCard<T, D>
where
    T: Transport,
    D: DelayNs,
{
    /// Create a new SD/MMC Card driver on the given transport.
    ///
    /// Uses the default options.
    pub fn new(transport: T, delayer: D) -> SdCard<T, D> {
        Self::new_with_options(transport, delayer, AcquireOpts::default())
    }

    /// Create a new SD/MMC Card driver on the given transport, with the
    /// given options.
    pub fn new_with_options(transport: T, delayer: D, options: AcquireOpts) -> SdCard<T, D> {
        SdCard {
            inner: RefCell::new(SdCardInner {
                transport,
                delayer,
                options,
                variant: CardVariant::Unknown,
                geometry: CardGeometry::default(),
                status: CardStatus::NOT_INITIALIZED,
            }),
        }
    }

    /// Get a temporary borrow on the underlying transport.
    ///
    /// The given closure will be called exactly once, and will be passed a
    /// mutable reference to the transport.
    pub fn transport<R, F>(&self, func: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut inner = self.inner.borrow_mut();
        func(&mut inner.transport)
    }

    /// The options this driver was built with.
    pub fn options(&self) -> AcquireOpts {
        self.inner.borrow().options.clone()
    }

    /// Identify the card and bring it into the data-transfer state.
    ///
    /// Does nothing if the card is already identified. On failure the card
    /// is left [`CardVariant::Unknown`] and not initialised.
    pub fn acquire(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.acquire()
    }

    /// Forget everything known about the card.
    ///
    /// The next [`SdCard::acquire`] runs the full identification again.
    pub fn deinit(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.reset();
    }

    /// The variant found by the last identification.
    pub fn card_variant(&self) -> CardVariant {
        self.inner.borrow().variant
    }

    /// The geometry found by the last identification, if the card is
    /// initialised.
    pub fn geometry(&self) -> Option<CardGeometry> {
        let inner = self.inner.borrow();
        inner.is_initialized().then_some(inner.geometry)
    }

    /// The card state flags.
    pub fn card_status(&self) -> CardStatus {
        self.inner.borrow().status
    }

    /// Record the position of a write-protect switch, for boards that have
    /// one. Writes through the disk-I/O facade are refused while it is set.
    pub fn set_write_protected(&self, protected: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.status.set(CardStatus::WRITE_PROTECTED, protected);
    }

    /// Return the usable size of this card in bytes.
    pub fn num_bytes(&self) -> Result<u64, Error> {
        let inner = self.inner.borrow();
        inner.check_init()?;
        Ok(BlockCount(inner.geometry.sector_count).into_bytes())
    }

    /// Send one command with chip-select held around it, and return the
    /// response.
    ///
    /// A card that does not answer in time gives a response whose
    /// [`Response::is_timeout`] is true; only a transport failure is an
    /// `Err`.
    pub fn send_command(&self, index: u8, arg: u32, kind: ResponseKind) -> Result<Response, Error> {
        let mut inner = self.inner.borrow_mut();
        let clock = inner.clock_profile();
        inner.session(clock, |s| s.send_command(index, arg, kind, true))
    }

    /// Read one of the card's registers.
    ///
    /// For [`RegisterKind::Status`] only the first 16 of the 64 bytes are
    /// returned.
    pub fn read_register(&self, kind: RegisterKind) -> Result<[u8; 16], Error> {
        let mut inner = self.inner.borrow_mut();
        inner.check_init()?;
        inner.session(ClockProfile::Normal, |s| s.read_register(kind))
    }

    /// Read the Card Identification register.
    pub fn read_cid(&self) -> Result<[u8; 16], Error> {
        self.read_register(RegisterKind::Cid)
    }

    /// Read `count` blocks starting at sector `start` into `dest`.
    ///
    /// `dest` must hold at least `count * 512` bytes.
    pub fn read_blocks(&self, start: u32, count: u32, dest: &mut [u8]) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        debug!("Read {} blocks @ {}", count, start);
        let address = inner.native_address(start)?;
        let dest = dest
            .get_mut(..buffer_len(count)?)
            .ok_or(Error::BufferTooSmall)?;
        inner.session(ClockProfile::Normal, |s| {
            s.read_blocks(address, dest.chunks_exact_mut(BLOCK_LEN))
        })
    }

    /// Write `count` blocks from `src` starting at sector `start`.
    ///
    /// `src` must hold at least `count * 512` bytes.
    pub fn write_blocks(&self, start: u32, count: u32, src: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        debug!("Writing {} blocks @ {}", count, start);
        let address = inner.native_address(start)?;
        let src = src.get(..buffer_len(count)?).ok_or(Error::BufferTooSmall)?;
        let variant = inner.variant;
        inner.session(ClockProfile::Normal, |s| {
            s.write_blocks(variant, address, src.chunks_exact(BLOCK_LEN))
        })
    }
}

impl<T, D> BlockDevice for SdCard<T, D>
where
    T: Transport,
    D: DelayNs,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();
        debug!("Read {} blocks @ {}", blocks.len(), start_block_idx.0);
        let address = inner.native_address(start_block_idx.0)?;
        inner.session(ClockProfile::Normal, |s| {
            s.read_blocks(address, blocks.iter_mut().map(|b| &mut b.contents[..]))
        })
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();
        debug!("Writing {} blocks @ {}", blocks.len(), start_block_idx.0);
        let address = inner.native_address(start_block_idx.0)?;
        let variant = inner.variant;
        inner.session(ClockProfile::Normal, |s| {
            s.write_blocks(variant, address, blocks.iter().map(|b| &b.contents[..]))
        })
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        let inner = self.inner.borrow();
        inner.check_init()?;
        Ok(BlockCount(inner.geometry.sector_count))
    }
}

/// Bytes needed to hold `count` blocks.
fn buffer_len(count: u32) -> Result<usize, Error> {
    (count as usize)
        .checked_mul(BLOCK_LEN)
        .ok_or(Error::BufferTooSmall)
}

/// Inner details for the SD Card driver.
///
/// All the APIs required `&mut self`.
struct SdCardInner<T, D>
where
    T: Transport,
    D: DelayNs,
{
    transport: T,
    delayer: D,
    options: AcquireOpts,
    variant: CardVariant,
    geometry: CardGeometry,
    status: CardStatus,
}

impl<T, D> SdCardInner<T, D>
where
    T: Transport,
    D: DelayNs,
{
    fn is_initialized(&self) -> bool {
        !self.status.contains(CardStatus::NOT_INITIALIZED)
    }

    /// Fail with [`Error::NotReady`] unless the card has been identified.
    fn check_init(&self) -> Result<(), Error> {
        if !self.is_initialized() {
            warn!("Card not initialised");
            Err(Error::NotReady)
        } else {
            Ok(())
        }
    }

    fn clock_profile(&self) -> ClockProfile {
        if self.is_initialized() {
            ClockProfile::Normal
        } else {
            ClockProfile::CardDetect
        }
    }

    /// Translate a sector number into the card's own addressing unit.
    fn native_address(&self, sector: u32) -> Result<u32, Error> {
        self.check_init()?;
        if self.variant.is_block_addressed() {
            Ok(sector)
        } else {
            sector
                .checked_mul(BLOCK_LEN_U32)
                .ok_or(Error::AddressOutOfRange)
        }
    }

    fn reset(&mut self) {
        self.variant = CardVariant::Unknown;
        self.geometry = CardGeometry::default();
        self.status.insert(CardStatus::NOT_INITIALIZED);
    }

    /// Initializes the card into a known state (or at least tries to).
    fn acquire(&mut self) -> Result<(), Error> {
        if self.is_initialized() {
            return Ok(());
        }
        debug!("acquiring card with opts: {:?}", self.options);
        let result = self.session(ClockProfile::CardDetect, |s| {
            let identity = s.identify()?;
            s.set_clock(ClockProfile::Normal)?;
            Ok(identity)
        });
        match result {
            Ok((variant, geometry)) => {
                debug!("Card version: {:?}, {:?}", variant, geometry);
                self.variant = variant;
                self.geometry = geometry;
                self.status.remove(CardStatus::NOT_INITIALIZED);
                Ok(())
            }
            Err(e) => {
                warn!("Identification failed: {:?}", e);
                self.reset();
                Err(e)
            }
        }
    }

    /// Run `func` as one bus transaction.
    ///
    /// The bus lock is held throughout. Whatever `func` returns,
    /// chip-select is released and the transport is back in transmit mode
    /// afterwards.
    fn session<R, F>(&mut self, clock: ClockProfile, func: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Session<'_, T, D>) -> Result<R, Error>,
    {
        let SdCardInner {
            transport,
            delayer,
            options,
            ..
        } = self;
        transport.with_bus(|transport| {
            let mut session = Session {
                transport,
                delayer,
                options,
                clock: None,
                selected: false,
                receiving: false,
                activation: None,
            };
            let result = match session.set_clock(clock) {
                Ok(()) => func(&mut session),
                Err(e) => Err(e),
            };
            let released = session.release();
            let value = result?;
            released?;
            Ok(value)
        })
    }
}

/// One bus transaction with the card.
///
/// Holds the transport for as long as the bus lock is held, and tracks the
/// select, mode and clock state so it can all be put back afterwards.
struct Session<'a, T, D> {
    transport: &'a mut T,
    delayer: &'a mut D,
    options: &'a AcquireOpts,
    clock: Option<ClockProfile>,
    selected: bool,
    receiving: bool,
    /// Polling budget shared by everything inside an activation loop
    activation: Option<Delay>,
}

impl<T, D> Session<'_, T, D>
where
    T: Transport,
    D: DelayNs,
{
    // ========================================================================
    // Identification
    // ========================================================================

    /// Run the identification handshake and decode the card geometry.
    fn identify(&mut self) -> Result<(CardVariant, CardGeometry), Error> {
        trace!("Reset card..");
        // At least 74 clocks with the card deselected puts it in SPI mode
        self.deselect()?;
        self.send(&[IDLE_BYTE; 10])?;

        self.send_command(CMD0, 0, ResponseKind::R1, true)?
            .expect(R1_IDLE_STATE)?;

        debug!("Enable CRC: {}", self.options.use_crc);
        if self.options.use_crc
            && self.send_command(CMD59, 1, ResponseKind::R1, true)?.r1 != R1_IDLE_STATE
        {
            return Err(Error::CantEnableCrc);
        }

        let r7 = self.send_command(CMD8, IF_COND_CHECK, ResponseKind::R7, true)?;
        let variant = if r7.r1 == R1_IDLE_STATE && (r7.value() & 0xFFF) == IF_COND_CHECK {
            self.activate_v2()?
        } else {
            trace!("CMD8 gave {:?}, trying legacy cards", r7);
            self.activate_legacy()?
        };
        trace!("Card variant {:?}", variant);

        if !variant.is_block_addressed() {
            let response = self.send_command(CMD16, BLOCK_LEN_U32, ResponseKind::R1, true)?;
            if let Err(e) = response.expect(R1_READY_STATE) {
                warn!("Card refused 512 byte blocks, demoting to Unknown");
                return Err(e);
            }
        }

        let geometry = self.read_geometry(variant)?;
        Ok((variant, geometry))
    }

    /// SD v2: `ACMD41` with high capacity support until ready, then the OCR
    /// says how the card is addressed.
    fn activate_v2(&mut self) -> Result<CardVariant, Error> {
        self.activate(ACMD41, ACMD41_HCS, true)?
            .expect(R1_READY_STATE)?;
        let ocr = self
            .send_command(CMD58, 0, ResponseKind::R3, true)?
            .expect(R1_READY_STATE)?
            .value();
        if ocr & OCR_CCS != 0 {
            Ok(CardVariant::SdV2Block)
        } else {
            Ok(CardVariant::SdV2Byte)
        }
    }

    /// Cards that did not understand `CMD8`: SD v1 answers `ACMD41`, MMC
    /// only answers `CMD1`.
    fn activate_legacy(&mut self) -> Result<CardVariant, Error> {
        match self.activate(ACMD41, 0, true) {
            Ok(response) if response.r1 == R1_READY_STATE => return Ok(CardVariant::SdV1),
            Ok(_response) => {
                trace!("ACMD41 refused: {:?}", _response);
            }
            Err(Error::Timeout(_)) => {
                trace!("ACMD41 never left idle");
            }
            Err(e) => return Err(e),
        }
        match self.activate(CMD1, 0, false) {
            Ok(response) if response.r1 == R1_READY_STATE => Ok(CardVariant::MmcV3),
            Ok(_) | Err(Error::Timeout(_)) => {
                warn!("Card refused every activation command");
                Err(Error::UnsupportedCard)
            }
            Err(e) => Err(e),
        }
    }

    /// Repeat an activation command while the card stays idle.
    ///
    /// Returns the first response that is not idle (ready or an error), or a
    /// timeout error if the card stays idle for too long or stops answering.
    /// Every poll inside the loop draws on one `timeout_ms` budget.
    fn activate(&mut self, index: u8, arg: u32, app: bool) -> Result<Response, Error> {
        self.activation = Some(Delay::new(self.options));
        let result = self.activation_attempts(index, arg, app);
        self.activation = None;
        result
    }

    fn activation_attempts(&mut self, index: u8, arg: u32, app: bool) -> Result<Response, Error> {
        let timeout = Error::Timeout(TimeoutKind::Command(index));
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            trace!("Activate with CMD{}, attempt: {}..", index, attempts);
            let response = if app {
                self.send_app_command(index, arg, ResponseKind::R1, true)?
            } else {
                self.send_command(index, arg, ResponseKind::R1, true)?
            };
            if response.is_timeout() {
                warn!("No answer to CMD{} after {} attempts", index, attempts);
                return Err(timeout);
            }
            if response.r1 != R1_IDLE_STATE {
                return Ok(response);
            }
            if let Some(budget) = self.activation.as_mut() {
                budget.delay(&mut *self.delayer, timeout)?;
            }
        }
    }

    /// Decode capacity and erase unit from the CSD (and, for version 2 CSDs,
    /// the SD Status register).
    fn read_geometry(&mut self, variant: CardVariant) -> Result<CardGeometry, Error> {
        let raw = self.read_register(RegisterKind::Csd)?;
        // MMC CSD_STRUCTURE values all share the version 1 capacity layout
        let csd = if variant == CardVariant::MmcV3 {
            Some(Csd::V1(CsdV1 { data: raw }))
        } else {
            Csd::parse(raw)
        };
        let geometry = match csd {
            Some(Csd::V1(csd)) => {
                debug!("CSD: {:?}", csd);
                CardGeometry {
                    sector_count: csd.card_capacity_blocks(),
                    erase_unit_sectors: csd.erase_unit_blocks(),
                }
            }
            Some(Csd::V2(csd)) => {
                debug!("CSD: {:?}", csd);
                let Some(sector_count) = csd.card_capacity_blocks() else {
                    warn!("CSD capacity does not fit in 32-bit sectors");
                    return Err(Error::UnsupportedCard);
                };
                let status = SdStatus {
                    data: self.read_register(RegisterKind::Status)?,
                };
                let erase_unit_sectors = match status.au_blocks() {
                    Some(blocks) => blocks,
                    None => csd.erase_unit_blocks(),
                };
                CardGeometry {
                    sector_count,
                    erase_unit_sectors,
                }
            }
            None => {
                warn!(
                    "Unknown CSD structure {}",
                    crate::structure::extract_bits(&raw, 127, 126)
                );
                return Err(Error::UnsupportedCard);
            }
        };
        Ok(geometry)
    }

    // ========================================================================
    // Registers and blocks
    // ========================================================================

    /// Read a register, with select held for the whole exchange.
    fn read_register(&mut self, kind: RegisterKind) -> Result<[u8; 16], Error> {
        self.with_select(true, |s| {
            let response = match kind {
                RegisterKind::Csd => s.command(CMD9, 0, ResponseKind::R1)?,
                RegisterKind::Cid => s.command(CMD10, 0, ResponseKind::R1)?,
                RegisterKind::Status => s.app_command(ACMD13, 0, ResponseKind::R2)?,
            };
            response.expect(R1_READY_STATE)?;
            let mut buffer = [0u8; SD_STATUS_LEN];
            s.read_data(&mut buffer[..kind.len()])?;
            let mut register = [0u8; 16];
            register.copy_from_slice(&buffer[..16]);
            Ok(register)
        })
    }

    /// Read blocks from a native card address, one 512 byte slice per block.
    fn read_blocks<'b, I>(&mut self, address: u32, mut blocks: I) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = &'b mut [u8]>,
    {
        let count = blocks.len();
        if count == 0 {
            return Ok(());
        }
        self.with_select(true, |s| {
            if count == 1 {
                // Start a single-block read
                s.command(CMD17, address, ResponseKind::R1)?
                    .expect(R1_READY_STATE)?;
                blocks.try_for_each(|block| s.read_data(block))
            } else {
                // Start a multi-block read
                s.command(CMD18, address, ResponseKind::R1)?
                    .expect(R1_READY_STATE)?;
                let result = blocks.try_for_each(|block| s.read_data(block));
                // Stop the read, even if a block failed
                let stop = s.command(CMD12, 0, ResponseKind::R1b);
                result?;
                if stop?.is_timeout() {
                    return Err(Error::Timeout(TimeoutKind::Command(CMD12)));
                }
                Ok(())
            }
        })
    }

    /// Write blocks to a native card address, one 512 byte slice per block.
    ///
    /// Stops at the first block the card does not accept.
    fn write_blocks<'b, I>(&mut self, variant: CardVariant, address: u32, blocks: I) -> Result<(), Error>
    where
        I: ExactSizeIterator<Item = &'b [u8]>,
    {
        let count = blocks.len();
        if count == 0 {
            return Ok(());
        }
        self.with_select(true, |s| {
            let token = if count == 1 {
                // Start a single-block write
                s.command(CMD24, address, ResponseKind::R1)?
                    .expect(R1_READY_STATE)?;
                DATA_START_BLOCK
            } else {
                if variant != CardVariant::MmcV3 {
                    // Pre-erase hint
                    s.app_command(ACMD23, count as u32, ResponseKind::R1)?
                        .expect(R1_READY_STATE)?;
                }
                // Start a multi-block write
                s.command(CMD25, address, ResponseKind::R1)?
                    .expect(R1_READY_STATE)?;
                WRITE_MULTIPLE_TOKEN
            };
            for (_idx, block) in blocks.enumerate() {
                if let Err(e) = s.write_data(token, block) {
                    warn!("Write failed on block {} of {}: {:?}", _idx + 1, count, e);
                    return Err(e);
                }
            }
            if count > 1 {
                // Stop the write
                s.send(&[STOP_TRAN_TOKEN])?;
                // The card only goes busy after one more byte
                let _stuff = s.read_byte()?;
                s.wait_not_busy()?;
            }
            Ok(())
        })
    }

    /// Read a data block: wait for the start token, fill `buffer`, then
    /// take the CRC.
    fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let token = self.poll(TimeoutKind::ReadToken, |b| b != IDLE_BYTE)?;
        if token != DATA_START_BLOCK {
            warn!("Unexpected token {:#04x}", token);
            return Err(Error::UnexpectedToken(token));
        }

        self.receive(buffer)?;

        // These two bytes are always sent. They are either a valid CRC, or
        // junk, depending on whether CRC mode was enabled.
        let mut crc_bytes = [IDLE_BYTE; 2];
        self.receive(&mut crc_bytes)?;
        if self.options.use_crc {
            let crc = u16::from_be_bytes(crc_bytes);
            let calc_crc = crc16(buffer);
            if crc != calc_crc {
                return Err(Error::CrcError(crc, calc_crc));
            }
        }
        Ok(())
    }

    /// Write a data block and check the card took it.
    fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        self.send(&[token])?;
        self.send(buffer)?;
        let crc_bytes = if self.options.use_crc {
            crc16(buffer).to_be_bytes()
        } else {
            [0x00, 0x00]
        };
        self.send(&crc_bytes)?;

        let status = self.read_byte()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            return Err(Error::WriteRejected(status));
        }
        self.wait_not_busy()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Send a command, optionally wrapped in its own chip-select.
    fn send_command(
        &mut self,
        index: u8,
        arg: u32,
        kind: ResponseKind,
        manage_select: bool,
    ) -> Result<Response, Error> {
        self.with_select(manage_select, |s| s.command(index, arg, kind))
    }

    /// Send `CMD55` and an application-specific command, optionally wrapped
    /// in its own chip-select.
    fn send_app_command(
        &mut self,
        index: u8,
        arg: u32,
        kind: ResponseKind,
        manage_select: bool,
    ) -> Result<Response, Error> {
        self.with_select(manage_select, |s| s.app_command(index, arg, kind))
    }

    /// Perform an application-specific command.
    ///
    /// If the card does not accept `CMD55`, its response is returned under
    /// the application command's index.
    fn app_command(&mut self, index: u8, arg: u32, kind: ResponseKind) -> Result<Response, Error> {
        let prefix = self.command(CMD55, 0, ResponseKind::R1)?;
        if prefix.r1 > R1_IDLE_STATE {
            return Ok(Response {
                command: index,
                ..prefix
            });
        }
        self.command(index, arg, kind)
    }

    /// Perform a command.
    ///
    /// The caller holds select. A card that stays silent gives the
    /// [`R1_INVALID`] sentinel rather than an error.
    fn command(&mut self, index: u8, arg: u32, kind: ResponseKind) -> Result<Response, Error> {
        if index != CMD0 && index != CMD12 {
            match self.poll(TimeoutKind::Command(index), |b| b == IDLE_BYTE) {
                Ok(_) => {}
                Err(Error::Timeout(_)) => {
                    warn!("Card busy before CMD{}", index);
                    return Ok(Response::timed_out(index));
                }
                Err(e) => return Err(e),
            }
        }

        let frame = command_frame(index, arg, self.options.use_crc);
        self.transmit_mode()?;
        self.transport
            .exchange(Exchange::command(frame[0], arg, &frame[5..]))?;

        // skip stuff byte for stop read
        if index == CMD12 {
            let _stuff = self.read_byte()?;
        }

        let r1 = match self.poll(TimeoutKind::Command(index), |b| (b & R1_INVALID) == 0) {
            Ok(r1) => r1,
            Err(Error::Timeout(_)) => {
                warn!("Timeout on CMD{}", index);
                return Ok(Response::timed_out(index));
            }
            Err(e) => return Err(e),
        };
        let mut response = Response {
            command: index,
            r1,
            payload: [0; 4],
        };
        self.receive(&mut response.payload[..kind.payload_len()])?;
        trace!("CMD{} {:#010x} -> {:?}", index, arg, response);

        if kind == ResponseKind::R1b {
            match self.wait_not_busy() {
                Ok(()) => {}
                Err(Error::Timeout(_)) => return Ok(Response::timed_out(index)),
                Err(e) => return Err(e),
            }
        }
        Ok(response)
    }

    // ========================================================================
    // Bus primitives
    // ========================================================================

    /// Run `func`, with chip-select asserted around it if `manage` is set.
    fn with_select<R, F>(&mut self, manage: bool, func: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Self) -> Result<R, Error>,
    {
        if !manage {
            return func(self);
        }
        self.select()?;
        let result = func(self);
        let released = self.deselect();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Spin until the card stops holding the data line low, at the polling
    /// clock.
    fn wait_not_busy(&mut self) -> Result<(), Error> {
        let previous = self.clock;
        self.set_clock(ClockProfile::Polling)?;
        let result = self.poll(TimeoutKind::Busy, |b| b != 0x00);
        if let Some(profile) = previous {
            self.set_clock(profile)?;
        }
        if result.is_err() {
            warn!("Card stayed busy");
        }
        result.map(drop)
    }

    /// Clock in bytes until one satisfies `accept`, or the polling budget
    /// runs out. Inside an activation loop the shared budget is used.
    fn poll<F>(&mut self, timeout: TimeoutKind, mut accept: F) -> Result<u8, Error>
    where
        F: FnMut(u8) -> bool,
    {
        let mut own = Delay::new(self.options);
        loop {
            let byte = self.read_byte()?;
            if accept(byte) {
                return Ok(byte);
            }
            let budget = self.activation.as_mut().unwrap_or(&mut own);
            budget.delay(&mut *self.delayer, Error::Timeout(timeout))?;
        }
    }

    /// Receive a byte with the data-in line held high.
    fn read_byte(&mut self) -> Result<u8, Error> {
        let mut byte = [IDLE_BYTE];
        self.receive(&mut byte)?;
        Ok(byte[0])
    }

    /// Send bytes, split into transport-sized pieces.
    fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.transmit_mode()?;
        for (offset, len) in Chunks::for_slice(data) {
            self.transport
                .exchange(Exchange::write(&data[offset..offset + len]))?;
        }
        Ok(())
    }

    /// Receive bytes, split into transport-sized pieces.
    fn receive(&mut self, data: &mut [u8]) -> Result<(), Error> {
        self.receive_mode()?;
        for (offset, len) in Chunks::for_slice(data) {
            self.transport
                .exchange(Exchange::read(&mut data[offset..offset + len]))?;
        }
        Ok(())
    }

    fn select(&mut self) -> Result<(), Error> {
        self.transport.select()?;
        self.selected = true;
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), Error> {
        self.selected = false;
        self.transport.deselect()?;
        Ok(())
    }

    fn receive_mode(&mut self) -> Result<(), Error> {
        if !self.receiving {
            self.transport.receive_mode()?;
            self.receiving = true;
        }
        Ok(())
    }

    fn transmit_mode(&mut self) -> Result<(), Error> {
        if self.receiving {
            self.transport.transmit_mode()?;
            self.receiving = false;
        }
        Ok(())
    }

    fn set_clock(&mut self, profile: ClockProfile) -> Result<(), Error> {
        if self.clock != Some(profile) {
            self.transport.set_clock(profile)?;
            self.clock = Some(profile);
        }
        Ok(())
    }

    /// Put select and mode back the way a new session expects them.
    fn release(&mut self) -> Result<(), Error> {
        let deselected = if self.selected {
            self.deselect()
        } else {
            Ok(())
        };
        let transmitting = self.transmit_mode();
        deselected?;
        transmitting
    }
}

/// Options for acquiring the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOpts {
    /// Set to true to enable CRC checking on commands and data blocks.
    ///
    /// When false, commands carry a fixed CRC byte (only valid for `CMD0`
    /// and `CMD8`), written blocks carry a zero CRC and received CRCs are
    /// ignored. Off by default.
    pub use_crc: bool,

    /// The bound on every polling loop, in milliseconds. Defaults to 500.
    pub timeout_ms: u32,

    /// How long to wait between two polls, in microseconds. Defaults to 10.
    pub poll_interval_us: u32,

    /// The disk-I/O unit number this card answers to. Defaults to 0.
    pub drive: u8,
}

impl Default for AcquireOpts {
    fn default() -> Self {
        AcquireOpts {
            use_crc: false,
            timeout_ms: 500,
            poll_interval_us: 10,
            drive: 0,
        }
    }
}

/// Which polling loop ran out of time.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No response to this command
    Command(u8),
    /// No data start token
    ReadToken,
    /// The card stayed busy
    Busy,
}

/// The possible errors this crate can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the transport
    Transport,
    /// A polling loop ran out of time
    Timeout(TimeoutKind),
    /// A command got a response other than the one the sequence needs
    UnexpectedResponse {
        /// The command index
        command: u8,
        /// The R1 byte the card sent
        r1: u8,
    },
    /// Something other than a data start token arrived before a data block
    UnexpectedToken(u8),
    /// The card did not accept a written block (the data-response token)
    WriteRejected(u8),
    /// The card did not complete identification as any known variant
    UnsupportedCard,
    /// The card has not been identified
    NotReady,
    /// We got a CRC mismatch (card gave us, we calculated)
    CrcError(u16, u16),
    /// We failed to enable CRC checking on the SD card
    CantEnableCrc,
    /// The buffer is shorter than the blocks asked for
    BufferTooSmall,
    /// The sector can not be expressed as a byte address on this card
    AddressOutOfRange,
}

/// The broad classes of [`Error`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No response within the bound
    Timeout,
    /// Unexpected token or response value
    ProtocolMismatch,
    /// Identification exhausted every card variant
    UnsupportedCard,
    /// Operation attempted before identification
    NotReady,
    /// CRC mismatch
    DataError,
    /// The transport failed
    Transport,
    /// The caller passed a bad buffer or address
    InvalidParameter,
}

impl Error {
    /// Which broad class this error falls into.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport => ErrorKind::Transport,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::UnexpectedResponse { .. }
            | Error::UnexpectedToken(_)
            | Error::WriteRejected(_)
            | Error::CantEnableCrc => ErrorKind::ProtocolMismatch,
            Error::UnsupportedCard => ErrorKind::UnsupportedCard,
            Error::NotReady => ErrorKind::NotReady,
            Error::CrcError(_, _) => ErrorKind::DataError,
            Error::BufferTooSmall | Error::AddressOutOfRange => ErrorKind::InvalidParameter,
        }
    }
}

impl From<TransportError> for Error {
    fn from(_error: TransportError) -> Error {
        Error::Transport
    }
}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        match Error::kind(self) {
            ErrorKind::Timeout => embedded_io::ErrorKind::TimedOut,
            ErrorKind::ProtocolMismatch | ErrorKind::DataError => embedded_io::ErrorKind::InvalidData,
            ErrorKind::UnsupportedCard => embedded_io::ErrorKind::Unsupported,
            ErrorKind::NotReady => embedded_io::ErrorKind::NotConnected,
            ErrorKind::InvalidParameter => embedded_io::ErrorKind::InvalidInput,
            ErrorKind::Transport => embedded_io::ErrorKind::Other,
        }
    }
}

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardVariant {
    /// A high-capacity SD v2 card ('SDHC'/'SDXC').
    ///
    /// Uses block-addressing.
    SdV2Block,
    /// A standard-capacity SD v2 card.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SdV2Byte,
    /// A standard-capacity SD Card supporting v1.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SdV1,
    /// An MMC v3 card. Uses byte-addressing.
    MmcV3,
    /// Not identified, or identification failed.
    Unknown,
}

impl CardVariant {
    /// Does this card take sector numbers (rather than byte offsets) as
    /// data addresses?
    pub fn is_block_addressed(self) -> bool {
        self == CardVariant::SdV2Block
    }
}

/// Size information decoded during identification.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CardGeometry {
    /// Capacity in 512-byte sectors
    pub sector_count: u32,
    /// Erase-block granularity in 512-byte sectors
    pub erase_unit_sectors: u32,
}

/// The registers [`SdCard::read_register`] can fetch.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterKind {
    /// Card Specific Data (`CMD9`)
    Csd,
    /// Card Identification (`CMD10`)
    Cid,
    /// SD Status (`ACMD13`)
    Status,
}

impl RegisterKind {
    /// Bytes the card sends for this register.
    fn len(self) -> usize {
        match self {
            RegisterKind::Csd | RegisterKind::Cid => 16,
            RegisterKind::Status => SD_STATUS_LEN,
        }
    }
}

/// The response shapes a command can have.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// One byte
    R1,
    /// One byte, then the card may hold the line low while busy
    R1b,
    /// Two bytes
    R2,
    /// Five bytes: R1 then the OCR
    R3,
    /// Five bytes: R1 then the interface condition echo
    R7,
}

impl ResponseKind {
    /// Bytes following the R1 byte.
    pub fn payload_len(self) -> usize {
        match self {
            ResponseKind::R1 | ResponseKind::R1b => 0,
            ResponseKind::R2 => 1,
            ResponseKind::R3 | ResponseKind::R7 => 4,
        }
    }
}

/// What a card sent back for one command.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Response {
    /// The command this answers
    pub command: u8,
    /// The R1 byte, or [`R1_INVALID`] if the card never answered
    pub r1: u8,
    /// Bytes after R1: one for R2, four (big-endian) for R3 and R7
    pub payload: [u8; 4],
}

impl Response {
    fn timed_out(command: u8) -> Response {
        Response {
            command,
            r1: R1_INVALID,
            payload: [0; 4],
        }
    }

    /// True if the card did not answer in time.
    pub fn is_timeout(&self) -> bool {
        self.r1 == R1_INVALID
    }

    /// The four payload bytes of an R3 or R7 response.
    pub fn value(&self) -> u32 {
        BigEndian::read_u32(&self.payload)
    }

    /// Turn anything but `r1` into an error.
    pub fn expect(self, r1: u8) -> Result<Response, Error> {
        if self.is_timeout() {
            Err(Error::Timeout(TimeoutKind::Command(self.command)))
        } else if self.r1 != r1 {
            warn!("CMD{} got {:#04x}", self.command, self.r1);
            Err(Error::UnexpectedResponse {
                command: self.command,
                r1: self.r1,
            })
        } else {
            Ok(self)
        }
    }
}

/// This an object you can use to busy-wait with a timeout.
///
/// Will let you call `delay` as many times as fit in the configured timeout
/// before `delay` returns an error.
struct Delay {
    retries_left: u32,
    interval_us: u32,
}

impl Delay {
    /// Create a new Delay object with the budget from the options.
    fn new(options: &AcquireOpts) -> Delay {
        let interval_us = options.poll_interval_us.max(1);
        Delay {
            retries_left: options.timeout_ms.saturating_mul(1000) / interval_us,
            interval_us,
        }
    }

    /// Wait for a while.
    ///
    /// Checks the retry counter first, and if we hit the max retry limit, the
    /// value `err` is returned. Otherwise we wait for one poll interval and
    /// then return `Ok(())`.
    fn delay<T, E>(&mut self, delayer: &mut T, err: E) -> Result<(), E>
    where
        T: DelayNs,
    {
        if self.retries_left == 0 {
            Err(err)
        } else {
            delayer.delay_us(self.interval_us);
            self.retries_left -= 1;
            Ok(())
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
