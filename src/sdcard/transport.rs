//! The transport between the SD card driver and the SPI lines.
//!
//! The driver never touches pins or peripheral registers. Everything it does
//! on the bus goes through the [`Transport`] trait: bounded exchanges,
//! chip-select, data-line direction, clock profile and a bus-wide lock.

use core::cell::RefCell;

use embedded_hal::{digital::OutputPin, spi::SpiBus};

/// The native transfer width of the transport, in bytes.
pub const WORD_LEN: usize = 4;

/// The most bytes that can be sent or received in one [`Exchange`].
pub const MAX_CHUNK: usize = 64;

/// The clock settings the driver asks for at different stages.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockProfile {
    /// Slow clock (at most 400 kHz) used while identifying the card.
    CardDetect,
    /// Full speed clock for command and block traffic.
    Normal,
    /// Low speed, receive-only clock for long busy polls.
    Polling,
}

/// Errors that can occur when using a [`Transport`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[non_exhaustive]
pub enum TransportError {
    /// An operation on the inner SPI bus failed.
    Spi,
    /// Setting the value of the Chip Select (CS) pin failed.
    Cs,
    /// The clock could not be switched to the requested profile.
    Clock,
    /// An exchange asked for more than [`MAX_CHUNK`] bytes in one direction.
    ChunkTooLarge,
}

/// One bounded bus exchange.
///
/// The phases go out in order: an 8-bit command, a 32-bit big-endian
/// address, then the output bytes. The input bytes are clocked in last,
/// with the data line held high. Any phase may be empty.
#[derive(Debug)]
pub struct Exchange<'a> {
    /// Optional 8-bit command phase.
    pub command: Option<u8>,
    /// Optional 32-bit address phase, sent most significant byte first.
    pub address: Option<u32>,
    /// Bytes to send after the command and address.
    pub output: &'a [u8],
    /// Bytes to receive.
    pub input: &'a mut [u8],
}

impl<'a> Exchange<'a> {
    /// An exchange that only sends `output`.
    pub fn write(output: &'a [u8]) -> Exchange<'a> {
        Exchange {
            command: None,
            address: None,
            output,
            input: &mut [],
        }
    }

    /// An exchange that only receives into `input`.
    pub fn read(input: &'a mut [u8]) -> Exchange<'a> {
        Exchange {
            command: None,
            address: None,
            output: &[],
            input,
        }
    }

    /// An exchange with command and address phases followed by `output`.
    pub fn command(command: u8, address: u32, output: &'a [u8]) -> Exchange<'a> {
        Exchange {
            command: Some(command),
            address: Some(address),
            output,
            input: &mut [],
        }
    }

    /// Number of bytes sent on the wire.
    pub fn output_len(&self) -> usize {
        usize::from(self.command.is_some())
            + if self.address.is_some() { 4 } else { 0 }
            + self.output.len()
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.output.len() > MAX_CHUNK || self.input.len() > MAX_CHUNK {
            Err(TransportError::ChunkTooLarge)
        } else {
            Ok(())
        }
    }
}

/// What the SD card driver needs from the bus it sits on.
///
/// The SPI lines may be shared with other peripherals. The driver wraps each
/// whole identification run and each read or write transaction in
/// [`Transport::with_bus`], so implementations guarding a shared bus should
/// hold their lock for the duration of that call.
pub trait Transport {
    /// Perform one exchange. Neither `output` nor `input` may exceed
    /// [`MAX_CHUNK`] bytes.
    fn exchange(&mut self, exchange: Exchange<'_>) -> Result<(), TransportError>;

    /// Switch the bus clock to the given profile.
    fn set_clock(&mut self, profile: ClockProfile) -> Result<(), TransportError>;

    /// Assert the card's chip-select.
    fn select(&mut self) -> Result<(), TransportError>;

    /// Deassert the card's chip-select and clock one idle byte so the card
    /// lets go of its data-out line.
    fn deselect(&mut self) -> Result<(), TransportError>;

    /// Hold the data-in line of the card high while receiving.
    fn receive_mode(&mut self) -> Result<(), TransportError>;

    /// Drive the data-in line of the card from the output phases again.
    fn transmit_mode(&mut self) -> Result<(), TransportError>;

    /// Run `func` while holding the bus-wide lock.
    ///
    /// The default suits a bus owned by this transport alone.
    fn with_bus<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut Self) -> T,
        Self: Sized,
    {
        func(self)
    }
}

/// Splits a transfer of `len` bytes starting at memory address `address`
/// into the pieces the transport can move.
///
/// First an undersized piece brings the address up to a [`WORD_LEN`]
/// boundary, then as many [`MAX_CHUNK`] pieces as fit, then whatever is
/// left. Yields `(offset, len)` pairs; no piece is empty.
#[derive(Debug, Clone)]
pub struct Chunks {
    offset: usize,
    remaining: usize,
    prefix: usize,
}

impl Chunks {
    /// Plan a transfer of `len` bytes starting at `address`.
    pub fn new(address: usize, len: usize) -> Chunks {
        Chunks {
            offset: 0,
            remaining: len,
            prefix: ((WORD_LEN - address % WORD_LEN) % WORD_LEN).min(len),
        }
    }

    /// Plan a transfer into or out of `buffer`.
    pub fn for_slice(buffer: &[u8]) -> Chunks {
        Chunks::new(buffer.as_ptr() as usize, buffer.len())
    }
}

impl Iterator for Chunks {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        if self.remaining == 0 {
            return None;
        }
        let len = if self.prefix > 0 {
            core::mem::take(&mut self.prefix)
        } else {
            self.remaining.min(MAX_CHUNK)
        };
        let item = (self.offset, len);
        self.offset += len;
        self.remaining -= len;
        Some(item)
    }
}

/// Applies a [`ClockProfile`] to a bus, for example by reprogramming its
/// divider.
pub type ClockHook<BUS> = fn(&mut BUS, ClockProfile) -> Result<(), TransportError>;

/// A transport that owns its SPI bus and chip-select pin.
pub struct ExclusiveTransport<BUS, CS> {
    bus: BUS,
    cs: CS,
    clock: Option<ClockHook<BUS>>,
}

impl<BUS, CS> ExclusiveTransport<BUS, CS> {
    /// Create a new `ExclusiveTransport`.
    pub fn new(bus: BUS, cs: CS) -> Self {
        Self {
            bus,
            cs,
            clock: None,
        }
    }

    /// Use `hook` to apply clock profiles to the bus.
    pub fn with_clock(mut self, hook: ClockHook<BUS>) -> Self {
        self.clock = Some(hook);
        self
    }

    /// Get the bus and chip-select pin back.
    pub fn free(self) -> (BUS, CS) {
        (self.bus, self.cs)
    }
}

impl<BUS, CS> Transport for ExclusiveTransport<BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    fn exchange(&mut self, exchange: Exchange<'_>) -> Result<(), TransportError> {
        bus_exchange(&mut self.bus, exchange)
    }

    fn set_clock(&mut self, profile: ClockProfile) -> Result<(), TransportError> {
        match self.clock {
            Some(hook) => hook(&mut self.bus, profile),
            None => Ok(()),
        }
    }

    fn select(&mut self) -> Result<(), TransportError> {
        self.cs.set_low().map_err(|_| TransportError::Cs)
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        release(&mut self.bus, &mut self.cs)
    }

    fn receive_mode(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn transmit_mode(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A wrapper around a SPI bus and a CS pin, using a `RefCell`.
///
/// This allows sharing the bus within the same thread, for example with a
/// display on the same clock and data lines.
pub struct RefCellTransport<'a, BUS, CS> {
    bus: &'a RefCell<BUS>,
    cs: CS,
    clock: Option<ClockHook<BUS>>,
}

impl<'a, BUS, CS> RefCellTransport<'a, BUS, CS> {
    /// Create a new `RefCellTransport`.
    pub fn new(bus: &'a RefCell<BUS>, cs: CS) -> Self {
        Self {
            bus,
            cs,
            clock: None,
        }
    }

    /// Use `hook` to apply clock profiles to the bus.
    pub fn with_clock(mut self, hook: ClockHook<BUS>) -> Self {
        self.clock = Some(hook);
        self
    }
}

impl<BUS, CS> Transport for RefCellTransport<'_, BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    fn exchange(&mut self, exchange: Exchange<'_>) -> Result<(), TransportError> {
        let mut bus = self.bus.borrow_mut();
        bus_exchange(&mut *bus, exchange)
    }

    fn set_clock(&mut self, profile: ClockProfile) -> Result<(), TransportError> {
        match self.clock {
            Some(hook) => hook(&mut *self.bus.borrow_mut(), profile),
            None => Ok(()),
        }
    }

    fn select(&mut self) -> Result<(), TransportError> {
        self.cs.set_low().map_err(|_| TransportError::Cs)
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        let mut bus = self.bus.borrow_mut();
        release(&mut *bus, &mut self.cs)
    }

    fn receive_mode(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn transmit_mode(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(feature = "embassy-sync-06")]
mod embassy_sync_06 {
    use core::cell::RefCell;

    use ::embassy_sync_06::blocking_mutex;

    use super::*;

    /// A wrapper around a SPI bus and a CS pin, using an `embassy-sync` blocking mutex.
    ///
    /// [`Transport::with_bus`] holds the mutex for the whole of a card
    /// operation, so other users of the bus can not slip in between two
    /// exchanges. See [`blocking_mutex::Mutex`] for the locking model.
    pub struct EmbassyMutexTransport<'a, BUS, CS, M> {
        bus: &'a blocking_mutex::Mutex<M, RefCell<BUS>>,
        cs: CS,
        clock: Option<ClockHook<BUS>>,
    }

    impl<'a, BUS, CS, M> EmbassyMutexTransport<'a, BUS, CS, M> {
        /// Create a new `EmbassyMutexTransport`.
        pub fn new(bus: &'a blocking_mutex::Mutex<M, RefCell<BUS>>, cs: CS) -> Self {
            Self {
                bus,
                cs,
                clock: None,
            }
        }

        /// Use `hook` to apply clock profiles to the bus.
        pub fn with_clock(mut self, hook: ClockHook<BUS>) -> Self {
            self.clock = Some(hook);
            self
        }
    }

    impl<BUS, CS, M> Transport for EmbassyMutexTransport<'_, BUS, CS, M>
    where
        CS: OutputPin,
        BUS: SpiBus,
        M: blocking_mutex::raw::RawMutex,
    {
        fn exchange(&mut self, exchange: Exchange<'_>) -> Result<(), TransportError> {
            self.bus.lock(|bus| {
                let mut bus = bus.borrow_mut();
                bus_exchange(&mut *bus, exchange)
            })
        }

        fn set_clock(&mut self, profile: ClockProfile) -> Result<(), TransportError> {
            match self.clock {
                Some(hook) => self.bus.lock(|bus| hook(&mut *bus.borrow_mut(), profile)),
                None => Ok(()),
            }
        }

        fn select(&mut self) -> Result<(), TransportError> {
            self.cs.set_low().map_err(|_| TransportError::Cs)
        }

        fn deselect(&mut self) -> Result<(), TransportError> {
            let cs = &mut self.cs;
            self.bus.lock(|bus| {
                let mut bus = bus.borrow_mut();
                release(&mut *bus, cs)
            })
        }

        fn receive_mode(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn transmit_mode(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn with_bus<T, F>(&mut self, func: F) -> T
        where
            F: FnOnce(&mut Self) -> T,
        {
            let bus = self.bus;
            bus.lock(|_| func(self))
        }
    }
}

#[cfg(feature = "embassy-sync-06")]
pub use embassy_sync_06::*;

/// Perform one exchange on a plain SPI bus. The input phase clocks out
/// `0xFF` so the card sees its data-in line held high.
fn bus_exchange<BUS>(bus: &mut BUS, exchange: Exchange<'_>) -> Result<(), TransportError>
where
    BUS: SpiBus,
{
    exchange.check()?;
    let mut header = [0u8; 5];
    let mut header_len = 0;
    if let Some(command) = exchange.command {
        header[0] = command;
        header_len = 1;
    }
    if let Some(address) = exchange.address {
        header[header_len..header_len + 4].copy_from_slice(&address.to_be_bytes());
        header_len += 4;
    }

    let mut op_res = bus.write(&header[..header_len]);
    if op_res.is_ok() && !exchange.output.is_empty() {
        op_res = bus.write(exchange.output);
    }
    if op_res.is_ok() && !exchange.input.is_empty() {
        exchange.input.fill(0xFF);
        op_res = bus.transfer_in_place(exchange.input);
    }

    // On failure, it's important to still flush.
    let flush_res = bus.flush();

    op_res.map_err(|_| TransportError::Spi)?;
    flush_res.map_err(|_| TransportError::Spi)?;
    Ok(())
}

/// Deassert CS, then write the dummy byte.
fn release<BUS, CS>(bus: &mut BUS, cs: &mut CS) -> Result<(), TransportError>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    let cs_res = cs.set_high();
    let dummy_res = bus.write(&[0xFF]);
    let flush_res = bus.flush();

    cs_res.map_err(|_| TransportError::Cs)?;
    dummy_res.map_err(|_| TransportError::Spi)?;
    flush_res.map_err(|_| TransportError::Spi)?;
    Ok(())
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
