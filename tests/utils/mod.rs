//! Useful library code for tests

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use hex_literal::hex;
use sdspi_disk::sdcard::proto::{crc16, crc7};
use sdspi_disk::sdcard::transport::MAX_CHUNK;
use sdspi_disk::{
    AcquireOpts, ClockProfile, Exchange, SdCard, Transport, TransportError, BLOCK_LEN,
};

/// CSD version 1: C_SIZE = 0x3A2, C_SIZE_MULT = 3, READ_BL_LEN = 9,
/// SECTOR_SIZE = 0x1F. 29,792 sectors, erase unit 32.
pub static CSD_V1: [u8; 16] = hex!("00 26 00 32 5F 59 80 E8 AD D9 CF FF 92 80 40 01");

/// CSD version 2 from a real 4 GB card. 7,710,720 sectors, SECTOR_SIZE 0x7F.
pub static CSD_V2: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");

/// CSD version 2 with C_SIZE = 0x3FFFFF, which is 2^32 sectors.
pub static CSD_V2_OVERSIZED: [u8; 16] =
    hex!("40 0E 00 32 5B 59 00 3F FF FF 7F 80 0A 40 00 8B");

/// CSD_STRUCTURE 3, which SD cards never use.
pub static CSD_BAD: [u8; 16] = hex!("C0 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");

pub static CID: [u8; 16] = hex!("03 53 44 53 55 30 34 47 80 12 34 56 78 01 4C 21");

/// Sectors described by [`CSD_V1`].
pub const CSD_V1_SECTORS: u32 = 29_792;

/// Sectors described by [`CSD_V2`].
pub const CSD_V2_SECTORS: u32 = 7_710_720;

/// An SD Status register with the given AU_SIZE (9 is 4 MiB, 8192 sectors).
pub fn sd_status(au_size: u8) -> [u8; 64] {
    let mut status = [0u8; 64];
    status[8] = 0x02;
    status[10] = au_size << 4;
    status
}

/// The card families the simulator can pretend to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Personality {
    /// SD v2, high capacity
    SdhcBlock,
    /// SD v2, standard capacity
    SdV2Byte,
    /// SD v1
    SdV1,
    /// MMC v3: no CMD8, no CMD55
    Mmc,
    /// Nothing ever comes back
    Silent,
}

/// One call to [`Transport::exchange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRecord {
    pub command: Option<u8>,
    pub address: Option<u32>,
    pub output_len: usize,
    pub input_len: usize,
}

#[derive(Debug)]
enum Rx {
    Idle,
    Command(Vec<u8>),
    WaitToken { multi: bool },
    Data { multi: bool, bytes: Vec<u8> },
}

/// A byte-level simulation of an SD or MMC card in SPI mode.
///
/// Implements [`Transport`] directly, so the driver talks to it exactly as
/// it would to a real bus.
pub struct SimCard {
    pub personality: Personality,
    pub csd: [u8; 16],
    pub cid: [u8; 16],
    pub status: [u8; 64],
    /// Sectors written so far. Unwritten sectors read as [`pattern`].
    pub storage: HashMap<u32, [u8; BLOCK_LEN]>,

    // Timing
    /// Idle bytes before every R1.
    pub response_delay: usize,
    /// Busy (0x00) bytes after each written block and after CMD12.
    pub busy_bytes: usize,
    /// How many activation commands the card stays idle for.
    pub idle_rounds: u32,

    // Faults
    /// Reject the n'th (1-based) data block of a write command.
    pub reject_block: Option<usize>,
    /// Never send a data start token for reads.
    pub no_read_token: bool,
    /// Send this instead of the data start token.
    pub bad_read_token: Option<u8>,
    /// Stay busy forever after a written block.
    pub busy_forever: bool,
    /// Corrupt the CRC of read blocks.
    pub corrupt_read_crc: bool,
    /// Refuse CMD16.
    pub refuse_block_len: bool,
    /// Fail the n'th (1-based) exchange at the transport level.
    pub fail_exchange: Option<usize>,
    /// Go silent once this command has been answered.
    pub silent_after: Option<u8>,

    // Recording
    pub commands: Vec<(u8, u32)>,
    pub exchanges: Vec<ExchangeRecord>,
    pub clocks: Vec<ClockProfile>,
    pub data_tokens: Vec<u8>,
    pub blocks_received: usize,
    pub preerase: Vec<u32>,
    pub selects: usize,
    pub deselects: usize,
    pub deselected_idle_bytes: usize,
    pub crc_failures: usize,
    /// Exchanges that sent while in receive mode, or received while in
    /// transmit mode.
    pub mode_errors: usize,
    pub selected: bool,
    pub receiving: bool,

    // Card state
    out: VecDeque<u8>,
    rx: Rx,
    idle: bool,
    app: bool,
    crc_enabled: bool,
    activations: u32,
    reading: Option<u32>,
    write_block: u32,
    block_in_command: usize,
    stuck_busy: bool,
}

/// What an unwritten sector holds.
pub fn pattern(sector: u32) -> [u8; BLOCK_LEN] {
    let mut block = [0u8; BLOCK_LEN];
    for (i, b) in block.iter_mut().enumerate() {
        *b = (i as u8) ^ (sector as u8).wrapping_mul(31) ^ ((i >> 8) as u8);
    }
    block
}

impl SimCard {
    pub fn new(personality: Personality) -> SimCard {
        let csd = match personality {
            Personality::SdhcBlock => CSD_V2,
            _ => CSD_V1,
        };
        SimCard {
            personality,
            csd,
            cid: CID,
            status: sd_status(9),
            storage: HashMap::new(),
            response_delay: 1,
            busy_bytes: 3,
            idle_rounds: 2,
            reject_block: None,
            no_read_token: false,
            bad_read_token: None,
            busy_forever: false,
            corrupt_read_crc: false,
            refuse_block_len: false,
            fail_exchange: None,
            silent_after: None,
            commands: Vec::new(),
            exchanges: Vec::new(),
            clocks: Vec::new(),
            data_tokens: Vec::new(),
            blocks_received: 0,
            preerase: Vec::new(),
            selects: 0,
            deselects: 0,
            deselected_idle_bytes: 0,
            crc_failures: 0,
            mode_errors: 0,
            selected: false,
            receiving: false,
            out: VecDeque::new(),
            rx: Rx::Idle,
            idle: true,
            app: false,
            crc_enabled: false,
            activations: 0,
            reading: None,
            write_block: 0,
            block_in_command: 0,
            stuck_busy: false,
        }
    }

    /// The command indices seen, in order.
    pub fn command_indices(&self) -> Vec<u8> {
        self.commands.iter().map(|&(index, _)| index).collect()
    }

    /// Forget everything recorded so far.
    pub fn clear_records(&mut self) {
        self.commands.clear();
        self.exchanges.clear();
        self.clocks.clear();
        self.data_tokens.clear();
        self.blocks_received = 0;
        self.preerase.clear();
    }

    /// The contents of a sector.
    pub fn sector(&self, sector: u32) -> [u8; BLOCK_LEN] {
        self.storage
            .get(&sector)
            .copied()
            .unwrap_or_else(|| pattern(sector))
    }

    fn block_addressed(&self) -> bool {
        self.personality == Personality::SdhcBlock
    }

    /// One byte each way.
    fn clock(&mut self, mosi: u8) -> u8 {
        if !self.selected {
            return 0xFF;
        }
        let miso = self.next_out();
        self.take(mosi);
        miso
    }

    fn next_out(&mut self) -> u8 {
        if self.out.is_empty() {
            if let Some(sector) = self.reading {
                self.queue_block(sector);
                self.reading = Some(sector + 1);
            }
        }
        match self.out.pop_front() {
            Some(byte) => byte,
            None if self.stuck_busy => 0x00,
            None => 0xFF,
        }
    }

    fn queue_block(&mut self, sector: u32) {
        if self.no_read_token {
            return;
        }
        let data = self.sector(sector);
        self.out.push_back(0xFF);
        self.out.push_back(self.bad_read_token.unwrap_or(0xFE));
        self.queue_data(&data);
    }

    fn queue_data(&mut self, data: &[u8]) {
        self.out.extend(data.iter().copied());
        let mut crc = crc16(data);
        if self.corrupt_read_crc {
            crc ^= 0x5A5A;
        }
        self.out.extend(crc.to_be_bytes());
    }

    fn take(&mut self, mosi: u8) {
        match &mut self.rx {
            Rx::Idle => {
                if mosi & 0xC0 == 0x40 {
                    self.rx = Rx::Command(vec![mosi]);
                }
            }
            Rx::Command(frame) => {
                frame.push(mosi);
                if frame.len() == 6 {
                    let frame = std::mem::take(frame);
                    self.rx = Rx::Idle;
                    self.handle_command(&frame);
                }
            }
            Rx::WaitToken { multi } => {
                let multi = *multi;
                match mosi {
                    0xFE if !multi => {
                        self.data_tokens.push(mosi);
                        self.rx = Rx::Data {
                            multi,
                            bytes: Vec::new(),
                        };
                    }
                    0xFC if multi => {
                        self.data_tokens.push(mosi);
                        self.rx = Rx::Data {
                            multi,
                            bytes: Vec::new(),
                        };
                    }
                    0xFD if multi => {
                        self.data_tokens.push(mosi);
                        self.out.push_back(0xFF);
                        self.out.extend(std::iter::repeat(0x00).take(self.busy_bytes));
                        self.rx = Rx::Idle;
                    }
                    _ => {}
                }
            }
            Rx::Data { multi, bytes } => {
                bytes.push(mosi);
                if bytes.len() == BLOCK_LEN + 2 {
                    let multi = *multi;
                    let bytes = std::mem::take(bytes);
                    self.finish_block(multi, &bytes);
                }
            }
        }
    }

    fn finish_block(&mut self, multi: bool, bytes: &[u8]) {
        self.blocks_received += 1;
        self.block_in_command += 1;
        let (data, crc) = bytes.split_at(BLOCK_LEN);
        let crc_ok = !self.crc_enabled || crc16(data).to_be_bytes() == crc;
        if !crc_ok {
            self.crc_failures += 1;
        }
        if !crc_ok || self.reject_block == Some(self.block_in_command) {
            // Data rejected due to a CRC error
            self.out.push_back(0xEB);
            self.rx = Rx::Idle;
            return;
        }
        let mut block = [0u8; BLOCK_LEN];
        block.copy_from_slice(data);
        self.storage.insert(self.write_block, block);
        self.write_block += 1;
        // Accepted, with the undefined upper bits set
        self.out.push_back(0xE5);
        if self.busy_forever {
            self.stuck_busy = true;
        }
        self.out.extend(std::iter::repeat(0x00).take(self.busy_bytes));
        self.rx = if multi {
            Rx::WaitToken { multi }
        } else {
            Rx::Idle
        };
    }

    fn respond(&mut self, r1: u8, payload: &[u8]) {
        self.out
            .extend(std::iter::repeat(0xFF).take(self.response_delay));
        self.out.push_back(r1);
        self.out.extend(payload.iter().copied());
    }

    fn r1_state(&self) -> u8 {
        u8::from(self.idle)
    }

    fn sector_of(&self, arg: u32) -> Option<u32> {
        if self.block_addressed() {
            Some(arg)
        } else if arg % 512 == 0 {
            Some(arg / 512)
        } else {
            None
        }
    }

    fn handle_command(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        if let Some(last) = self.silent_after {
            if self.commands.iter().any(|&(i, _)| i == last) {
                self.personality = Personality::Silent;
            }
        }
        self.commands.push((index, arg));
        if self.personality == Personality::Silent {
            return;
        }

        // CMD0 and CMD8 are always CRC checked
        if (self.crc_enabled || index == 0 || index == 8) && crc7(&frame[..5]) != frame[5] {
            self.crc_failures += 1;
            self.respond(0x08 | self.r1_state(), &[]);
            return;
        }

        let app = std::mem::take(&mut self.app);
        let illegal = 0x04 | self.r1_state();
        match (app, index) {
            (_, 0) => {
                self.idle = true;
                self.activations = 0;
                self.reading = None;
                self.stuck_busy = false;
                self.out.clear();
                self.respond(0x01, &[]);
            }
            (_, 59) => {
                self.crc_enabled = arg & 1 != 0;
                self.respond(self.r1_state(), &[]);
            }
            (_, 8) => match self.personality {
                Personality::SdhcBlock | Personality::SdV2Byte => {
                    let echo = (arg & 0xFFF).to_be_bytes();
                    self.respond(0x01, &echo);
                }
                _ => self.respond(illegal, &[]),
            },
            (_, 55) => {
                if self.personality == Personality::Mmc {
                    self.respond(illegal, &[]);
                } else {
                    self.app = true;
                    self.respond(self.r1_state(), &[]);
                }
            }
            (true, 41) => self.activate(),
            (false, 1) => {
                if self.personality == Personality::Mmc {
                    self.activate();
                } else {
                    self.respond(illegal, &[]);
                }
            }
            (_, 58) => {
                let mut ocr = 0x80FF_8000u32;
                if self.block_addressed() {
                    ocr |= 0x4000_0000;
                }
                self.respond(self.r1_state(), &ocr.to_be_bytes());
            }
            (_, 16) => {
                if self.refuse_block_len || arg != 512 {
                    self.respond(0x40, &[]);
                } else {
                    self.respond(0x00, &[]);
                }
            }
            (_, 9) => {
                let csd = self.csd;
                self.respond(0x00, &[0xFF, 0xFE]);
                self.queue_data(&csd);
            }
            (_, 10) => {
                let cid = self.cid;
                self.respond(0x00, &[0xFF, 0xFE]);
                self.queue_data(&cid);
            }
            (true, 13) => {
                let status = self.status;
                self.respond(0x00, &[0x00, 0xFF, 0xFE]);
                self.queue_data(&status);
            }
            (false, 13) => self.respond(0x00, &[0x00]),
            (true, 23) => {
                self.preerase.push(arg);
                self.respond(0x00, &[]);
            }
            (_, 17) | (_, 18) => match self.sector_of(arg) {
                Some(sector) => {
                    self.respond(0x00, &[]);
                    if index == 17 {
                        self.queue_block(sector);
                    } else {
                        self.reading = Some(sector);
                    }
                }
                None => self.respond(0x20, &[]),
            },
            (_, 12) => {
                self.reading = None;
                self.out.clear();
                // Stuff byte
                self.out.push_back(0xC3);
                self.respond(0x00, &[]);
                self.out.extend(std::iter::repeat(0x00).take(self.busy_bytes));
            }
            (_, 24) | (_, 25) => match self.sector_of(arg) {
                Some(sector) => {
                    self.write_block = sector;
                    self.block_in_command = 0;
                    self.respond(0x00, &[]);
                    self.rx = Rx::WaitToken { multi: index == 25 };
                }
                None => self.respond(0x20, &[]),
            },
            _ => self.respond(illegal, &[]),
        }
    }

    fn activate(&mut self) {
        self.activations += 1;
        if self.activations > self.idle_rounds {
            self.idle = false;
        }
        self.respond(self.r1_state(), &[]);
    }
}

impl Transport for SimCard {
    fn exchange(&mut self, exchange: Exchange<'_>) -> Result<(), TransportError> {
        assert!(exchange.output.len() <= MAX_CHUNK, "output too long");
        assert!(exchange.input.len() <= MAX_CHUNK, "input too long");
        self.exchanges.push(ExchangeRecord {
            command: exchange.command,
            address: exchange.address,
            output_len: exchange.output.len(),
            input_len: exchange.input.len(),
        });
        if Some(self.exchanges.len()) == self.fail_exchange {
            return Err(TransportError::Spi);
        }
        let sending = exchange.output_len() > 0;
        if (sending && self.receiving) || (!exchange.input.is_empty() && !self.receiving) {
            self.mode_errors += 1;
        }
        if !self.selected && sending {
            self.deselected_idle_bytes += exchange.output.len();
        }
        if let Some(command) = exchange.command {
            self.clock(command);
        }
        if let Some(address) = exchange.address {
            for byte in address.to_be_bytes() {
                self.clock(byte);
            }
        }
        for &byte in exchange.output {
            self.clock(byte);
        }
        for slot in exchange.input.iter_mut() {
            *slot = self.clock(0xFF);
        }
        Ok(())
    }

    fn set_clock(&mut self, profile: ClockProfile) -> Result<(), TransportError> {
        self.clocks.push(profile);
        Ok(())
    }

    fn select(&mut self) -> Result<(), TransportError> {
        self.selects += 1;
        self.selected = true;
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        self.deselects += 1;
        self.selected = false;
        Ok(())
    }

    fn receive_mode(&mut self) -> Result<(), TransportError> {
        self.receiving = true;
        Ok(())
    }

    fn transmit_mode(&mut self) -> Result<(), TransportError> {
        self.receiving = false;
        Ok(())
    }
}

/// A [`DelayNs`](embedded_hal::delay::DelayNs) that only counts.
///
/// Clones share the same clock, so a test can keep one and hand the other
/// to the driver.
#[derive(Clone, Default)]
pub struct FakeDelay {
    elapsed_ns: Rc<Cell<u64>>,
}

impl FakeDelay {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ns.get() / 1_000_000
    }

    pub fn elapsed_ns(&self) -> u64 {
        self.elapsed_ns.get()
    }

    pub fn reset(&self) {
        self.elapsed_ns.set(0);
    }
}

impl embedded_hal::delay::DelayNs for FakeDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns.set(self.elapsed_ns.get() + u64::from(ns));
    }
}

/// Options with a short timeout, so failing tests finish quickly.
pub fn quick_options() -> AcquireOpts {
    AcquireOpts {
        timeout_ms: 20,
        ..Default::default()
    }
}

/// A driver on a simulated card.
pub fn make_card(sim: SimCard) -> (SdCard<SimCard, FakeDelay>, FakeDelay) {
    make_card_with_options(sim, quick_options())
}

pub fn make_card_with_options(
    sim: SimCard,
    options: AcquireOpts,
) -> (SdCard<SimCard, FakeDelay>, FakeDelay) {
    init_logger();
    let delay = FakeDelay::default();
    (SdCard::new_with_options(sim, delay.clone(), options), delay)
}

/// A driver on an identified card of the given personality.
pub fn acquired_card(personality: Personality) -> (SdCard<SimCard, FakeDelay>, FakeDelay) {
    let (sdcard, delay) = make_card(SimCard::new(personality));
    sdcard.acquire().expect("card identifies");
    sdcard.transport(|sim| sim.clear_records());
    (sdcard, delay)
}

/// Assert the bus was left released: no select and back in transmit mode.
pub fn assert_released(sdcard: &SdCard<SimCard, FakeDelay>) {
    sdcard.transport(|sim| {
        assert!(!sim.selected, "chip-select left asserted");
        assert!(!sim.receiving, "left in receive mode");
        assert_eq!(sim.mode_errors, 0, "exchange in the wrong mode");
    });
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
