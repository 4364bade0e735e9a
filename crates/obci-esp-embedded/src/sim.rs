//! Simulated ADS1299 pair
//!
//! A register-level model of the on-board and daisy chips behind the
//! `embedded-hal` traits, for host tests and the console app. All handles
//! borrow one [`SimBoard`], so a test can inspect the chips while the driver
//! owns the bus:
//!
//! ```ignore
//! use obci_esp_core::types::Chip;
//! use obci_esp_embedded::drivers::ads1299::{regs, Ads1299Pair, BoardConfig};
//! use obci_esp_embedded::sim::SimBoard;
//!
//! let sim = SimBoard::new(true);
//! let mut board = Ads1299Pair::new(
//!     sim.spi(),
//!     [sim.cs(Chip::Primary), sim.cs(Chip::Secondary)],
//!     sim.reset_pin(),
//!     sim.delay(),
//!     BoardConfig::default(),
//! );
//! board.initialize().unwrap();
//! assert_eq!(sim.register(Chip::Secondary, regs::CONFIG3), 0xEC);
//! ```
//!
//! The model honours the parts of the datasheet the driver depends on:
//! register access is ignored in continuous-read mode, RESET restores the
//! power-on register values and re-enters continuous-read mode, and in
//! continuous-read mode clocking `0x00` shifts out a 27-byte frame built from
//! the queued samples. An absent chip leaves MISO low.

use core::cell::{Cell, RefCell};
use core::convert::Infallible;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, SpiBus};
use heapless::Deque;

use obci_esp_core::protocol::to_be_24;
use obci_esp_core::types::{Chip, CHANNELS_PER_CHIP};

use crate::drivers::ads1299::{opcodes, regs, ADS_ID};

/// Samples that can be queued per chip
pub const SAMPLE_QUEUE_LEN: usize = 64;

const FRAME_LEN: usize = 27;
const STATUS_HEADER: u8 = 0xC0;

/// Where the chip is in the current chip-select scope.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Start,
    ReadCount { addr: u8 },
    ReadData { addr: u8, remaining: u8 },
    WriteCount { addr: u8 },
    WriteData { addr: u8, remaining: u8 },
    Frame { pos: usize },
    Ignore,
}

struct SimChip {
    present: bool,
    id: u8,
    regs: [u8; regs::COUNT],
    continuous: bool,
    converting: bool,
    selected: bool,
    phase: Phase,
    frame: [u8; FRAME_LEN],
    last_sample: [i32; CHANNELS_PER_CHIP],
    samples: Deque<[i32; CHANNELS_PER_CHIP], SAMPLE_QUEUE_LEN>,
}

impl SimChip {
    fn new(present: bool) -> Self {
        let mut chip = Self {
            present,
            id: ADS_ID,
            regs: [0; regs::COUNT],
            continuous: true,
            converting: false,
            selected: false,
            phase: Phase::Start,
            frame: [0; FRAME_LEN],
            last_sample: [0; CHANNELS_PER_CHIP],
            samples: Deque::new(),
        };
        chip.reset();
        chip
    }

    /// Power-on register values; the device comes up in continuous-read mode.
    fn reset(&mut self) {
        if !self.present {
            return;
        }
        self.regs = [0; regs::COUNT];
        self.regs[usize::from(regs::ID)] = self.id;
        self.regs[usize::from(regs::CONFIG1)] = 0x96;
        self.regs[usize::from(regs::CONFIG2)] = 0xC0;
        self.regs[usize::from(regs::CONFIG3)] = 0x60;
        for addr in regs::CH1SET..=regs::CH8SET {
            self.regs[usize::from(addr)] = 0x61;
        }
        self.regs[usize::from(regs::GPIO)] = 0x0F;
        self.continuous = true;
        self.converting = false;
        self.phase = Phase::Start;
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.present {
            return 0x00;
        }
        match self.phase {
            Phase::Start => self.command(mosi),
            Phase::ReadCount { addr } => {
                self.phase = Phase::ReadData { addr, remaining: (mosi & 0x1F) + 1 };
                0x00
            }
            Phase::ReadData { addr, remaining } => {
                let value = self.regs.get(usize::from(addr)).copied().unwrap_or(0);
                self.phase = if remaining > 1 {
                    Phase::ReadData { addr: addr + 1, remaining: remaining - 1 }
                } else {
                    Phase::Ignore
                };
                value
            }
            Phase::WriteCount { addr } => {
                self.phase = Phase::WriteData { addr, remaining: (mosi & 0x1F) + 1 };
                0x00
            }
            Phase::WriteData { addr, remaining } => {
                // ID is read-only
                if addr != regs::ID {
                    if let Some(reg) = self.regs.get_mut(usize::from(addr)) {
                        *reg = mosi;
                    }
                }
                self.phase = if remaining > 1 {
                    Phase::WriteData { addr: addr + 1, remaining: remaining - 1 }
                } else {
                    Phase::Ignore
                };
                0x00
            }
            Phase::Frame { pos } => {
                let value = self.frame[pos];
                self.phase = if pos + 1 < FRAME_LEN { Phase::Frame { pos: pos + 1 } } else { Phase::Ignore };
                value
            }
            Phase::Ignore => 0x00,
        }
    }

    fn command(&mut self, opcode: u8) -> u8 {
        match opcode {
            0x00 if self.continuous => {
                self.load_frame();
                self.phase = Phase::Frame { pos: 1 };
                return self.frame[0];
            }
            opcodes::RESET => self.reset(),
            opcodes::SDATAC => self.continuous = false,
            opcodes::RDATAC => self.continuous = true,
            opcodes::START => self.converting = true,
            opcodes::STOP => self.converting = false,
            0x20..=0x3F | 0x40..=0x5F if self.continuous => self.phase = Phase::Ignore,
            0x20..=0x3F => self.phase = Phase::ReadCount { addr: opcode & 0x1F },
            0x40..=0x5F => self.phase = Phase::WriteCount { addr: opcode & 0x1F },
            _ => {}
        }
        0x00
    }

    fn load_frame(&mut self) {
        if let Some(sample) = self.samples.pop_front() {
            self.last_sample = sample;
        }
        self.frame = [0; FRAME_LEN];
        self.frame[0] = STATUS_HEADER;
        for (word, &value) in self.frame[3..].chunks_exact_mut(3).zip(&self.last_sample) {
            word.copy_from_slice(&to_be_24(value));
        }
    }
}

/// Reset line behaviour observed during the last initialization.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResetTiming {
    /// Simulated time from construction to the reset line falling
    pub power_on_to_reset_ns: u64,
    /// Time the reset line was held low
    pub low_ns: u64,
    /// Time from the reset line rising to the next SPI byte
    pub release_to_first_access_ns: u64,
}

#[derive(Copy, Clone, Debug, Default)]
struct ResetLog {
    low_at: Option<u64>,
    high_at: Option<u64>,
    first_access: Option<u64>,
}

/// Two simulated ADS1299 chips sharing a bus.
pub struct SimBoard {
    chips: RefCell<[SimChip; 2]>,
    now_ns: Cell<u64>,
    reset_high: Cell<bool>,
    reset_log: Cell<ResetLog>,
    bytes: Cell<usize>,
}

impl SimBoard {
    /// Create a board with or without a daisy chip fitted.
    #[must_use]
    pub fn new(daisy: bool) -> Self {
        Self {
            chips: RefCell::new([SimChip::new(true), SimChip::new(daisy)]),
            now_ns: Cell::new(0),
            reset_high: Cell::new(true),
            reset_log: Cell::new(ResetLog::default()),
            bytes: Cell::new(0),
        }
    }

    /// SPI bus handle.
    pub fn spi(&self) -> SimSpi<'_> {
        SimSpi { board: self }
    }

    /// Chip-select line for one chip.
    pub fn cs(&self, chip: Chip) -> SimPin<'_> {
        SimPin { board: self, line: Line::ChipSelect(chip) }
    }

    /// Shared reset line.
    pub fn reset_pin(&self) -> SimPin<'_> {
        SimPin { board: self, line: Line::Reset }
    }

    /// Delay that advances the simulated clock.
    pub fn delay(&self) -> SimDelay<'_> {
        SimDelay { board: self }
    }

    /// Fit a chip answering with `id`. A secondary chip with an ID other
    /// than `0x3E` models a misidentified daisy module.
    pub fn set_device_id(&self, chip: Chip, id: u8) {
        let mut chips = self.chips.borrow_mut();
        let sim = &mut chips[chip.index()];
        sim.present = true;
        sim.id = id;
        sim.regs[usize::from(regs::ID)] = id;
    }

    /// Queue a sample for the chip's next frame. Returns `false` when the
    /// queue is full. With an empty queue the last sample repeats.
    pub fn push_sample(&self, chip: Chip, sample: [i32; CHANNELS_PER_CHIP]) -> bool {
        self.chips.borrow_mut()[chip.index()].samples.push_back(sample).is_ok()
    }

    /// Current hardware value of a register.
    pub fn register(&self, chip: Chip, addr: u8) -> u8 {
        self.chips.borrow()[chip.index()].regs[usize::from(addr)]
    }

    /// Whether the chip has been told to START.
    pub fn is_converting(&self, chip: Chip) -> bool {
        self.chips.borrow()[chip.index()].converting
    }

    /// Whether the chip is in continuous-read mode.
    pub fn is_continuous(&self, chip: Chip) -> bool {
        self.chips.borrow()[chip.index()].continuous
    }

    /// Bytes clocked on the bus so far.
    pub fn bytes_exchanged(&self) -> usize {
        self.bytes.get()
    }

    /// Simulated time elapsed in delays.
    pub fn elapsed_ns(&self) -> u64 {
        self.now_ns.get()
    }

    /// Reset line timing of the most recent hardware reset.
    pub fn reset_timing(&self) -> ResetTiming {
        let log = self.reset_log.get();
        let low_at = log.low_at.unwrap_or(0);
        let high_at = log.high_at.unwrap_or(low_at);
        ResetTiming {
            power_on_to_reset_ns: low_at,
            low_ns: high_at - low_at,
            release_to_first_access_ns: log.first_access.map_or(0, |t| t - high_at),
        }
    }

    fn exchange(&self, mosi: u8) -> u8 {
        self.bytes.set(self.bytes.get() + 1);

        let mut log = self.reset_log.get();
        if log.high_at.is_some() && log.first_access.is_none() {
            log.first_access = Some(self.now_ns.get());
            self.reset_log.set(log);
        }

        let mut miso = None;
        for chip in self.chips.borrow_mut().iter_mut().filter(|c| c.selected) {
            let out = chip.exchange(mosi);
            miso.get_or_insert(out);
        }
        miso.unwrap_or(0x00)
    }

    fn drive(&self, line: Line, high: bool) {
        match line {
            Line::ChipSelect(chip) => {
                let mut chips = self.chips.borrow_mut();
                let sim = &mut chips[chip.index()];
                sim.selected = !high;
                if high {
                    sim.phase = Phase::Start;
                }
            }
            Line::Reset => {
                let was_high = self.reset_high.replace(high);
                let now = self.now_ns.get();
                if was_high && !high {
                    self.reset_log.set(ResetLog { low_at: Some(now), ..ResetLog::default() });
                } else if !was_high && high {
                    let mut log = self.reset_log.get();
                    log.high_at = Some(now);
                    self.reset_log.set(log);
                    for chip in self.chips.borrow_mut().iter_mut() {
                        chip.reset();
                    }
                }
            }
        }
    }

    fn advance(&self, ns: u64) {
        self.now_ns.set(self.now_ns.get() + ns);
    }
}

/// SPI handle onto a [`SimBoard`].
pub struct SimSpi<'a> {
    board: &'a SimBoard,
}

impl spi::ErrorType for SimSpi<'_> {
    type Error = Infallible;
}

impl SpiBus<u8> for SimSpi<'_> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        for word in words {
            *word = self.board.exchange(0x00);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        for &word in words {
            self.board.exchange(word);
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        for i in 0..read.len().max(write.len()) {
            let miso = self.board.exchange(write.get(i).copied().unwrap_or(0x00));
            if let Some(word) = read.get_mut(i) {
                *word = miso;
            }
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        for word in words {
            *word = self.board.exchange(*word);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
enum Line {
    ChipSelect(Chip),
    Reset,
}

/// Output pin handle onto a [`SimBoard`].
pub struct SimPin<'a> {
    board: &'a SimBoard,
    line: Line,
}

impl digital::ErrorType for SimPin<'_> {
    type Error = Infallible;
}

impl OutputPin for SimPin<'_> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.board.drive(self.line, false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.board.drive(self.line, true);
        Ok(())
    }
}

/// Delay handle advancing the [`SimBoard`] clock.
pub struct SimDelay<'a> {
    board: &'a SimBoard,
}

impl DelayNs for SimDelay<'_> {
    fn delay_ns(&mut self, ns: u32) {
        self.board.advance(u64::from(ns));
    }

    fn delay_us(&mut self, us: u32) {
        self.board.advance(u64::from(us) * 1_000);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.board.advance(u64::from(ms) * 1_000_000);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction(sim: &SimBoard, chip: Chip, bytes: &mut [u8]) {
        let mut cs = sim.cs(chip);
        cs.set_low().unwrap();
        sim.spi().transfer_in_place(bytes).unwrap();
        cs.set_high().unwrap();
    }

    #[test]
    fn test_register_access_ignored_in_continuous_mode() {
        let sim = SimBoard::new(false);
        transaction(&sim, Chip::Primary, &mut [0x40 | regs::CONFIG3, 0x00, 0xEC]);
        assert_eq!(sim.register(Chip::Primary, regs::CONFIG3), 0x60);

        transaction(&sim, Chip::Primary, &mut [opcodes::SDATAC]);
        transaction(&sim, Chip::Primary, &mut [0x40 | regs::CONFIG3, 0x00, 0xEC]);
        assert_eq!(sim.register(Chip::Primary, regs::CONFIG3), 0xEC);

        let mut read = [0x20 | regs::CONFIG3, 0x00, 0x00];
        transaction(&sim, Chip::Primary, &mut read);
        assert_eq!(read[2], 0xEC);
    }

    #[test]
    fn test_absent_chip_reads_zero() {
        let sim = SimBoard::new(false);
        transaction(&sim, Chip::Secondary, &mut [opcodes::SDATAC]);
        let mut read = [0x20 | regs::ID, 0x00, 0x00];
        transaction(&sim, Chip::Secondary, &mut read);
        assert_eq!(read[2], 0x00);
    }

    #[test]
    fn test_frame_from_queued_sample() {
        let sim = SimBoard::new(false);
        assert!(sim.push_sample(Chip::Primary, [1, -1, 0, 0, 0, 0, 0, 2]));
        let mut frame = [0u8; FRAME_LEN];
        transaction(&sim, Chip::Primary, &mut frame);
        assert_eq!(frame[0], STATUS_HEADER);
        assert_eq!(&frame[3..9], &[0x00, 0x00, 0x01, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&frame[24..], &[0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_reset_opcode_restores_defaults() {
        let sim = SimBoard::new(true);
        transaction(&sim, Chip::Secondary, &mut [opcodes::SDATAC]);
        transaction(&sim, Chip::Secondary, &mut [0x40 | regs::MISC1, 0x00, 0x20]);
        assert_eq!(sim.register(Chip::Secondary, regs::MISC1), 0x20);
        assert!(!sim.is_continuous(Chip::Secondary));

        transaction(&sim, Chip::Secondary, &mut [opcodes::RESET]);
        assert_eq!(sim.register(Chip::Secondary, regs::MISC1), 0x00);
        assert!(sim.is_continuous(Chip::Secondary));
    }

    #[test]
    fn test_delay_advances_clock() {
        let sim = SimBoard::new(false);
        let mut delay = sim.delay();
        delay.delay_ms(2);
        delay.delay_us(3);
        delay.delay_ns(4);
        assert_eq!(sim.elapsed_ns(), 2_003_004);
    }
}
