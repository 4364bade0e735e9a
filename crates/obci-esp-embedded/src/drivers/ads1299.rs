//! ADS1299 pair driver (on-board chip plus optional daisy module)
//!
//! Driver for two cascaded Texas Instruments ADS1299 converters sharing one
//! SPI bus, one reset line and one DRDY line. The on-board chip supplies the
//! conversion clock to the daisy chip when the latter is present.
//!
//! # Channel numbering
//!
//! Public channel operations take 1-based channel numbers: 1-8 live on the
//! primary chip, 9-16 on the secondary. Operations on 9-16 are silent no-ops
//! when no daisy module was detected, and numbers outside 1-16 are ignored.
//!
//! # Register access
//!
//! Registers can only be accessed with continuous-read mode off. Every
//! register sequence issues `SDATAC` first and waits
//! [`timing::SDATAC_SETTLE_US`]. All settle times are named in [`timing`]
//! and executed through [`DelayNs`], so a fake delay can check them.
//!
//! # Example
//!
//! ```ignore
//! let mut board = Ads1299Pair::new(spi, [cs_board, cs_daisy], reset, delay, BoardConfig::default());
//! board.initialize()?;
//! board.stream_start()?;
//!
//! loop {
//!     if DRDY.is_set() {
//!         board.update_channel_data(&DRDY)?;
//!         // forward board.frame(Chip::Primary)...
//!     }
//! }
//! ```

use core::fmt;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use log::{debug, info};

use obci_esp_core::error::Ads1299Error;
use obci_esp_core::protocol::{sign_extend_24, to_be_24};
use obci_esp_core::types::{
    ChannelSettings, Chip, ChipSelect, InputType, LeadOffCurrent, LeadOffFrequency,
    LeadOffSettings, SampleRate, TestAmplitude, TestFrequency, CHANNELS_PER_CHIP, MAX_CHANNELS,
};

use crate::drdy::DataReady;

/// ADS1299 register addresses
#[allow(missing_docs)]
pub mod regs {
    pub const ID: u8 = 0x00;
    pub const CONFIG1: u8 = 0x01;
    pub const CONFIG2: u8 = 0x02;
    pub const CONFIG3: u8 = 0x03;
    pub const LOFF: u8 = 0x04;
    pub const CH1SET: u8 = 0x05;
    pub const CH8SET: u8 = 0x0C;
    pub const BIAS_SENSP: u8 = 0x0D;
    pub const BIAS_SENSN: u8 = 0x0E;
    pub const LOFF_SENSP: u8 = 0x0F;
    pub const LOFF_SENSN: u8 = 0x10;
    pub const LOFF_FLIP: u8 = 0x11;
    pub const LOFF_STATP: u8 = 0x12;
    pub const LOFF_STATN: u8 = 0x13;
    pub const GPIO: u8 = 0x14;
    pub const MISC1: u8 = 0x15;
    pub const MISC2: u8 = 0x16;
    pub const CONFIG4: u8 = 0x17;

    /// Number of addressable registers
    pub const COUNT: usize = 24;

    /// Register names, indexed by address
    pub const NAMES: [&str; COUNT] = [
        "ID", "CONFIG1", "CONFIG2", "CONFIG3", "LOFF", "CH1SET", "CH2SET", "CH3SET", "CH4SET",
        "CH5SET", "CH6SET", "CH7SET", "CH8SET", "BIAS_SENSP", "BIAS_SENSN", "LOFF_SENSP",
        "LOFF_SENSN", "LOFF_FLIP", "LOFF_STATP", "LOFF_STATN", "GPIO", "MISC1", "MISC2", "CONFIG4",
    ];
}

/// ADS1299 SPI opcodes
#[allow(missing_docs)]
pub mod opcodes {
    pub const WAKEUP: u8 = 0x02;
    pub const STANDBY: u8 = 0x04;
    pub const RESET: u8 = 0x06;
    pub const START: u8 = 0x08;
    pub const STOP: u8 = 0x0A;
    pub const RDATAC: u8 = 0x10;
    pub const SDATAC: u8 = 0x11;
    pub const RDATA: u8 = 0x12;
    pub const RREG: u8 = 0x20;
    pub const WREG: u8 = 0x40;
}

/// Minimum settle times around bus operations.
pub mod timing {
    /// Power-on to first reset (tPOR is ~32 ms)
    pub const POWER_ON_MS: u32 = 50;
    /// Reset line held low
    pub const RESET_PULSE_US: u32 = 4;
    /// Reset release to first bus access (18 tCLK)
    pub const RESET_RECOVERY_US: u32 = 20;
    /// After the hardware reset before talking to either chip
    pub const POST_RESET_MS: u32 = 40;
    /// RESET opcode execution, inside the chip-select scope (18 tCLK)
    pub const RESET_OPCODE_US: u32 = 12;
    /// After SDATAC, before any register access (4 tCLK)
    pub const SDATAC_SETTLE_US: u32 = 10;
    /// After a per-chip reset, before deactivating its channels
    pub const CHIP_RESET_MS: u32 = 100;
    /// Between the per-chip bring-up steps
    pub const CHIP_GAP_MS: u32 = 10;
    /// After a CONFIG1 write changes the clock output
    pub const CLOCK_SETTLE_MS: u32 = 40;
    /// After a register read-modify-write
    pub const REGISTER_MS: u32 = 1;
    /// After re-initialization in a soft reset
    pub const SOFT_RESET_MS: u32 = 500;
}

/// Device ID read from a present ADS1299
pub const ADS_ID: u8 = 0x3E;

/// CONFIG1: daisy mode, clock output enabled
const CONFIG1_DAISY: u8 = 0b1011_0000;
/// CONFIG1: daisy mode, clock output disabled
const CONFIG1_DAISY_NOT: u8 = 0b1001_0000;
/// CONFIG3: internal reference, bias buffer and bias reference enabled
const CONFIG3_DEFAULT: u8 = 0b1110_1100;
/// CONFIG2: internal test signal source, amplitude and frequency OR'd in
const CONFIG2_TEST_BASE: u8 = 0b1101_0000;
const CONFIG2_AMP_MASK: u8 = 0b0000_0100;
const CONFIG2_FREQ_MASK: u8 = 0b0000_0011;
/// MISC1: SRB1 switch closed for every channel of the chip
const MISC1_SRB1: u8 = 0x20;
const LOFF_CONFIG_MASK: u8 = 0b0000_1111;

/// Status bytes plus eight 24-bit channel words
const FRAME_BYTES: usize = 27;

/// Where a chip lives on the board.
#[derive(Copy, Clone, Debug)]
struct ChipSlot {
    chip: Chip,
    /// Index into the chip-select array
    cs: usize,
    /// First 0-based logical channel on this chip
    first_channel: usize,
    /// Address of this chip's first channel register
    chset_base: u8,
}

const CHIP_SLOTS: [ChipSlot; 2] = [
    ChipSlot { chip: Chip::Primary, cs: 0, first_channel: 0, chset_base: regs::CH1SET },
    ChipSlot { chip: Chip::Secondary, cs: 1, first_channel: CHANNELS_PER_CHIP, chset_base: regs::CH1SET },
];

impl ChipSlot {
    const fn of(chip: Chip) -> Self {
        CHIP_SLOTS[chip.index()]
    }

    fn channels(self) -> core::ops::Range<usize> {
        self.first_channel..self.first_channel + CHANNELS_PER_CHIP
    }
}

/// Board-level configuration applied on every initialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoardConfig {
    /// Output data rate for both chips
    pub sample_rate: SampleRate,
}

impl BoardConfig {
    /// 250 SPS, the power-on rate
    pub const DEFAULT: Self = Self { sample_rate: SampleRate::Sps250 };

    /// 1 kSPS for high-bandwidth recordings
    pub const FAST_1K: Self = Self { sample_rate: SampleRate::Sps1000 };
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Latest acquisition results for one chip.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChipFrame {
    /// 24-bit status word (`1100 | LOFF_STATP | LOFF_STATN | GPIO[7:4]`)
    pub status: [u8; 3],
    /// Channel words as clocked out of the chip
    pub raw: [u8; 24],
    /// Sign-extended channel values
    pub current: [i32; CHANNELS_PER_CHIP],
    /// Values from the previous acquisition
    pub last: [i32; CHANNELS_PER_CHIP],
    /// Truncating mean of `last` and `current` (pass-through on the first frame)
    pub mean: [i32; CHANNELS_PER_CHIP],
    /// `mean` as big-endian 24-bit words
    pub mean_raw: [u8; 24],
}

#[cfg(feature = "defmt")]
impl defmt::Format for ChipFrame {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "status={:x} current={}", self.status, self.current);
    }
}

/// Reject addresses outside the register map.
fn check_register<E>(addr: u8) -> Result<(), Ads1299Error<E>> {
    if usize::from(addr) < regs::COUNT {
        Ok(())
    } else {
        Err(Ads1299Error::InvalidRegister { addr })
    }
}

/// Driver for the ADS1299 pair.
pub struct Ads1299Pair<SPI, CS, RST, D> {
    spi: SPI,
    /// Chip select lines, indexed by [`ChipSlot::cs`]
    cs: [CS; 2],
    reset: RST,
    delay: D,
    config: BoardConfig,
    daisy_present: bool,
    streaming: bool,
    first_frame: bool,
    channel_settings: [ChannelSettings; MAX_CHANNELS],
    lead_off: [LeadOffSettings; MAX_CHANNELS],
    use_in_bias: [bool; MAX_CHANNELS],
    use_srb2: [bool; MAX_CHANNELS],
    use_srb1: [bool; 2],
    registers: [[u8; regs::COUNT]; 2],
    frames: [ChipFrame; 2],
}

impl<SPI, CS, RST, D, E> Ads1299Pair<SPI, CS, RST, D>
where
    SPI: SpiBus<u8, Error = E>,
    CS: OutputPin,
    RST: OutputPin,
    D: DelayNs,
{
    /// Create a new driver. Nothing is sent until [`initialize`](Self::initialize).
    #[must_use]
    pub fn new(spi: SPI, cs: [CS; 2], reset: RST, delay: D, config: BoardConfig) -> Self {
        Self {
            spi,
            cs,
            reset,
            delay,
            config,
            daisy_present: false,
            streaming: false,
            first_frame: true,
            channel_settings: [ChannelSettings::DEFAULT; MAX_CHANNELS],
            lead_off: [LeadOffSettings::OFF; MAX_CHANNELS],
            use_in_bias: [true; MAX_CHANNELS],
            use_srb2: [true; MAX_CHANNELS],
            use_srb1: [false; 2],
            registers: [[0; regs::COUNT]; 2],
            frames: [ChipFrame::default(), ChipFrame::default()],
        }
    }

    /// Release the bus and pins.
    pub fn release(self) -> (SPI, [CS; 2], RST, D) {
        (self.spi, self.cs, self.reset, self.delay)
    }

    // ------------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------------

    /// Whether the daisy chip answered the last probe.
    #[inline]
    pub fn daisy_present(&self) -> bool {
        self.daisy_present
    }

    /// Logical channel count: 16 with the daisy chip, 8 without.
    #[inline]
    pub fn num_channels(&self) -> usize {
        if self.daisy_present {
            MAX_CHANNELS
        } else {
            CHANNELS_PER_CHIP
        }
    }

    /// Whether continuous acquisition is running.
    #[inline]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Current output data rate.
    #[inline]
    pub fn sample_rate(&self) -> SampleRate {
        self.config.sample_rate
    }

    /// Settings table entry for a 1-based channel.
    pub fn channel_settings(&self, channel: u8) -> Option<&ChannelSettings> {
        channel.checked_sub(1).and_then(|i| self.channel_settings.get(usize::from(i)))
    }

    /// Replace a channel's table entry without touching the hardware.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::InvalidChannel`] outside 1-16.
    pub fn set_channel_settings(&mut self, channel: u8, settings: ChannelSettings) -> Result<(), Ads1299Error<E>> {
        let index = Self::table_index(channel)?;
        self.channel_settings[index] = settings;
        Ok(())
    }

    /// Lead-off flags for a 1-based channel.
    pub fn lead_off_settings(&self, channel: u8) -> Option<&LeadOffSettings> {
        channel.checked_sub(1).and_then(|i| self.lead_off.get(usize::from(i)))
    }

    /// Replace a channel's lead-off flags without touching the hardware.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::InvalidChannel`] outside 1-16.
    pub fn set_lead_off_settings(&mut self, channel: u8, settings: LeadOffSettings) -> Result<(), Ads1299Error<E>> {
        let index = Self::table_index(channel)?;
        self.lead_off[index] = settings;
        Ok(())
    }

    /// Remembered bias membership for a 1-based channel.
    pub fn uses_bias(&self, channel: u8) -> bool {
        Self::table_index(channel).is_ok_and(|i| self.use_in_bias[i])
    }

    /// Remembered SRB2 membership for a 1-based channel.
    pub fn uses_srb2(&self, channel: u8) -> bool {
        Self::table_index(channel).is_ok_and(|i| self.use_srb2[i])
    }

    /// Whether SRB1 is closed on a chip.
    pub fn uses_srb1(&self, chip: Chip) -> bool {
        self.use_srb1[chip.index()]
    }

    /// Register mirror for one chip.
    pub fn registers(&self, chip: Chip) -> &[u8; regs::COUNT] {
        &self.registers[chip.index()]
    }

    /// Latest acquisition results for one chip.
    pub fn frame(&self, chip: Chip) -> &ChipFrame {
        &self.frames[chip.index()]
    }

    fn table_index(channel: u8) -> Result<usize, Ads1299Error<E>> {
        match usize::from(channel) {
            n @ 1..=MAX_CHANNELS => Ok(n - 1),
            _ => Err(Ads1299Error::InvalidChannel { channel }),
        }
    }

    /// Route a 1-based channel to its chip. `None` for out-of-range channels
    /// and for daisy channels without a daisy chip.
    fn locate(&self, channel: u8) -> Option<(ChipSlot, usize)> {
        let index = Self::table_index(channel).ok()?;
        let slot = ChipSlot::of(Chip::for_channel_index(index));
        if slot.chip == Chip::Secondary && !self.daisy_present {
            return None;
        }
        Some((slot, index))
    }

    /// Chips that currently exist on the bus.
    fn present_chips(&self) -> &'static [Chip] {
        const PRIMARY_ONLY: [Chip; 1] = [Chip::Primary];
        if self.daisy_present {
            &Chip::ALL
        } else {
            &PRIMARY_ONLY
        }
    }

    // ------------------------------------------------------------------------
    // Bus primitives
    // ------------------------------------------------------------------------

    fn select(&mut self, target: ChipSelect) {
        for slot in &CHIP_SLOTS {
            if target.includes(slot.chip) {
                let _ = self.cs[slot.cs].set_low();
            }
        }
    }

    fn deselect(&mut self, target: ChipSelect) -> Result<(), Ads1299Error<E>> {
        self.spi.flush().map_err(Ads1299Error::Spi)?;
        for slot in &CHIP_SLOTS {
            if target.includes(slot.chip) {
                let _ = self.cs[slot.cs].set_high();
            }
        }
        Ok(())
    }

    /// Exchange one byte.
    fn xfer(&mut self, byte: u8) -> Result<u8, Ads1299Error<E>> {
        let mut buf = [byte];
        self.spi.transfer_in_place(&mut buf).map_err(Ads1299Error::Spi)?;
        Ok(buf[0])
    }

    /// Send a single opcode in its own chip-select scope.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn send_command(&mut self, target: ChipSelect, opcode: u8) -> Result<(), Ads1299Error<E>> {
        self.select(target);
        self.xfer(opcode)?;
        self.deselect(target)
    }

    /// RESET opcode; the chip needs 18 tCLK before CS may rise.
    fn reset_opcode(&mut self, target: ChipSelect) -> Result<(), Ads1299Error<E>> {
        self.select(target);
        self.xfer(opcodes::RESET)?;
        self.delay.delay_us(timing::RESET_OPCODE_US);
        self.deselect(target)
    }

    /// Leave continuous-read mode and wait the settle time.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn sdatac(&mut self, target: ChipSelect) -> Result<(), Ads1299Error<E>> {
        self.send_command(target, opcodes::SDATAC)?;
        self.delay.delay_us(timing::SDATAC_SETTLE_US);
        Ok(())
    }

    /// Read one register and update the mirror.
    ///
    /// The chip must be out of continuous-read mode.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::InvalidRegister`] for an address past
    /// [`regs::COUNT`], [`Ads1299Error::Spi`] on bus failure.
    pub fn read_register(&mut self, chip: Chip, addr: u8) -> Result<u8, Ads1299Error<E>> {
        check_register(addr)?;
        let target = ChipSelect::from(chip);
        self.select(target);
        self.xfer(opcodes::RREG | addr)?;
        self.xfer(0x00)?;
        let value = self.xfer(0x00)?;
        self.deselect(target)?;
        self.registers[chip.index()][usize::from(addr)] = value;
        Ok(value)
    }

    /// Write one register on every selected chip and update their mirrors.
    ///
    /// The chips must be out of continuous-read mode.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::InvalidRegister`] for an address past
    /// [`regs::COUNT`], [`Ads1299Error::Spi`] on bus failure.
    pub fn write_register(&mut self, target: ChipSelect, addr: u8, value: u8) -> Result<(), Ads1299Error<E>> {
        check_register(addr)?;
        self.select(target);
        self.xfer(opcodes::WREG | addr)?;
        self.xfer(0x00)?;
        self.xfer(value)?;
        self.deselect(target)?;
        for chip in Chip::ALL {
            if target.includes(chip) {
                self.registers[chip.index()][usize::from(addr)] = value;
            }
        }
        Ok(())
    }

    /// Read-modify-write one bit of a bitmask register.
    fn update_bit(&mut self, chip: Chip, addr: u8, bit: usize, set: bool) -> Result<(), Ads1299Error<E>> {
        let mut value = self.read_register(chip, addr)?;
        if set {
            value |= 1 << bit;
        } else {
            value &= !(1 << bit);
        }
        self.write_register(chip.into(), addr, value)?;
        self.delay.delay_ms(timing::REGISTER_MS);
        Ok(())
    }

    /// Read a chip's ID register.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn device_id(&mut self, chip: Chip) -> Result<u8, Ads1299Error<E>> {
        self.read_register(chip, regs::ID)
    }

    // ------------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------------

    /// Full bring-up: hardware reset, per-chip reset, daisy probe and
    /// default channel configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn initialize(&mut self) -> Result<(), Ads1299Error<E>> {
        let rate = self.config.sample_rate.code();

        self.delay.delay_ms(timing::POWER_ON_MS);
        let _ = self.reset.set_low();
        self.delay.delay_us(timing::RESET_PULSE_US);
        let _ = self.reset.set_high();
        self.delay.delay_us(timing::RESET_RECOVERY_US);
        self.delay.delay_ms(timing::POST_RESET_MS);

        self.reset_chip(Chip::Primary)?;
        self.delay.delay_ms(timing::CHIP_GAP_MS);
        self.write_register(ChipSelect::Primary, regs::CONFIG1, CONFIG1_DAISY | rate)?;
        self.delay.delay_ms(timing::CLOCK_SETTLE_MS);

        self.reset_chip(Chip::Secondary)?;
        self.delay.delay_ms(timing::CHIP_GAP_MS);

        self.daisy_present = self.probe_daisy()?;
        if self.daisy_present {
            self.write_register(ChipSelect::Secondary, regs::CONFIG1, CONFIG1_DAISY_NOT | rate)?;
            self.delay.delay_ms(timing::CLOCK_SETTLE_MS);
        } else {
            self.write_register(ChipSelect::Primary, regs::CONFIG1, CONFIG1_DAISY_NOT | rate)?;
        }

        self.load_default_settings();
        self.write_all_channel_settings()?;

        self.write_register(ChipSelect::Both, regs::CONFIG3, CONFIG3_DEFAULT)?;
        self.delay.delay_ms(timing::REGISTER_MS);

        self.lead_off = [LeadOffSettings::OFF; MAX_CHANNELS];
        self.first_frame = true;
        self.streaming = false;

        info!(
            "ADS1299 initialized: {} channels at {} Hz",
            self.num_channels(),
            self.config.sample_rate.hz()
        );
        Ok(())
    }

    /// RESET + SDATAC one chip, then power down its channels.
    ///
    /// Daisy channels are only touched once a daisy chip has been detected.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn reset_chip(&mut self, chip: Chip) -> Result<(), Ads1299Error<E>> {
        let target = ChipSelect::from(chip);
        self.reset_opcode(target)?;
        self.sdatac(target)?;
        self.delay.delay_ms(timing::CHIP_RESET_MS);

        #[allow(clippy::cast_possible_truncation)]
        let first = ChipSlot::of(chip).first_channel as u8;
        for channel in first + 1..=first + 8 {
            self.deactivate_channel(channel)?;
        }
        Ok(())
    }

    /// Read the secondary chip's ID; the daisy module is present iff it
    /// matches [`ADS_ID`].
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn probe_daisy(&mut self) -> Result<bool, Ads1299Error<E>> {
        let id = self.read_register(Chip::Secondary, regs::ID)?;
        debug!("daisy probe read ID 0x{id:02X}");
        Ok(id == ADS_ID)
    }

    fn load_default_settings(&mut self) {
        for index in 0..self.num_channels() {
            self.channel_settings[index] = ChannelSettings::DEFAULT;
            self.use_in_bias[index] = true;
            self.use_srb2[index] = true;
        }
        self.use_srb1 = [false; 2];
    }

    /// Change the output data rate and re-run [`initialize`](Self::initialize).
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn set_sample_rate(&mut self, rate: SampleRate) -> Result<(), Ads1299Error<E>> {
        self.config.sample_rate = rate;
        self.initialize()
    }

    /// Change the output data rate by register code.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::InvalidSampleRate`] for codes above 6 without
    /// touching the bus, or [`Ads1299Error::Spi`] on bus failure.
    pub fn set_sample_rate_code(&mut self, code: u8) -> Result<(), Ads1299Error<E>> {
        let rate = SampleRate::from_code(code).ok_or(Ads1299Error::InvalidSampleRate { code })?;
        self.set_sample_rate(rate)
    }

    /// Re-initialize and arm lead-off detection at 6 nA / 31.2 Hz.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn soft_reset(&mut self) -> Result<(), Ads1299Error<E>> {
        self.initialize()?;
        self.delay.delay_ms(timing::SOFT_RESET_MS);
        self.configure_lead_off_detection(LeadOffCurrent::Na6, LeadOffFrequency::Ac31_2Hz)
    }

    // ------------------------------------------------------------------------
    // Daisy module
    // ------------------------------------------------------------------------

    /// Drop to 8 channels and stop clocking the daisy chip. Returns whether
    /// a daisy chip was attached.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn remove_daisy(&mut self) -> Result<bool, Ads1299Error<E>> {
        if !self.daisy_present {
            return Ok(false);
        }
        let rate = self.config.sample_rate.code();
        self.write_register(ChipSelect::Primary, regs::CONFIG1, CONFIG1_DAISY_NOT | rate)?;
        self.daisy_present = false;
        info!("daisy removed, {} channels", self.num_channels());
        Ok(true)
    }

    /// Enable the clock output and probe for the daisy chip again. Returns
    /// whether it is now present.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn attach_daisy(&mut self) -> Result<bool, Ads1299Error<E>> {
        let rate = self.config.sample_rate.code();
        self.write_register(ChipSelect::Primary, regs::CONFIG1, CONFIG1_DAISY | rate)?;
        self.delay.delay_ms(timing::CLOCK_SETTLE_MS);

        // The daisy chip may still be in continuous-read mode
        self.sdatac(ChipSelect::Secondary)?;
        self.daisy_present = self.probe_daisy()?;
        if self.daisy_present {
            self.write_register(ChipSelect::Secondary, regs::CONFIG1, CONFIG1_DAISY_NOT | rate)?;
        } else {
            self.write_register(ChipSelect::Primary, regs::CONFIG1, CONFIG1_DAISY_NOT | rate)?;
        }
        info!("daisy attach: {} channels", self.num_channels());
        Ok(self.daisy_present)
    }

    // ------------------------------------------------------------------------
    // Channel configuration
    // ------------------------------------------------------------------------

    /// Power down a channel and drop it from bias, SRB2 and lead-off.
    ///
    /// The remembered bias and SRB2 membership is kept so that
    /// [`activate_channel`](Self::activate_channel) can restore it.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn deactivate_channel(&mut self, channel: u8) -> Result<(), Ads1299Error<E>> {
        let Some((slot, index)) = self.locate(channel) else {
            return Ok(());
        };
        let bit = index - slot.first_channel;
        #[allow(clippy::cast_possible_truncation)]
        let chset = slot.chset_base + bit as u8;

        self.sdatac(slot.chip.into())?;
        self.delay.delay_ms(timing::REGISTER_MS);

        let mut setting = self.read_register(slot.chip, chset)?;
        setting |= ChannelSettings::PD_BIT;
        setting &= !ChannelSettings::SRB2_BIT;
        self.write_register(slot.chip.into(), chset, setting)?;
        self.delay.delay_ms(timing::REGISTER_MS);

        self.update_bit(slot.chip, regs::BIAS_SENSP, bit, false)?;
        self.update_bit(slot.chip, regs::BIAS_SENSN, bit, false)?;

        self.channel_settings[index].power_down = true;
        self.lead_off[index] = LeadOffSettings::OFF;
        self.change_lead_off_detect(channel)
    }

    /// Power up a channel with its table gain and input, restoring the
    /// remembered bias and SRB2 membership and the chip's SRB1 state.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn activate_channel(&mut self, channel: u8) -> Result<(), Ads1299Error<E>> {
        let Some((slot, index)) = self.locate(channel) else {
            return Ok(());
        };
        let bit = index - slot.first_channel;
        #[allow(clippy::cast_possible_truncation)]
        let chset = slot.chset_base + bit as u8;

        self.sdatac(slot.chip.into())?;
        self.delay.delay_ms(timing::REGISTER_MS);

        self.channel_settings[index].power_down = false;
        let settings = self.channel_settings[index];
        let mut setting = settings.gain.bits() | settings.input.code();
        if self.use_srb2[index] {
            setting |= ChannelSettings::SRB2_BIT;
        }
        self.write_register(slot.chip.into(), chset, setting)?;

        let bias = self.use_in_bias[index];
        self.update_bit(slot.chip, regs::BIAS_SENSP, bit, bias)?;
        self.update_bit(slot.chip, regs::BIAS_SENSN, bit, bias)?;

        let misc1 = if self.use_srb1[slot.chip.index()] { MISC1_SRB1 } else { 0x00 };
        self.write_register(slot.chip.into(), regs::MISC1, misc1)
    }

    /// Write one channel's `CHnSET` byte and bias membership from the table.
    /// The channel's SRB1 request becomes the chip-wide SRB1 state.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn write_channel_settings(&mut self, channel: u8) -> Result<(), Ads1299Error<E>> {
        let Some((slot, index)) = self.locate(channel) else {
            return Ok(());
        };
        self.sdatac(slot.chip.into())?;
        self.delay.delay_ms(timing::REGISTER_MS);

        self.write_channel_registers(slot, index)?;
        let srb1 = self.channel_settings[index].srb1;
        self.apply_srb1(slot, srb1)
    }

    /// Write every channel of every present chip from the table.
    ///
    /// SRB1 is decided per chip: closed if any of the chip's channels asks
    /// for it.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn write_all_channel_settings(&mut self) -> Result<(), Ads1299Error<E>> {
        for &chip in self.present_chips() {
            let slot = ChipSlot::of(chip);
            self.sdatac(chip.into())?;
            self.delay.delay_ms(timing::REGISTER_MS);

            let mut srb1 = false;
            for index in slot.channels() {
                self.write_channel_registers(slot, index)?;
                srb1 |= self.channel_settings[index].srb1;
            }
            self.apply_srb1(slot, srb1)?;
        }
        debug!("wrote settings for {} channels", self.num_channels());
        Ok(())
    }

    /// `CHnSET` plus the bias bits for one channel.
    ///
    /// A powered-down channel stays off SRB2 and out of bias; its
    /// remembered membership is still updated for the next activation.
    fn write_channel_registers(&mut self, slot: ChipSlot, index: usize) -> Result<(), Ads1299Error<E>> {
        let bit = index - slot.first_channel;
        #[allow(clippy::cast_possible_truncation)]
        let chset = slot.chset_base + bit as u8;
        let settings = self.channel_settings[index];

        self.use_srb2[index] = settings.srb2;
        let mut setting = settings.register_value();
        if settings.power_down {
            setting &= !ChannelSettings::SRB2_BIT;
        }
        self.write_register(slot.chip.into(), chset, setting)?;

        self.use_in_bias[index] = settings.bias;
        let bias = settings.bias && !settings.power_down;
        self.update_bit(slot.chip, regs::BIAS_SENSP, bit, bias)?;
        self.update_bit(slot.chip, regs::BIAS_SENSN, bit, bias)
    }

    /// Propagate an SRB1 decision to every channel of the chip and `MISC1`.
    fn apply_srb1(&mut self, slot: ChipSlot, closed: bool) -> Result<(), Ads1299Error<E>> {
        for index in slot.channels() {
            self.channel_settings[index].srb1 = closed;
        }
        self.use_srb1[slot.chip.index()] = closed;
        let misc1 = if closed { MISC1_SRB1 } else { 0x00 };
        self.write_register(slot.chip.into(), regs::MISC1, misc1)
    }

    /// Push one channel's lead-off flags into `LOFF_SENSP`/`LOFF_SENSN`.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn change_lead_off_detect(&mut self, channel: u8) -> Result<(), Ads1299Error<E>> {
        let Some((slot, index)) = self.locate(channel) else {
            return Ok(());
        };
        self.sdatac(slot.chip.into())?;
        self.delay.delay_ms(timing::REGISTER_MS);

        let bit = index - slot.first_channel;
        let flags = self.lead_off[index];
        let mut p = self.read_register(slot.chip, regs::LOFF_SENSP)?;
        let mut n = self.read_register(slot.chip, regs::LOFF_SENSN)?;
        set_bit(&mut p, bit, flags.p);
        set_bit(&mut n, bit, flags.n);
        self.write_register(slot.chip.into(), regs::LOFF_SENSP, p)?;
        self.write_register(slot.chip.into(), regs::LOFF_SENSN, n)
    }

    /// Push every channel's lead-off flags.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn change_all_lead_off_detect(&mut self) -> Result<(), Ads1299Error<E>> {
        for &chip in self.present_chips() {
            let slot = ChipSlot::of(chip);
            self.sdatac(chip.into())?;
            self.delay.delay_ms(timing::REGISTER_MS);

            let mut p = self.read_register(chip, regs::LOFF_SENSP)?;
            let mut n = self.read_register(chip, regs::LOFF_SENSN)?;
            for index in slot.channels() {
                let bit = index - slot.first_channel;
                set_bit(&mut p, bit, self.lead_off[index].p);
                set_bit(&mut n, bit, self.lead_off[index].n);
            }
            self.write_register(chip.into(), regs::LOFF_SENSP, p)?;
            self.write_register(chip.into(), regs::LOFF_SENSN, n)?;
        }
        Ok(())
    }

    /// Restore default settings on every channel, clear lead-off and open SRB1.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn set_channels_to_default(&mut self) -> Result<(), Ads1299Error<E>> {
        self.load_default_settings();
        self.write_all_channel_settings()?;

        for index in 0..self.num_channels() {
            self.lead_off[index] = LeadOffSettings::OFF;
        }
        self.change_all_lead_off_detect()?;

        for &chip in self.present_chips() {
            self.write_register(chip.into(), regs::MISC1, 0x00)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Test signals and lead-off excitation
    // ------------------------------------------------------------------------

    /// Program the internal test signal. `None` keeps the chip's current field.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn configure_internal_test_signal(
        &mut self,
        amplitude: Option<TestAmplitude>,
        frequency: Option<TestFrequency>,
    ) -> Result<(), Ads1299Error<E>> {
        for &chip in self.present_chips() {
            let current = if amplitude.is_none() || frequency.is_none() {
                self.read_register(chip, regs::CONFIG2)?
            } else {
                0
            };
            let amp = amplitude.map_or(current & CONFIG2_AMP_MASK, |a| a as u8);
            let freq = frequency.map_or(current & CONFIG2_FREQ_MASK, |f| f as u8);
            self.write_register(chip.into(), regs::CONFIG2, CONFIG2_TEST_BASE | freq | amp)?;
            self.delay.delay_ms(timing::REGISTER_MS);
        }
        Ok(())
    }

    /// Route every logical channel's input mux to `input`.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn change_input_type(&mut self, input: InputType) -> Result<(), Ads1299Error<E>> {
        for index in 0..self.num_channels() {
            self.channel_settings[index].input = input;
        }
        self.write_all_channel_settings()
    }

    /// Test-signal routing used by `'0' 'p' '-' '=' '[' ']'`. Stream-safe.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn activate_all_channels_to_test_condition(
        &mut self,
        input: InputType,
        amplitude: Option<TestAmplitude>,
        frequency: Option<TestFrequency>,
    ) -> Result<(), Ads1299Error<E>> {
        self.stream_safe(|board| {
            board.configure_internal_test_signal(amplitude, frequency)?;
            board.change_input_type(input)
        })
    }

    /// Set the lead-off excitation current and frequency on every present chip.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn configure_lead_off_detection(
        &mut self,
        current: LeadOffCurrent,
        frequency: LeadOffFrequency,
    ) -> Result<(), Ads1299Error<E>> {
        for &chip in self.present_chips() {
            let mut setting = self.read_register(chip, regs::LOFF)?;
            setting &= !LOFF_CONFIG_MASK;
            setting |= current as u8 | frequency as u8;
            self.write_register(chip.into(), regs::LOFF, setting)?;
            self.delay.delay_ms(timing::REGISTER_MS);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    /// Enter continuous-read mode and start conversions on both chips.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn stream_start(&mut self) -> Result<(), Ads1299Error<E>> {
        self.streaming = true;
        self.first_frame = true;
        self.send_command(ChipSelect::Both, opcodes::RDATAC)?;
        self.delay.delay_us(timing::SDATAC_SETTLE_US);
        self.send_command(ChipSelect::Both, opcodes::START)?;
        debug!("stream started");
        Ok(())
    }

    /// Stop conversions and leave continuous-read mode on both chips.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn stream_stop(&mut self) -> Result<(), Ads1299Error<E>> {
        self.streaming = false;
        self.send_command(ChipSelect::Both, opcodes::STOP)?;
        self.delay.delay_us(timing::SDATAC_SETTLE_US);
        self.sdatac(ChipSelect::Both)?;
        debug!("stream stopped");
        Ok(())
    }

    /// Run a configuration change with the stream paused around it.
    ///
    /// # Errors
    ///
    /// Propagates the error of the stop, the change or the restart.
    pub fn stream_safe<F>(&mut self, f: F) -> Result<(), Ads1299Error<E>>
    where
        F: FnOnce(&mut Self) -> Result<(), Ads1299Error<E>>,
    {
        let was_streaming = self.streaming;
        if was_streaming {
            self.stream_stop()?;
        }
        f(self)?;
        if was_streaming {
            self.stream_start()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------------

    /// Read one conversion from every present chip.
    ///
    /// Clears `drdy` before touching the bus. With the daisy chip present
    /// the mean of this and the previous sample is computed, except on the
    /// first frame after [`stream_start`](Self::stream_start).
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure. Corrupt frames are not
    /// detected here.
    pub fn update_channel_data(&mut self, drdy: &DataReady) -> Result<(), Ads1299Error<E>> {
        drdy.clear();

        let average = self.daisy_present && !self.first_frame;
        self.read_frame(Chip::Primary, average)?;
        if self.daisy_present {
            self.read_frame(Chip::Secondary, average)?;
        }
        self.first_frame = false;
        Ok(())
    }

    fn read_frame(&mut self, chip: Chip, average: bool) -> Result<(), Ads1299Error<E>> {
        let target = ChipSelect::from(chip);
        let mut bytes = [0u8; FRAME_BYTES];

        self.select(target);
        for byte in &mut bytes {
            *byte = self.xfer(0x00)?;
        }
        self.deselect(target)?;

        let frame = &mut self.frames[chip.index()];
        frame.last = frame.current;
        frame.status.copy_from_slice(&bytes[..3]);
        frame.raw.copy_from_slice(&bytes[3..]);
        for (value, word) in frame.current.iter_mut().zip(frame.raw.chunks_exact(3)) {
            *value = sign_extend_24([word[0], word[1], word[2]]);
        }

        if average {
            for (i, word) in frame.mean_raw.chunks_exact_mut(3).enumerate() {
                frame.mean[i] = (frame.last[i] + frame.current[i]) / 2;
                word.copy_from_slice(&to_be_24(frame.mean[i]));
            }
        } else {
            frame.mean = frame.current;
            frame.mean_raw = frame.raw;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Read back every register of every present chip and print them as
    /// `NAME, addr, value, b7..b0` lines.
    ///
    /// # Errors
    ///
    /// Returns [`Ads1299Error::Spi`] on bus failure.
    pub fn dump_registers<W: fmt::Write>(&mut self, out: &mut W) -> Result<(), Ads1299Error<E>> {
        for &chip in self.present_chips() {
            self.sdatac(chip.into())?;
            let _ = writeln!(out, "{chip} ADS Registers");
            for (addr, name) in regs::NAMES.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let value = self.read_register(chip, addr as u8)?;
                let _ = write!(out, "{name}, {addr:02X}, {value:02X}");
                for bit in (0..8).rev() {
                    let _ = write!(out, ", {}", (value >> bit) & 1);
                }
                let _ = writeln!(out);
            }
        }
        Ok(())
    }
}

fn set_bit(value: &mut u8, bit: usize, on: bool) {
    if on {
        *value |= 1 << bit;
    } else {
        *value &= !(1 << bit);
    }
}
