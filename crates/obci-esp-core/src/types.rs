//! Core data types for the ADS1299 front-end
//!
//! These types describe the board topology (which chip a transaction
//! targets), the per-channel configuration that is mirrored into the
//! `CHnSET`, `BIAS_SENSx` and `LOFF_SENSx` registers, and the board-level
//! modes the command protocol can switch between.
//!
//! All register-facing enums carry their datasheet code as the `repr(u8)`
//! discriminant, already positioned in the bit field they occupy.

use core::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Topology
// ============================================================================

/// Number of channels on a single ADS1299.
pub const CHANNELS_PER_CHIP: usize = 8;

/// Number of logical channels with the daisy module attached.
pub const MAX_CHANNELS: usize = 16;

/// A single physical converter chip.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chip {
    /// On-board chip, channels 1-8. Always present.
    Primary,
    /// Daisy module chip, channels 9-16.
    Secondary,
}

impl Chip {
    /// Both chips, in bus order.
    pub const ALL: [Self; 2] = [Self::Primary, Self::Secondary];

    /// Index into per-chip tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
        }
    }

    /// Chip owning a 0-based logical channel index.
    #[must_use]
    pub const fn for_channel_index(index: usize) -> Self {
        if index < CHANNELS_PER_CHIP {
            Self::Primary
        } else {
            Self::Secondary
        }
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("Board"),
            Self::Secondary => f.write_str("Daisy"),
        }
    }
}

/// Target of a bus transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChipSelect {
    /// On-board chip only
    Primary,
    /// Daisy chip only
    Secondary,
    /// Both chip-select lines asserted together (broadcast writes/commands)
    Both,
}

impl ChipSelect {
    /// Whether this selection asserts the given chip's select line.
    #[inline]
    #[must_use]
    pub const fn includes(self, chip: Chip) -> bool {
        matches!(
            (self, chip),
            (Self::Both, _) | (Self::Primary, Chip::Primary) | (Self::Secondary, Chip::Secondary)
        )
    }
}

impl From<Chip> for ChipSelect {
    fn from(chip: Chip) -> Self {
        match chip {
            Chip::Primary => Self::Primary,
            Chip::Secondary => Self::Secondary,
        }
    }
}

// ============================================================================
// Sample rate
// ============================================================================

/// Output data rate, encoded as the `CONFIG1.DR` field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum SampleRate {
    /// 16 kSPS
    Sps16000 = 0,
    /// 8 kSPS
    Sps8000 = 1,
    /// 4 kSPS
    Sps4000 = 2,
    /// 2 kSPS
    Sps2000 = 3,
    /// 1 kSPS
    Sps1000 = 4,
    /// 500 SPS
    Sps500 = 5,
    /// 250 SPS (power-on default)
    #[default]
    Sps250 = 6,
}

impl SampleRate {
    /// Decode a `CONFIG1.DR` code (0..=6).
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Sps16000),
            1 => Some(Self::Sps8000),
            2 => Some(Self::Sps4000),
            3 => Some(Self::Sps2000),
            4 => Some(Self::Sps1000),
            5 => Some(Self::Sps500),
            6 => Some(Self::Sps250),
            _ => None,
        }
    }

    /// Register code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn hz(self) -> u16 {
        match self {
            Self::Sps16000 => 16000,
            Self::Sps8000 => 8000,
            Self::Sps4000 => 4000,
            Self::Sps2000 => 2000,
            Self::Sps1000 => 1000,
            Self::Sps500 => 500,
            Self::Sps250 => 250,
        }
    }
}

// ============================================================================
// Channel configuration
// ============================================================================

/// Programmable gain, pre-shifted into `CHnSET[6:4]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum Gain {
    /// 1x gain
    X1 = 0x00,
    /// 2x gain
    X2 = 0x10,
    /// 4x gain
    X4 = 0x20,
    /// 6x gain
    X6 = 0x30,
    /// 8x gain
    X8 = 0x40,
    /// 12x gain
    X12 = 0x50,
    /// 24x gain (default for EEG)
    #[default]
    X24 = 0x60,
}

impl Gain {
    /// Decode a 3-bit gain index (0..=6). Anything larger is the maximum gain.
    #[must_use]
    pub const fn from_index(index: u8) -> Self {
        match index {
            0 => Self::X1,
            1 => Self::X2,
            2 => Self::X4,
            3 => Self::X6,
            4 => Self::X8,
            5 => Self::X12,
            _ => Self::X24,
        }
    }

    /// Index as used by the ASCII protocol (`'0'..='6'`).
    #[inline]
    #[must_use]
    pub const fn index(self) -> u8 {
        (self as u8) >> 4
    }

    /// Bits to OR into `CHnSET`.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Get the gain multiplier
    #[must_use]
    pub const fn multiplier(self) -> u8 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X4 => 4,
            Self::X6 => 6,
            Self::X8 => 8,
            Self::X12 => 12,
            Self::X24 => 24,
        }
    }
}

/// Channel input multiplexer, `CHnSET[2:0]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum InputType {
    /// Normal electrode input
    #[default]
    Normal = 0,
    /// Input shorted (offset / noise measurement)
    Shorted = 1,
    /// Used with `BIAS_MEAS` for bias measurement
    BiasMeasure = 2,
    /// MVDD for supply measurement
    Mvdd = 3,
    /// Temperature sensor
    Temperature = 4,
    /// Internal test signal
    TestSignal = 5,
    /// Positive electrode is the bias driver
    BiasDrp = 6,
    /// Negative electrode is the bias driver
    BiasDrn = 7,
}

impl InputType {
    /// Decode a mux code. Only the low three bits belong to the mux field.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code & 0x07 {
            0 => Self::Normal,
            1 => Self::Shorted,
            2 => Self::BiasMeasure,
            3 => Self::Mvdd,
            4 => Self::Temperature,
            5 => Self::TestSignal,
            6 => Self::BiasDrp,
            _ => Self::BiasDrn,
        }
    }

    /// Register code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// The six independent settings of one channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Channel powered down
    pub power_down: bool,
    /// Programmable gain
    pub gain: Gain,
    /// Input mux selection
    pub input: InputType,
    /// Included in bias derivation (`BIAS_SENSP`/`BIAS_SENSN`)
    pub bias: bool,
    /// P input connected to SRB2
    pub srb2: bool,
    /// SRB1 requested (chip-wide, see `MISC1`)
    pub srb1: bool,
}

impl ChannelSettings {
    /// Power-up configuration: on, x24, normal input, in bias, on SRB2, off SRB1.
    pub const DEFAULT: Self = Self {
        power_down: false,
        gain: Gain::X24,
        input: InputType::Normal,
        bias: true,
        srb2: true,
        srb1: false,
    };

    /// `CHnSET` power-down bit
    pub const PD_BIT: u8 = 0x80;
    /// `CHnSET` SRB2 bit
    pub const SRB2_BIT: u8 = 0x08;

    /// Compose the `CHnSET` register value.
    #[must_use]
    pub const fn register_value(&self) -> u8 {
        let mut value = self.gain.bits() | self.input.code();
        if self.power_down {
            value |= Self::PD_BIT;
        }
        if self.srb2 {
            value |= Self::SRB2_BIT;
        }
        value
    }

    /// ASCII report used by the `'D'` command, one digit per setting.
    #[must_use]
    pub fn ascii(&self) -> [u8; 6] {
        let digit = |b: bool| if b { b'1' } else { b'0' };
        [
            digit(self.power_down),
            b'0' + self.gain.index(),
            b'0' + self.input.code(),
            digit(self.bias),
            digit(self.srb2),
            digit(self.srb1),
        ]
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Lead-off detection flags for one channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct LeadOffSettings {
    /// P-side current source enabled (`LOFF_SENSP`)
    pub p: bool,
    /// N-side current source enabled (`LOFF_SENSN`)
    pub n: bool,
}

impl LeadOffSettings {
    /// Both sides off
    pub const OFF: Self = Self { p: false, n: false };
}

// ============================================================================
// Test signal and lead-off excitation
// ============================================================================

/// Internal test signal amplitude, `CONFIG2[2]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TestAmplitude {
    /// 1 × −(VREFP − VREFN) / 2400
    X1 = 0b0000_0000,
    /// 2 × −(VREFP − VREFN) / 2400
    X2 = 0b0000_0100,
}

/// Internal test signal frequency, `CONFIG2[1:0]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TestFrequency {
    /// Pulsed at fCLK / 2^21
    PulseSlow = 0b0000_0000,
    /// Pulsed at fCLK / 2^20
    PulseFast = 0b0000_0001,
    /// DC
    Dc = 0b0000_0011,
}

/// Lead-off excitation current, `LOFF[3:2]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LeadOffCurrent {
    /// 6 nA
    Na6 = 0b0000_0000,
    /// 24 nA
    Na24 = 0b0000_0100,
    /// 6 µA
    Ua6 = 0b0000_1000,
    /// 24 µA
    Ua24 = 0b0000_1100,
}

/// Lead-off excitation frequency, `LOFF[1:0]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LeadOffFrequency {
    /// DC lead-off detection
    Dc = 0b0000_0000,
    /// AC at 7.8 Hz
    Ac7_8Hz = 0b0000_0001,
    /// AC at 31.2 Hz
    Ac31_2Hz = 0b0000_0010,
    /// AC at fDR / 4
    AcFdrBy4 = 0b0000_0011,
}

// ============================================================================
// Board modes
// ============================================================================

/// Board mode selected with the `'/'` command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum BoardMode {
    /// Accelerometer data in the aux bytes
    #[default]
    Default = 0,
    /// Debug output
    Debug = 1,
    /// Analog pin readings in the aux bytes
    Analog = 2,
    /// Digital pin readings in the aux bytes
    Digital = 3,
    /// Inserted markers in the aux bytes
    Marker = 4,
    /// Reduced-rate BLE relay
    Ble = 5,
}

impl BoardMode {
    /// Number of defined modes
    pub const COUNT: u8 = 6;

    /// Decode a mode number.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Default),
            1 => Some(Self::Debug),
            2 => Some(Self::Analog),
            3 => Some(Self::Digital),
            4 => Some(Self::Marker),
            5 => Some(Self::Ble),
            _ => None,
        }
    }

    /// Lower-case name reported back to clients.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Debug => "debug",
            Self::Analog => "analog",
            Self::Digital => "digital",
            Self::Marker => "marker",
            Self::Ble => "ble",
        }
    }

    /// Whether the aux bytes carry accelerometer data in this mode.
    #[must_use]
    pub const fn uses_accel(self) -> bool {
        matches!(self, Self::Default | Self::Debug)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BoardMode {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{}", self.name());
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for SampleRate {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{}Hz", self.hz());
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Chip {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::Primary => defmt::write!(f, "Board"),
            Self::Secondary => defmt::write!(f, "Daisy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_channel_register_value() {
        // PD=0, gain x24, SRB2 closed, normal input
        assert_eq!(ChannelSettings::DEFAULT.register_value(), 0x68);
    }

    #[test]
    fn test_powered_down_register_value() {
        let settings = ChannelSettings { power_down: true, srb2: false, ..ChannelSettings::DEFAULT };
        assert_eq!(settings.register_value(), 0xE0);
    }

    #[test]
    fn test_default_ascii_report() {
        assert_eq!(&ChannelSettings::DEFAULT.ascii(), b"060110");
    }

    #[test]
    fn test_gain_index_roundtrip() {
        for index in 0..=6 {
            assert_eq!(Gain::from_index(index).index(), index);
        }
        assert_eq!(Gain::from_index(9), Gain::X24);
    }

    #[test]
    fn test_sample_rate_codes() {
        assert_eq!(SampleRate::from_code(6), Some(SampleRate::Sps250));
        assert_eq!(SampleRate::from_code(0).map(SampleRate::hz), Some(16000));
        assert_eq!(SampleRate::from_code(7), None);
    }

    #[test]
    fn test_chip_select_includes() {
        assert!(ChipSelect::Both.includes(Chip::Secondary));
        assert!(ChipSelect::Primary.includes(Chip::Primary));
        assert!(!ChipSelect::Primary.includes(Chip::Secondary));
    }

    #[test]
    fn test_board_mode_accel() {
        assert!(BoardMode::Default.uses_accel());
        assert!(!BoardMode::Marker.uses_accel());
        assert_eq!(BoardMode::from_code(BoardMode::COUNT), None);
    }
}
