//! ASCII command protocol and binary stream packet format
//!
//! Clients drive the board with single printable characters, some of which
//! open a multi-character transaction (see [`commands`]). Samples flow back
//! as fixed 33-byte packets:
//!
//! ```text
//! 0xA0 | sample# | 8 × 3 channel bytes (big-endian, signed 24-bit) | 6 aux bytes | 0xC0 | type
//! ```
//!
//! The character set is a compatibility surface shared with existing client
//! software and must not change.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{Gain, CHANNELS_PER_CHIP};

// ============================================================================
// Command characters
// ============================================================================

/// Command characters understood by the interpreter.
pub mod commands {
    /// Turn channels 1-16 off
    pub const CHANNEL_OFF: [u8; 16] = *b"12345678qwertyui";
    /// Turn channels 1-16 on
    pub const CHANNEL_ON: [u8; 16] = *b"!@#$%^&*QWERTYUI";

    /// All channels to DC test signal
    pub const TEST_SIGNAL_DC: u8 = b'p';
    /// All channels shorted to ground
    pub const TEST_SIGNAL_GROUND: u8 = b'0';
    /// All channels to 1x fast pulse
    pub const TEST_SIGNAL_PULSE_1X_FAST: u8 = b'=';
    /// All channels to 1x slow pulse
    pub const TEST_SIGNAL_PULSE_1X_SLOW: u8 = b'-';
    /// All channels to 2x fast pulse
    pub const TEST_SIGNAL_PULSE_2X_FAST: u8 = b']';
    /// All channels to 2x slow pulse
    pub const TEST_SIGNAL_PULSE_2X_SLOW: u8 = b'[';

    /// Start a channel settings transaction
    pub const CHANNEL_SET: u8 = b'x';
    /// Channel settings latch
    pub const CHANNEL_LATCH: u8 = b'X';
    /// Start a lead-off transaction
    pub const LEAD_OFF_SET: u8 = b'z';
    /// Lead-off latch
    pub const LEAD_OFF_LATCH: u8 = b'Z';

    /// Restore default channel settings
    pub const DEFAULT_ALL_SET: u8 = b'd';
    /// Report default channel settings
    pub const DEFAULT_ALL_REPORT: u8 = b'D';

    /// Start streaming
    pub const STREAM_START: u8 = b'b';
    /// Stop streaming
    pub const STREAM_STOP: u8 = b's';

    /// Dump every register
    pub const QUERY_REGISTERS: u8 = b'?';
    /// Soft reset
    pub const SOFT_RESET: u8 = b'v';
    /// Report firmware version
    pub const GET_VERSION: u8 = b'V';

    /// Limit to 8 channels
    pub const CHANNEL_MAX_8: u8 = b'c';
    /// Enable 16 channels
    pub const CHANNEL_MAX_16: u8 = b'C';

    /// Board mode transaction
    pub const BOARD_MODE_SET: u8 = b'/';
    /// Sample rate transaction
    pub const SAMPLE_RATE_SET: u8 = b'~';
    /// Insert a marker into the stream
    pub const INSERT_MARKER: u8 = b'`';

    /// Time stamps on
    pub const TIME_SET: u8 = b'<';
    /// Time stamps off
    pub const TIME_STOP: u8 = b'>';

    /// Bytes in a channel settings transaction, trigger and latch included
    pub const CHANNEL_SETTINGS_LEN: u8 = 9;
    /// Bytes in a lead-off transaction, trigger and latch included
    pub const LEAD_OFF_LEN: u8 = 5;

    /// Default multi-character transaction timeout
    pub const MULTI_CHAR_TIMEOUT_MS: u32 = 1000;
}

/// Text appended to every acknowledgement.
pub const EOT: &str = "$$$";

/// Firmware version reported by `'V'`.
pub const FIRMWARE_VERSION: &str = "v3.1.2";

// ============================================================================
// ASCII argument decoding
// ============================================================================

/// Map a channel selector character to a 0-based channel index.
///
/// `'1'..='8'` select channels 1-8, `"QWERTYUI"` select 9-16. Unknown
/// characters fall back to the first channel.
#[must_use]
pub fn channel_for_ascii(c: u8) -> usize {
    match c {
        b'1'..=b'8' => usize::from(c - b'1'),
        _ => commands::CHANNEL_ON[CHANNELS_PER_CHIP..]
            .iter()
            .position(|&on| on == c)
            .map_or(0, |i| i + CHANNELS_PER_CHIP),
    }
}

/// Decode a digit character, mapping anything outside `'0'..='9'` to 0.
#[must_use]
pub const fn number_for_ascii(c: u8) -> u8 {
    if c.is_ascii_digit() {
        c - b'0'
    } else {
        0
    }
}

/// Decode a gain digit. Anything outside `'0'..='6'` selects the maximum gain.
#[must_use]
pub const fn gain_for_ascii(c: u8) -> Gain {
    match c {
        b'0'..=b'6' => Gain::from_index(c - b'0'),
        _ => Gain::X24,
    }
}

/// Decode a flag digit: exactly `'1'` is on.
#[must_use]
pub const fn flag_for_ascii(c: u8) -> bool {
    number_for_ascii(c) == 1
}

// ============================================================================
// Stream packets
// ============================================================================

/// Stream packet type, carried in the low nibble of the stop byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum PacketType {
    /// Accelerometer in the aux bytes
    #[default]
    Accel = 0,
    /// Accelerometer plus time stamp
    AccelTimeSet = 1,
    /// Accelerometer plus time sync response
    AccelTimeSync = 2,
    /// Raw aux bytes
    RawAux = 3,
    /// Raw aux bytes plus time stamp
    RawAuxTimeSet = 4,
    /// Raw aux bytes plus time sync response
    RawAuxTimeSync = 5,
}

impl PacketType {
    /// Pick the packet type for the current accelerometer and time-stamp modes.
    #[must_use]
    pub const fn select(accel: bool, time_sync: bool) -> Self {
        match (accel, time_sync) {
            (true, true) => Self::AccelTimeSet,
            (false, true) => Self::RawAuxTimeSet,
            (false, false) => Self::RawAux,
            (true, false) => Self::Accel,
        }
    }

    /// Try to convert a type nibble to a packet type.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Accel),
            1 => Some(Self::AccelTimeSet),
            2 => Some(Self::AccelTimeSync),
            3 => Some(Self::RawAux),
            4 => Some(Self::RawAuxTimeSet),
            5 => Some(Self::RawAuxTimeSync),
            _ => None,
        }
    }

    /// Whether the aux bytes carry a time stamp.
    #[must_use]
    pub const fn has_time_stamp(self) -> bool {
        matches!(
            self,
            Self::AccelTimeSet | Self::AccelTimeSync | Self::RawAuxTimeSet | Self::RawAuxTimeSync
        )
    }

    /// Stop byte closing a packet of this type.
    #[inline]
    #[must_use]
    pub const fn stop_byte(self) -> u8 {
        StreamPacket::STOP_BASE | self as u8
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for PacketType {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::Accel => defmt::write!(f, "Accel"),
            Self::AccelTimeSet => defmt::write!(f, "AccelTimeSet"),
            Self::AccelTimeSync => defmt::write!(f, "AccelTimeSync"),
            Self::RawAux => defmt::write!(f, "RawAux"),
            Self::RawAuxTimeSet => defmt::write!(f, "RawAuxTimeSet"),
            Self::RawAuxTimeSync => defmt::write!(f, "RawAuxTimeSync"),
        }
    }
}

/// One 33-byte stream packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamPacket {
    /// Wrapping sample counter
    pub sample_number: u8,
    /// Eight big-endian 24-bit channel words
    pub channels: [u8; Self::CHANNEL_BYTES],
    /// Auxiliary bytes, meaning depends on board mode and packet type
    pub aux: [u8; Self::AUX_BYTES],
    /// Packet type
    pub packet_type: PacketType,
}

impl StreamPacket {
    /// Start byte
    pub const START: u8 = 0xA0;
    /// Stop byte base, OR'd with the packet type
    pub const STOP_BASE: u8 = 0xC0;
    /// Channel payload bytes
    pub const CHANNEL_BYTES: usize = 24;
    /// Aux payload bytes
    pub const AUX_BYTES: usize = 6;
    /// Total packet size
    pub const SIZE: usize = 33;

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = Self::START;
        bytes[1] = self.sample_number;
        bytes[2..26].copy_from_slice(&self.channels);
        bytes[26..32].copy_from_slice(&self.aux);
        bytes[32] = self.packet_type.stop_byte();
        bytes
    }

    /// Parse a packet from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is short or either framing byte is wrong.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::IncompletePacket { received: bytes.len(), expected: Self::SIZE });
        }
        if bytes[0] != Self::START {
            return Err(ProtocolError::InvalidStartByte { got: bytes[0] });
        }

        let stop = bytes[32];
        let packet_type = match stop & 0xF0 {
            Self::STOP_BASE => PacketType::from_byte(stop & 0x0F),
            _ => None,
        }
        .ok_or(ProtocolError::InvalidStopByte { got: stop })?;

        let mut channels = [0u8; Self::CHANNEL_BYTES];
        channels.copy_from_slice(&bytes[2..26]);
        let mut aux = [0u8; Self::AUX_BYTES];
        aux.copy_from_slice(&bytes[26..32]);

        Ok(Self { sample_number: bytes[1], channels, aux, packet_type })
    }

    /// Sign-extended value of channel `index` (0..8).
    #[must_use]
    pub fn channel(&self, index: usize) -> i32 {
        let o = index * 3;
        sign_extend_24([self.channels[o], self.channels[o + 1], self.channels[o + 2]])
    }

    /// Time stamp in the aux bytes, if this packet type carries one.
    #[must_use]
    pub fn time_stamp(&self) -> Option<u32> {
        self.packet_type
            .has_time_stamp()
            .then(|| u32::from_be_bytes([self.aux[2], self.aux[3], self.aux[4], self.aux[5]]))
    }
}

/// Sign-extend a big-endian 24-bit two's-complement word.
#[inline]
#[must_use]
pub const fn sign_extend_24(bytes: [u8; 3]) -> i32 {
    // Place in the top 24 bits, then arithmetic shift back down
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0]) >> 8
}

/// Truncate a value to a big-endian 24-bit word.
#[inline]
#[must_use]
pub const fn to_be_24(value: i32) -> [u8; 3] {
    let b = value.to_be_bytes();
    [b[1], b[2], b[3]]
}

/// Convert raw counts to microvolts for a given gain (4.5 V reference).
#[must_use]
pub fn counts_to_microvolts(counts: i32, gain: Gain) -> f32 {
    const VREF_UV: f32 = 4_500_000.0;
    const FULL_SCALE: f32 = 8_388_607.0;
    #[allow(clippy::cast_precision_loss)]
    let counts = counts as f32;
    counts * VREF_UV / f32::from(gain.multiplier()) / FULL_SCALE
}

/// Scan a buffer for the start of a framed packet.
#[must_use]
pub fn find_start(buffer: &[u8]) -> Option<usize> {
    buffer.windows(StreamPacket::SIZE).position(|w| {
        w[0] == StreamPacket::START && w[StreamPacket::SIZE - 1] & 0xF0 == StreamPacket::STOP_BASE
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_extend_negative() {
        // Bit 23 set: value - 2^24
        assert_eq!(sign_extend_24([0xFF, 0xFF, 0xFF]), -1);
        assert_eq!(sign_extend_24([0x80, 0x00, 0x00]), 0x80_0000 - (1 << 24));
        assert_eq!(sign_extend_24([0x92, 0x34, 0x56]), 0x92_3456 - (1 << 24));
    }

    #[test]
    fn test_sign_extend_positive() {
        assert_eq!(sign_extend_24([0x7F, 0xFF, 0xFF]), 0x7F_FFFF);
        assert_eq!(sign_extend_24([0x00, 0x01, 0x00]), 256);
        assert_eq!(to_be_24(-2), [0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn test_channel_for_ascii() {
        assert_eq!(channel_for_ascii(b'1'), 0);
        assert_eq!(channel_for_ascii(b'8'), 7);
        assert_eq!(channel_for_ascii(b'Q'), 8);
        assert_eq!(channel_for_ascii(b'I'), 15);
        assert_eq!(channel_for_ascii(b'9'), 0);
        assert_eq!(channel_for_ascii(b'!'), 0);
    }

    #[test]
    fn test_digit_clamping() {
        assert_eq!(number_for_ascii(b'7'), 7);
        assert_eq!(number_for_ascii(b'a'), 0);
        assert_eq!(gain_for_ascii(b'2'), Gain::X4);
        assert_eq!(gain_for_ascii(b'9'), Gain::X24);
        assert!(flag_for_ascii(b'1'));
        assert!(!flag_for_ascii(b'2'));
    }

    #[test]
    fn test_packet_type_selector() {
        assert_eq!(PacketType::select(true, true), PacketType::AccelTimeSet);
        assert_eq!(PacketType::select(false, true), PacketType::RawAuxTimeSet);
        assert_eq!(PacketType::select(false, false), PacketType::RawAux);
        assert_eq!(PacketType::select(true, false), PacketType::Accel);
    }

    #[test]
    fn test_stream_packet_framing() {
        let packet = StreamPacket {
            sample_number: 7,
            channels: [0x11; 24],
            aux: [0, 0, 0x00, 0x00, 0x04, 0xD2],
            packet_type: PacketType::RawAuxTimeSet,
        };
        let bytes = packet.to_bytes();
        assert_eq!(bytes[0], 0xA0);
        assert_eq!(bytes[32], 0xC4);

        let parsed = StreamPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.time_stamp(), Some(1234));
    }

    #[test]
    fn test_stream_packet_bad_stop() {
        let mut bytes = [0u8; StreamPacket::SIZE];
        bytes[0] = StreamPacket::START;
        bytes[32] = 0xB0;
        assert!(matches!(StreamPacket::from_bytes(&bytes), Err(ProtocolError::InvalidStopByte { got: 0xB0 })));
        assert!(matches!(StreamPacket::from_bytes(&bytes[..10]), Err(ProtocolError::IncompletePacket { .. })));
    }

    #[test]
    fn test_find_start() {
        let packet = StreamPacket {
            sample_number: 0,
            channels: [0; 24],
            aux: [0; 6],
            packet_type: PacketType::Accel,
        };
        let mut buffer = [0u8; 40];
        buffer[5..38].copy_from_slice(&packet.to_bytes());
        assert_eq!(find_start(&buffer), Some(5));
        assert_eq!(find_start(&buffer[..20]), None);
    }

    #[test]
    fn test_counts_to_microvolts() {
        let uv = counts_to_microvolts(8_388_607, Gain::X1);
        assert!((uv - 4_500_000.0).abs() < 2.0);
        assert!(counts_to_microvolts(-8_388_607, Gain::X24) < 0.0);
    }
}
