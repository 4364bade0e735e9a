//! Error types for the OBCI ESP firmware core
//!
//! All errors work in `no_std` environments and carry enough context to be
//! logged without heap allocation.

use core::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// ADS1299 Driver Errors
// ============================================================================

/// Errors from the ADS1299 pair driver.
///
/// Bus faults are surfaced as [`Ads1299Error::Spi`]; the chips themselves
/// never report failure, so a garbled frame is not detected at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ads1299Error<E> {
    /// SPI communication failure
    Spi(E),
    /// Logical channel outside 1..=16
    InvalidChannel {
        /// Requested 1-based channel number
        channel: u8,
    },
    /// Sample rate code outside 0..=6
    InvalidSampleRate {
        /// Requested `CONFIG1.DR` code
        code: u8,
    },
    /// Register address outside the ADS1299 register map
    InvalidRegister {
        /// Requested register address
        addr: u8,
    },
}

impl<E> Ads1299Error<E> {
    /// Whether this error came from the bus transport.
    #[must_use]
    pub const fn is_bus_fault(&self) -> bool {
        matches!(self, Self::Spi(_))
    }
}

impl<E: fmt::Debug> fmt::Display for Ads1299Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spi(e) => write!(f, "SPI communication error: {e:?}"),
            Self::InvalidChannel { channel } => {
                write!(f, "Invalid channel: {channel} (expected 1-16)")
            }
            Self::InvalidSampleRate { code } => {
                write!(f, "Invalid sample rate code: {code} (expected 0-6)")
            }
            Self::InvalidRegister { addr } => {
                write!(f, "Invalid register address: 0x{addr:02X} (expected 0x00-0x17)")
            }
        }
    }
}

#[cfg(feature = "defmt")]
impl<E: defmt::Format> defmt::Format for Ads1299Error<E> {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::Spi(e) => defmt::write!(f, "SPI error: {}", e),
            Self::InvalidChannel { channel } => defmt::write!(f, "Bad channel: {}", channel),
            Self::InvalidSampleRate { code } => defmt::write!(f, "Bad rate code: {}", code),
            Self::InvalidRegister { addr } => defmt::write!(f, "Bad register: {=u8:#x}", addr),
        }
    }
}

// ============================================================================
// Command Interpreter Failures
// ============================================================================

/// Reasons a command was rejected by the interpreter.
///
/// The `Display` text is the acknowledgement sent back to the client after
/// the `"Failure: "` prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandFailure {
    /// Latch character arrived before all arguments
    TooFewChars,
    /// Final position held something other than the latch character
    MissingLatch {
        /// 1-based position of the latch in the whole command
        position: u8,
        /// Expected latch character
        latch: char,
    },
    /// More bytes than the command takes
    TooManyChars,
    /// Deadline passed before the command was completed
    Timeout,
    /// Sample rate argument was not a digit
    InvalidSampleRate,
    /// Sample rate digit above the largest code
    SampleRateOutOfBounds,
    /// Board mode argument was not a digit
    InvalidBoardMode,
    /// Board mode digit above the largest mode
    BoardModeOutOfBounds,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewChars => f.write_str("too few chars"),
            Self::MissingLatch { position, latch } => write!(f, "{position}th char not {latch}"),
            Self::TooManyChars => f.write_str("too many chars"),
            Self::Timeout => f.write_str("Timeout processing multi byte message"),
            Self::InvalidSampleRate => f.write_str("invalid sample value"),
            Self::SampleRateOutOfBounds => f.write_str("sample value out of bounds"),
            Self::InvalidBoardMode => f.write_str("invalid board mode value"),
            Self::BoardModeOutOfBounds => f.write_str("board mode value out of bounds"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for CommandFailure {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::TooFewChars => defmt::write!(f, "too few chars"),
            Self::MissingLatch { position, latch } => {
                defmt::write!(f, "{}th char not {}", position, latch);
            }
            Self::TooManyChars => defmt::write!(f, "too many chars"),
            Self::Timeout => defmt::write!(f, "timeout"),
            Self::InvalidSampleRate => defmt::write!(f, "invalid sample value"),
            Self::SampleRateOutOfBounds => defmt::write!(f, "sample value out of bounds"),
            Self::InvalidBoardMode => defmt::write!(f, "invalid board mode value"),
            Self::BoardModeOutOfBounds => defmt::write!(f, "board mode value out of bounds"),
        }
    }
}

// ============================================================================
// Stream Packet Errors
// ============================================================================

/// Errors from parsing stream packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolError {
    /// First byte was not the packet start marker
    InvalidStartByte {
        /// Byte received
        got: u8,
    },
    /// Last byte was not a valid stop marker
    InvalidStopByte {
        /// Byte received
        got: u8,
    },
    /// Buffer too short for a full packet
    IncompletePacket {
        /// Bytes received
        received: usize,
        /// Bytes expected
        expected: usize,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStartByte { got } => write!(f, "Invalid start byte: 0x{got:02X}"),
            Self::InvalidStopByte { got } => write!(f, "Invalid stop byte: 0x{got:02X}"),
            Self::IncompletePacket { received, expected } => {
                write!(f, "Incomplete packet: got {received}/{expected} bytes")
            }
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ProtocolError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::InvalidStartByte { got } => defmt::write!(f, "Bad start: {:02X}", got),
            Self::InvalidStopByte { got } => defmt::write!(f, "Bad stop: {:02X}", got),
            Self::IncompletePacket { received, expected } => {
                defmt::write!(f, "Incomplete: {}/{}", received, expected);
            }
        }
    }
}

#[cfg(feature = "std")]
impl<E: fmt::Debug> std::error::Error for Ads1299Error<E> {}

#[cfg(feature = "std")]
impl std::error::Error for CommandFailure {}

#[cfg(feature = "std")]
impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::ToString;

    use super::*;

    #[test]
    fn test_missing_latch_text() {
        let failure = CommandFailure::MissingLatch { position: 9, latch: 'X' };
        assert_eq!(failure.to_string(), "9th char not X");
        let failure = CommandFailure::MissingLatch { position: 5, latch: 'Z' };
        assert_eq!(failure.to_string(), "5th char not Z");
    }

    #[test]
    fn test_driver_error_display() {
        let err: Ads1299Error<()> = Ads1299Error::InvalidChannel { channel: 17 };
        assert_eq!(err.to_string(), "Invalid channel: 17 (expected 1-16)");
        assert!(!err.is_bus_fault());
        assert!(Ads1299Error::Spi(()).is_bus_fault());
        let err: Ads1299Error<()> = Ads1299Error::InvalidRegister { addr: 0x18 };
        assert_eq!(err.to_string(), "Invalid register address: 0x18 (expected 0x00-0x17)");
    }
}
