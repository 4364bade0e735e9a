//! OBCI ESP Core - `no_std` compatible types and protocol definitions
//!
//! This crate provides the foundational types shared by the ADS1299 pair
//! driver, the command interpreter and host tooling. It is designed to work
//! in `no_std` environments (embedded devices) as well as `std` environments.
//!
//! # Modules
//!
//! - [`types`]: Board topology, channel settings, sample rates and board modes
//! - [`error`]: Error types for the driver, the interpreter and packet parsing
//! - [`protocol`]: ASCII command set, argument decoding and stream packets
//!
//! # Features
//!
//! - `std`: Enable standard library support
//! - `defmt`: Enable `defmt` formatting for embedded logging
//!
//! # Example
//!
//! ```rust
//! use obci_esp_core::protocol::{channel_for_ascii, gain_for_ascii};
//! use obci_esp_core::types::{ChannelSettings, Gain};
//!
//! assert_eq!(channel_for_ascii(b'Q'), 8);
//! assert_eq!(gain_for_ascii(b'9'), Gain::X24);
//! assert_eq!(ChannelSettings::DEFAULT.register_value(), 0x68);
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[cfg(feature = "std")]
extern crate std;

pub mod error;
pub mod protocol;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{Ads1299Error, CommandFailure, ProtocolError};
pub use protocol::{PacketType, StreamPacket};
pub use types::{
    BoardMode, ChannelSettings, Chip, ChipSelect, Gain, InputType, LeadOffCurrent,
    LeadOffFrequency, LeadOffSettings, SampleRate, TestAmplitude, TestFrequency,
};
