//! OBCI ESP Embedded - ADS1299 pair driver and command interpreter
//!
//! This crate drives the converter side of the ESP32 biosignal board:
//! - [`drivers::ads1299`]: two cascaded TI ADS1299 converters (8 or 16 channels)
//! - [`command`]: the OpenBCI ASCII command interpreter
//! - [`stream`]: 33-byte stream packet assembly
//! - [`drdy`]: data-ready flag shared with the DRDY edge handler
//!
//! Everything is written against `embedded-hal` 1.0 traits, so the same
//! code runs on the ESP32 HAL and, with the `sim` feature, against the
//! register-level chip model in [`sim`].
//!
//! # Hardware
//!
//! ```text
//! SPI (ADS1299):  MOSI=21, MISO=47, SCLK=14
//! Chip select:    board=13, daisy=12
//! DRDY:           GPIO 48 (falling edge)
//! Reset:          GPIO 11
//! ```

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod command;
pub mod drdy;
pub mod drivers;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod stream;

pub use command::{CommandInterpreter, InterpreterConfig, Processed};
pub use drdy::DataReady;
pub use drivers::ads1299::{Ads1299Pair, BoardConfig, ChipFrame};
pub use stream::PacketBuilder;
