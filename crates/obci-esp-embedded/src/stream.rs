//! Stream packet assembly
//!
//! Builds one 33-byte [`StreamPacket`] per acquisition from the driver's
//! latest frames and the interpreter's mode flags. With the daisy module
//! fitted the packet rate is halved: odd sample numbers carry the on-board
//! chip's averaged channels, even ones the daisy chip's.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use obci_esp_core::protocol::StreamPacket;
use obci_esp_core::types::{BoardMode, Chip};

use crate::command::CommandInterpreter;
use crate::drivers::ads1299::Ads1299Pair;

/// Composes stream packets and owns the wrapping sample counter.
#[derive(Debug, Default)]
pub struct PacketBuilder {
    sample_number: u8,
}

impl PacketBuilder {
    /// Start counting from zero.
    #[must_use]
    pub const fn new() -> Self {
        Self { sample_number: 0 }
    }

    /// Sample number the next packet will carry.
    pub fn sample_number(&self) -> u8 {
        self.sample_number
    }

    /// Restart the sample counter.
    pub fn reset(&mut self) {
        self.sample_number = 0;
    }

    /// Build the packet for the frame just read by
    /// [`Ads1299Pair::update_channel_data`].
    ///
    /// Consumes a pending marker in marker mode and a pending counter
    /// restart from the interpreter. `now_ms` is stamped into the aux
    /// bytes when the packet type carries a time stamp.
    pub fn build<SPI, CS, RST, D, E>(
        &mut self,
        board: &Ads1299Pair<SPI, CS, RST, D>,
        interpreter: &mut CommandInterpreter,
        now_ms: u32,
    ) -> StreamPacket
    where
        SPI: SpiBus<u8, Error = E>,
        CS: OutputPin,
        RST: OutputPin,
        D: DelayNs,
    {
        if interpreter.take_counter_reset() {
            self.reset();
        }
        let sample_number = self.sample_number;
        self.sample_number = self.sample_number.wrapping_add(1);

        let channels = if board.daisy_present() {
            let chip = if sample_number % 2 == 1 { Chip::Primary } else { Chip::Secondary };
            board.frame(chip).mean_raw
        } else {
            board.frame(Chip::Primary).raw
        };

        let packet_type = interpreter.packet_type();
        let mut aux = [0u8; StreamPacket::AUX_BYTES];
        if interpreter.board_mode() == BoardMode::Marker {
            if let Some(marker) = interpreter.take_marker() {
                aux[1] = marker;
            }
        }
        if packet_type.has_time_stamp() {
            aux[2..].copy_from_slice(&now_ms.to_be_bytes());
        }

        StreamPacket { sample_number, channels, aux, packet_type }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drdy::DataReady;
    use crate::drivers::ads1299::BoardConfig;
    use crate::sim::{SimBoard, SimDelay, SimPin, SimSpi};
    use obci_esp_core::protocol::PacketType;
    use std::string::String;

    type SimPair<'a> = Ads1299Pair<SimSpi<'a>, SimPin<'a>, SimPin<'a>, SimDelay<'a>>;

    fn streaming_board(sim: &SimBoard) -> SimPair<'_> {
        let mut board = Ads1299Pair::new(
            sim.spi(),
            [sim.cs(Chip::Primary), sim.cs(Chip::Secondary)],
            sim.reset_pin(),
            sim.delay(),
            BoardConfig::default(),
        );
        board.initialize().unwrap();
        board.stream_start().unwrap();
        board
    }

    #[test]
    fn test_single_board_packets() {
        let sim = SimBoard::new(false);
        let mut board = streaming_board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut builder = PacketBuilder::new();
        let drdy = DataReady::new();

        sim.push_sample(Chip::Primary, [1, 2, 3, 4, 5, 6, 7, -8]);
        board.update_channel_data(&drdy).unwrap();
        let packet = builder.build(&board, &mut interpreter, 0);

        assert_eq!(packet.sample_number, 0);
        assert_eq!(packet.packet_type, PacketType::Accel);
        assert_eq!(packet.channel(0), 1);
        assert_eq!(packet.channel(7), -8);
        assert_eq!(packet.aux, [0; 6]);

        let bytes = packet.to_bytes();
        assert_eq!(bytes[0], 0xA0);
        assert_eq!(bytes[32], 0xC0);
        assert_eq!(builder.sample_number(), 1);
    }

    #[test]
    fn test_daisy_packets_alternate_chips() {
        let sim = SimBoard::new(true);
        let mut board = streaming_board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut builder = PacketBuilder::new();
        let drdy = DataReady::new();

        sim.push_sample(Chip::Primary, [10; 8]);
        sim.push_sample(Chip::Secondary, [-20; 8]);
        board.update_channel_data(&drdy).unwrap();

        let even = builder.build(&board, &mut interpreter, 0);
        assert_eq!(even.sample_number, 0);
        assert_eq!(even.channel(0), -20);

        sim.push_sample(Chip::Primary, [13; 8]);
        sim.push_sample(Chip::Secondary, [-23; 8]);
        board.update_channel_data(&drdy).unwrap();

        let odd = builder.build(&board, &mut interpreter, 0);
        assert_eq!(odd.sample_number, 1);
        // Truncating mean of 10 and 13
        assert_eq!(odd.channel(0), 11);
    }

    #[test]
    fn test_sample_number_wraps() {
        let sim = SimBoard::new(false);
        let board = streaming_board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut builder = PacketBuilder::new();

        for _ in 0..255 {
            builder.build(&board, &mut interpreter, 0);
        }
        assert_eq!(builder.build(&board, &mut interpreter, 0).sample_number, 255);
        assert_eq!(builder.build(&board, &mut interpreter, 0).sample_number, 0);
    }

    #[test]
    fn test_marker_and_time_stamp_in_aux() {
        let sim = SimBoard::new(false);
        let mut board = streaming_board(&sim);
        board.stream_stop().unwrap();
        let mut interpreter = CommandInterpreter::default();
        let mut builder = PacketBuilder::new();
        let mut out = String::new();

        for &byte in b"/4<`M" {
            interpreter.process_char(&mut board, byte, 0, &mut out).unwrap();
        }
        let packet = builder.build(&board, &mut interpreter, 0x0102_0304);
        assert_eq!(packet.packet_type, PacketType::RawAuxTimeSet);
        assert_eq!(packet.aux, [0x00, b'M', 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(packet.time_stamp(), Some(0x0102_0304));
        assert_eq!(packet.to_bytes()[32], 0xC4);

        // Marker is consumed once
        let packet = builder.build(&board, &mut interpreter, 5);
        assert_eq!(packet.aux[1], 0);
    }

    #[test]
    fn test_stream_start_with_time_sync_restarts_counter() {
        let sim = SimBoard::new(false);
        let mut board = streaming_board(&sim);
        board.stream_stop().unwrap();
        let mut interpreter = CommandInterpreter::default();
        let mut builder = PacketBuilder::new();
        let mut out = String::new();

        builder.build(&board, &mut interpreter, 0);
        builder.build(&board, &mut interpreter, 0);
        for &byte in b"<b" {
            interpreter.process_char(&mut board, byte, 0, &mut out).unwrap();
        }
        assert_eq!(builder.build(&board, &mut interpreter, 0).sample_number, 0);
    }
}
