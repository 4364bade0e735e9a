//! Incremental command interpreter
//!
//! Turns the OpenBCI single-character command stream into [`Ads1299Pair`]
//! calls. Five characters open a multi-character command (`'x'`, `'z'`,
//! `'~'`, `'/'` and `` '`' ``); the bytes that follow are fed to that
//! command's continuation until it latches, fails or times out. Every other
//! byte is dispatched on its own.
//!
//! Acknowledgements are plain text written to a [`fmt::Write`] sink,
//! prefixed `"Success: "` or `"Failure: "` and closed with [`EOT`]. Nothing
//! is written while the board is streaming so the packet stream stays
//! clean; the returned [`Processed`] still carries the outcome.
//!
//! The board is passed in on every call, so one interpreter can front any
//! driver instance:
//!
//! ```ignore
//! let mut interpreter = CommandInterpreter::new(InterpreterConfig::default());
//! for byte in serial.bytes() {
//!     interpreter.process_char(&mut board, byte, clock.now_ms(), &mut serial)?;
//! }
//! ```

use core::fmt::{self, Write};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use heapless::Vec;
use log::{debug, warn};

use obci_esp_core::error::{Ads1299Error, CommandFailure};
use obci_esp_core::protocol::{
    channel_for_ascii, commands, flag_for_ascii, gain_for_ascii, number_for_ascii, PacketType, EOT,
    FIRMWARE_VERSION,
};
use obci_esp_core::types::{
    BoardMode, ChannelSettings, Chip, InputType, LeadOffSettings, SampleRate, TestAmplitude,
    TestFrequency,
};

use crate::drivers::ads1299::Ads1299Pair;

/// Arguments buffered by the longest command (`'x'`)
const MAX_ARGS: usize = 7;

/// Interpreter configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterpreterConfig {
    /// How long a multi-character command may stay open, counted from its
    /// trigger byte
    pub timeout_ms: u32,
}

impl InterpreterConfig {
    /// One second, as the OpenBCI clients expect
    pub const DEFAULT: Self = Self { timeout_ms: commands::MULTI_CHAR_TIMEOUT_MS };
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Outcome of feeding one byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Processed {
    /// A command completed
    Handled,
    /// Byte consumed by a multi-character command that is still open
    Pending,
    /// A multi-character command was discarded
    Failed(CommandFailure),
    /// Not a command; nothing changed
    NotHandled,
}

#[cfg(feature = "defmt")]
impl defmt::Format for Processed {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::Handled => defmt::write!(f, "Handled"),
            Self::Pending => defmt::write!(f, "Pending"),
            Self::Failed(failure) => defmt::write!(f, "Failed({})", failure),
            Self::NotHandled => defmt::write!(f, "NotHandled"),
        }
    }
}

/// Which continuation the next byte goes to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
enum Continuation {
    #[default]
    Idle,
    ChannelSettings,
    LeadOff,
    SampleRate,
    BoardMode,
    Marker,
}

/// Fixed-length command layout: arguments then one latch character.
struct Framing {
    /// 1-based position of the latch after the trigger
    latch_at: u8,
    latch: u8,
}

const CHANNEL_FRAMING: Framing = Framing {
    latch_at: commands::CHANNEL_SETTINGS_LEN - 1,
    latch: commands::CHANNEL_LATCH,
};

const LEAD_OFF_FRAMING: Framing = Framing {
    latch_at: commands::LEAD_OFF_LEN - 1,
    latch: commands::LEAD_OFF_LATCH,
};

/// Acknowledgement sink, muted while streaming.
struct Ack<'a, W> {
    out: &'a mut W,
    quiet: bool,
}

impl<W: Write> Ack<'_, W> {
    fn success(&mut self, args: fmt::Arguments<'_>) {
        if !self.quiet {
            let _ = write!(self.out, "Success: {args}{EOT}");
        }
    }

    fn failure(&mut self, failure: CommandFailure) {
        if !self.quiet {
            let _ = write!(self.out, "Failure: {failure}{EOT}");
        }
    }

    fn text(&mut self, args: fmt::Arguments<'_>) {
        if !self.quiet {
            let _ = self.out.write_fmt(args);
        }
    }
}

/// Byte-at-a-time command interpreter.
#[derive(Debug)]
pub struct CommandInterpreter {
    config: InterpreterConfig,
    state: Continuation,
    /// Next expected 1-based position after the trigger
    position: u8,
    args: Vec<u8, MAX_ARGS>,
    started_ms: u32,
    board_mode: BoardMode,
    time_sync: bool,
    marker: Option<u8>,
    counter_reset: bool,
}

impl CommandInterpreter {
    /// Create an idle interpreter in the default board mode.
    #[must_use]
    pub fn new(config: InterpreterConfig) -> Self {
        Self {
            config,
            state: Continuation::Idle,
            position: 0,
            args: Vec::new(),
            started_ms: 0,
            board_mode: BoardMode::Default,
            time_sync: false,
            marker: None,
            counter_reset: false,
        }
    }

    /// Whether no multi-character command is open.
    pub fn is_idle(&self) -> bool {
        self.state == Continuation::Idle
    }

    /// Current board mode.
    pub fn board_mode(&self) -> BoardMode {
        self.board_mode
    }

    /// Whether time stamps were requested with `'<'`.
    pub fn time_sync(&self) -> bool {
        self.time_sync
    }

    /// Whether the aux bytes carry accelerometer data.
    pub fn accel_enabled(&self) -> bool {
        self.board_mode.uses_accel()
    }

    /// Packet type for the current accelerometer and time-stamp modes.
    pub fn packet_type(&self) -> PacketType {
        PacketType::select(self.accel_enabled(), self.time_sync)
    }

    /// Take the last inserted marker, lowering the new-marker flag.
    pub fn take_marker(&mut self) -> Option<u8> {
        self.marker.take()
    }

    /// Whether the sample counter should restart, lowering the request.
    /// Raised when streaming starts with time stamps on.
    pub fn take_counter_reset(&mut self) -> bool {
        core::mem::take(&mut self.counter_reset)
    }

    /// Discard an open multi-character command whose deadline has passed.
    ///
    /// [`process_char`](Self::process_char) runs this itself; call it from
    /// an idle loop to expire commands without waiting for the next byte.
    pub fn check_timeout(&mut self, now_ms: u32) -> Option<CommandFailure> {
        if self.is_idle() || now_ms.wrapping_sub(self.started_ms) <= self.config.timeout_ms {
            return None;
        }
        warn!("multi-char command {:?} timed out", self.state);
        self.reset();
        Some(CommandFailure::Timeout)
    }

    fn reset(&mut self) {
        self.state = Continuation::Idle;
        self.position = 0;
        self.args.clear();
    }

    fn open(&mut self, state: Continuation, now_ms: u32) -> Processed {
        self.reset();
        self.state = state;
        self.position = 1;
        self.started_ms = now_ms;
        Processed::Pending
    }

    fn fail<W: Write>(&mut self, ack: &mut Ack<'_, W>, failure: CommandFailure) -> Processed {
        warn!("command failed: {failure}");
        self.reset();
        ack.failure(failure);
        Processed::Failed(failure)
    }

    /// Feed one byte received at `now_ms`.
    ///
    /// A byte arriving after an open command's deadline first discards
    /// that command (writing a timeout failure) and is then dispatched as
    /// a fresh command; the return value describes the fresh dispatch.
    ///
    /// # Errors
    ///
    /// Returns the driver error if a bus transaction fails. The
    /// interpreter is idle again afterwards.
    pub fn process_char<SPI, CS, RST, D, E, W>(
        &mut self,
        board: &mut Ads1299Pair<SPI, CS, RST, D>,
        byte: u8,
        now_ms: u32,
        out: &mut W,
    ) -> Result<Processed, Ads1299Error<E>>
    where
        SPI: SpiBus<u8, Error = E>,
        CS: OutputPin,
        RST: OutputPin,
        D: DelayNs,
        W: Write,
    {
        let mut ack = Ack { out, quiet: board.is_streaming() };

        if let Some(failure) = self.check_timeout(now_ms) {
            ack.failure(failure);
        }

        let result = match self.state {
            Continuation::Idle => self.dispatch(board, byte, now_ms, &mut ack),
            Continuation::ChannelSettings => self.channel_settings_byte(board, byte, &mut ack),
            Continuation::LeadOff => self.lead_off_byte(board, byte, &mut ack),
            Continuation::SampleRate => self.sample_rate_byte(board, byte, &mut ack),
            Continuation::BoardMode => Ok(self.board_mode_byte(byte, &mut ack)),
            Continuation::Marker => {
                self.marker = Some(byte);
                self.reset();
                Ok(Processed::Handled)
            }
        };
        if result.is_err() {
            self.reset();
        }
        result
    }

    // ------------------------------------------------------------------------
    // Single-character commands
    // ------------------------------------------------------------------------

    fn dispatch<SPI, CS, RST, D, E, W>(
        &mut self,
        board: &mut Ads1299Pair<SPI, CS, RST, D>,
        byte: u8,
        now_ms: u32,
        ack: &mut Ack<'_, W>,
    ) -> Result<Processed, Ads1299Error<E>>
    where
        SPI: SpiBus<u8, Error = E>,
        CS: OutputPin,
        RST: OutputPin,
        D: DelayNs,
        W: Write,
    {
        if let Some(i) = commands::CHANNEL_OFF.iter().position(|&c| c == byte) {
            let channel = channel_number(i);
            debug!("channel {channel} off");
            board.stream_safe(|b| b.deactivate_channel(channel))?;
            return Ok(Processed::Handled);
        }
        if let Some(i) = commands::CHANNEL_ON.iter().position(|&c| c == byte) {
            let channel = channel_number(i);
            debug!("channel {channel} on");
            board.stream_safe(|b| b.activate_channel(channel))?;
            return Ok(Processed::Handled);
        }
        if let Some((input, amplitude, frequency)) = test_condition(byte) {
            board.activate_all_channels_to_test_condition(input, amplitude, frequency)?;
            ack.success(format_args!("Configured internal test signal."));
            return Ok(Processed::Handled);
        }

        match byte {
            commands::CHANNEL_SET => Ok(self.open(Continuation::ChannelSettings, now_ms)),
            commands::LEAD_OFF_SET => Ok(self.open(Continuation::LeadOff, now_ms)),
            commands::SAMPLE_RATE_SET => Ok(self.open(Continuation::SampleRate, now_ms)),
            commands::BOARD_MODE_SET => Ok(self.open(Continuation::BoardMode, now_ms)),
            commands::INSERT_MARKER => Ok(self.open(Continuation::Marker, now_ms)),

            commands::DEFAULT_ALL_SET => {
                board.stream_safe(|b| b.set_channels_to_default())?;
                ack.success(format_args!("updating channel settings to default"));
                Ok(Processed::Handled)
            }
            commands::DEFAULT_ALL_REPORT => {
                let report = ChannelSettings::DEFAULT.ascii();
                for &c in &report {
                    ack.text(format_args!("{}", char::from(c)));
                }
                ack.text(format_args!("{EOT}"));
                Ok(Processed::Handled)
            }

            commands::CHANNEL_MAX_8 => {
                let mut removed = false;
                board.stream_safe(|b| {
                    removed = b.remove_daisy()?;
                    Ok(())
                })?;
                let status = if removed { "daisy removed" } else { "no daisy to remove!" };
                ack.text(format_args!("{status}\n{}{EOT}", board.num_channels()));
                Ok(Processed::Handled)
            }
            commands::CHANNEL_MAX_16 => {
                let status = if board.daisy_present() {
                    "daisy already attached"
                } else {
                    let mut attached = false;
                    board.stream_safe(|b| {
                        attached = b.attach_daisy()?;
                        Ok(())
                    })?;
                    if attached {
                        "daisy attached"
                    } else {
                        "no daisy to attach!"
                    }
                };
                ack.text(format_args!("{status}\n{}{EOT}", board.num_channels()));
                Ok(Processed::Handled)
            }

            commands::STREAM_START => {
                if self.time_sync {
                    self.counter_reset = true;
                }
                board.stream_start()?;
                Ok(Processed::Handled)
            }
            commands::STREAM_STOP => {
                board.stream_stop()?;
                Ok(Processed::Handled)
            }

            commands::SOFT_RESET => {
                if !board.is_streaming() {
                    self.soft_reset(board, ack)?;
                }
                Ok(Processed::Handled)
            }
            commands::QUERY_REGISTERS => {
                if !board.is_streaming() {
                    board.dump_registers(&mut *ack.out)?;
                    ack.text(format_args!("{EOT}"));
                }
                Ok(Processed::Handled)
            }
            commands::GET_VERSION => {
                ack.text(format_args!("{FIRMWARE_VERSION}{EOT}"));
                Ok(Processed::Handled)
            }

            commands::TIME_SET => {
                self.time_sync = true;
                ack.success(format_args!("Time stamp ON"));
                Ok(Processed::Handled)
            }
            commands::TIME_STOP => {
                self.time_sync = false;
                ack.success(format_args!("Time stamp OFF"));
                Ok(Processed::Handled)
            }

            _ => Ok(Processed::NotHandled),
        }
    }

    fn soft_reset<SPI, CS, RST, D, E, W>(
        &mut self,
        board: &mut Ads1299Pair<SPI, CS, RST, D>,
        ack: &mut Ack<'_, W>,
    ) -> Result<(), Ads1299Error<E>>
    where
        SPI: SpiBus<u8, Error = E>,
        CS: OutputPin,
        RST: OutputPin,
        D: DelayNs,
        W: Write,
    {
        board.soft_reset()?;
        self.board_mode = BoardMode::Default;
        self.time_sync = false;

        ack.text(format_args!("OpenBCI V3 8-16 channel\n"));
        let id = board.device_id(Chip::Primary)?;
        ack.text(format_args!("On Board ADS1299 Device ID: 0x{id:02X}\n"));
        if board.daisy_present() {
            let id = board.device_id(Chip::Secondary)?;
            ack.text(format_args!("On Daisy ADS1299 Device ID: 0x{id:02X}\n"));
        }
        ack.text(format_args!("Firmware: {FIRMWARE_VERSION}\n{EOT}"));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Multi-character continuations
    // ------------------------------------------------------------------------

    /// Buffer one argument of a fixed-length command. Returns the
    /// arguments once the latch arrives in place.
    fn framed_byte<W: Write>(
        &mut self,
        framing: &Framing,
        byte: u8,
        ack: &mut Ack<'_, W>,
    ) -> Result<Vec<u8, MAX_ARGS>, Processed> {
        let position = self.position;
        self.position += 1;

        if position < framing.latch_at {
            if byte == framing.latch {
                return Err(self.fail(ack, CommandFailure::TooFewChars));
            }
            if self.args.push(byte).is_err() {
                return Err(self.fail(ack, CommandFailure::TooManyChars));
            }
            return Err(Processed::Pending);
        }
        if position > framing.latch_at {
            return Err(self.fail(ack, CommandFailure::TooManyChars));
        }
        if byte != framing.latch {
            let failure = CommandFailure::MissingLatch { position: position + 1, latch: char::from(framing.latch) };
            return Err(self.fail(ack, failure));
        }

        let args = self.args.clone();
        self.reset();
        Ok(args)
    }

    fn channel_settings_byte<SPI, CS, RST, D, E, W>(
        &mut self,
        board: &mut Ads1299Pair<SPI, CS, RST, D>,
        byte: u8,
        ack: &mut Ack<'_, W>,
    ) -> Result<Processed, Ads1299Error<E>>
    where
        SPI: SpiBus<u8, Error = E>,
        CS: OutputPin,
        RST: OutputPin,
        D: DelayNs,
        W: Write,
    {
        let args = match self.framed_byte(&CHANNEL_FRAMING, byte, ack) {
            Ok(args) => args,
            Err(processed) => return Ok(processed),
        };
        let &[selector, power, gain, input, bias, srb2, srb1] = args.as_slice() else {
            return Ok(self.fail(ack, CommandFailure::TooFewChars));
        };

        let channel = channel_number(channel_for_ascii(selector));
        let settings = ChannelSettings {
            power_down: flag_for_ascii(power),
            gain: gain_for_ascii(gain),
            input: InputType::from_code(number_for_ascii(input)),
            bias: flag_for_ascii(bias),
            srb2: flag_for_ascii(srb2),
            srb1: flag_for_ascii(srb1),
        };
        debug!("channel {channel} settings {settings:?}");

        board.stream_safe(|b| {
            b.set_channel_settings(channel, settings)?;
            b.write_channel_settings(channel)
        })?;
        ack.success(format_args!("Channel set for {channel}"));
        Ok(Processed::Handled)
    }

    fn lead_off_byte<SPI, CS, RST, D, E, W>(
        &mut self,
        board: &mut Ads1299Pair<SPI, CS, RST, D>,
        byte: u8,
        ack: &mut Ack<'_, W>,
    ) -> Result<Processed, Ads1299Error<E>>
    where
        SPI: SpiBus<u8, Error = E>,
        CS: OutputPin,
        RST: OutputPin,
        D: DelayNs,
        W: Write,
    {
        let args = match self.framed_byte(&LEAD_OFF_FRAMING, byte, ack) {
            Ok(args) => args,
            Err(processed) => return Ok(processed),
        };
        let &[selector, p, n] = args.as_slice() else {
            return Ok(self.fail(ack, CommandFailure::TooFewChars));
        };

        let channel = channel_number(channel_for_ascii(selector));
        let flags = LeadOffSettings { p: flag_for_ascii(p), n: flag_for_ascii(n) };
        board.stream_safe(|b| {
            b.set_lead_off_settings(channel, flags)?;
            b.change_lead_off_detect(channel)
        })?;
        ack.success(format_args!("Lead off set for {channel}"));
        Ok(Processed::Handled)
    }

    fn sample_rate_byte<SPI, CS, RST, D, E, W>(
        &mut self,
        board: &mut Ads1299Pair<SPI, CS, RST, D>,
        byte: u8,
        ack: &mut Ack<'_, W>,
    ) -> Result<Processed, Ads1299Error<E>>
    where
        SPI: SpiBus<u8, Error = E>,
        CS: OutputPin,
        RST: OutputPin,
        D: DelayNs,
        W: Write,
    {
        if byte == commands::SAMPLE_RATE_SET {
            self.reset();
            ack.success(format_args!("Sample rate is {}Hz", board.sample_rate().hz()));
            return Ok(Processed::Handled);
        }
        if !byte.is_ascii_digit() {
            return Ok(self.fail(ack, CommandFailure::InvalidSampleRate));
        }
        let code = byte - b'0';
        if SampleRate::from_code(code).is_none() {
            return Ok(self.fail(ack, CommandFailure::SampleRateOutOfBounds));
        }

        self.reset();
        board.stream_safe(|b| b.set_sample_rate_code(code))?;
        ack.success(format_args!("Sample rate is {}Hz", board.sample_rate().hz()));
        Ok(Processed::Handled)
    }

    fn board_mode_byte<W: Write>(&mut self, byte: u8, ack: &mut Ack<'_, W>) -> Processed {
        if byte == commands::BOARD_MODE_SET {
            self.reset();
            ack.success(format_args!("{}", self.board_mode.name()));
            return Processed::Handled;
        }
        if !byte.is_ascii_digit() {
            return self.fail(ack, CommandFailure::InvalidBoardMode);
        }
        let Some(mode) = BoardMode::from_code(byte - b'0') else {
            return self.fail(ack, CommandFailure::BoardModeOutOfBounds);
        };

        self.reset();
        self.board_mode = mode;
        debug!("board mode {}", mode.name());
        ack.success(format_args!("{}", mode.name()));
        Processed::Handled
    }
}

impl Default for CommandInterpreter {
    fn default() -> Self {
        Self::new(InterpreterConfig::default())
    }
}

/// 1-based channel number for a 0-based command index.
fn channel_number(index: usize) -> u8 {
    #[allow(clippy::cast_possible_truncation)]
    let channel = index as u8 + 1;
    channel
}

/// Input routing for the test-signal characters.
fn test_condition(byte: u8) -> Option<(InputType, Option<TestAmplitude>, Option<TestFrequency>)> {
    let condition = match byte {
        commands::TEST_SIGNAL_GROUND => (InputType::Shorted, None, None),
        commands::TEST_SIGNAL_DC => (InputType::TestSignal, Some(TestAmplitude::X2), Some(TestFrequency::Dc)),
        commands::TEST_SIGNAL_PULSE_1X_SLOW => {
            (InputType::TestSignal, Some(TestAmplitude::X1), Some(TestFrequency::PulseSlow))
        }
        commands::TEST_SIGNAL_PULSE_1X_FAST => {
            (InputType::TestSignal, Some(TestAmplitude::X1), Some(TestFrequency::PulseFast))
        }
        commands::TEST_SIGNAL_PULSE_2X_SLOW => {
            (InputType::TestSignal, Some(TestAmplitude::X2), Some(TestFrequency::PulseSlow))
        }
        commands::TEST_SIGNAL_PULSE_2X_FAST => {
            (InputType::TestSignal, Some(TestAmplitude::X2), Some(TestFrequency::PulseFast))
        }
        _ => return None,
    };
    Some(condition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ads1299::{regs, BoardConfig};
    use crate::sim::{SimBoard, SimDelay, SimPin, SimSpi};
    use obci_esp_core::types::Gain;
    use std::string::String;

    type SimPair<'a> = Ads1299Pair<SimSpi<'a>, SimPin<'a>, SimPin<'a>, SimDelay<'a>>;

    fn board(sim: &SimBoard) -> SimPair<'_> {
        let mut board = Ads1299Pair::new(
            sim.spi(),
            [sim.cs(Chip::Primary), sim.cs(Chip::Secondary)],
            sim.reset_pin(),
            sim.delay(),
            BoardConfig::default(),
        );
        board.initialize().unwrap();
        board
    }

    /// Feed a string at a fixed time and return the last outcome.
    fn feed(
        interpreter: &mut CommandInterpreter,
        board: &mut SimPair<'_>,
        input: &[u8],
        now_ms: u32,
        out: &mut String,
    ) -> Processed {
        let mut last = Processed::NotHandled;
        for &byte in input {
            last = interpreter.process_char(board, byte, now_ms, out).unwrap();
        }
        last
    }

    #[test]
    fn test_channel_settings_applied_on_latch() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        assert_eq!(feed(&mut interpreter, &mut board, b"x302000", 0, &mut out), Processed::Pending);
        assert_eq!(feed(&mut interpreter, &mut board, b"1", 0, &mut out), Processed::Pending);
        // Nothing applied before the latch
        assert_eq!(board.channel_settings(3), Some(&ChannelSettings::DEFAULT));

        assert_eq!(feed(&mut interpreter, &mut board, b"X", 0, &mut out), Processed::Handled);
        let expected = ChannelSettings {
            power_down: false,
            gain: Gain::X4,
            input: InputType::Normal,
            bias: false,
            srb2: false,
            srb1: true,
        };
        assert_eq!(board.channel_settings(3), Some(&expected));
        assert_eq!(sim.register(Chip::Primary, regs::CH1SET + 2), 0x20);
        assert_eq!(sim.register(Chip::Primary, regs::MISC1), 0x20);
        assert_eq!(out, "Success: Channel set for 3$$$");
        assert!(interpreter.is_idle());
    }

    #[test]
    fn test_wrong_latch_leaves_state_untouched() {
        let sim = SimBoard::new(true);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        let settings_before: std::vec::Vec<_> = (1..=16).map(|c| *board.channel_settings(c).unwrap()).collect();
        let registers_before = [*board.registers(Chip::Primary), *board.registers(Chip::Secondary)];
        let bytes_before = sim.bytes_exchanged();

        let result = feed(&mut interpreter, &mut board, b"xQ1510000", 0, &mut out);
        assert_eq!(result, Processed::Failed(CommandFailure::MissingLatch { position: 9, latch: 'X' }));
        assert_eq!(out, "Failure: 9th char not X$$$");

        let settings_after: std::vec::Vec<_> = (1..=16).map(|c| *board.channel_settings(c).unwrap()).collect();
        assert_eq!(settings_after, settings_before);
        assert_eq!([*board.registers(Chip::Primary), *board.registers(Chip::Secondary)], registers_before);
        assert_eq!(sim.bytes_exchanged(), bytes_before);
        assert!(interpreter.is_idle());
    }

    #[test]
    fn test_early_latch_is_too_few_chars() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        let result = feed(&mut interpreter, &mut board, b"x30X", 0, &mut out);
        assert_eq!(result, Processed::Failed(CommandFailure::TooFewChars));
        assert_eq!(out, "Failure: too few chars$$$");
        assert!(interpreter.is_idle());
    }

    #[test]
    fn test_timeout_redispatches_from_idle() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        feed(&mut interpreter, &mut board, b"x306", 0, &mut out);
        // Exactly at the deadline is still in time
        assert_eq!(feed(&mut interpreter, &mut board, b"0", 1000, &mut out), Processed::Pending);

        // Stale command dropped; 'X' alone is not a command
        let result = feed(&mut interpreter, &mut board, b"X", 2001, &mut out);
        assert_eq!(result, Processed::NotHandled);
        assert_eq!(out, "Failure: Timeout processing multi byte message$$$");
        assert!(interpreter.is_idle());
        assert_eq!(board.channel_settings(3), Some(&ChannelSettings::DEFAULT));

        // A trigger after the timeout opens a new command
        out.clear();
        feed(&mut interpreter, &mut board, b"x", 5000, &mut out);
        assert!(!interpreter.is_idle());
        assert_eq!(interpreter.check_timeout(6001), Some(CommandFailure::Timeout));
        assert!(interpreter.is_idle());
        assert_eq!(interpreter.check_timeout(9000), None);
    }

    #[test]
    fn test_timeout_survives_clock_wrap() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        feed(&mut interpreter, &mut board, b"z", u32::MAX - 10, &mut out);
        assert_eq!(feed(&mut interpreter, &mut board, b"1", 20, &mut out), Processed::Pending);
        assert!(out.is_empty());
    }

    #[test]
    fn test_lead_off_command() {
        let sim = SimBoard::new(true);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        assert_eq!(feed(&mut interpreter, &mut board, b"zW10Z", 0, &mut out), Processed::Handled);
        assert_eq!(board.lead_off_settings(10), Some(&LeadOffSettings { p: true, n: false }));
        assert_eq!(sim.register(Chip::Secondary, regs::LOFF_SENSP), 0b0000_0010);
        assert_eq!(out, "Success: Lead off set for 10$$$");

        out.clear();
        let result = feed(&mut interpreter, &mut board, b"z411X", 0, &mut out);
        assert_eq!(result, Processed::Failed(CommandFailure::MissingLatch { position: 5, latch: 'Z' }));
        assert_eq!(out, "Failure: 5th char not Z$$$");
    }

    #[test]
    fn test_lenient_digit_decoding() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        // Gain '9' clamps to x24, input '9' keeps the low three bits
        feed(&mut interpreter, &mut board, b"x1a9911aX", 0, &mut out);
        let settings = board.channel_settings(1).unwrap();
        assert!(!settings.power_down);
        assert_eq!(settings.gain, Gain::X24);
        assert_eq!(settings.input, InputType::Shorted);
        assert!(settings.bias);
        assert!(settings.srb2);
        assert!(!settings.srb1);
    }

    #[test]
    fn test_sample_rate_command() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        assert_eq!(feed(&mut interpreter, &mut board, b"~~", 0, &mut out), Processed::Handled);
        assert_eq!(out, "Success: Sample rate is 250Hz$$$");

        out.clear();
        assert_eq!(feed(&mut interpreter, &mut board, b"~4", 0, &mut out), Processed::Handled);
        assert_eq!(board.sample_rate(), SampleRate::Sps1000);
        assert_eq!(sim.register(Chip::Primary, regs::CONFIG1) & 0x07, 4);
        assert_eq!(out, "Success: Sample rate is 1000Hz$$$");

        out.clear();
        assert_eq!(
            feed(&mut interpreter, &mut board, b"~7", 0, &mut out),
            Processed::Failed(CommandFailure::SampleRateOutOfBounds)
        );
        assert_eq!(out, "Failure: sample value out of bounds$$$");
        assert_eq!(
            feed(&mut interpreter, &mut board, b"~a", 0, &mut out),
            Processed::Failed(CommandFailure::InvalidSampleRate)
        );
        assert_eq!(board.sample_rate(), SampleRate::Sps1000);
    }

    #[test]
    fn test_board_mode_command() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        assert_eq!(feed(&mut interpreter, &mut board, b"//", 0, &mut out), Processed::Handled);
        assert_eq!(out, "Success: default$$$");

        out.clear();
        feed(&mut interpreter, &mut board, b"/4", 0, &mut out);
        assert_eq!(interpreter.board_mode(), BoardMode::Marker);
        assert!(!interpreter.accel_enabled());
        assert_eq!(out, "Success: marker$$$");

        assert_eq!(
            feed(&mut interpreter, &mut board, b"/6", 0, &mut out),
            Processed::Failed(CommandFailure::BoardModeOutOfBounds)
        );
        assert_eq!(
            feed(&mut interpreter, &mut board, b"/x", 0, &mut out),
            Processed::Failed(CommandFailure::InvalidBoardMode)
        );
        assert_eq!(interpreter.board_mode(), BoardMode::Marker);
        assert!(interpreter.is_idle());
    }

    #[test]
    fn test_insert_marker() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        assert_eq!(feed(&mut interpreter, &mut board, b"`", 0, &mut out), Processed::Pending);
        // Any byte, even a command character, is the payload
        assert_eq!(feed(&mut interpreter, &mut board, b"x", 0, &mut out), Processed::Handled);
        assert!(interpreter.is_idle());
        assert_eq!(interpreter.take_marker(), Some(b'x'));
        assert_eq!(interpreter.take_marker(), None);
    }

    #[test]
    fn test_packet_type_selection() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        assert_eq!(interpreter.packet_type(), PacketType::Accel);
        feed(&mut interpreter, &mut board, b"<", 0, &mut out);
        assert_eq!(out, "Success: Time stamp ON$$$");
        assert_eq!(interpreter.packet_type(), PacketType::AccelTimeSet);
        feed(&mut interpreter, &mut board, b"/2", 0, &mut out);
        assert_eq!(interpreter.packet_type(), PacketType::RawAuxTimeSet);
        feed(&mut interpreter, &mut board, b">", 0, &mut out);
        assert_eq!(interpreter.packet_type(), PacketType::RawAux);
    }

    #[test]
    fn test_acknowledgements_muted_while_streaming() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        assert_eq!(feed(&mut interpreter, &mut board, b"b", 0, &mut out), Processed::Handled);
        assert!(board.is_streaming());

        assert_eq!(feed(&mut interpreter, &mut board, b"~~", 0, &mut out), Processed::Handled);
        assert_eq!(
            feed(&mut interpreter, &mut board, b"x1000000Y", 0, &mut out),
            Processed::Failed(CommandFailure::MissingLatch { position: 9, latch: 'X' })
        );
        assert_eq!(feed(&mut interpreter, &mut board, b"1", 0, &mut out), Processed::Handled);
        assert!(out.is_empty());

        // Channel 1 was powered down with the stream paused and resumed
        assert!(board.is_streaming());
        assert!(sim.is_converting(Chip::Primary));
        assert_eq!(sim.register(Chip::Primary, regs::CH1SET) & ChannelSettings::PD_BIT, ChannelSettings::PD_BIT);

        feed(&mut interpreter, &mut board, b"s", 0, &mut out);
        assert!(!board.is_streaming());
        assert!(!sim.is_converting(Chip::Primary));
    }

    #[test]
    fn test_channel_on_off_characters() {
        let sim = SimBoard::new(true);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        feed(&mut interpreter, &mut board, b"i", 0, &mut out);
        assert!(board.channel_settings(16).unwrap().power_down);
        assert_eq!(sim.register(Chip::Secondary, regs::CH8SET) & ChannelSettings::PD_BIT, ChannelSettings::PD_BIT);

        feed(&mut interpreter, &mut board, b"I", 0, &mut out);
        assert!(!board.channel_settings(16).unwrap().power_down);
        assert_eq!(sim.register(Chip::Secondary, regs::CH8SET), 0x68);
        assert!(out.is_empty());
    }

    #[test]
    fn test_test_signal_characters() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        feed(&mut interpreter, &mut board, b"[", 0, &mut out);
        assert_eq!(sim.register(Chip::Primary, regs::CONFIG2), 0b1101_0100);
        assert_eq!(sim.register(Chip::Primary, regs::CH1SET), 0x6D);
        assert_eq!(out, "Success: Configured internal test signal.$$$");

        // Ground keeps the signal generator as it was
        feed(&mut interpreter, &mut board, b"0", 0, &mut out);
        assert_eq!(sim.register(Chip::Primary, regs::CONFIG2), 0b1101_0100);
        assert_eq!(sim.register(Chip::Primary, regs::CH1SET), 0x69);

        feed(&mut interpreter, &mut board, b"d", 0, &mut out);
        assert_eq!(sim.register(Chip::Primary, regs::CH1SET), 0x68);
    }

    #[test]
    fn test_report_and_version() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        feed(&mut interpreter, &mut board, b"D", 0, &mut out);
        assert_eq!(out, "060110$$$");
        out.clear();
        feed(&mut interpreter, &mut board, b"V", 0, &mut out);
        assert_eq!(out, "v3.1.2$$$");
        out.clear();
        assert_eq!(feed(&mut interpreter, &mut board, b"k", 0, &mut out), Processed::NotHandled);
        assert!(out.is_empty());
    }

    #[test]
    fn test_soft_reset_banner() {
        let sim = SimBoard::new(true);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        feed(&mut interpreter, &mut board, b"/4<", 0, &mut out);
        out.clear();
        feed(&mut interpreter, &mut board, b"v", 0, &mut out);

        assert!(out.starts_with("OpenBCI V3 8-16 channel\n"));
        assert!(out.contains("On Board ADS1299 Device ID: 0x3E\n"));
        assert!(out.contains("On Daisy ADS1299 Device ID: 0x3E\n"));
        assert!(out.ends_with("Firmware: v3.1.2\n$$$"));
        assert_eq!(interpreter.board_mode(), BoardMode::Default);
        assert!(!interpreter.time_sync());
    }

    #[test]
    fn test_daisy_characters() {
        let sim = SimBoard::new(true);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        feed(&mut interpreter, &mut board, b"C", 0, &mut out);
        assert_eq!(out, "daisy already attached\n16$$$");
        out.clear();
        feed(&mut interpreter, &mut board, b"c", 0, &mut out);
        assert_eq!(out, "daisy removed\n8$$$");
        out.clear();
        feed(&mut interpreter, &mut board, b"c", 0, &mut out);
        assert_eq!(out, "no daisy to remove!\n8$$$");
        out.clear();
        feed(&mut interpreter, &mut board, b"C", 0, &mut out);
        assert_eq!(out, "daisy attached\n16$$$");
    }

    #[test]
    fn test_register_query() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        feed(&mut interpreter, &mut board, b"?", 0, &mut out);
        assert!(out.starts_with("Board ADS Registers\n"));
        assert!(out.ends_with("$$$"));
    }

    #[test]
    fn test_stream_start_requests_counter_reset_with_time_sync() {
        let sim = SimBoard::new(false);
        let mut board = board(&sim);
        let mut interpreter = CommandInterpreter::default();
        let mut out = String::new();

        feed(&mut interpreter, &mut board, b"bs", 0, &mut out);
        assert!(!interpreter.take_counter_reset());
        feed(&mut interpreter, &mut board, b"<b", 0, &mut out);
        assert!(interpreter.take_counter_reset());
        assert!(!interpreter.take_counter_reset());
    }
}
