//! OBCI ESP console
//!
//! Host front end for the command interpreter. Reads OpenBCI command
//! characters from stdin, feeds them to the interpreter in front of a
//! simulated ADS1299 pair, and prints the acknowledgements. While the board
//! is streaming, every input line also produces a burst of stream packets
//! printed as JSON lines.
//!
//! # Usage
//!
//! ```bash
//! # 8 channels, 250 Hz
//! echo "vx1060110X?" | obci-esp
//!
//! # With the daisy module, 1 kHz, 10 packets per line while streaming
//! obci-esp --daisy --sample-rate 4 --samples-per-line 10
//! ```

use std::io::{self, BufRead, Write as _};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::FmtSubscriber;

use obci_esp_core::protocol::{PacketType, StreamPacket};
use obci_esp_core::types::{BoardMode, Chip, SampleRate, CHANNELS_PER_CHIP};
use obci_esp_embedded::sim::SimBoard;
use obci_esp_embedded::{
    Ads1299Pair, BoardConfig, CommandInterpreter, DataReady, InterpreterConfig, PacketBuilder,
    Processed,
};

/// OBCI ESP command console
#[derive(Parser, Debug)]
#[command(name = "obci-esp")]
#[command(author, version, about = "OpenBCI command console over a simulated ADS1299 pair", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Fit the daisy module (16 channels)
    #[arg(long)]
    daisy: bool,

    /// Multi-character command timeout in milliseconds
    #[arg(long, default_value_t = InterpreterConfig::DEFAULT.timeout_ms)]
    timeout_ms: u32,

    /// Initial sample rate code (0 = 16 kHz ... 6 = 250 Hz)
    #[arg(long, default_value_t = 6)]
    sample_rate: u8,

    /// Stream packets emitted per input line while streaming
    #[arg(long, default_value_t = 4)]
    samples_per_line: u32,
}

/// One stream packet as printed on stdout.
#[derive(Serialize)]
struct PacketRecord {
    sample_number: u8,
    packet_type: PacketType,
    channels: [i32; CHANNELS_PER_CHIP],
    aux: [u8; StreamPacket::AUX_BYTES],
    #[serde(skip_serializing_if = "Option::is_none")]
    time_stamp: Option<u32>,
}

impl From<&StreamPacket> for PacketRecord {
    fn from(packet: &StreamPacket) -> Self {
        Self {
            sample_number: packet.sample_number,
            packet_type: packet.packet_type,
            channels: core::array::from_fn(|i| packet.channel(i)),
            aux: packet.aux,
            time_stamp: packet.time_stamp(),
        }
    }
}

/// Board state printed at exit.
#[derive(Serialize)]
struct Status {
    channels: usize,
    daisy: bool,
    sample_rate_hz: u16,
    board_mode: BoardMode,
    packet_type: PacketType,
    streaming: bool,
    packets: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so stdout carries only protocol output.
    // try_init also routes `log` records from the driver crates here.
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(io::stderr)
        .finish()
        .try_init()?;

    info!("OBCI ESP console v{}", env!("CARGO_PKG_VERSION"));

    let sample_rate = SampleRate::from_code(cli.sample_rate)
        .with_context(|| format!("sample rate code {} is not in 0-6", cli.sample_rate))?;

    let sim = SimBoard::new(cli.daisy);
    let mut board = Ads1299Pair::new(
        sim.spi(),
        [sim.cs(Chip::Primary), sim.cs(Chip::Secondary)],
        sim.reset_pin(),
        sim.delay(),
        BoardConfig { sample_rate },
    );
    board.initialize().context("board initialization failed")?;

    let mut interpreter = CommandInterpreter::new(InterpreterConfig { timeout_ms: cli.timeout_ms });
    let mut builder = PacketBuilder::new();
    let drdy = DataReady::new();
    let start = Instant::now();
    let now_ms = || {
        // Wraps like the firmware's millisecond counter
        #[allow(clippy::cast_possible_truncation)]
        let ms = start.elapsed().as_millis() as u32;
        ms
    };

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    let mut ack = String::new();
    let mut packets = 0u64;
    let mut tick = 0u64;

    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;

        for byte in line.bytes() {
            match interpreter.process_char(&mut board, byte, now_ms(), &mut ack)? {
                Processed::NotHandled => warn!("unknown command {:?}", char::from(byte)),
                Processed::Failed(failure) => debug!("command failed: {failure}"),
                Processed::Handled | Processed::Pending => {}
            }
        }
        if let Some(failure) = interpreter.check_timeout(now_ms()) {
            warn!("{failure}");
        }
        if !ack.is_empty() {
            writeln!(stdout, "{ack}")?;
            ack.clear();
        }

        if board.is_streaming() {
            for _ in 0..cli.samples_per_line {
                for chip in Chip::ALL {
                    sim.push_sample(chip, synthetic_sample(chip, tick));
                }
                tick += 1;

                drdy.signal();
                if drdy.is_set() {
                    board.update_channel_data(&drdy)?;
                    let packet = builder.build(&board, &mut interpreter, now_ms());
                    serde_json::to_writer(&mut stdout, &PacketRecord::from(&packet))?;
                    writeln!(stdout)?;
                    packets += 1;
                }
            }
        }
    }

    let status = Status {
        channels: board.num_channels(),
        daisy: board.daisy_present(),
        sample_rate_hz: board.sample_rate().hz(),
        board_mode: interpreter.board_mode(),
        packet_type: interpreter.packet_type(),
        streaming: board.is_streaming(),
        packets,
    };
    writeln!(stdout, "{}", serde_json::to_string(&status)?)?;
    info!("{packets} packets streamed");
    Ok(())
}

/// Alpha plus beta sine mix in ADC counts, phase-shifted per channel.
fn synthetic_sample(chip: Chip, tick: u64) -> [i32; CHANNELS_PER_CHIP] {
    use std::f32::consts::PI;

    #[allow(clippy::cast_precision_loss)]
    let t = tick as f32 / 250.0;
    core::array::from_fn(|ch| {
        #[allow(clippy::cast_precision_loss)]
        let phase = (chip.index() * CHANNELS_PER_CHIP + ch) as f32 * 0.5;
        let uv = 10.0 * (2.0 * PI * 10.0 * t + phase).sin() + 5.0 * (2.0 * PI * 20.0 * t + phase * 2.0).sin();
        // 24x gain: ~0.02235 uV per count
        #[allow(clippy::cast_possible_truncation)]
        let counts = (uv / 0.022_35) as i32;
        counts
    })
}
