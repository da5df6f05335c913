use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, trace};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tone_link_core::{
    audio::{AudioInput, AudioOutput, CaptureEvent},
    codec::Codec,
    demodulation::{Demodulator, DemodulatorEvent},
    export::{load_wav, read_wav, render_schedule, save_wav, write_wav},
    modulation::{Modulator, ModulatorEvent},
    replay::{completed_messages, Replay, DEFAULT_HOP_SIZE},
    spectrum::SpectrumAnalyser,
    Config, ToneLinkError, TransmissionMode,
};

#[derive(Parser)]
#[command(name = "tone-link")]
#[command(about = "Short-range acoustic text link", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct LinkArgs {
    /// Use the audible band (1-3kHz) instead of near-ultrasonic (18-20kHz)
    #[arg(long, short)]
    audible: bool,

    /// Lower edge of the band in Hz
    #[arg(long)]
    min_frequency: Option<f32>,

    /// Upper edge of the band in Hz
    #[arg(long)]
    max_frequency: Option<f32>,

    /// Decode tolerance outside the band in Hz
    #[arg(long)]
    error_margin: Option<f32>,

    /// Characters that can be sent, control symbols excluded
    #[arg(long)]
    alphabet: Option<String>,

    #[arg(long)]
    start_symbol: Option<char>,

    #[arg(long)]
    end_symbol: Option<char>,

    #[arg(long)]
    pad_symbol: Option<char>,

    /// Tone length per character in milliseconds
    #[arg(long, default_value = "150")]
    character_duration: u64,

    /// Fade in/out per tone in milliseconds
    #[arg(long, default_value = "1")]
    ramp_duration: u64,

    /// Minimum peak level in dB
    #[arg(long, default_value = "-65", allow_hyphen_values = true)]
    peak_threshold: f32,

    /// Frames a tone must outlast before it counts
    #[arg(long, default_value = "2")]
    min_run_length: usize,

    /// Silence in milliseconds before a partial message is dropped
    #[arg(long, default_value = "300")]
    timeout_ms: u64,
}

impl LinkArgs {
    fn to_config(&self) -> Config {
        let mode = if self.audible {
            TransmissionMode::Audible
        } else {
            TransmissionMode::Ultrasonic
        };
        let mut config = Config::for_mode(mode);

        if let Some(f) = self.min_frequency {
            config.codec.min_frequency = f;
        }
        if let Some(f) = self.max_frequency {
            config.codec.max_frequency = f;
        }
        if let Some(margin) = self.error_margin {
            config.codec.error_margin = margin;
        }
        if let Some(alphabet) = &self.alphabet {
            config.codec.alphabet = alphabet.clone();
        }
        if let Some(c) = self.start_symbol {
            config.codec.start_symbol = c;
        }
        if let Some(c) = self.end_symbol {
            config.codec.end_symbol = c;
        }
        if let Some(c) = self.pad_symbol {
            config.codec.pad_symbol = c;
        }

        config.modulator.character_duration = Duration::from_millis(self.character_duration);
        config.modulator.ramp_duration = Duration::from_millis(self.ramp_duration);
        config.demodulator.peak_threshold = self.peak_threshold;
        config.demodulator.min_run_length = self.min_run_length;
        config.demodulator.timeout = Duration::from_millis(self.timeout_ms);
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message through the speaker
    Send {
        #[command(flatten)]
        link: LinkArgs,

        /// Volume level (0.0 - 1.0)
        #[arg(long, default_value = "0.5")]
        volume: f32,

        /// Do not separate characters with the pad symbol
        #[arg(long)]
        no_padding: bool,

        /// Message to send (if not provided, reads from stdin)
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Listen on the microphone and print each received message
    Receive {
        #[command(flatten)]
        link: LinkArgs,

        /// Stop after this many seconds (0 listens forever)
        #[arg(long, default_value = "0")]
        timeout: u64,

        /// Exit after the first complete message
        #[arg(long)]
        once: bool,
    },

    /// Render a message to a WAV file
    Export {
        #[command(flatten)]
        link: LinkArgs,

        /// Output WAV path
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value = "48000")]
        sample_rate: u32,

        #[arg(long, default_value = "0.5")]
        volume: f32,

        #[arg(long)]
        no_padding: bool,

        message: String,
    },

    /// Decode messages from a WAV recording
    Decode {
        #[command(flatten)]
        link: LinkArgs,

        /// Samples between analysis frames
        #[arg(long, default_value_t = DEFAULT_HOP_SIZE)]
        hop_size: usize,

        input: PathBuf,
    },

    /// List available audio devices
    Devices,

    /// Offline loopback: render, store as WAV in memory and decode again
    Test {
        #[command(flatten)]
        link: LinkArgs,

        /// Test message
        #[arg(default_value = "Bad1dea")]
        message: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            link,
            volume,
            no_padding,
            message,
        } => {
            let message = match message {
                Some(m) => m,
                None => {
                    let mut buffer = String::new();
                    io::stdin().read_to_string(&mut buffer)?;
                    buffer.trim_end().to_string()
                }
            };

            if message.is_empty() {
                eprintln!("Error: No message to send");
                std::process::exit(1);
            }

            let config = Config {
                volume: volume.clamp(0.0, 1.0),
                ..link.to_config()
            };

            send_message(&message, !no_padding, &config)?;
        }

        Commands::Receive {
            link,
            timeout,
            once,
        } => {
            let config = link.to_config();
            let timeout = (timeout > 0).then(|| Duration::from_secs(timeout));
            receive_messages(&config, timeout, once)?;
        }

        Commands::Export {
            link,
            output,
            sample_rate,
            volume,
            no_padding,
            message,
        } => {
            let config = Config {
                sample_rate,
                volume: volume.clamp(0.0, 1.0),
                ..link.to_config()
            };
            let samples = render_message(&message, !no_padding, &config)?;
            save_wav(&output, &samples, sample_rate)?;
            eprintln!(
                "Wrote {} samples ({:.2} s) to {}",
                samples.len(),
                samples.len() as f32 / sample_rate as f32,
                output.display()
            );
        }

        Commands::Decode {
            link,
            hop_size,
            input,
        } => {
            let config = link.to_config();
            let (samples, sample_rate) = load_wav(&input)?;
            eprintln!(
                "Decoding {} samples at {} Hz from {}",
                samples.len(),
                sample_rate,
                input.display()
            );

            let mut replay = Replay::new(&config, sample_rate)?.with_hop_size(hop_size);
            let messages = completed_messages(&replay.run(&samples));
            if messages.is_empty() {
                bail!("No complete message found");
            }
            for message in messages {
                println!("{}", message);
            }
        }

        Commands::Devices => {
            let devices = tone_link_core::audio::list_audio_devices();
            println!("Available audio devices:");
            for device in devices {
                println!("  {}", device);
            }
        }

        Commands::Test { link, message } => {
            println!("Running loopback test with message: {}", message);
            run_test(&message, &link.to_config())?;
        }
    }

    Ok(())
}

fn build_modulator(config: &Config) -> Result<Modulator> {
    let codec = Arc::new(Codec::new(config.codec.clone())?);
    Ok(Modulator::new(codec, config.modulator))
}

fn warn_unencodable(codec: &Codec, message: &str) {
    let skipped: String = message
        .chars()
        .filter(|&c| codec.to_frequency(c).is_none())
        .collect();
    if !skipped.is_empty() {
        eprintln!("Warning: characters {:?} are not in the alphabet and will be skipped", skipped);
    }
}

fn render_message(message: &str, add_padding: bool, config: &Config) -> Result<Vec<f32>> {
    let modulator = build_modulator(config)?;
    warn_unencodable(modulator.codec(), message);
    let bursts = modulator.schedule(message, add_padding);
    Ok(render_schedule(&bursts, config.sample_rate, config.volume))
}

fn send_message(message: &str, add_padding: bool, config: &Config) -> Result<()> {
    let mut modulator = build_modulator(config)?;
    warn_unencodable(modulator.codec(), message);

    let airtime = modulator.total_duration(message, add_padding);
    eprintln!(
        "Sending {} characters ({:.1} s, {:.0}-{:.0} Hz)...",
        message.chars().count(),
        airtime.as_secs_f32(),
        config.codec.min_frequency,
        config.codec.max_frequency
    );

    let mut output = AudioOutput::new(config.volume)?;
    modulator.transmit(message, add_padding, &mut output)?;

    let deadline = Instant::now() + airtime + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let burst = match output.finished().recv_timeout(remaining) {
            Ok(burst) => burst,
            Err(RecvTimeoutError::Timeout) => {
                modulator.cancel();
                return Err(match output.failure() {
                    Some(reason) => ToneLinkError::TransmissionAborted(reason),
                    None => ToneLinkError::Timeout,
                }
                .into());
            }
            Err(RecvTimeoutError::Disconnected) => {
                bail!("Output stream closed before the transmission finished")
            }
        };

        for event in modulator.on_burst_finished(&burst) {
            match event {
                ModulatorEvent::BurstSent {
                    frequency,
                    start_time,
                    duration,
                } => debug!(
                    "Sent {:.0} Hz at {:?} for {:?}",
                    frequency, start_time, duration
                ),
                ModulatorEvent::TransmissionComplete => {
                    eprintln!("Transmission complete!");
                    return Ok(());
                }
            }
        }
    }
}

fn receive_messages(config: &Config, timeout: Option<Duration>, once: bool) -> Result<()> {
    let input = AudioInput::new()?;
    let sample_rate = input.sample_rate();

    let codec = Arc::new(Codec::new(config.codec.clone())?);
    let mut demodulator = Demodulator::new(codec, config.demodulator)?;
    let mut analyser = SpectrumAnalyser::new(config.analyser, sample_rate)?;

    eprintln!(
        "Listening at {} Hz for {:.0}-{:.0} Hz tones...",
        sample_rate, config.codec.min_frequency, config.codec.max_frequency
    );

    let session = input.start()?;
    let started = Instant::now();

    loop {
        if timeout.map_or(false, |t| started.elapsed() > t) {
            demodulator.stop();
            eprintln!("Stopped listening after {:?}", started.elapsed());
            return Ok(());
        }

        let block = match session.events().recv_timeout(Duration::from_millis(100)) {
            Ok(CaptureEvent::Samples(block)) => block,
            Ok(CaptureEvent::Error(reason)) => {
                demodulator.on_stream_error(reason.clone());
                return Err(ToneLinkError::StreamError(reason).into());
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                demodulator.stop();
                return Err(ToneLinkError::StreamError("capture stream closed".into()).into());
            }
        };

        for chunk in block.chunks(DEFAULT_HOP_SIZE) {
            analyser.push_samples(chunk);
            let now = started.elapsed();
            let snapshot = analyser.snapshot();

            for event in demodulator.on_snapshot(&snapshot, now) {
                match event {
                    DemodulatorEvent::FrequencyDetected(frequency) => {
                        trace!("Peak {:.1} Hz", frequency)
                    }
                    DemodulatorEvent::SymbolDetected(symbol) => debug!("Symbol {:?}", symbol),
                    DemodulatorEvent::SessionIdle => eprintln!("Signal lost, waiting for a new message"),
                    DemodulatorEvent::MessageComplete(message) => {
                        println!("{}", message);
                        io::stdout().flush()?;
                        if once {
                            demodulator.stop();
                            return Ok(());
                        }
                    }
                    DemodulatorEvent::StreamError(reason) => {
                        return Err(ToneLinkError::StreamError(reason).into())
                    }
                }
            }
        }
    }
}

fn run_test(message: &str, config: &Config) -> Result<()> {
    let samples = render_message(message, true, config)?;

    let mut wav = Vec::new();
    write_wav(&mut wav, &samples, config.sample_rate)?;
    let (recorded, sample_rate) = read_wav(wav.as_slice())?;

    println!("Samples: {}", samples.len());
    println!("Duration: {:.2} s", samples.len() as f32 / config.sample_rate as f32);
    println!("WAV size: {} bytes", wav.len());

    let mut replay = Replay::new(config, sample_rate)?;
    let messages = completed_messages(&replay.run(&recorded));

    let codec = Codec::new(config.codec.clone())?;
    let expected: String = message
        .chars()
        .filter(|&c| codec.to_frequency(c).is_some())
        .collect();

    match messages.first() {
        Some(decoded) => println!("\nDecoded message: {}", decoded),
        None => println!("\nNo message decoded"),
    }

    if messages.len() == 1 && messages[0] == expected {
        println!("\n✓ Test PASSED: Messages match!");
    } else {
        println!("\n✗ Test FAILED: expected {:?}, got {:?}", expected, messages);
        std::process::exit(1);
    }

    Ok(())
}
