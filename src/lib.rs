pub mod audio;
pub mod codec;
pub mod demodulation;
pub mod error;
pub mod export;
pub mod modulation;
pub mod replay;
pub mod spectrum;

#[cfg(target_arch = "wasm32")]
pub mod wasm;

pub use audio::*;
pub use codec::*;
pub use demodulation::*;
pub use error::*;
pub use export::*;
pub use modulation::*;
pub use replay::*;
pub use spectrum::*;

pub const SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_MIN_FREQUENCY: f32 = 18000.0;
pub const DEFAULT_MAX_FREQUENCY: f32 = 20000.0;
pub const DEFAULT_ERROR_MARGIN: f32 = 50.0;
pub const DEFAULT_CHARACTER_DURATION_MS: u64 = 150;
pub const DEFAULT_RAMP_DURATION_MS: u64 = 1;
pub const DEFAULT_PEAK_THRESHOLD_DB: f32 = -65.0;
pub const DEFAULT_MIN_RUN_LENGTH: usize = 2;
pub const DEFAULT_TIMEOUT_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransmissionMode {
    Audible,
    Ultrasonic,
}

impl TransmissionMode {
    pub fn min_frequency(&self) -> f32 {
        match self {
            TransmissionMode::Audible => 1000.0,
            TransmissionMode::Ultrasonic => DEFAULT_MIN_FREQUENCY,
        }
    }

    pub fn max_frequency(&self) -> f32 {
        match self {
            TransmissionMode::Audible => 3000.0,
            TransmissionMode::Ultrasonic => DEFAULT_MAX_FREQUENCY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: TransmissionMode,
    pub codec: CodecConfig,
    pub modulator: ModulatorConfig,
    pub demodulator: DemodulatorConfig,
    pub analyser: AnalyserConfig,
    pub sample_rate: u32,
    pub volume: f32,
}

impl Config {
    pub fn for_mode(mode: TransmissionMode) -> Self {
        Self {
            mode,
            codec: CodecConfig {
                min_frequency: mode.min_frequency(),
                max_frequency: mode.max_frequency(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: TransmissionMode::Ultrasonic,
            codec: CodecConfig::default(),
            modulator: ModulatorConfig::default(),
            demodulator: DemodulatorConfig::default(),
            analyser: AnalyserConfig::default(),
            sample_rate: SAMPLE_RATE,
            volume: 0.5,
        }
    }
}
