use crate::error::{Result, ToneLinkError};
use crate::{DEFAULT_ERROR_MARGIN, DEFAULT_MAX_FREQUENCY, DEFAULT_MIN_FREQUENCY};

pub const DEFAULT_ALPHABET: &str = "abcdefghijklmABCDEFGHIJKLM0123456789";
pub const DEFAULT_START_SYMBOL: char = '^';
pub const DEFAULT_END_SYMBOL: char = '$';
pub const DEFAULT_PAD_SYMBOL: char = '.';

#[derive(Debug, Clone, PartialEq)]
pub struct CodecConfig {
    pub min_frequency: f32,
    pub max_frequency: f32,
    /// Extra tolerance applied on decode only.
    pub error_margin: f32,
    pub alphabet: String,
    pub start_symbol: char,
    pub end_symbol: char,
    pub pad_symbol: char,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            min_frequency: DEFAULT_MIN_FREQUENCY,
            max_frequency: DEFAULT_MAX_FREQUENCY,
            error_margin: DEFAULT_ERROR_MARGIN,
            alphabet: DEFAULT_ALPHABET.to_string(),
            start_symbol: DEFAULT_START_SYMBOL,
            end_symbol: DEFAULT_END_SYMBOL,
            pad_symbol: DEFAULT_PAD_SYMBOL,
        }
    }
}

/// Bijection between the composed alphabet and an evenly divided frequency band.
///
/// The composed alphabet is `START + alphabet + END + PAD`. Symbol `i` of `L`
/// maps to `min + round((max - min) * i / L)`.
#[derive(Debug, Clone)]
pub struct Codec {
    config: CodecConfig,
    symbols: Vec<char>,
    frequency_range: f32,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Result<Self> {
        if !config.min_frequency.is_finite() || !config.max_frequency.is_finite() {
            return Err(ToneLinkError::InvalidConfig(
                "frequency band must be finite".into(),
            ));
        }
        if config.min_frequency < 0.0 || config.min_frequency >= config.max_frequency {
            return Err(ToneLinkError::InvalidConfig(format!(
                "min frequency {} must be non-negative and below max frequency {}",
                config.min_frequency, config.max_frequency
            )));
        }
        if !config.error_margin.is_finite() || config.error_margin < 0.0 {
            return Err(ToneLinkError::InvalidConfig(format!(
                "error margin must be >= 0, got {}",
                config.error_margin
            )));
        }
        if config.alphabet.is_empty() {
            return Err(ToneLinkError::InvalidConfig("alphabet is empty".into()));
        }

        let mut symbols = Vec::with_capacity(config.alphabet.chars().count() + 3);
        symbols.push(config.start_symbol);
        symbols.extend(config.alphabet.chars());
        symbols.push(config.end_symbol);
        symbols.push(config.pad_symbol);

        for (i, symbol) in symbols.iter().enumerate() {
            if symbols[i + 1..].contains(symbol) {
                return Err(ToneLinkError::InvalidConfig(format!(
                    "symbol {:?} appears more than once in the composed alphabet",
                    symbol
                )));
            }
        }

        let frequency_range = config.max_frequency - config.min_frequency;

        Ok(Self {
            config,
            symbols,
            frequency_range,
        })
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// The composed alphabet, control symbols included.
    pub fn symbols(&self) -> &[char] {
        &self.symbols
    }

    pub fn start_symbol(&self) -> char {
        self.config.start_symbol
    }

    pub fn end_symbol(&self) -> char {
        self.config.end_symbol
    }

    pub fn pad_symbol(&self) -> char {
        self.config.pad_symbol
    }

    /// Frequency spacing between adjacent symbols.
    pub fn resolution(&self) -> f32 {
        self.frequency_range / self.symbols.len() as f32
    }

    pub fn to_frequency(&self, symbol: char) -> Option<f32> {
        let index = self.symbols.iter().position(|&s| s == symbol)?;
        let offset = (self.frequency_range * index as f32 / self.symbols.len() as f32).round();
        Some(self.config.min_frequency + offset)
    }

    pub fn to_character(&self, frequency: f32) -> Option<char> {
        let low = self.config.min_frequency - self.config.error_margin;
        let high = self.config.max_frequency + self.config.error_margin;
        if !(low..=high).contains(&frequency) {
            return None;
        }

        let percent = (frequency - self.config.min_frequency) / self.frequency_range;
        let index = (self.symbols.len() as f32 * percent).round();
        if index < 0.0 {
            return None;
        }

        self.symbols.get(index as usize).copied()
    }

    /// `START + message + END`, with PAD between every message character when
    /// `add_padding` is set.
    pub fn frame(&self, message: &str, add_padding: bool) -> String {
        let mut framed = String::with_capacity(message.len() * 2 + 2);
        framed.push(self.config.start_symbol);
        for (i, c) in message.chars().enumerate() {
            if add_padding && i > 0 {
                framed.push(self.config.pad_symbol);
            }
            framed.push(c);
        }
        framed.push(self.config.end_symbol);
        framed
    }

    /// One entry per framed symbol; unencodable characters stay in place as `None`.
    pub fn encode_string(&self, message: &str, add_padding: bool) -> Vec<Option<f32>> {
        self.frame(message, add_padding)
            .chars()
            .map(|c| self.to_frequency(c))
            .collect()
    }

    /// Symbol-wise inverse of `encode_string`, dropping undecodable entries.
    pub fn decode_frequencies(&self, frequencies: &[Option<f32>]) -> String {
        frequencies
            .iter()
            .filter_map(|f| f.and_then(|f| self.to_character(f)))
            .collect()
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CodecConfig::default()).expect("Default codec configuration is valid")
    }
}
