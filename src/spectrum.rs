use crate::demodulation::Snapshot;
use crate::error::{Result, ToneLinkError};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

pub const DEFAULT_FFT_SIZE: usize = 2048;
pub const DEFAULT_SMOOTHING: f32 = 0.8;
pub const DEFAULT_MIN_DECIBELS: f32 = -100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyserConfig {
    pub fft_size: usize,
    /// Weight of the previous frame when averaging magnitudes, in `[0, 1)`.
    pub smoothing: f32,
    /// Floor for reported magnitudes; silence reads as this value.
    pub min_decibels: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: DEFAULT_FFT_SIZE,
            smoothing: DEFAULT_SMOOTHING,
            min_decibels: DEFAULT_MIN_DECIBELS,
        }
    }
}

/// Turns a live sample stream into dB power spectrum snapshots over the most
/// recent `fft_size` samples.
pub struct SpectrumAnalyser {
    config: AnalyserConfig,
    sample_rate: u32,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    samples: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    decibels: Vec<f32>,
}

impl SpectrumAnalyser {
    pub fn new(config: AnalyserConfig, sample_rate: u32) -> Result<Self> {
        if !config.fft_size.is_power_of_two() || !(32..=32768).contains(&config.fft_size) {
            return Err(ToneLinkError::InvalidConfig(format!(
                "fft size must be a power of two between 32 and 32768, got {}",
                config.fft_size
            )));
        }
        if !(0.0..1.0).contains(&config.smoothing) {
            return Err(ToneLinkError::InvalidConfig(format!(
                "smoothing must be in [0, 1), got {}",
                config.smoothing
            )));
        }
        if sample_rate == 0 {
            return Err(ToneLinkError::InvalidConfig("sample rate is zero".into()));
        }

        let n = config.fft_size;
        let fft = FftPlanner::new().plan_fft_forward(n);

        // Blackman
        let window = (0..n)
            .map(|i| {
                let x = i as f32 / n as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();

        Ok(Self {
            config,
            sample_rate,
            fft,
            window,
            samples: vec![0.0; n],
            scratch: vec![Complex::new(0.0, 0.0); n],
            smoothed: vec![0.0; n / 2],
            decibels: vec![config.min_decibels; n / 2],
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bins(&self) -> usize {
        self.config.fft_size / 2
    }

    pub fn push_samples(&mut self, input: &[f32]) {
        let n = self.samples.len();
        if input.len() >= n {
            self.samples.copy_from_slice(&input[input.len() - n..]);
        } else {
            self.samples.copy_within(input.len().., 0);
            self.samples[n - input.len()..].copy_from_slice(input);
        }
    }

    /// Analyses the current window. Each call advances the smoothing state.
    pub fn snapshot(&mut self) -> Snapshot<'_> {
        for ((out, &sample), &w) in self.scratch.iter_mut().zip(&self.samples).zip(&self.window) {
            *out = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut self.scratch);

        let n = self.config.fft_size as f32;
        let smoothing = self.config.smoothing;
        let floor = self.config.min_decibels;

        for ((bin, smoothed), db) in self
            .scratch
            .iter()
            .zip(self.smoothed.iter_mut())
            .zip(self.decibels.iter_mut())
        {
            let magnitude = bin.norm() / n;
            *smoothed = smoothing * *smoothed + (1.0 - smoothing) * magnitude;
            let level = 20.0 * smoothed.log10();
            *db = if level.is_finite() { level.max(floor) } else { floor };
        }

        Snapshot::new(&self.decibels, self.sample_rate)
    }

    pub fn reset(&mut self) {
        self.samples.fill(0.0);
        self.smoothed.fill(0.0);
        self.decibels.fill(self.config.min_decibels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frequency: f32, len: usize, sample_rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_tone_peaks_in_its_bin() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig::default(), 48000).unwrap();
        analyser.push_samples(&sine(19000.0, 4096, 48000));

        let snapshot = analyser.snapshot();
        let (index, &level) = snapshot
            .magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();

        assert_eq!(snapshot.magnitudes.len(), 1024);
        assert!((snapshot.index_to_frequency(index) - 19000.0).abs() < 24.0);
        assert!(level > -65.0, "level {}", level);
    }

    #[test]
    fn test_silence_reads_as_floor() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig::default(), 48000).unwrap();
        analyser.push_samples(&[0.0; 512]);
        let snapshot = analyser.snapshot();
        assert!(snapshot.magnitudes.iter().all(|&m| m == DEFAULT_MIN_DECIBELS));
    }

    #[test]
    fn test_short_blocks_slide_the_window() {
        let config = AnalyserConfig {
            fft_size: 64,
            smoothing: 0.0,
            ..Default::default()
        };
        let mut analyser = SpectrumAnalyser::new(config, 48000).unwrap();
        analyser.push_samples(&[1.0; 16]);
        analyser.push_samples(&[2.0; 32]);
        assert_eq!(&analyser.samples[..16], &[0.0; 16]);
        assert_eq!(&analyser.samples[16..32], &[1.0; 16]);
        assert_eq!(&analyser.samples[32..], &[2.0; 32]);
    }

    #[test]
    fn test_smoothing_decays_old_tone() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig::default(), 48000).unwrap();
        analyser.push_samples(&sine(19000.0, 2048, 48000));
        let index = 19000.0f32 / 24000.0 * 1024.0;
        let index = index.round() as usize;
        let loud = analyser.snapshot().magnitudes[index];

        analyser.push_samples(&[0.0; 2048]);
        let fading = analyser.snapshot().magnitudes[index];
        assert!(fading < loud);
        assert!(fading > DEFAULT_MIN_DECIBELS);

        analyser.reset();
        assert_eq!(analyser.snapshot().magnitudes[index], DEFAULT_MIN_DECIBELS);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad_size = AnalyserConfig {
            fft_size: 1000,
            ..Default::default()
        };
        assert!(SpectrumAnalyser::new(bad_size, 48000).is_err());

        let bad_smoothing = AnalyserConfig {
            smoothing: 1.0,
            ..Default::default()
        };
        assert!(SpectrumAnalyser::new(bad_smoothing, 48000).is_err());
        assert!(SpectrumAnalyser::new(AnalyserConfig::default(), 0).is_err());
    }
}
