use crate::codec::Codec;
use crate::demodulation::{Demodulator, DemodulatorEvent};
use crate::error::Result;
use crate::spectrum::SpectrumAnalyser;
use crate::Config;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HOP_SIZE: usize = 512;

/// Offline receiver: runs a recorded buffer through the same analyser and
/// demodulator as the live path, using the sample clock as time.
pub struct Replay {
    analyser: SpectrumAnalyser,
    demodulator: Demodulator,
    hop_size: usize,
    consumed: u64,
}

impl Replay {
    pub fn new(config: &Config, sample_rate: u32) -> Result<Self> {
        let codec = Arc::new(Codec::new(config.codec.clone())?);
        Ok(Self {
            analyser: SpectrumAnalyser::new(config.analyser, sample_rate)?,
            demodulator: Demodulator::new(codec, config.demodulator)?,
            hop_size: DEFAULT_HOP_SIZE,
            consumed: 0,
        })
    }

    pub fn with_hop_size(mut self, hop_size: usize) -> Self {
        self.hop_size = hop_size.max(1);
        self
    }

    pub fn demodulator(&self) -> &Demodulator {
        &self.demodulator
    }

    /// Simulated time at the end of the samples consumed so far.
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.consumed as f64 / self.analyser.sample_rate() as f64)
    }

    /// Feeds `samples` one hop at a time and returns every event raised.
    pub fn feed(&mut self, samples: &[f32]) -> Vec<DemodulatorEvent> {
        let mut events = Vec::new();
        for block in samples.chunks(self.hop_size) {
            self.analyser.push_samples(block);
            self.consumed += block.len() as u64;
            let now = self.elapsed();
            let snapshot = self.analyser.snapshot();
            events.extend(self.demodulator.on_snapshot(&snapshot, now));
        }
        events
    }

    /// Feeds `samples` followed by enough silence for the analyser to drain
    /// and the receive timeout to fire.
    pub fn run(&mut self, samples: &[f32]) -> Vec<DemodulatorEvent> {
        let mut events = self.feed(samples);

        let sample_rate = self.analyser.sample_rate();
        let tail = self.demodulator.config().timeout + Duration::from_secs(1);
        let tail_samples =
            self.analyser.bins() * 2 + (tail.as_secs_f64() * sample_rate as f64) as usize;
        events.extend(self.feed(&vec![0.0; tail_samples]));

        debug!(
            "Replayed {:?} of audio, {} events",
            self.elapsed(),
            events.len()
        );
        events
    }
}

pub fn completed_messages(events: &[DemodulatorEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            DemodulatorEvent::MessageComplete(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Decodes every complete message in a recording.
pub fn decode_samples(config: &Config, samples: &[f32], sample_rate: u32) -> Result<Vec<String>> {
    let mut replay = Replay::new(config, sample_rate)?;
    let events = replay.run(samples);
    Ok(completed_messages(&events))
}
