use crate::codec::Codec;
use crate::error::{Result, ToneLinkError};
use crate::{DEFAULT_CHARACTER_DURATION_MS, DEFAULT_RAMP_DURATION_MS};
use log::{debug, info, warn};
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulatorConfig {
    pub character_duration: Duration,
    pub ramp_duration: Duration,
}

impl Default for ModulatorConfig {
    fn default() -> Self {
        Self {
            character_duration: Duration::from_millis(DEFAULT_CHARACTER_DURATION_MS),
            ramp_duration: Duration::from_millis(DEFAULT_RAMP_DURATION_MS),
        }
    }
}

/// Trapezoidal gain: linear ramp up, hold at 1.0, linear ramp down to zero at `duration`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub duration: Duration,
    pub ramp: Duration,
}

impl Envelope {
    pub fn new(duration: Duration, ramp: Duration) -> Self {
        Self {
            duration,
            ramp: ramp.min(duration / 2),
        }
    }

    /// Gain at `t` seconds after the burst starts.
    pub fn gain_at(&self, t: f32) -> f32 {
        let duration = self.duration.as_secs_f32();
        let ramp = self.ramp.as_secs_f32();

        if t < 0.0 || t >= duration {
            0.0
        } else if ramp <= 0.0 {
            1.0
        } else if t < ramp {
            t / ramp
        } else if t > duration - ramp {
            (duration - t) / ramp
        } else {
            1.0
        }
    }
}

/// One scheduled tone. `start_time` is relative to the start of its transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneBurst {
    pub transmission: u64,
    /// Position in the encoded frequency sequence.
    pub index: usize,
    pub frequency: f32,
    pub start_time: Duration,
    pub duration: Duration,
    pub envelope: Envelope,
}

impl ToneBurst {
    pub fn end_time(&self) -> Duration {
        self.start_time + self.duration
    }

    pub fn num_samples(&self, sample_rate: u32) -> usize {
        (self.duration.as_secs_f32() * sample_rate as f32).round() as usize
    }

    pub fn render(&self, sample_rate: u32, volume: f32) -> Vec<f32> {
        let mut samples = vec![0.0f32; self.num_samples(sample_rate)];
        self.render_into(&mut samples, 0, sample_rate, volume);
        samples
    }

    /// Mixes this burst into `buffer` starting at sample `offset`; samples past
    /// the end of `buffer` are dropped.
    pub fn render_into(&self, buffer: &mut [f32], offset: usize, sample_rate: u32, volume: f32) {
        let num_samples = self.num_samples(sample_rate);
        let end = buffer.len().min(offset.saturating_add(num_samples));
        if offset >= end {
            return;
        }

        for (i, out) in buffer[offset..end].iter_mut().enumerate() {
            let t = i as f32 / sample_rate as f32;
            let sample = (2.0 * PI * self.frequency * t).sin() * volume;
            *out += sample * self.envelope.gain_at(t);
        }
    }
}

/// Output side collaborator. Implementations must report each burst back to
/// [`Modulator::on_burst_finished`] once it has played.
pub trait Playback {
    fn schedule_burst(&mut self, burst: &ToneBurst) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModulatorEvent {
    BurstSent {
        frequency: f32,
        start_time: Duration,
        duration: Duration,
    },
    TransmissionComplete,
}

#[derive(Debug)]
struct Transmission {
    id: u64,
    pending: Vec<bool>,
    remaining: usize,
}

pub struct Modulator {
    codec: Arc<Codec>,
    config: ModulatorConfig,
    next_transmission: u64,
    active: Option<Transmission>,
}

impl Modulator {
    pub fn new(codec: Arc<Codec>, config: ModulatorConfig) -> Self {
        Self {
            codec,
            config,
            next_transmission: 1,
            active: None,
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn config(&self) -> &ModulatorConfig {
        &self.config
    }

    /// Builds the burst schedule for `message` without transmitting it.
    /// Unencodable characters get no burst but keep their time slot.
    pub fn schedule(&self, message: &str, add_padding: bool) -> Vec<ToneBurst> {
        self.build_schedule(0, message, add_padding)
    }

    /// Airtime of the framed message, silent slots included.
    pub fn total_duration(&self, message: &str, add_padding: bool) -> Duration {
        let symbols = self.codec.frame(message, add_padding).chars().count();
        self.config.character_duration * symbols as u32
    }

    pub fn is_transmitting(&self) -> bool {
        self.active.is_some()
    }

    /// Hands every burst of `message` to `playback`. Any scheduling failure
    /// aborts the whole transmission; nothing is resent.
    pub fn transmit<P: Playback + ?Sized>(
        &mut self,
        message: &str,
        add_padding: bool,
        playback: &mut P,
    ) -> Result<Vec<ToneBurst>> {
        let id = self.next_transmission;
        self.next_transmission += 1;

        let bursts = self.build_schedule(id, message, add_padding);
        let sequence_len = self.codec.frame(message, add_padding).chars().count();

        let mut pending = vec![false; sequence_len];
        for burst in &bursts {
            pending[burst.index] = true;
        }

        // START and END are always encodable, so `bursts` is never empty.
        self.active = Some(Transmission {
            id,
            pending,
            remaining: bursts.len(),
        });

        info!(
            "Transmitting {} bursts for {} symbols",
            bursts.len(),
            sequence_len
        );

        for burst in &bursts {
            if let Err(e) = playback.schedule_burst(burst) {
                warn!("Playback refused burst {}: {}", burst.index, e);
                self.active = None;
                return Err(ToneLinkError::TransmissionAborted(e.to_string()));
            }
        }

        Ok(bursts)
    }

    /// Completion accounting for one played burst. Acknowledgements for other
    /// transmissions or already counted bursts are ignored.
    pub fn on_burst_finished(&mut self, burst: &ToneBurst) -> Vec<ModulatorEvent> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };

        if burst.transmission != active.id {
            debug!(
                "Ignoring burst from transmission {} (active {})",
                burst.transmission, active.id
            );
            return Vec::new();
        }

        match active.pending.get_mut(burst.index) {
            Some(pending) if *pending => *pending = false,
            _ => return Vec::new(),
        }
        active.remaining -= 1;

        let mut events = vec![ModulatorEvent::BurstSent {
            frequency: burst.frequency,
            start_time: burst.start_time,
            duration: burst.duration,
        }];

        if active.remaining == 0 {
            info!("Transmission {} complete", active.id);
            self.active = None;
            events.push(ModulatorEvent::TransmissionComplete);
        }

        events
    }

    pub fn cancel(&mut self) {
        if let Some(active) = self.active.take() {
            debug!("Cancelled transmission {}", active.id);
        }
    }

    fn build_schedule(&self, transmission: u64, message: &str, add_padding: bool) -> Vec<ToneBurst> {
        let duration = self.config.character_duration;
        let envelope = Envelope::new(duration, self.config.ramp_duration);

        self.codec
            .encode_string(message, add_padding)
            .into_iter()
            .enumerate()
            .filter_map(|(index, frequency)| match frequency {
                Some(frequency) => Some(ToneBurst {
                    transmission,
                    index,
                    frequency,
                    start_time: duration * index as u32,
                    duration,
                    envelope,
                }),
                None => {
                    debug!("Skipping unencodable symbol at position {}", index);
                    None
                }
            })
            .collect()
    }
}
