use crate::error::{Result, ToneLinkError};
use crate::modulation::{Playback, ToneBurst};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use log::{debug, warn};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LEAD_IN: Duration = Duration::from_millis(50);

/// Playback timeline shared with the output callback. Bursts are mixed in
/// ahead of the play head and reported once the head passes their end.
#[derive(Default)]
struct Timeline {
    samples: Vec<f32>,
    position: usize,
    origin: usize,
    transmission: Option<u64>,
    pending: Vec<(usize, ToneBurst)>,
}

impl Timeline {
    fn schedule(&mut self, burst: &ToneBurst, sample_rate: u32, volume: f32) {
        if self.transmission != Some(burst.transmission) {
            let lead_in = (LEAD_IN.as_secs_f64() * sample_rate as f64) as usize;
            self.origin = self.position.max(self.samples.len()) + lead_in;
            self.transmission = Some(burst.transmission);
        }

        let offset =
            self.origin + (burst.start_time.as_secs_f64() * sample_rate as f64).round() as usize;
        let end = offset + burst.num_samples(sample_rate);
        if self.samples.len() < end {
            self.samples.resize(end, 0.0);
        }

        burst.render_into(&mut self.samples, offset, sample_rate, volume);
        self.pending.push((end, burst.clone()));
    }

    fn next_sample(&mut self) -> f32 {
        let sample = self.samples.get(self.position).copied().unwrap_or(0.0);
        self.position += 1;
        sample
    }

    fn take_finished(&mut self) -> Vec<ToneBurst> {
        let position = self.position;
        let mut finished = Vec::new();
        self.pending.retain(|(end, burst)| {
            if *end <= position {
                finished.push(burst.clone());
                false
            } else {
                true
            }
        });

        if self.pending.is_empty() && self.position >= self.samples.len() {
            self.samples.clear();
            self.position = 0;
            self.origin = 0;
        }

        finished
    }
}

/// Speaker-side collaborator. Finished bursts arrive on [`AudioOutput::finished`].
pub struct AudioOutput {
    _stream: Stream,
    timeline: Arc<Mutex<Timeline>>,
    failure: Arc<Mutex<Option<String>>>,
    finished: Receiver<ToneBurst>,
    sample_rate: u32,
    volume: f32,
}

impl AudioOutput {
    pub fn new(volume: f32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| ToneLinkError::AudioDevice("No output device found".into()))?;

        let supported_config = device
            .default_output_config()
            .map_err(|e| ToneLinkError::AudioDevice(e.to_string()))?;
        let sample_rate = supported_config.sample_rate().0;
        let channels = supported_config.channels().max(1) as usize;
        let config: StreamConfig = supported_config.config();

        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let failure = Arc::new(Mutex::new(None));
        let (tx, finished) = mpsc::channel();

        let timeline_clone = Arc::clone(&timeline);
        let failure_clone = Arc::clone(&failure);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Ok(mut timeline) = timeline_clone.lock() else {
                        data.fill(0.0);
                        return;
                    };

                    for frame in data.chunks_mut(channels) {
                        let sample = timeline.next_sample();
                        frame.fill(sample);
                    }

                    for burst in timeline.take_finished() {
                        let _ = tx.send(burst);
                    }
                },
                move |err| {
                    warn!("Audio output error: {}", err);
                    if let Ok(mut failure) = failure_clone.lock() {
                        *failure = Some(err.to_string());
                    }
                },
                None,
            )
            .map_err(|e| ToneLinkError::AudioDevice(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ToneLinkError::AudioDevice(e.to_string()))?;

        debug!("Output stream open: {} Hz, {} channels", sample_rate, channels);

        Ok(Self {
            _stream: stream,
            timeline,
            failure,
            finished,
            sample_rate,
            volume,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn finished(&self) -> &Receiver<ToneBurst> {
        &self.finished
    }

    /// Device failure reported by the output callback, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }
}

impl Playback for AudioOutput {
    fn schedule_burst(&mut self, burst: &ToneBurst) -> Result<()> {
        if let Some(reason) = self.failure() {
            return Err(ToneLinkError::AudioDevice(reason));
        }

        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| ToneLinkError::AudioDevice("output timeline poisoned".into()))?;
        timeline.schedule(burst, self.sample_rate, self.volume);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Mono block, channels averaged.
    Samples(Vec<f32>),
    Error(String),
}

/// Microphone-side collaborator.
pub struct AudioInput {
    device: Device,
    config: StreamConfig,
}

impl AudioInput {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| ToneLinkError::AudioDevice("No input device found".into()))?;

        let config = device
            .default_input_config()
            .map_err(|e| ToneLinkError::AudioDevice(e.to_string()))?
            .config();

        Ok(Self { device, config })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Opens the input stream. Capture runs until the session is dropped.
    pub fn start(&self) -> Result<CaptureSession> {
        let channels = self.config.channels.max(1) as usize;
        let (tx, events) = mpsc::channel();
        let error_tx = tx.clone();

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let block = data
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                        .collect();
                    let _ = tx.send(CaptureEvent::Samples(block));
                },
                move |err| {
                    let _ = error_tx.send(CaptureEvent::Error(err.to_string()));
                },
                None,
            )
            .map_err(|e| ToneLinkError::AudioDevice(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ToneLinkError::AudioDevice(e.to_string()))?;

        debug!(
            "Input stream open: {} Hz, {} channels",
            self.sample_rate(),
            channels
        );

        Ok(CaptureSession {
            _stream: stream,
            events,
        })
    }
}

pub struct CaptureSession {
    _stream: Stream,
    events: Receiver<CaptureEvent>,
}

impl CaptureSession {
    pub fn events(&self) -> &Receiver<CaptureEvent> {
        &self.events
    }
}

pub fn list_audio_devices() -> Vec<String> {
    let host = cpal::default_host();
    let default_output = host.default_output_device().and_then(|d| d.name().ok());
    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let mut devices = Vec::new();

    let mut push = |kind: &str, name: String, default: &Option<String>| {
        let marker = if default.as_ref() == Some(&name) { " (default)" } else { "" };
        devices.push(format!("{}: {}{}", kind, name, marker));
    };

    if let Ok(output_devices) = host.output_devices() {
        for name in output_devices.filter_map(|d| d.name().ok()) {
            push("Output", name, &default_output);
        }
    }

    if let Ok(input_devices) = host.input_devices() {
        for name in input_devices.filter_map(|d| d.name().ok()) {
            push("Input", name, &default_input);
        }
    }

    devices
}
