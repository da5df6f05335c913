//! Receive side: peak detection, run-length debounce and message framing
//! over a stream of spectral snapshots.

use crate::codec::Codec;
use crate::error::{Result, ToneLinkError};
use crate::{DEFAULT_MIN_RUN_LENGTH, DEFAULT_PEAK_THRESHOLD_DB, DEFAULT_TIMEOUT_MS};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HISTORY_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemodulatorConfig {
    /// Minimum peak magnitude in dB for a frame to count as signal.
    pub peak_threshold: f32,
    /// A symbol needs more than this many repeats after its first frame.
    pub min_run_length: usize,
    /// Silence longer than this drops any partial message.
    pub timeout: Duration,
    pub history_capacity: usize,
}

impl Default for DemodulatorConfig {
    fn default() -> Self {
        Self {
            peak_threshold: DEFAULT_PEAK_THRESHOLD_DB,
            min_run_length: DEFAULT_MIN_RUN_LENGTH,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// One frame of power spectrum magnitudes (dB), bin `i` covering
/// `i * nyquist / bins`.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub magnitudes: &'a [f32],
    pub sample_rate: u32,
}

impl<'a> Snapshot<'a> {
    pub fn new(magnitudes: &'a [f32], sample_rate: u32) -> Self {
        Self {
            magnitudes,
            sample_rate,
        }
    }

    pub fn nyquist(&self) -> f32 {
        self.sample_rate as f32 / 2.0
    }

    pub fn index_to_frequency(&self, index: usize) -> f32 {
        self.nyquist() / self.magnitudes.len() as f32 * index as f32
    }

    pub fn frequency_to_index(&self, frequency: f32) -> usize {
        (frequency / self.nyquist() * self.magnitudes.len() as f32)
            .round()
            .max(0.0) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverMode {
    Idle,
    Receiving,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DemodulatorEvent {
    FrequencyDetected(f32),
    SymbolDetected(char),
    SessionIdle,
    MessageComplete(String),
    StreamError(String),
}

/// Bounded history of decoded peaks. The oldest entry is evicted once the
/// capacity is reached.
#[derive(Debug)]
pub struct PeakHistory {
    entries: VecDeque<Option<char>>,
    capacity: usize,
}

impl PeakHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, symbol: Option<char>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(symbol);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries before the newest one that repeat it.
    pub fn trailing_run(&self) -> usize {
        let Some(last) = self.entries.back() else {
            return 0;
        };
        self.entries
            .iter()
            .rev()
            .skip(1)
            .take_while(|&symbol| symbol == last)
            .count()
    }

    /// Removes and returns the trailing run, newest entry included, once it
    /// repeats more than `min_run_length` times. The outer `Option` is whether
    /// a run was taken; the inner one is the run's symbol, which may be an
    /// undecodable peak.
    pub fn take_run(&mut self, min_run_length: usize) -> Option<Option<char>> {
        let repeats = self.trailing_run();
        if repeats <= min_run_length {
            return None;
        }

        let symbol = *self.entries.back()?;
        self.entries.truncate(self.entries.len() - repeats - 1);
        Some(symbol)
    }
}

pub struct Demodulator {
    codec: Arc<Codec>,
    config: DemodulatorConfig,
    history: PeakHistory,
    /// Time of the newest candidate peak; debounce never trims it.
    last_peak: Option<Duration>,
    mode: ReceiverMode,
    buffer: String,
    last_symbol: Option<char>,
    running: bool,
}

impl Demodulator {
    pub fn new(codec: Arc<Codec>, config: DemodulatorConfig) -> Result<Self> {
        if config.history_capacity <= config.min_run_length + 1 {
            return Err(ToneLinkError::InvalidConfig(format!(
                "history capacity {} cannot hold a run of {} peaks",
                config.history_capacity,
                config.min_run_length + 2
            )));
        }
        if !config.peak_threshold.is_finite() {
            return Err(ToneLinkError::InvalidConfig(
                "peak threshold must be finite".into(),
            ));
        }

        Ok(Self {
            codec,
            history: PeakHistory::new(config.history_capacity),
            config,
            last_peak: None,
            mode: ReceiverMode::Idle,
            buffer: String::new(),
            last_symbol: None,
            running: true,
        })
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn config(&self) -> &DemodulatorConfig {
        &self.config
    }

    pub fn mode(&self) -> ReceiverMode {
        self.mode
    }

    /// Characters accepted so far in the current message.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn history(&self) -> &PeakHistory {
        &self.history
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts a fresh session in `Idle`.
    pub fn start(&mut self) {
        self.reset();
        self.running = true;
    }

    /// Stops the session and drops all partial state. Calling it twice is harmless.
    pub fn stop(&mut self) {
        if self.running {
            debug!("Demodulator stopped");
        }
        self.running = false;
        self.reset();
    }

    /// Capture failure is terminal: the session stops and the reason is reported.
    pub fn on_stream_error(&mut self, reason: impl Into<String>) -> Vec<DemodulatorEvent> {
        let reason = reason.into();
        warn!("Capture stream failed: {}", reason);
        self.stop();
        vec![DemodulatorEvent::StreamError(reason)]
    }

    /// One analysis step. `now` is the time since an arbitrary fixed epoch
    /// and must not go backwards.
    pub fn on_snapshot(&mut self, snapshot: &Snapshot<'_>, now: Duration) -> Vec<DemodulatorEvent> {
        let mut events = Vec::new();
        if !self.running {
            return events;
        }

        match self.peak_frequency(snapshot) {
            Some(frequency) => {
                trace!("Peak at {:.1} Hz", frequency);
                events.push(DemodulatorEvent::FrequencyDetected(frequency));
                let symbol = self.codec.to_character(frequency);
                self.history.push(symbol);
                self.last_peak = Some(now);
            }
            None => {
                let timed_out = self
                    .last_peak
                    .map_or(false, |last| now.saturating_sub(last) > self.config.timeout);
                if timed_out {
                    if self.mode == ReceiverMode::Receiving {
                        warn!(
                            "No signal for {:?}, dropping partial message {:?}",
                            self.config.timeout, self.buffer
                        );
                        events.push(DemodulatorEvent::SessionIdle);
                    }
                    self.reset();
                }
            }
        }

        if let Some(symbol) = self.history.take_run(self.config.min_run_length) {
            match symbol {
                Some(symbol) => {
                    events.push(DemodulatorEvent::SymbolDetected(symbol));
                    events.extend(self.feed_symbol(symbol));
                }
                None => trace!("Discarding run of out-of-band peaks"),
            }
        }

        events
    }

    /// Strongest bin at or above the band's lower edge, if it clears the threshold.
    pub fn peak_frequency(&self, snapshot: &Snapshot<'_>) -> Option<f32> {
        let start = snapshot.frequency_to_index(self.codec.config().min_frequency);

        let mut max = f32::NEG_INFINITY;
        let mut index = None;
        for (i, &magnitude) in snapshot.magnitudes.iter().enumerate().skip(start) {
            if magnitude > max {
                max = magnitude;
                index = Some(i);
            }
        }

        if max > self.config.peak_threshold {
            index.map(|i| snapshot.index_to_frequency(i))
        } else {
            None
        }
    }

    /// Framing state machine for one debounced symbol.
    pub fn feed_symbol(&mut self, symbol: char) -> Option<DemodulatorEvent> {
        let start = self.codec.start_symbol();
        let end = self.codec.end_symbol();
        let pad = self.codec.pad_symbol();

        match self.mode {
            ReceiverMode::Idle => {
                if symbol == start {
                    debug!("Start of message");
                    self.mode = ReceiverMode::Receiving;
                    self.buffer.clear();
                    self.last_symbol = None;
                }
                None
            }
            ReceiverMode::Receiving => {
                if symbol == start {
                    None
                } else if symbol == pad {
                    // lets a padded repeat such as "a.a" through
                    self.last_symbol = None;
                    None
                } else if symbol == end {
                    let message = std::mem::take(&mut self.buffer);
                    info!("Received message {:?}", message);
                    self.mode = ReceiverMode::Idle;
                    self.last_symbol = None;
                    Some(DemodulatorEvent::MessageComplete(message))
                } else if Some(symbol) == self.last_symbol {
                    None
                } else {
                    debug!("Accepted {:?}", symbol);
                    self.buffer.push(symbol);
                    self.last_symbol = Some(symbol);
                    None
                }
            }
        }
    }

    fn reset(&mut self) {
        self.mode = ReceiverMode::Idle;
        self.buffer.clear();
        self.last_symbol = None;
        self.history.clear();
        self.last_peak = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BINS: usize = 1024;
    const RATE: u32 = 48000;
    const FRAME: Duration = Duration::from_millis(10);

    fn demodulator() -> Demodulator {
        Demodulator::new(Arc::new(Codec::default()), DemodulatorConfig::default()).unwrap()
    }

    fn spectrum_with_peak(frequency: Option<f32>) -> Vec<f32> {
        let mut magnitudes = vec![-120.0f32; BINS];
        if let Some(frequency) = frequency {
            let snapshot = Snapshot::new(&magnitudes, RATE);
            let index = snapshot.frequency_to_index(frequency);
            magnitudes[index] = -30.0;
        }
        magnitudes
    }

    struct Trace {
        demodulator: Demodulator,
        now: Duration,
        events: Vec<DemodulatorEvent>,
    }

    impl Trace {
        fn new() -> Self {
            Self {
                demodulator: demodulator(),
                now: Duration::ZERO,
                events: Vec::new(),
            }
        }

        fn tone(&mut self, symbol: char, frames: usize) {
            let frequency = self.demodulator.codec().to_frequency(symbol);
            self.frames(frequency, frames);
        }

        fn silence(&mut self, frames: usize) {
            self.frames(None, frames);
        }

        fn frames(&mut self, frequency: Option<f32>, frames: usize) {
            let magnitudes = spectrum_with_peak(frequency);
            for _ in 0..frames {
                let snapshot = Snapshot::new(&magnitudes, RATE);
                let events = self.demodulator.on_snapshot(&snapshot, self.now);
                self.events.extend(events);
                self.now += FRAME;
            }
        }

        fn messages(&self) -> Vec<String> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    DemodulatorEvent::MessageComplete(m) => Some(m.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_clean_trace_yields_one_message() {
        let mut trace = Trace::new();
        for symbol in ['^', 'a', 'a', 'a', 'b', '$'] {
            trace.tone(symbol, 4);
        }
        assert_eq!(trace.messages(), vec!["ab".to_string()]);
        assert_eq!(trace.demodulator.mode(), ReceiverMode::Idle);
    }

    #[test]
    fn test_padded_repeats_are_kept() {
        let mut trace = Trace::new();
        for symbol in "^a.a.b$".chars() {
            trace.tone(symbol, 5);
        }
        assert_eq!(trace.messages(), vec!["aab".to_string()]);
    }

    #[test]
    fn test_long_tone_counts_once() {
        let mut trace = Trace::new();
        trace.tone('^', 4);
        trace.tone('c', 14);
        trace.tone('$', 4);
        assert_eq!(trace.messages(), vec!["c".to_string()]);
    }

    #[test]
    fn test_short_run_yields_nothing() {
        let mut history = PeakHistory::new(16);
        history.push(Some('x'));
        for _ in 0..3 {
            history.push(Some('a'));
        }
        // two repeats after the first 'a' is not more than two
        assert_eq!(history.trailing_run(), 2);
        assert_eq!(history.take_run(2), None);
        assert_eq!(history.len(), 4);

        history.push(Some('a'));
        assert_eq!(history.trailing_run(), 3);
        assert_eq!(history.take_run(2), Some(Some('a')));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_three_frame_tone_is_not_a_symbol() {
        let mut trace = Trace::new();
        trace.tone('^', 4);
        trace.tone('a', 3);
        trace.tone('b', 4);
        trace.tone('$', 4);
        assert_eq!(trace.messages(), vec!["b".to_string()]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = PeakHistory::new(4);
        for c in "abcdefhh".chars() {
            history.push(Some(c));
        }
        assert_eq!(history.len(), 4);
        assert_eq!(history.take_run(0), Some(Some('h')));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_single_frame_spikes_are_ignored() {
        let mut trace = Trace::new();
        trace.tone('^', 4);
        trace.tone('a', 4);
        trace.tone('k', 1);
        trace.tone('a', 1);
        trace.tone('b', 4);
        trace.tone('$', 4);
        assert_eq!(trace.messages(), vec!["ab".to_string()]);
    }

    #[test]
    fn test_duplicate_start_keeps_buffer() {
        let mut demodulator = demodulator();
        demodulator.feed_symbol('^');
        demodulator.feed_symbol('a');
        demodulator.feed_symbol('^');
        demodulator.feed_symbol('^');
        assert_eq!(demodulator.mode(), ReceiverMode::Receiving);
        assert_eq!(demodulator.buffer(), "a");

        demodulator.feed_symbol('b');
        assert_eq!(
            demodulator.feed_symbol('$'),
            Some(DemodulatorEvent::MessageComplete("ab".into()))
        );
    }

    #[test]
    fn test_symbols_outside_a_frame_are_ignored() {
        let mut demodulator = demodulator();
        assert_eq!(demodulator.feed_symbol('a'), None);
        assert_eq!(demodulator.feed_symbol('$'), None);
        assert_eq!(demodulator.mode(), ReceiverMode::Idle);
        assert_eq!(demodulator.buffer(), "");
    }

    #[test]
    fn test_pad_is_not_written() {
        let mut demodulator = demodulator();
        for c in "^x.y.".chars() {
            demodulator.feed_symbol(c);
        }
        assert_eq!(demodulator.buffer(), "xy");
    }

    #[test]
    fn test_timeout_returns_to_idle_without_message() {
        let mut trace = Trace::new();
        trace.tone('^', 4);
        trace.tone('a', 4);
        assert_eq!(trace.demodulator.mode(), ReceiverMode::Receiving);
        assert_eq!(trace.demodulator.buffer(), "a");

        trace.silence(40);
        assert_eq!(trace.demodulator.mode(), ReceiverMode::Idle);
        assert_eq!(trace.demodulator.buffer(), "");
        assert!(trace.demodulator.history().is_empty());
        assert!(trace.events.contains(&DemodulatorEvent::SessionIdle));

        // the tail of the old message must not complete anything
        trace.tone('b', 4);
        trace.tone('$', 4);
        assert!(trace.messages().is_empty());
    }

    #[test]
    fn test_timeout_after_fully_consumed_run() {
        let mut trace = Trace::new();
        trace.tone('^', 4);
        trace.tone('a', 4);
        // both runs were consumed exactly, nothing is left in the history
        assert!(trace.demodulator.history().is_empty());
        assert_eq!(trace.demodulator.buffer(), "a");

        trace.silence(200);
        assert_eq!(trace.demodulator.mode(), ReceiverMode::Idle);
        assert!(trace.events.contains(&DemodulatorEvent::SessionIdle));

        for symbol in "^hi$".chars() {
            trace.tone(symbol, 4);
        }
        assert_eq!(trace.messages(), vec!["hi".to_string()]);
    }

    #[test]
    fn test_short_gap_does_not_time_out() {
        let mut trace = Trace::new();
        trace.tone('^', 4);
        trace.tone('a', 4);
        trace.silence(15);
        trace.tone('b', 4);
        trace.tone('$', 4);
        assert_eq!(trace.messages(), vec!["ab".to_string()]);
    }

    #[test]
    fn test_quiet_frames_are_not_peaks() {
        let demodulator = demodulator();
        let mut magnitudes = vec![-120.0f32; BINS];
        let snapshot = Snapshot::new(&magnitudes, RATE);
        assert_eq!(demodulator.peak_frequency(&snapshot), None);

        let index = snapshot.frequency_to_index(19000.0);
        magnitudes[index] = -70.0;
        let snapshot = Snapshot::new(&magnitudes, RATE);
        assert_eq!(demodulator.peak_frequency(&snapshot), None);
    }

    #[test]
    fn test_peaks_below_band_are_ignored() {
        let demodulator = demodulator();
        let mut magnitudes = vec![-120.0f32; BINS];
        magnitudes[20] = 0.0;
        magnitudes[800] = -40.0;
        let snapshot = Snapshot::new(&magnitudes, RATE);
        assert_eq!(demodulator.peak_frequency(&snapshot), Some(18750.0));
    }

    #[test]
    fn test_stop_is_idempotent_and_resets() {
        let mut trace = Trace::new();
        trace.tone('^', 4);
        trace.tone('a', 4);

        trace.demodulator.stop();
        trace.demodulator.stop();
        assert!(!trace.demodulator.is_running());
        assert_eq!(trace.demodulator.mode(), ReceiverMode::Idle);
        assert_eq!(trace.demodulator.buffer(), "");

        let magnitudes = spectrum_with_peak(Some(18051.0));
        let snapshot = Snapshot::new(&magnitudes, RATE);
        assert!(trace.demodulator.on_snapshot(&snapshot, trace.now).is_empty());

        trace.demodulator.start();
        trace.events.clear();
        for symbol in "^z$".chars() {
            trace.tone(symbol, 4);
        }
        // 'z' is outside the alphabet so it never reaches the buffer
        assert_eq!(trace.messages(), vec![String::new()]);
    }

    #[test]
    fn test_stream_error_is_terminal() {
        let mut demodulator = demodulator();
        let events = demodulator.on_stream_error("device unplugged");
        assert_eq!(
            events,
            vec![DemodulatorEvent::StreamError("device unplugged".into())]
        );
        assert!(!demodulator.is_running());
    }

    #[test]
    fn test_history_capacity_must_hold_a_run() {
        let config = DemodulatorConfig {
            history_capacity: 2,
            ..Default::default()
        };
        assert!(Demodulator::new(Arc::new(Codec::default()), config).is_err());
    }
}
