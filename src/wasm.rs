#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

#[cfg(target_arch = "wasm32")]
use crate::{
    codec::Codec,
    demodulation::{Demodulator, DemodulatorEvent, Snapshot},
    export::render_schedule,
    modulation::Modulator,
    Config, TransmissionMode,
};

#[cfg(target_arch = "wasm32")]
use std::{sync::Arc, time::Duration};

/// Browser binding. Transmit renders samples for an `AudioBuffer`; receive
/// takes `AnalyserNode.getFloatFrequencyData` frames.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub struct ToneLinkWasm {
    config: Config,
    modulator: Modulator,
    demodulator: Demodulator,
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
impl ToneLinkWasm {
    #[wasm_bindgen(constructor)]
    pub fn new(ultrasonic: bool) -> Result<ToneLinkWasm, JsValue> {
        console_error_panic_hook::set_once();

        let mode = if ultrasonic {
            TransmissionMode::Ultrasonic
        } else {
            TransmissionMode::Audible
        };
        Self::from_config(Config::for_mode(mode))
    }

    fn from_config(config: Config) -> Result<ToneLinkWasm, JsValue> {
        let codec = Arc::new(
            Codec::new(config.codec.clone()).map_err(|e| JsValue::from_str(&e.to_string()))?,
        );
        let modulator = Modulator::new(Arc::clone(&codec), config.modulator);
        let demodulator = Demodulator::new(codec, config.demodulator)
            .map_err(|e| JsValue::from_str(&e.to_string()))?;

        Ok(Self {
            config,
            modulator,
            demodulator,
        })
    }

    #[wasm_bindgen]
    pub fn set_character_duration(&mut self, duration_ms: u32) -> Result<(), JsValue> {
        let mut config = self.config.clone();
        config.modulator.character_duration = Duration::from_millis(duration_ms as u64);
        *self = Self::from_config(config)?;
        Ok(())
    }

    #[wasm_bindgen]
    pub fn set_volume(&mut self, volume: f32) {
        self.config.volume = volume.clamp(0.0, 1.0);
    }

    /// One frequency per framed symbol; `NaN` marks an unencodable character.
    #[wasm_bindgen]
    pub fn encode_frequencies(&self, message: &str, add_padding: bool) -> Vec<f32> {
        self.modulator
            .codec()
            .encode_string(message, add_padding)
            .into_iter()
            .map(|f| f.unwrap_or(f32::NAN))
            .collect()
    }

    #[wasm_bindgen]
    pub fn render(&self, message: &str, add_padding: bool, sample_rate: u32) -> Vec<f32> {
        let bursts = self.modulator.schedule(message, add_padding);
        render_schedule(&bursts, sample_rate, self.config.volume)
    }

    /// Feeds one analyser frame. Returns the message when a frame completes one.
    #[wasm_bindgen]
    pub fn process_spectrum(
        &mut self,
        magnitudes: &[f32],
        sample_rate: u32,
        timestamp_ms: f64,
    ) -> Option<String> {
        let snapshot = Snapshot::new(magnitudes, sample_rate);
        let now = Duration::from_secs_f64(timestamp_ms.max(0.0) / 1000.0);

        self.demodulator
            .on_snapshot(&snapshot, now)
            .into_iter()
            .find_map(|event| match event {
                DemodulatorEvent::MessageComplete(message) => Some(message),
                _ => None,
            })
    }

    #[wasm_bindgen]
    pub fn is_receiving(&self) -> bool {
        self.demodulator.mode() == crate::ReceiverMode::Receiving
    }

    #[wasm_bindgen]
    pub fn reset(&mut self) {
        self.demodulator.start();
    }

    #[wasm_bindgen]
    pub fn stop(&mut self) {
        self.demodulator.stop();
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub fn init() {
    console_error_panic_hook::set_once();
}
