//! Audio cue synthesis and playback seam.
//!
//! Two cues are used by the corridor task: a short go tone played when a
//! trial's stimulus appears and a white-noise burst on errors. Waveforms
//! are synthesised once at startup from the configured sample rate and
//! handed to whatever [`AudioSink`] the process was built with.

use crate::config::SoundConfig;
use crate::error::RigResult;
use rand::Rng;
use std::f64::consts::PI;
use tracing::debug;

/// Mono PCM buffer at a fixed sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samplerate_hz: u32,
    pub samples: Vec<f32>,
}

impl Waveform {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.samplerate_hz)
    }
}

/// Pure sine tone at `freq_hz` for `secs`, with a short linear ramp at
/// both ends to avoid speaker clicks.
pub fn sine_tone(samplerate_hz: u32, freq_hz: f64, secs: f64) -> Waveform {
    let n = (f64::from(samplerate_hz) * secs).round() as usize;
    let ramp = (f64::from(samplerate_hz) * 0.005).round() as usize;
    let mut samples = Vec::with_capacity(n);
    for i in 0..n {
        let t = i as f64 / f64::from(samplerate_hz);
        let mut s = (2.0 * PI * freq_hz * t).sin();
        if ramp > 0 {
            if i < ramp {
                s *= i as f64 / ramp as f64;
            }
            let from_end = n - 1 - i;
            if from_end < ramp {
                s *= from_end as f64 / ramp as f64;
            }
        }
        samples.push(s as f32);
    }
    Waveform {
        samplerate_hz,
        samples,
    }
}

/// Uniform white noise for `secs`, scaled to stay well below full scale.
pub fn white_noise(samplerate_hz: u32, secs: f64) -> Waveform {
    let n = (f64::from(samplerate_hz) * secs).round() as usize;
    let mut rng = rand::thread_rng();
    let samples = (0..n).map(|_| rng.gen_range(-0.5f32..0.5f32)).collect();
    Waveform {
        samplerate_hz,
        samples,
    }
}

/// Playback seam. Implementations must return promptly; playback runs in
/// the sink's own thread or device queue.
pub trait AudioSink: Send + Sync {
    fn play(&self, waveform: &Waveform) -> RigResult<()>;
    fn stop(&self) -> RigResult<()>;
}

/// Sink used when no audio hardware is configured. Logs and discards.
#[derive(Debug, Default)]
pub struct NullAudio;

impl AudioSink for NullAudio {
    fn play(&self, waveform: &Waveform) -> RigResult<()> {
        debug!(
            secs = waveform.duration_secs(),
            "no audio device, dropping cue"
        );
        Ok(())
    }

    fn stop(&self) -> RigResult<()> {
        Ok(())
    }
}

/// The synthesised cues for one session.
pub struct SoundBank {
    pub go_tone: Waveform,
    pub noise: Waveform,
}

impl SoundBank {
    pub fn from_config(cfg: &SoundConfig) -> Self {
        Self {
            go_tone: sine_tone(cfg.samplerate_hz, cfg.go_tone_hz, cfg.go_tone_secs),
            noise: white_noise(cfg.samplerate_hz, cfg.noise_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_tone_has_expected_length_and_ramp() {
        let wave = sine_tone(44_100, 5_000.0, 0.1);
        assert_eq!(wave.samples.len(), 4_410);
        assert!((wave.duration_secs() - 0.1).abs() < 1e-9);
        // Ramped endpoints are silent.
        assert_eq!(wave.samples[0], 0.0);
        assert_eq!(*wave.samples.last().unwrap(), 0.0);
        // Interior reaches close to full scale.
        assert!(wave.samples.iter().any(|s| s.abs() > 0.9));
    }

    #[test]
    fn white_noise_stays_in_bounds() {
        let wave = white_noise(44_100, 0.5);
        assert_eq!(wave.samples.len(), 22_050);
        assert!(wave.samples.iter().all(|s| s.abs() <= 0.5));
    }

    #[test]
    fn bank_builds_both_cues_from_config() {
        let cfg = SoundConfig {
            samplerate_hz: 44_100,
            go_tone_hz: 5_000.0,
            go_tone_secs: 0.1,
            noise_secs: 0.5,
        };
        let bank = SoundBank::from_config(&cfg);
        assert_eq!(bank.go_tone.samples.len(), 4_410);
        assert_eq!(bank.noise.samples.len(), 22_050);
    }
}
