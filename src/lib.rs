//! Two-pass spectral noise reduction for digital audio.
//!
//! The first pass is run over representative noise alone: each windowed
//! frame is transformed and per-band power statistics accumulate into a
//! [`NoiseProfile`]. The second pass processes arbitrary audio against that
//! frozen profile. Per frequency band, the gain is raised to unity where the
//! sound exceeds what the profile predicts for noise and left at an
//! attenuation factor otherwise; the gains are then smoothed over time with
//! lookahead attack and release envelopes and over frequency, applied to the
//! complex spectrum, and resynthesized by overlap-add.
//!
//! The engine is synchronous and offline: lookahead of several frames makes
//! it acausal at frame granularity. Each track is processed independently.
//!
//! ```
//! use spectral_denoise::{MemoryTrack, NoiseReduction, NoiseReductionSettings};
//!
//! let mut effect = NoiseReduction::new(NoiseReductionSettings::default());
//!
//! // First pass: profile a stretch of noise
//! let mut noise = MemoryTrack::from_samples(44100.0, vec![0.0; 44100]);
//! effect.process(&mut [&mut noise], 0.0, 1.0, &mut |_, _| false)?;
//!
//! // Second pass: the same call now reduces noise in the real signal
//! let mut voice = MemoryTrack::from_samples(44100.0, vec![0.0; 44100]);
//! effect.process(&mut [&mut voice], 0.0, 1.0, &mut |_, _| false)?;
//! # Ok::<(), spectral_denoise::ProcessError>(())
//! ```

use log::warn;

/// Real FFT with the engine's packed spectrum layout
pub mod fft;
/// Noise profile statistics shared between the passes
pub mod noise_profile;
/// Streaming analysis, classification, gain shaping, and resynthesis
pub mod reduction;
/// Configuration model and persistence
pub mod settings;
/// Sliding history of spectral frames
pub mod spectrum_queue;
/// Audio source/sink abstraction and in-memory tracks
pub mod track;
/// Shared numeric helpers
pub mod utils;
/// Analysis and synthesis window generation
pub mod windows;

pub use noise_profile::NoiseProfile;
pub use reduction::{Outcome, ProcessError, ReductionWorker};
pub use settings::{
    DiscriminationMethod, NoiseReductionSettings, ReductionChoice, SettingsError,
};
pub use track::{AudioSink, AudioSource, MemoryTrack, Track, TrackError};
pub use windows::WindowType;

/// Two-pass noise reduction effect. Owns the settings and, once the first
/// pass succeeds, the noise profile consumed by the second.
///
/// The same `process` call runs both passes: a new effect starts in
/// profiling mode and flips itself to reducing after a successful profile,
/// so repeating the invocation proceeds to the second pass.
pub struct NoiseReduction {
    settings: NoiseReductionSettings,
    profile: Option<NoiseProfile>,
    do_profile: bool,
}

impl NoiseReduction {
    /// New effect in profiling mode
    pub fn new(settings: NoiseReductionSettings) -> Self {
        Self { settings, profile: None, do_profile: true }
    }

    #[inline]
    pub fn settings(&self) -> &NoiseReductionSettings {
        &self.settings
    }

    /// Replace the settings; takes effect on the next invocation
    pub fn set_settings(&mut self, settings: NoiseReductionSettings) {
        self.settings = settings;
    }

    /// True while the next invocation will gather a profile
    #[inline]
    pub fn is_profiling(&self) -> bool {
        self.do_profile
    }

    /// Choose which pass the next invocation runs. Selecting the reduction
    /// pass without a stored profile fails at process time.
    pub fn set_profiling(&mut self, profiling: bool) {
        self.do_profile = profiling;
    }

    /// The stored profile, once the profiling pass has succeeded
    #[inline]
    pub fn profile(&self) -> Option<&NoiseProfile> {
        self.profile.as_ref()
    }

    /// Discard any stored profile and return to profiling mode
    pub fn reset(&mut self) {
        self.profile = None;
        self.do_profile = true;
    }

    /// Run the configured pass over the selection `[t0, t1]` (seconds) of
    /// every track. The progress callback receives the track index and a
    /// fraction complete once per input block; returning `true` requests
    /// cancellation.
    pub fn process<T: Track + ?Sized>(
        &mut self,
        tracks: &mut [&mut T],
        t0: f64,
        t1: f64,
        progress: &mut dyn FnMut(usize, f64) -> bool,
    ) -> Result<Outcome, ProcessError> {
        if self.do_profile {
            let rate = match tracks.first() {
                Some(track) => track.sample_rate(),
                None => return Err(ProcessError::ProfileTooShort),
            };

            let mut profile = NoiseProfile::new(
                self.settings.spectrum_size(),
                rate,
                self.settings.window_type,
            );
            let mut worker = ReductionWorker::new(&self.settings, rate, true)?;
            match worker.process(&mut profile, tracks, t0, t1, progress) {
                Ok(Outcome::Completed) => {
                    // So that a repeated invocation proceeds to the second pass
                    self.profile = Some(profile);
                    self.do_profile = false;
                    Ok(Outcome::Completed)
                }
                // Profiling must be done again before any reduction
                other => other,
            }
        } else {
            let profile = self.profile.as_mut().ok_or(ProcessError::NoProfile)?;

            // Possible only by changing the advanced settings between passes
            if profile.window_size() != self.settings.window_size {
                return Err(ProcessError::WindowSizeMismatch {
                    profile: profile.window_size(),
                    requested: self.settings.window_size,
                });
            }
            if profile.window_type() != self.settings.window_type {
                warn!("window types are not the same as for profiling");
            }

            let rate = profile.sample_rate();
            let mut worker = ReductionWorker::new(&self.settings, rate, false)?;
            worker.process(profile, tracks, t0, t1, progress)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::RealFft;
    use crate::utils::calculate_rms;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::PI;

    const RATE: f64 = 44100.0;

    fn sine(len: usize, freq: f64, amplitude: f64) -> Vec<f32> {
        (0..len)
            .map(|i| (amplitude * (2.0 * PI * freq * i as f64 / RATE).sin()) as f32)
            .collect()
    }

    /// Uniform white noise with the requested RMS
    fn white_noise(len: usize, rms: f64, seed: u64) -> Vec<f32> {
        let amplitude = (rms * 3f64.sqrt()) as f32;
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-amplitude..amplitude)).collect()
    }

    fn mix(a: &[f32], b: &[f32]) -> Vec<f32> {
        a.iter().zip(b.iter()).map(|(x, y)| x + y).collect()
    }

    /// Profile `noise`, then run the second pass over `input` and return the
    /// processed samples.
    fn profile_and_reduce(
        settings: &NoiseReductionSettings,
        noise: &[f32],
        input: &[f32],
    ) -> Vec<f32> {
        let mut effect = NoiseReduction::new(settings.clone());

        let mut noise_track = MemoryTrack::from_samples(RATE, noise.to_vec());
        let t1 = noise_track.end_time();
        effect
            .process(&mut [&mut noise_track], 0.0, t1, &mut |_, _| false)
            .unwrap();

        let mut track = MemoryTrack::from_samples(RATE, input.to_vec());
        let t1 = track.end_time();
        effect.process(&mut [&mut track], 0.0, t1, &mut |_, _| false).unwrap();
        track.samples().to_vec()
    }

    /// Samples to skip at each end before asserting steady-state behavior;
    /// covers the queue fill, the zero-padded startup windows, and the
    /// attack lookahead. Valid for the newer discrimination methods.
    fn settle_margin(settings: &NoiseReductionSettings) -> usize {
        let step = settings.step_size();
        let n_attack = 1 + (settings.attack_time * RATE / step as f64) as usize;
        let n_windows = 1 + settings.steps_per_window;
        let history = n_windows.max(n_windows / 2 + n_attack);
        (history + settings.steps_per_window) * step + settings.window_size
    }

    /// Amplitude of a coherent sine component, measured over a whole number
    /// of cycles
    fn component_amplitude(samples: &[f32], freq: f64) -> f64 {
        let n = samples.len() as f64;
        let (mut re, mut im) = (0.0f64, 0.0f64);
        for (i, &s) in samples.iter().enumerate() {
            let theta = 2.0 * PI * freq * i as f64 / RATE;
            re += s as f64 * theta.cos();
            im += s as f64 * theta.sin();
        }
        2.0 * (re * re + im * im).sqrt() / n
    }

    /// Energy in `[f_low, f_high]` Hz of a Hann-windowed 8192-sample slice
    fn band_energy(samples: &[f32], f_low: f64, f_high: f64) -> f64 {
        let size = 8192;
        assert!(samples.len() >= size);
        let mut fft = RealFft::new(size);
        let mut buffer: Vec<f32> = (0..size)
            .map(|i| {
                let w = 0.5 - 0.5 * (2.0 * PI * i as f64 / size as f64).cos();
                samples[i] * w as f32
            })
            .collect();
        fft.forward_real(&mut buffer);

        let bin_hz = RATE / size as f64;
        let k0 = ((f_low / bin_hz).ceil() as usize).max(1);
        let k1 = ((f_high / bin_hz).floor() as usize).min(size / 2 - 1);
        let mut energy = 0.0f64;
        for k in k0..=k1 {
            let (re, im) = (buffer[2 * k] as f64, buffer[2 * k + 1] as f64);
            energy += re * re + im * im;
        }
        energy
    }

    // ------------------------------------------------------------------------
    // End-to-end scenarios
    // ------------------------------------------------------------------------

    #[test]
    fn test_silence_passthrough() {
        let settings = NoiseReductionSettings::default();
        let noise = vec![0.0; 8820];
        let input = vec![0.0; RATE as usize];

        let output = profile_and_reduce(&settings, &noise, &input);
        assert_eq!(output.len(), input.len());
        assert!(output.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_tone_preserved_with_clean_profile() {
        // Profiled on digital silence, nothing in the signal is classified
        // as noise and the pipeline reduces to overlap-add reconstruction
        let settings = NoiseReductionSettings::default();
        let noise = vec![0.0; 8820];
        let input = sine(RATE as usize, 1000.0, 0.8);

        let output = profile_and_reduce(&settings, &noise, &input);
        assert_eq!(output.len(), input.len());

        let margin = settle_margin(&settings);
        let max_err = input[margin..input.len() - margin]
            .iter()
            .zip(&output[margin..input.len() - margin])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err < 1e-3, "reconstruction error {}", max_err);
    }

    #[test]
    fn test_white_noise_attenuated_by_noise_gain() {
        let settings = NoiseReductionSettings::default();
        let noise = white_noise(8820, 0.1, 1);
        let input = white_noise(RATE as usize, 0.1, 2);

        let output = profile_and_reduce(&settings, &noise, &input);
        let margin = settle_margin(&settings);
        let rms = calculate_rms(&output[margin..output.len() - margin]);

        // 24 dB of attenuation, within the tolerance of the classifier
        let target = 0.1 * 10f32.powf(-24.0 / 20.0);
        assert!(rms <= target * 1.2, "rms {} above {}", rms, target * 1.2);
        assert!(rms >= target * 0.5, "rms {} suspiciously low", rms);
    }

    #[test]
    fn test_sine_in_noise() {
        // Frequency smoothing off so the tone's own gain is untouched by its
        // attenuated neighborhood
        let settings = NoiseReductionSettings {
            freq_smoothing_hz: 0.0,
            ..NoiseReductionSettings::default()
        };
        let len = 66150;
        let tone = sine(len, 1000.0, 0.1 * 2f64.sqrt());
        let noise = white_noise(len, 0.01, 6);
        let input = mix(&tone, &noise);
        let profile_noise = white_noise(8820, 0.01, 5);

        let output = profile_and_reduce(&settings, &profile_noise, &input);

        // Steady state, whole number of 1 kHz cycles
        let start = 16384;
        let measured = component_amplitude(&output[start..start + 8820], 1000.0);
        let clean = 0.1 * 2f64.sqrt();
        let level_db = 20.0 * (measured / clean).log10();
        assert!(level_db.abs() < 0.5, "tone level changed by {} dB", level_db);

        // Out-of-band noise attenuated by at least 18 dB
        let e_in = band_energy(&input[start..start + 8192], 2000.0, 20000.0);
        let e_out = band_energy(&output[start..start + 8192], 2000.0, 20000.0);
        assert!(
            e_out <= e_in * 10f64.powf(-18.0 / 10.0),
            "band energy ratio {}",
            e_out / e_in
        );
    }

    #[test]
    fn test_residue_complements_reduction() {
        // The residue pass applies (gain - 1), a phase-flipped copy of what
        // reduction removed, so reduced minus residue rebuilds the input
        let settings = NoiseReductionSettings::default();
        let profile_noise = white_noise(8820, 0.05, 21);
        let input = mix(
            &sine(RATE as usize, 440.0, 0.5),
            &white_noise(RATE as usize, 0.05, 22),
        );

        let mut effect = NoiseReduction::new(settings.clone());
        let mut noise_track = MemoryTrack::from_samples(RATE, profile_noise.clone());
        let t1 = noise_track.end_time();
        effect
            .process(&mut [&mut noise_track], 0.0, t1, &mut |_, _| false)
            .unwrap();

        let mut reduce_track = MemoryTrack::from_samples(RATE, input.clone());
        let t1 = reduce_track.end_time();
        effect
            .process(&mut [&mut reduce_track], 0.0, t1, &mut |_, _| false)
            .unwrap();

        let mut residue_settings = settings.clone();
        residue_settings.reduction_choice = ReductionChoice::LeaveResidue;
        effect.set_settings(residue_settings);
        let mut residue_track = MemoryTrack::from_samples(RATE, input.clone());
        effect
            .process(&mut [&mut residue_track], 0.0, t1, &mut |_, _| false)
            .unwrap();

        let margin = settle_margin(&settings);
        let max_err = (margin..input.len() - margin)
            .map(|i| {
                let rebuilt = reduce_track.samples()[i] - residue_track.samples()[i];
                (rebuilt - input[i]).abs()
            })
            .fold(0.0f32, f32::max);
        assert!(max_err < 1e-3, "complement error {}", max_err);
    }

    #[test]
    fn test_isolate_complements_reduce() {
        // With maximum attenuation and no time or frequency smoothing, the
        // reduce and isolate gain lattices are complementary
        let settings = NoiseReductionSettings {
            noise_gain_db: 48.0,
            freq_smoothing_hz: 0.0,
            attack_time: 0.0,
            release_time: 0.0,
            ..NoiseReductionSettings::default()
        };
        let len = RATE as usize;
        let input = mix(&sine(len, 880.0, 0.3), &white_noise(len, 0.02, 31));
        let profile_noise = white_noise(8820, 0.02, 30);

        let reduced = profile_and_reduce(&settings, &profile_noise, &input);

        let isolate_settings = NoiseReductionSettings {
            reduction_choice: ReductionChoice::IsolateNoise,
            ..settings.clone()
        };
        let isolated = profile_and_reduce(&isolate_settings, &profile_noise, &input);

        let margin = settle_margin(&settings);
        let interior = margin..len - margin;
        let rms_in = calculate_rms(&input[interior.clone()]);
        let err: Vec<f32> = interior
            .clone()
            .map(|i| reduced[i] + isolated[i] - input[i])
            .collect();
        let rms_err = calculate_rms(&err);
        assert!(
            rms_err < 0.01 * rms_in + 1e-4,
            "complement rms {} vs input {}",
            rms_err,
            rms_in
        );
    }

    #[test]
    fn test_isolate_keeps_pure_noise() {
        let settings = NoiseReductionSettings {
            reduction_choice: ReductionChoice::IsolateNoise,
            ..NoiseReductionSettings::default()
        };
        let noise = white_noise(8820, 0.1, 41);
        let input = white_noise(RATE as usize, 0.1, 42);

        let output = profile_and_reduce(&settings, &noise, &input);
        let margin = settle_margin(&settings);
        let interior = margin..input.len() - margin;

        let err: Vec<f32> = interior
            .clone()
            .map(|i| output[i] - input[i])
            .collect();
        let rms_in = calculate_rms(&input[interior]);
        assert!(calculate_rms(&err) < 0.05 * rms_in);
    }

    #[test]
    fn test_band_restricted_reduction() {
        let noise = white_noise(8820, 0.1, 51);
        let input = white_noise(RATE as usize, 0.1, 52);

        let banded_settings = NoiseReductionSettings {
            frequency_band: Some((0.0, 300.0)),
            ..NoiseReductionSettings::default()
        };
        let banded = profile_and_reduce(&banded_settings, &noise, &input);

        let full = profile_and_reduce(&NoiseReductionSettings::default(), &noise, &input);

        let margin = settle_margin(&banded_settings);
        let interior = margin..input.len() - margin;
        let rms_in = calculate_rms(&input[interior.clone()]);
        let rms_banded = calculate_rms(&banded[interior.clone()]);
        let rms_full = calculate_rms(&full[interior]);

        // Only bins up to 300 Hz may be touched
        assert!(rms_banded > 0.8 * rms_in, "{} vs {}", rms_banded, rms_in);
        assert!(rms_full < 0.15 * rms_in, "{} vs {}", rms_full, rms_in);
    }

    // ------------------------------------------------------------------------
    // Boundary configurations
    // ------------------------------------------------------------------------

    #[test]
    fn test_smallest_window() {
        let settings = NoiseReductionSettings {
            window_size: 8,
            steps_per_window: 4,
            ..NoiseReductionSettings::default()
        };
        let noise = white_noise(2205, 0.1, 61);
        let input = white_noise(8820, 0.1, 62);

        let output = profile_and_reduce(&settings, &noise, &input);
        assert_eq!(output.len(), input.len());
        assert!(output.iter().all(|s| s.is_finite()));
        assert!(calculate_rms(&output) < calculate_rms(&input));
    }

    #[test]
    fn test_largest_window() {
        let settings = NoiseReductionSettings {
            window_size: 16384,
            steps_per_window: 4,
            ..NoiseReductionSettings::default()
        };
        let noise = white_noise(22050, 0.1, 63);
        let input = white_noise(RATE as usize, 0.1, 64);

        let output = profile_and_reduce(&settings, &noise, &input);
        assert_eq!(output.len(), input.len());
        assert!(output.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_step_size_of_one_sample() {
        let settings = NoiseReductionSettings {
            window_size: 8,
            steps_per_window: 8,
            window_type: WindowType::HannRectangular,
            freq_smoothing_hz: 0.0,
            attack_time: 0.0,
            release_time: 0.0,
            ..NoiseReductionSettings::default()
        };
        let noise = white_noise(1000, 0.1, 71);
        let input = white_noise(2000, 0.1, 72);

        let output = profile_and_reduce(&settings, &noise, &input);
        assert_eq!(output.len(), input.len());
        assert!(output.iter().all(|s| s.is_finite()));
        assert!(calculate_rms(&output[100..1900]) < calculate_rms(&input[100..1900]));
    }

    // ------------------------------------------------------------------------
    // Two-pass lifecycle
    // ------------------------------------------------------------------------

    #[test]
    fn test_profile_pass_flips_to_reduction() {
        let mut effect = NoiseReduction::new(NoiseReductionSettings::default());
        assert!(effect.is_profiling());
        assert!(effect.profile().is_none());

        let noise = white_noise(8820, 0.1, 81);
        let mut noise_track = MemoryTrack::from_samples(RATE, noise);
        let t1 = noise_track.end_time();
        let outcome = effect
            .process(&mut [&mut noise_track], 0.0, t1, &mut |_, _| false)
            .unwrap();

        assert_eq!(outcome, Outcome::Completed);
        assert!(!effect.is_profiling());
        assert!(effect.profile().is_some());

        // The repeated invocation runs the reduction pass and rewrites the track
        let input = white_noise(RATE as usize, 0.1, 82);
        let mut track = MemoryTrack::from_samples(RATE, input.clone());
        let t1 = track.end_time();
        effect.process(&mut [&mut track], 0.0, t1, &mut |_, _| false).unwrap();
        assert_ne!(track.samples(), &input[..]);

        effect.reset();
        assert!(effect.is_profiling());
        assert!(effect.profile().is_none());
    }

    #[test]
    fn test_profile_discarded_on_cancel() {
        let mut effect = NoiseReduction::new(NoiseReductionSettings::default());
        let mut noise_track = MemoryTrack::from_samples(RATE, white_noise(8820, 0.1, 83));
        let t1 = noise_track.end_time();

        let outcome = effect
            .process(&mut [&mut noise_track], 0.0, t1, &mut |_, _| true)
            .unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(effect.is_profiling());
        assert!(effect.profile().is_none());
    }

    #[test]
    fn test_reducing_without_profile_is_an_error() {
        let mut effect = NoiseReduction::new(NoiseReductionSettings::default());
        effect.set_profiling(false);

        let mut track = MemoryTrack::from_samples(RATE, white_noise(8820, 0.1, 84));
        let t1 = track.end_time();
        let result = effect.process(&mut [&mut track], 0.0, t1, &mut |_, _| false);
        assert_eq!(result, Err(ProcessError::NoProfile));
    }

    #[test]
    fn test_window_size_must_match_between_passes() {
        let mut effect = NoiseReduction::new(NoiseReductionSettings::default());
        let mut noise_track = MemoryTrack::from_samples(RATE, white_noise(8820, 0.1, 85));
        let t1 = noise_track.end_time();
        effect
            .process(&mut [&mut noise_track], 0.0, t1, &mut |_, _| false)
            .unwrap();

        let mut settings = effect.settings().clone();
        settings.window_size = 4096;
        effect.set_settings(settings);

        let mut track = MemoryTrack::from_samples(RATE, white_noise(8820, 0.1, 86));
        let result = effect.process(&mut [&mut track], 0.0, t1, &mut |_, _| false);
        assert!(matches!(result, Err(ProcessError::WindowSizeMismatch { .. })));
    }

    #[test]
    fn test_window_type_mismatch_is_tolerated() {
        let mut effect = NoiseReduction::new(NoiseReductionSettings::default());
        let mut noise_track = MemoryTrack::from_samples(RATE, white_noise(8820, 0.1, 87));
        let t1 = noise_track.end_time();
        effect
            .process(&mut [&mut noise_track], 0.0, t1, &mut |_, _| false)
            .unwrap();

        // A warning only; processing proceeds
        let mut settings = effect.settings().clone();
        settings.window_type = WindowType::BlackmanHann;
        effect.set_settings(settings);

        let mut track = MemoryTrack::from_samples(RATE, white_noise(RATE as usize, 0.1, 88));
        let t1 = track.end_time();
        let outcome = effect.process(&mut [&mut track], 0.0, t1, &mut |_, _| false).unwrap();
        assert_eq!(outcome, Outcome::Completed);
    }

    #[test]
    fn test_rate_mismatch_between_passes() {
        let mut effect = NoiseReduction::new(NoiseReductionSettings::default());
        let mut noise_track = MemoryTrack::from_samples(RATE, white_noise(8820, 0.1, 89));
        let t1 = noise_track.end_time();
        effect
            .process(&mut [&mut noise_track], 0.0, t1, &mut |_, _| false)
            .unwrap();

        let mut track = MemoryTrack::from_samples(48000.0, white_noise(9600, 0.1, 90));
        let t1 = track.end_time();
        let result = effect.process(&mut [&mut track], 0.0, t1, &mut |_, _| false);
        assert!(matches!(result, Err(ProcessError::RateMismatch { .. })));
    }

    #[test]
    fn test_multi_track_profile() {
        // Profiling across several tracks folds into one set of means
        let mut effect = NoiseReduction::new(NoiseReductionSettings::default());
        let mut first = MemoryTrack::from_samples(RATE, white_noise(8820, 0.1, 91));
        let mut second = MemoryTrack::from_samples(RATE, white_noise(4410, 0.1, 92));

        effect
            .process(&mut [&mut first, &mut second], 0.0, 1.0, &mut |_, _| false)
            .unwrap();
        let profile = effect.profile().unwrap();
        assert!(profile.total_windows() > 0);

        let input = white_noise(RATE as usize, 0.1, 93);
        let mut track = MemoryTrack::from_samples(RATE, input.clone());
        let t1 = track.end_time();
        effect.process(&mut [&mut track], 0.0, t1, &mut |_, _| false).unwrap();

        let margin = settle_margin(effect.settings());
        let rms = calculate_rms(&track.samples()[margin..input.len() - margin]);
        assert!(rms < 0.15 * calculate_rms(&input));
    }
}
