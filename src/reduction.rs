//! Streaming short-time-Fourier-transform worker for both passes.
//!
//! The worker assembles analysis frames from arbitrarily sized input blocks,
//! keeps a sliding history of analyzed spectra, and either accumulates noise
//! statistics (profiling pass) or classifies bands, builds time- and
//! frequency-smoothed gains, and resynthesizes output (reduction pass).
//!
//! Lookahead is inherent: a frame's gains are only final once it has
//! traveled the length of the history, so the pipeline runs several frames
//! behind its input and is flushed with zero blocks at track end.

use crate::fft::RealFft;
use crate::noise_profile::NoiseProfile;
use crate::settings::{
    DiscriminationMethod, NoiseReductionSettings, ReductionChoice, SettingsError,
};
use crate::spectrum_queue::SpectrumQueue;
use crate::track::{time_to_samples, AudioSink, MemoryTrack, Track, TrackError};
use crate::utils::db_to_linear;
use crate::windows::build_window_pair;
use log::{debug, info};

// ============================================================================
// Constants
// ============================================================================

/// Shortest stretch the old discrimination method treats as signal, in
/// seconds; sets its examination neighborhood
const MIN_SIGNAL_TIME: f64 = 0.05;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessError {
    /// Configuration rejected before processing
    Settings(SettingsError),

    /// Profiling tracks with differing sample rates
    ProfileRateMismatch { expected: f64, got: f64 },

    /// Processed track rate differs from the profile's
    RateMismatch { profile: f64, track: f64 },

    /// The profiling pass saw no complete analysis window
    ProfileTooShort,

    /// Reduction requested without a prior successful profile
    NoProfile,

    /// The profile was gathered with a different window size
    WindowSizeMismatch { profile: usize, requested: usize },

    /// Track storage failure
    Track(TrackError),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Settings(err) => err.fmt(f),
            ProcessError::ProfileRateMismatch { .. } => {
                write!(f, "All noise profile data must have the same sample rate")
            }
            ProcessError::RateMismatch { .. } => write!(
                f,
                "The sample rate of the noise profile must match that of the sound to be processed"
            ),
            ProcessError::ProfileTooShort => write!(f, "Selected noise profile is too short"),
            ProcessError::NoProfile => {
                write!(f, "Noise reduction requires a noise profile; profile some noise first")
            }
            ProcessError::WindowSizeMismatch { .. } => {
                write!(f, "You must specify the same window size for steps 1 and 2")
            }
            ProcessError::Track(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<SettingsError> for ProcessError {
    fn from(err: SettingsError) -> Self {
        ProcessError::Settings(err)
    }
}

impl From<TrackError> for ProcessError {
    fn from(err: TrackError) -> Self {
        ProcessError::Track(err)
    }
}

/// How a run ended when no error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The progress callback requested cancellation; output for the track
    /// being processed was abandoned
    Cancelled,
}

// ============================================================================
// Worker
// ============================================================================

/// One profiling or reduction run over a set of tracks. All buffers, the
/// frame history, and the FFT plan are acquired at construction and reused
/// for every track.
pub struct ReductionWorker {
    do_profile: bool,
    sample_rate: f64,

    window_size: usize,
    fft: RealFft,
    fft_buffer: Vec<f32>,
    in_wave_buffer: Vec<f32>,
    out_overlap_buffer: Vec<f32>,
    analysis_window: Option<Vec<f32>>,
    synthesis_window: Option<Vec<f32>>,

    spectrum_size: usize,
    freq_smoothing_scratch: Vec<f32>,
    freq_smoothing_bins: usize,
    // When a frequency band limits the affected bins:
    bin_low: usize,  // inclusive lower bound
    bin_high: usize, // exclusive upper bound

    reduction_choice: ReductionChoice,
    steps_per_window: usize,
    step_size: usize,
    method: DiscriminationMethod,
    new_sensitivity: f32,

    in_sample_count: i64,
    out_step_count: i64,
    in_wave_pos: usize,

    one_block_attack: f32,
    one_block_release: f32,
    noise_atten_factor: f32,
    sensitivity_factor: f32,

    n_windows_to_examine: usize,
    center: usize,
    history_len: usize,

    queue: SpectrumQueue,
    class_scratch: Vec<bool>,
}

impl ReductionWorker {
    /// Validate the settings and set up all state for one pass at the given
    /// sample rate.
    pub fn new(
        settings: &NoiseReductionSettings,
        sample_rate: f64,
        do_profile: bool,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;

        let window_size = settings.window_size;
        let spectrum_size = settings.spectrum_size();
        let steps_per_window = settings.steps_per_window;
        let step_size = settings.step_size();

        let freq_smoothing_bins =
            (settings.freq_smoothing_hz * window_size as f64 / sample_rate) as usize;

        let (bin_low, bin_high) = match settings.frequency_band {
            Some((f0, f1)) => {
                let bin_hz = sample_rate / window_size as f64;
                let high = ((f1 / bin_hz).ceil() as usize).min(spectrum_size);
                let low = ((f0 / bin_hz).floor().max(0.0) as usize).min(high);
                (low, high)
            }
            None => (0, spectrum_size),
        };

        let noise_gain = -settings.noise_gain_db;
        let n_attack_blocks = 1 + (settings.attack_time * sample_rate / step_size as f64) as usize;
        let n_release_blocks =
            1 + (settings.release_time * sample_rate / step_size as f64) as usize;
        // Applies to amplitudes, divide by 20:
        let noise_atten_factor = db_to_linear(noise_gain as f32);
        // Apply to gain factors which apply to amplitudes, divide by 20:
        let one_block_attack = 10f64.powf(noise_gain / (20.0 * n_attack_blocks as f64)) as f32;
        let one_block_release = 10f64.powf(noise_gain / (20.0 * n_release_blocks as f64)) as f32;
        // Applies to power, divide by 10:
        let sensitivity_factor = 10f64.powf(settings.sensitivity_db / 10.0) as f32;

        let n_windows_to_examine = if settings.method == DiscriminationMethod::Old {
            ((MIN_SIGNAL_TIME * sample_rate / step_size as f64) as usize).max(2)
        } else {
            1 + steps_per_window
        };
        let center = n_windows_to_examine / 2;
        // Release propagation inspects the slot ahead of the center
        debug_assert!(center >= 1);

        let history_len = if do_profile {
            n_windows_to_examine
        } else {
            // Long enough for inspection around the middle and for attack
            // propagation behind it
            n_windows_to_examine.max(center + n_attack_blocks)
        };

        let pair =
            build_window_pair(settings.window_type, window_size, steps_per_window, !do_profile);

        // Sensitivity is a base-10 log; classification uses the natural log
        let new_sensitivity = (settings.new_sensitivity * std::f64::consts::LN_10) as f32;

        Ok(Self {
            do_profile,
            sample_rate,
            window_size,
            fft: RealFft::new(window_size),
            fft_buffer: vec![0.0; window_size],
            in_wave_buffer: vec![0.0; window_size],
            out_overlap_buffer: vec![0.0; window_size],
            analysis_window: pair.analysis,
            synthesis_window: pair.synthesis,
            spectrum_size,
            freq_smoothing_scratch: vec![0.0; spectrum_size],
            freq_smoothing_bins,
            bin_low,
            bin_high,
            reduction_choice: settings.reduction_choice,
            steps_per_window,
            step_size,
            method: settings.method,
            new_sensitivity,
            in_sample_count: 0,
            out_step_count: 0,
            in_wave_pos: 0,
            one_block_attack,
            one_block_release,
            noise_atten_factor,
            sensitivity_factor,
            n_windows_to_examine,
            center,
            history_len,
            queue: SpectrumQueue::new(history_len, spectrum_size),
            class_scratch: vec![false; spectrum_size],
        })
    }

    /// Reset all streaming state for the next track
    fn start_new_track(&mut self) {
        self.queue.reset(self.noise_atten_factor);
        self.out_overlap_buffer.fill(0.0);
        self.in_wave_buffer.fill(0.0);

        // Prime the queue with windows zero-padded in front; the first frame
        // exposes only step_size samples of real input.
        self.in_wave_pos = self.window_size - self.step_size;
        self.in_sample_count = 0;

        // Starts negative, counting up while the queue fills and the padded
        // windows pass through, before the first full window:
        self.out_step_count =
            -((self.history_len - 1) as i64) - ((self.steps_per_window - 1) as i64);
    }

    /// Feed one block of input samples, emitting as many frames as the
    /// gating condition allows.
    fn process_samples(
        &mut self,
        profile: &mut NoiseProfile,
        mut output: Option<&mut MemoryTrack>,
        mut samples: &[f32],
    ) -> Result<(), TrackError> {
        while !samples.is_empty()
            && self.out_step_count * (self.step_size as i64) < self.in_sample_count
        {
            let avail = samples.len().min(self.window_size - self.in_wave_pos);
            self.in_wave_buffer[self.in_wave_pos..self.in_wave_pos + avail]
                .copy_from_slice(&samples[..avail]);
            samples = &samples[avail..];
            self.in_wave_pos += avail;

            if self.in_wave_pos == self.window_size {
                self.analyze_frame();
                if self.do_profile {
                    self.gather_statistics(profile);
                } else {
                    self.reduce_noise(profile, output.as_deref_mut())?;
                }
                self.out_step_count += 1;
                self.queue.rotate();

                // Slide the analysis window one step
                self.in_wave_buffer.copy_within(self.step_size.., 0);
                self.in_wave_pos -= self.step_size;
                self.in_wave_buffer[self.in_wave_pos..].fill(0.0);
            }
        }
        Ok(())
    }

    /// Transform the filled input window into the newest queue slot
    fn analyze_frame(&mut self) {
        match &self.analysis_window {
            Some(window) => {
                for ((dst, &src), &w) in self
                    .fft_buffer
                    .iter_mut()
                    .zip(self.in_wave_buffer.iter())
                    .zip(window.iter())
                {
                    *dst = src * w;
                }
            }
            None => self.fft_buffer.copy_from_slice(&self.in_wave_buffer),
        }
        self.fft.forward_real(&mut self.fft_buffer);

        let last = self.spectrum_size - 1;
        let record = self.queue.get_mut(0);

        // Keep real and imaginary parts for the later inverse FFT, and
        // compute power
        for k in 1..last {
            let re = self.fft_buffer[2 * k];
            let im = self.fft_buffer[2 * k + 1];
            record.real[k] = re;
            record.imag[k] = im;
            record.power[k] = re * re + im * im;
        }
        // DC and Fs/2 bins are handled specially
        let dc = self.fft_buffer[0];
        record.real[0] = dc;
        record.power[0] = dc * dc;

        let nyquist = self.fft_buffer[1];
        record.imag[0] = nyquist; // for Fs/2, not really imaginary
        record.power[last] = nyquist * nyquist;

        if self.reduction_choice != ReductionChoice::IsolateNoise {
            // Default all gains to the reduction factor until some are
            // raised at the center step
            record.gain.fill(self.noise_atten_factor);
        }
    }

    /// Accumulate the newest frame into the profile statistics
    fn gather_statistics(&mut self, profile: &mut NoiseProfile) {
        profile.accumulate(&self.queue.get(0).power);

        // Old statistic: the threshold for each band is the greatest level
        // that held across a full ring of consecutive frames, a max of mins.
        for band in 0..self.spectrum_size {
            let mut min = self.queue.get(0).power[band];
            for slot in 1..self.history_len {
                min = min.min(self.queue.get(slot).power[band]);
            }
            profile.raise_threshold(band, min);
        }
    }

    /// True iff the given band of the center frame looks like noise, judged
    /// from the band's neighborhood of frames in the queue.
    fn classify(&self, profile: &NoiseProfile, band: usize) -> bool {
        match self.method {
            DiscriminationMethod::Old => {
                let mut min = self.queue.get(0).power[band];
                for slot in 1..self.history_len {
                    min = min.min(self.queue.get(slot).power[band]);
                }
                min <= self.sensitivity_factor * profile.noise_threshold()[band]
            }

            // The newer methods suppose an exponential distribution of power
            // values in the noise; sensitivity is the log of the probability
            // that noise strays above the threshold, so multiplying the mean
            // by it gives the quantile.
            DiscriminationMethod::Median if self.n_windows_to_examine == 5 => {
                let (mut greatest, mut second, mut third) = (0.0f32, 0.0f32, 0.0f32);
                for slot in 0..self.n_windows_to_examine {
                    let power = self.queue.get(slot).power[band];
                    if power >= greatest {
                        third = second;
                        second = greatest;
                        greatest = power;
                    } else if power >= second {
                        third = second;
                        second = power;
                    } else if power >= third {
                        third = power;
                    }
                }
                third <= self.new_sensitivity * profile.means()[band]
            }

            DiscriminationMethod::Median if self.n_windows_to_examine != 3 => {
                // Validation restricts the median method to neighborhoods of
                // three or five
                debug_assert!(false, "median neighborhood of {}", self.n_windows_to_examine);
                true
            }

            // A median of three is no different from the second greatest,
            // which throws out the one high outlier.
            _ => {
                let (mut greatest, mut second) = (0.0f32, 0.0f32);
                for slot in 0..self.n_windows_to_examine {
                    let power = self.queue.get(slot).power[band];
                    if power >= greatest {
                        second = greatest;
                        greatest = power;
                    } else if power >= second {
                        second = power;
                    }
                }
                second <= self.new_sensitivity * profile.means()[band]
            }
        }
    }

    /// Classify the center frame, propagate attack and release through the
    /// queue, and resynthesize the outgoing frame.
    fn reduce_noise(
        &mut self,
        profile: &NoiseProfile,
        output: Option<&mut MemoryTrack>,
    ) -> Result<(), TrackError> {
        self.build_center_gains(profile);

        if self.reduction_choice != ReductionChoice::IsolateNoise {
            self.apply_attack_and_release();
        }

        if self.out_step_count >= -((self.steps_per_window - 1) as i64) {
            self.resynthesize(output)?;
        }
        Ok(())
    }

    /// Raise the gains of non-noise bands in the center frame or, when
    /// isolating, keep only the noise bands.
    fn build_center_gains(&mut self, profile: &NoiseProfile) {
        for band in self.bin_low..self.bin_high {
            self.class_scratch[band] = self.classify(profile, band);
        }

        let (bin_low, bin_high) = (self.bin_low, self.bin_high);
        let center = self.center;
        let isolate = self.reduction_choice == ReductionChoice::IsolateNoise;
        let record = self.queue.get_mut(center);

        if isolate {
            // Everything above or below the selected band is non-noise
            record.gain[..bin_low].fill(0.0);
            record.gain[bin_high..].fill(0.0);
            for band in bin_low..bin_high {
                record.gain[band] = if self.class_scratch[band] { 1.0 } else { 0.0 };
            }
        } else {
            record.gain[..bin_low].fill(1.0);
            record.gain[bin_high..].fill(1.0);
            for band in bin_low..bin_high {
                if !self.class_scratch[band] {
                    record.gain[band] = 1.0;
                }
            }
        }
    }

    /// In each direction from the center, impose an exponential decay limit
    /// on how fast gains may fall; actual gains are the maximum of the
    /// attenuation floor, the decay curve, and their prior values.
    fn apply_attack_and_release(&mut self) {
        // Attack goes backward in time, toward higher queue indices.
        for band in 0..self.spectrum_size {
            for slot in self.center + 1..self.history_len {
                let decayed = (self.queue.get(slot - 1).gain[band] * self.one_block_attack)
                    .max(self.noise_atten_factor);
                let gain = &mut self.queue.get_mut(slot).gain[band];
                if *gain < decayed {
                    *gain = decayed;
                } else {
                    // The attack curve has met the decay curve of a frame
                    // processed earlier; nothing further back can change.
                    break;
                }
            }
        }

        // Release looks only one window ahead. That window's own center step
        // will carry the decay further.
        for band in 0..self.spectrum_size {
            let released = (self.queue.get(self.center).gain[band] * self.one_block_release)
                .max(self.noise_atten_factor);
            let gain = &mut self.queue.get_mut(self.center - 1).gain[band];
            *gain = gain.max(released);
        }
    }

    /// Smooth the outgoing frame's gains geometrically across frequency.
    /// Averages the logs rather than multiplying and taking roots, which
    /// would quickly underflow.
    fn apply_freq_smoothing(&mut self) {
        if self.freq_smoothing_bins == 0 {
            return;
        }

        let bins = self.freq_smoothing_bins;
        let spectrum_size = self.spectrum_size;
        let outgoing = self.history_len - 1;
        let scratch = &mut self.freq_smoothing_scratch;
        let gains = &mut self.queue.get_mut(outgoing).gain;

        for gain in gains.iter_mut() {
            *gain = gain.ln();
        }

        for band in 0..spectrum_size {
            let j0 = band.saturating_sub(bins);
            let j1 = (spectrum_size - 1).min(band + bins);
            let sum: f32 = gains[j0..=j1].iter().sum();
            scratch[band] = sum / (j1 - j0 + 1) as f32;
        }

        for (gain, &smoothed) in gains.iter_mut().zip(scratch.iter()) {
            *gain = smoothed.exp();
        }
    }

    /// Apply the outgoing frame's gains to its spectrum, inverse-transform,
    /// window, and overlap-add; emit one finished step once steady.
    fn resynthesize(&mut self, output: Option<&mut MemoryTrack>) -> Result<(), TrackError> {
        if self.reduction_choice != ReductionChoice::IsolateNoise {
            // Gains are not less than the attenuation factor here, so the
            // logs in the smoothing stay finite
            self.apply_freq_smoothing();
        }

        let last = self.spectrum_size - 1;
        {
            let record = self.queue.get(self.history_len - 1);
            if self.reduction_choice == ReductionChoice::LeaveResidue {
                // Subtract the gain we would otherwise apply from one, and
                // negate that to flip the phase; residue plus reduction then
                // rebuild the original.
                for k in 1..last {
                    let gain = record.gain[k] - 1.0;
                    self.fft_buffer[2 * k] = record.real[k] * gain;
                    self.fft_buffer[2 * k + 1] = record.imag[k] * gain;
                }
                self.fft_buffer[0] = record.real[0] * (record.gain[0] - 1.0);
                // The Fs/2 component is stored as the imaginary part of DC
                self.fft_buffer[1] = record.imag[0] * (record.gain[last] - 1.0);
            } else {
                for k in 1..last {
                    let gain = record.gain[k];
                    self.fft_buffer[2 * k] = record.real[k] * gain;
                    self.fft_buffer[2 * k + 1] = record.imag[k] * gain;
                }
                self.fft_buffer[0] = record.real[0] * record.gain[0];
                self.fft_buffer[1] = record.imag[0] * record.gain[last];
            }
        }

        self.fft.inverse_real(&mut self.fft_buffer);

        // Overlap-add into the rolling accumulator
        match &self.synthesis_window {
            Some(window) => {
                for ((acc, &sample), &w) in self
                    .out_overlap_buffer
                    .iter_mut()
                    .zip(self.fft_buffer.iter())
                    .zip(window.iter())
                {
                    *acc += sample * w;
                }
            }
            None => {
                for (acc, &sample) in
                    self.out_overlap_buffer.iter_mut().zip(self.fft_buffer.iter())
                {
                    *acc += sample;
                }
            }
        }

        if self.out_step_count >= 0 {
            // The first step of the accumulator is done
            if let Some(track) = output {
                track.append(&self.out_overlap_buffer[..self.step_size])?;
            }
        }

        // Shift the remainder over
        self.out_overlap_buffer.copy_within(self.step_size.., 0);
        self.out_overlap_buffer[self.window_size - self.step_size..].fill(0.0);
        Ok(())
    }

    /// Keep flushing empty input through the history until as many samples
    /// have come out as went in. Not exactly as many: up to one step of
    /// extra samples, trimmed by the caller.
    fn finish_track(
        &mut self,
        profile: &mut NoiseProfile,
        output: &mut MemoryTrack,
    ) -> Result<(), TrackError> {
        let empty = vec![0.0f32; self.step_size];
        while self.out_step_count * (self.step_size as i64) < self.in_sample_count {
            self.process_samples(profile, Some(output), &empty)?;
        }
        Ok(())
    }

    /// Run one track's selection through the pipeline. In the reduction pass
    /// the synthesized signal replaces the selection; in the profiling pass
    /// the track is only read.
    fn process_one<T: Track + ?Sized>(
        &mut self,
        profile: &mut NoiseProfile,
        track: &mut T,
        track_index: usize,
        start: u64,
        len: u64,
        progress: &mut dyn FnMut(usize, f64) -> bool,
    ) -> Result<Outcome, ProcessError> {
        self.start_new_track();
        debug!(
            "track {}: {} {} samples at {} Hz",
            track_index,
            if self.do_profile { "profiling" } else { "reducing" },
            len,
            self.sample_rate
        );

        let mut output = if self.do_profile {
            None
        } else {
            Some(MemoryTrack::new(track.sample_rate()))
        };

        let mut buffer = vec![0.0f32; track.best_block_size(start).max(self.step_size)];
        let mut position = start;
        while position < start + len {
            let block = ((start + len - position) as usize)
                .min(track.best_block_size(position))
                .min(buffer.len());
            track.read(position, &mut buffer[..block])?;
            position += block as u64;

            self.in_sample_count += block as i64;
            self.process_samples(profile, output.as_mut(), &buffer[..block])?;

            // One cancellation checkpoint per input block
            if progress(track_index, (position - start) as f64 / len as f64) {
                return Ok(Outcome::Cancelled);
            }
        }

        if self.do_profile {
            profile.finish_track();
        } else if let Some(mut output) = output.take() {
            self.finish_track(profile, &mut output)?;
            output.flush()?;

            // The synthesis runs up to one step past the input; delete the
            // tail, then put the result in place of the original samples.
            output.truncate(len);
            track.replace_range(start, output.samples())?;
        }

        Ok(Outcome::Completed)
    }

    /// Run the configured pass over every track, clipping the selection
    /// `[t0, t1]` (seconds) to each track's extent. Tracks whose clipped
    /// selection is empty are skipped.
    pub fn process<T: Track + ?Sized>(
        &mut self,
        profile: &mut NoiseProfile,
        tracks: &mut [&mut T],
        t0: f64,
        t1: f64,
        progress: &mut dyn FnMut(usize, f64) -> bool,
    ) -> Result<Outcome, ProcessError> {
        for (index, track) in tracks.iter_mut().enumerate() {
            let rate = track.sample_rate();
            if rate != self.sample_rate {
                return Err(if self.do_profile {
                    ProcessError::ProfileRateMismatch { expected: self.sample_rate, got: rate }
                } else {
                    ProcessError::RateMismatch { profile: self.sample_rate, track: rate }
                });
            }

            let clipped_t0 = t0.max(track.start_time());
            let clipped_t1 = t1.min(track.end_time());
            if clipped_t1 <= clipped_t0 {
                continue;
            }

            let start = time_to_samples(clipped_t0, rate);
            let end = time_to_samples(clipped_t1, rate);
            if end <= start {
                continue;
            }

            match self.process_one(profile, &mut **track, index, start, end - start, progress)? {
                Outcome::Completed => {}
                Outcome::Cancelled => return Ok(Outcome::Cancelled),
            }
        }

        if self.do_profile {
            if profile.is_empty() {
                return Err(ProcessError::ProfileTooShort);
            }
            info!("noise profile gathered over {} windows", profile.total_windows());
        }

        Ok(Outcome::Completed)
    }
}
