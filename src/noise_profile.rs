//! Noise profile statistics gathered during the profiling pass.
//!
//! The profile accumulates per-band power sums over each profiling track and
//! folds them into running means at track end, so several noise tracks
//! average exactly as one concatenated track would. It also maintains the
//! max-of-min threshold used by the oldest discrimination method. Once the
//! profiling pass succeeds the profile is frozen; the reduction pass only
//! reads it.

use crate::windows::WindowType;

/// Per-band noise statistics shared between the profiling and reduction
/// passes. The reduction pass must run with the same sample rate and window
/// size that produced the profile.
#[derive(Debug, Clone)]
pub struct NoiseProfile {
    sample_rate: f64,
    window_size: usize,
    window_type: WindowType,

    total_windows: usize,
    track_windows: usize,
    sums: Vec<f32>,
    means: Vec<f32>,

    // Old statistic: per band, the greatest power level that held for a full
    // ring of consecutive frames -- a max of mins.
    noise_threshold: Vec<f32>,
}

impl NoiseProfile {
    pub fn new(spectrum_size: usize, sample_rate: f64, window_type: WindowType) -> Self {
        Self {
            sample_rate,
            window_size: (spectrum_size - 1) * 2,
            window_type,
            total_windows: 0,
            track_windows: 0,
            sums: vec![0.0; spectrum_size],
            means: vec![0.0; spectrum_size],
            noise_threshold: vec![0.0; spectrum_size],
        }
    }

    /// Rate of the profile track(s); processed tracks must match
    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Window size the profile was gathered with
    #[inline]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Window type the profile was gathered with
    #[inline]
    pub fn window_type(&self) -> WindowType {
        self.window_type
    }

    /// Frames folded into the means so far, not counting the current track
    #[inline]
    pub fn total_windows(&self) -> usize {
        self.total_windows
    }

    /// Per-band mean noise power across completed profiling tracks
    #[inline]
    pub fn means(&self) -> &[f32] {
        &self.means
    }

    /// Per-band old-method threshold
    #[inline]
    pub fn noise_threshold(&self) -> &[f32] {
        &self.noise_threshold
    }

    /// True if no profiling frames were ever folded in; such a profile is
    /// unusable and reported as "too short"
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total_windows == 0
    }

    /// Accumulate one analyzed frame of the current profiling track
    pub(crate) fn accumulate(&mut self, power: &[f32]) {
        debug_assert_eq!(power.len(), self.sums.len());
        self.track_windows += 1;
        for (sum, &p) in self.sums.iter_mut().zip(power.iter()) {
            *sum += p;
        }
    }

    /// Raise the old-method threshold for one band to the given minimum
    /// power level if it exceeds the stored value
    pub(crate) fn raise_threshold(&mut self, band: usize, min_power: f32) {
        let threshold = &mut self.noise_threshold[band];
        *threshold = threshold.max(min_power);
    }

    /// Fold the finished track's sums into the running means and reset the
    /// per-track accumulator. Combining through a weighted average keeps the
    /// means identical to those of one concatenated track.
    pub(crate) fn finish_track(&mut self) {
        let windows = self.track_windows;
        let multiplier = self.total_windows;
        let denom = windows + multiplier;

        if windows > 0 {
            for (mean, sum) in self.means.iter_mut().zip(self.sums.iter_mut()) {
                *mean = (*mean * multiplier as f32 + *sum) / denom as f32;
                *sum = 0.0;
            }
        }

        self.track_windows = 0;
        self.total_windows = denom;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> NoiseProfile {
        NoiseProfile::new(5, 44100.0, WindowType::HannHann)
    }

    #[test]
    fn test_new_profile_is_empty() {
        let profile = profile();
        assert!(profile.is_empty());
        assert_eq!(profile.window_size(), 8);
        assert!(profile.means().iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_means_match_naive_average() {
        let mut profile = profile();
        let frames = [
            [1.0, 2.0, 3.0, 4.0, 5.0],
            [3.0, 2.0, 1.0, 0.0, 5.0],
            [2.0, 2.0, 2.0, 2.0, 2.0],
        ];
        for frame in &frames {
            profile.accumulate(frame);
        }
        profile.finish_track();

        assert!(!profile.is_empty());
        assert_eq!(profile.total_windows(), 3);
        for band in 0..5 {
            let naive: f32 = frames.iter().map(|f| f[band]).sum::<f32>() / 3.0;
            assert!((profile.means()[band] - naive).abs() < 1e-6);
        }
    }

    #[test]
    fn test_multi_track_folding_matches_concatenation() {
        // Two tracks folded separately must equal one concatenated track
        let track_a = [[1.0f32, 4.0], [3.0, 0.0]];
        let track_b = [[5.0f32, 2.0], [1.0, 2.0], [3.0, 2.0]];

        let mut split = NoiseProfile::new(2, 48000.0, WindowType::HannHann);
        for frame in &track_a {
            split.accumulate(frame);
        }
        split.finish_track();
        for frame in &track_b {
            split.accumulate(frame);
        }
        split.finish_track();

        let mut joined = NoiseProfile::new(2, 48000.0, WindowType::HannHann);
        for frame in track_a.iter().chain(track_b.iter()) {
            joined.accumulate(frame);
        }
        joined.finish_track();

        assert_eq!(split.total_windows(), joined.total_windows());
        for band in 0..2 {
            assert!((split.means()[band] - joined.means()[band]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_empty_track_does_not_disturb_means() {
        let mut profile = profile();
        profile.accumulate(&[2.0; 5]);
        profile.finish_track();
        let means_before = profile.means().to_vec();

        profile.finish_track();
        assert_eq!(profile.means(), &means_before[..]);
        assert_eq!(profile.total_windows(), 1);
    }

    #[test]
    fn test_threshold_is_max_of_mins() {
        let mut profile = profile();
        profile.raise_threshold(2, 0.5);
        profile.raise_threshold(2, 0.3);
        assert_eq!(profile.noise_threshold()[2], 0.5);
        profile.raise_threshold(2, 0.8);
        assert_eq!(profile.noise_threshold()[2], 0.8);
        assert_eq!(profile.noise_threshold()[1], 0.0);
    }
}
