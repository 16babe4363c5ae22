//! Real FFT with the packed spectrum layout used by the engine.
//!
//! A buffer of `size` samples transforms in place to `size` floats holding
//! the non-negative half of the spectrum:
//!
//! - index 0: DC (purely real)
//! - index 1: Nyquist (purely real, stored where DC's imaginary part would be)
//! - indices `2k` / `2k + 1` for `k` in `1..size/2`: real and imaginary parts
//!   of bin `k`
//!
//! Analysis unpacking and synthesis-window application both walk this one
//! layout, in natural bin order. The inverse transform is normalized so that
//! `forward` followed by `inverse` reproduces the input.

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Forward/inverse real transform pair of one power-of-two size, owning all
/// scratch so repeated transforms never allocate.
pub struct RealFft {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    complex_buffer: Vec<Complex32>,
    fft_scratch: Vec<Complex32>,
}

impl RealFft {
    /// Plan transforms for `size`, which must be a power of two of at least 8.
    pub fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two() && size >= 8);

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Self {
            size,
            forward,
            inverse,
            complex_buffer: vec![Complex32::default(); size],
            fft_scratch: vec![Complex32::default(); scratch_len],
        }
    }

    /// Transform size in samples
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of distinct bins, `size / 2 + 1`
    #[inline]
    pub fn spectrum_size(&self) -> usize {
        self.size / 2 + 1
    }

    /// Forward transform: `buffer` holds `size` time-domain samples on entry
    /// and the packed spectrum on return.
    pub fn forward_real(&mut self, buffer: &mut [f32]) {
        debug_assert_eq!(buffer.len(), self.size);
        let half = self.size / 2;

        for (c, &s) in self.complex_buffer.iter_mut().zip(buffer.iter()) {
            *c = Complex32::new(s, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.complex_buffer, &mut self.fft_scratch);

        buffer[0] = self.complex_buffer[0].re;
        buffer[1] = self.complex_buffer[half].re;
        for k in 1..half {
            buffer[2 * k] = self.complex_buffer[k].re;
            buffer[2 * k + 1] = self.complex_buffer[k].im;
        }
    }

    /// Inverse transform: `buffer` holds a packed spectrum on entry and
    /// `size` time-domain samples on return.
    pub fn inverse_real(&mut self, buffer: &mut [f32]) {
        debug_assert_eq!(buffer.len(), self.size);
        let half = self.size / 2;

        self.complex_buffer[0] = Complex32::new(buffer[0], 0.0);
        self.complex_buffer[half] = Complex32::new(buffer[1], 0.0);
        for k in 1..half {
            let bin = Complex32::new(buffer[2 * k], buffer[2 * k + 1]);
            self.complex_buffer[k] = bin;
            self.complex_buffer[self.size - k] = bin.conj();
        }
        self.inverse
            .process_with_scratch(&mut self.complex_buffer, &mut self.fft_scratch);

        let norm = 1.0 / self.size as f32;
        for (s, c) in buffer.iter_mut().zip(self.complex_buffer.iter()) {
            *s = c.re * norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::f32::consts::PI;

    #[test]
    fn test_round_trip_is_identity() {
        let mut fft = RealFft::new(256);
        let mut rng = SmallRng::seed_from_u64(7);
        let original: Vec<f32> = (0..256).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let mut buffer = original.clone();
        fft.forward_real(&mut buffer);
        fft.inverse_real(&mut buffer);

        for (a, b) in original.iter().zip(buffer.iter()) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_dc_packing() {
        let mut fft = RealFft::new(64);
        let mut buffer = vec![0.25; 64];
        fft.forward_real(&mut buffer);

        // All energy in the DC slot
        assert!((buffer[0] - 64.0 * 0.25).abs() < 1e-4);
        assert!(buffer[1].abs() < 1e-4);
        for k in 1..32 {
            assert!(buffer[2 * k].abs() < 1e-4);
            assert!(buffer[2 * k + 1].abs() < 1e-4);
        }
    }

    #[test]
    fn test_nyquist_packing() {
        let mut fft = RealFft::new(64);
        let mut buffer: Vec<f32> = (0..64).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        fft.forward_real(&mut buffer);

        // The alternating signal lands entirely in the Nyquist slot
        assert!((buffer[1] - 64.0).abs() < 1e-3);
        assert!(buffer[0].abs() < 1e-3);
        for k in 1..32 {
            assert!(buffer[2 * k].abs() < 1e-3);
            assert!(buffer[2 * k + 1].abs() < 1e-3);
        }
    }

    #[test]
    fn test_sine_lands_in_one_bin() {
        let size = 128;
        let bin = 5;
        let mut fft = RealFft::new(size);
        let mut buffer: Vec<f32> = (0..size)
            .map(|i| (2.0 * PI * bin as f32 * i as f32 / size as f32).sin())
            .collect();
        fft.forward_real(&mut buffer);

        // Power concentrates at the target bin with magnitude size/2
        let power = buffer[2 * bin] * buffer[2 * bin] + buffer[2 * bin + 1] * buffer[2 * bin + 1];
        assert!((power.sqrt() - size as f32 / 2.0).abs() < 1e-2);

        for k in 1..size / 2 {
            if k == bin {
                continue;
            }
            let p = buffer[2 * k] * buffer[2 * k] + buffer[2 * k + 1] * buffer[2 * k + 1];
            assert!(p < 1e-4, "bin {} leaked {}", k, p);
        }
    }
}
