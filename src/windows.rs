//! Analysis and synthesis window generation for overlap-add processing.
//!
//! Each window type pairs an analysis-side and a synthesis-side cosine-sum
//! window. One window of the pair is scaled by `1 / (K * steps_per_window)`,
//! where `K` is the constant term of the product of the two windows, so that
//! the sum of `analysis * synthesis` over all step-size shifts equals one and
//! resynthesis with unity gains reconstructs the input.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

// ============================================================================
// Window Types
// ============================================================================

/// Analysis/synthesis window pairing applied around the FFT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowType {
    /// No analysis window, Hann synthesis; requires 1/2 step
    RectangularHann,
    /// Hann analysis, no synthesis window; requires 1/2 step
    HannRectangular,
    /// Hann on both sides (default); requires 1/4 step
    HannHann,
    /// Blackman analysis, Hann synthesis; requires 1/4 step
    BlackmanHann,
}

struct WindowTypeInfo {
    min_steps: usize,
    analysis: [f64; 3],
    synthesis: [f64; 3],
    product_constant_term: f64,
}

// In all of these cases, the constant term of the product of the two windows
// is the product of their constant terms plus one half the product of their
// first cosine coefficients.
const WINDOW_TYPE_INFO: [WindowTypeInfo; 4] = [
    WindowTypeInfo {
        min_steps: 2,
        analysis: [1.0, 0.0, 0.0],
        synthesis: [0.5, -0.5, 0.0],
        product_constant_term: 0.5,
    },
    WindowTypeInfo {
        min_steps: 2,
        analysis: [0.5, -0.5, 0.0],
        synthesis: [1.0, 0.0, 0.0],
        product_constant_term: 0.5,
    },
    WindowTypeInfo {
        min_steps: 4,
        analysis: [0.5, -0.5, 0.0],
        synthesis: [0.5, -0.5, 0.0],
        product_constant_term: 0.375,
    },
    WindowTypeInfo {
        min_steps: 4,
        analysis: [0.42, -0.5, 0.08],
        synthesis: [0.5, -0.5, 0.0],
        product_constant_term: 0.335,
    },
];

impl WindowType {
    /// Stable index used for key/value persistence
    #[inline]
    pub fn index(self) -> usize {
        match self {
            WindowType::RectangularHann => 0,
            WindowType::HannRectangular => 1,
            WindowType::HannHann => 2,
            WindowType::BlackmanHann => 3,
        }
    }

    /// Inverse of [`WindowType::index`]
    pub fn from_index(index: usize) -> Option<WindowType> {
        match index {
            0 => Some(WindowType::RectangularHann),
            1 => Some(WindowType::HannRectangular),
            2 => Some(WindowType::HannHann),
            3 => Some(WindowType::BlackmanHann),
            _ => None,
        }
    }

    /// Fewest steps per window at which overlap-add still sums to unity
    #[inline]
    pub fn min_steps_per_window(self) -> usize {
        self.info().min_steps
    }

    fn info(self) -> &'static WindowTypeInfo {
        &WINDOW_TYPE_INFO[self.index()]
    }
}

impl Default for WindowType {
    fn default() -> Self {
        WindowType::HannHann
    }
}

// ============================================================================
// Window Construction
// ============================================================================

/// Concrete windows for one configuration. A rectangular side is represented
/// as `None` so callers can skip the multiplication entirely.
pub struct WindowPair {
    pub analysis: Option<Vec<f32>>,
    pub synthesis: Option<Vec<f32>>,
}

/// Build the analysis window and, when `with_synthesis` is set, the synthesis
/// window for the given type. The profiling pass has no resynthesis stage and
/// never asks for the synthesis side.
pub fn build_window_pair(
    window_type: WindowType,
    window_size: usize,
    steps_per_window: usize,
    with_synthesis: bool,
) -> WindowPair {
    let info = window_type.info();

    // One or the other window must be multiplied by this to correct for
    // overlap. Scales down as steps get smaller and overlaps larger.
    let multiplier = 1.0 / (info.product_constant_term * steps_per_window as f64);

    let analysis = if window_type == WindowType::RectangularHann {
        None
    } else {
        let scale = if window_type == WindowType::HannRectangular {
            multiplier
        } else {
            1.0
        };
        Some(cosine_sum_window(window_size, &info.analysis, scale))
    };

    let synthesis = if !with_synthesis || window_type == WindowType::HannRectangular {
        None
    } else {
        Some(cosine_sum_window(window_size, &info.synthesis, multiplier))
    };

    WindowPair { analysis, synthesis }
}

/// `w[n] = scale * (c0 + c1*cos(2πn/N) + c2*cos(4πn/N))`, periodic form
fn cosine_sum_window(size: usize, coefficients: &[f64; 3], scale: f64) -> Vec<f32> {
    let n = size as f64;
    (0..size)
        .map(|i| {
            let theta = 2.0 * PI * i as f64 / n;
            let w = coefficients[0]
                + coefficients[1] * theta.cos()
                + coefficients[2] * (2.0 * theta).cos();
            (scale * w) as f32
        })
        .collect()
}
