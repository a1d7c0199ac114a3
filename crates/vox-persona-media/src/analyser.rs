//! Spectrum analyser used to drive the level indicator.
//!
//! Mirrors the browser analyser convention: a Blackman-windowed transform of
//! the most recent `FFT_SIZE` samples, magnitudes mapped from
//! [`MIN_DECIBELS`, `MAX_DECIBELS`] onto a 0..=255 byte scale.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Mutex;

pub const FFT_SIZE: usize = 256;
pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;

/// Rolling window over the most recent samples of one signal path.
#[derive(Debug)]
pub struct Analyser {
    window: Mutex<VecDeque<f32>>,
}

impl Default for Analyser {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyser {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(FFT_SIZE)),
        }
    }

    pub fn push(&self, samples: &[f32]) {
        let Ok(mut window) = self.window.lock() else {
            return;
        };
        for &s in samples.iter().rev().take(FFT_SIZE).rev() {
            if window.len() == FFT_SIZE {
                window.pop_front();
            }
            window.push_back(s);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut window) = self.window.lock() {
            window.clear();
        }
    }

    /// Average byte-scale spectrum energy of the current window.
    pub fn average_energy(&self) -> f32 {
        let snapshot: Vec<f32> = match self.window.lock() {
            Ok(window) => window.iter().copied().collect(),
            Err(_) => return 0.0,
        };
        average_energy(&snapshot)
    }
}

/// Byte-scale magnitude spectrum (`FFT_SIZE / 2` bins) of the last `FFT_SIZE`
/// samples of `signal`. Shorter input is zero-padded at the front.
pub fn byte_frequency_data(signal: &[f32]) -> Vec<u8> {
    let n = FFT_SIZE;
    let mut input = vec![0.0f32; n];
    let take = signal.len().min(n);
    input[n - take..].copy_from_slice(&signal[signal.len() - take..]);

    for (i, x) in input.iter_mut().enumerate() {
        let phase = 2.0 * PI * i as f32 / n as f32;
        *x *= 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos();
    }

    let (cos, sin): (Vec<f32>, Vec<f32>) = (0..n)
        .map(|i| {
            let phase = 2.0 * PI * i as f32 / n as f32;
            (phase.cos(), phase.sin())
        })
        .unzip();

    let range = MAX_DECIBELS - MIN_DECIBELS;
    (0..n / 2)
        .map(|k| {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (i, &x) in input.iter().enumerate() {
                let idx = (k * i) % n;
                re += x * cos[idx];
                im -= x * sin[idx];
            }
            let magnitude = (re * re + im * im).sqrt() / n as f32;
            if magnitude <= 0.0 {
                return 0;
            }
            let db = 20.0 * magnitude.log10();
            (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Mean of [`byte_frequency_data`]; 0 for an empty signal.
pub fn average_energy(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    let bins = byte_frequency_data(signal);
    bins.iter().map(|&b| f32::from(b)).sum::<f32>() / bins.len() as f32
}

/// Combine both signal paths into one indicator level in [0, 1].
pub fn normalized_level(input_energy: f32, output_energy: f32, ceiling: f32) -> f32 {
    if !(ceiling > 0.0) {
        return 0.0;
    }
    (input_energy.max(output_energy) / ceiling).clamp(0.0, 1.0)
}
