/// Spectral frontend
///
/// Turns one analysis window of PCM into a quantized feature slice. The
/// bundled implementation pools an FFT magnitude spectrum into log-spaced
/// bands and log-compresses them.

use super::{FeatureConfig, FeatureError};
use crate::audio::AudioSample;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;
use tracing::debug;

/// Upper end of the log-compressed feature range
pub const FEATURE_RANGE_MAX: f32 = 670.0;

/// Converts an analysis window into one int8 feature slice
pub trait SpectralFrontend: Send {
    /// Values produced per slice
    fn bins(&self) -> usize;

    /// Write `bins()` quantized values for `samples` into `out`
    ///
    /// Returns the mean unquantized feature value of the slice, a short-term
    /// power estimate on the 0..670 feature scale.
    fn process(&mut self, samples: &[AudioSample], out: &mut [i8]) -> Result<f32, FeatureError>;
}

/// Map a feature in the 0..670 range onto the int8 classifier input
pub fn quantize_feature(feature: f32) -> i8 {
    let value = feature.round() as i32;
    ((value * 256 + 333) / 666 - 128).clamp(i8::MIN as i32, i8::MAX as i32) as i8
}

/// FFT plan and scratch sized for one window length
struct SpectrumPlan {
    window_len: usize,
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    hann_sum: f32,
    buffer: Vec<Complex<f32>>,

    /// FFT bin range `[start, end)` pooled into each band
    bands: Vec<(usize, usize)>,
}

/// Log-spaced filterbank over an FFT magnitude spectrum
pub struct FilterbankFrontend {
    sample_rate: f32,
    centers: Vec<f32>,
    log_scale: f32,
    plan: Option<SpectrumPlan>,
}

impl FilterbankFrontend {
    pub fn new(sample_rate: u32, bins: usize, config: &FeatureConfig) -> Result<Self, FeatureError> {
        config.validate()?;

        if bins == 0 || sample_rate == 0 {
            return Err(FeatureError::InvalidConfig(format!(
                "{} bins at {} Hz",
                bins, sample_rate
            )));
        }

        let fs = sample_rate as f32;
        let upper = config.upper_band_hz.min(0.45 * fs);
        let lower = config.lower_band_hz;

        if upper <= lower {
            return Err(FeatureError::InvalidConfig(format!(
                "sample rate {} Hz leaves no band above {} Hz",
                sample_rate, lower
            )));
        }

        let centers: Vec<f32> = (0..bins)
            .map(|i| {
                if bins == 1 {
                    lower
                } else {
                    lower * (upper / lower).powf(i as f32 / (bins - 1) as f32)
                }
            })
            .collect();

        debug!("Filterbank: {} bands, {:.0}..{:.0} Hz", bins, lower, upper);

        Ok(Self {
            sample_rate: fs,
            centers,
            log_scale: config.log_scale,
            plan: None,
        })
    }

    /// Centre frequency of every bin (Hz)
    pub fn center_frequencies(&self) -> &[f32] {
        &self.centers
    }

    fn ensure_plan(&mut self, window_len: usize) {
        let stale = self.plan.as_ref().map_or(true, |p| p.window_len != window_len);

        if stale {
            let fft_len = window_len.next_power_of_two();
            let fft = FftPlanner::new().plan_fft_forward(fft_len);

            let hann: Vec<f32> = (0..window_len)
                .map(|n| {
                    if window_len > 1 {
                        0.5 - 0.5 * (2.0 * PI * n as f32 / (window_len - 1) as f32).cos()
                    } else {
                        1.0
                    }
                })
                .collect();
            let hann_sum = hann.iter().sum();

            let bands = band_ranges(&self.centers, self.sample_rate, fft_len);
            debug!("Planned {}-point FFT for {}-sample windows", fft_len, window_len);

            self.plan = Some(SpectrumPlan {
                window_len,
                fft,
                hann,
                hann_sum,
                buffer: vec![Complex::new(0.0, 0.0); fft_len],
                bands,
            });
        }
    }
}

/// FFT bins belonging to each band: everything between the geometric
/// midpoints to the neighbouring centres, or the nearest bin when the band
/// is narrower than the FFT resolution
fn band_ranges(centers: &[f32], sample_rate: f32, fft_len: usize) -> Vec<(usize, usize)> {
    let resolution = sample_rate / fft_len as f32;
    let nyquist_bin = fft_len / 2;

    // Outer edges mirror the inner spacing
    let edge = |a: f32, b: f32| (a * b).sqrt();

    centers
        .iter()
        .enumerate()
        .map(|(i, &center)| {
            let low = match i {
                0 => centers.get(1).map_or(center, |&next| center * center / edge(center, next)),
                _ => edge(centers[i - 1], center),
            };
            let high = match centers.get(i + 1) {
                Some(&next) => edge(center, next),
                None if i > 0 => center * center / edge(centers[i - 1], center),
                None => center,
            };

            let start = (low / resolution).ceil() as usize;
            let end = ((high / resolution).ceil() as usize).min(nyquist_bin + 1);

            if start < end {
                (start, end)
            } else {
                let nearest = ((center / resolution).round() as usize).min(nyquist_bin);
                (nearest, nearest + 1)
            }
        })
        .collect()
}

impl SpectralFrontend for FilterbankFrontend {
    fn bins(&self) -> usize {
        self.centers.len()
    }

    fn process(&mut self, samples: &[AudioSample], out: &mut [i8]) -> Result<f32, FeatureError> {
        if out.len() != self.bins() {
            return Err(FeatureError::Frontend(format!(
                "output slice holds {} values, filterbank has {} bins",
                out.len(),
                self.bins()
            )));
        }

        if samples.is_empty() {
            return Err(FeatureError::Frontend("empty analysis window".to_string()));
        }

        self.ensure_plan(samples.len());
        let log_scale = self.log_scale;
        let Some(plan) = self.plan.as_mut() else {
            return Err(FeatureError::Frontend("no FFT plan".to_string()));
        };

        for (slot, (&x, &w)) in plan.buffer.iter_mut().zip(samples.iter().zip(&plan.hann)) {
            *slot = Complex::new(x as f32 * w, 0.0);
        }
        for slot in plan.buffer[samples.len()..].iter_mut() {
            *slot = Complex::new(0.0, 0.0);
        }

        plan.fft.process(&mut plan.buffer);

        let mut energy = 0.0;
        for (slot, &(start, end)) in out.iter_mut().zip(&plan.bands) {
            // Peak magnitude in the band, scaled to a sine amplitude
            let peak = plan.buffer[start..end].iter().map(|c| c.norm()).fold(0.0f32, f32::max);
            let amplitude = 2.0 * peak / plan.hann_sum;
            let feature = (log_scale * amplitude.ln_1p()).min(FEATURE_RANGE_MAX);

            *slot = quantize_feature(feature);
            energy += feature;
        }

        Ok(energy / out.len() as f32)
    }
}
