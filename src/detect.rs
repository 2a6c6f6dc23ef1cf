// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Two-stage change detection against the last kept keyframe.
//!
//! Stage one is a hue/saturation histogram correlation on blurred,
//! detector-scale copies: cheap, illumination-tolerant, and good enough to
//! early-exit the vast majority of frames in a static scene. Frames that
//! survive it get a structural (SSIM) comparison of the luminance plane.
//!
//! Comparison is always against the last *kept* keyframe rather than the
//! previous frame, so slow drift accumulates until it crosses the threshold
//! instead of escaping one invisible step at a time.

use crate::config::EngineConfig;
use crate::source::Frame;
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

/// Why a frame was selected for downstream description.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyframeReason {
    First,
    Last,
    Changed,
    MaxGap,
}

impl KeyframeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyframeReason::First => "first",
            KeyframeReason::Last => "last",
            KeyframeReason::Changed => "changed",
            KeyframeReason::MaxGap => "max_gap",
        }
    }
}

impl std::fmt::Display for KeyframeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating one frame.
#[derive(Clone, Debug)]
pub struct Evaluation {
    /// Combined change score in [0, 1].
    pub score: f64,
    /// Stage-one similarity in [0, 1]; 0.0 when there was no reference.
    pub global_similarity: f64,
    /// Stage-two similarity; `None` if the early exit skipped it.
    pub local_similarity: Option<f64>,
    /// `Some(First)` or `Some(Changed)` if this frame should become a
    /// keyframe, pending the debouncer's decision.
    pub candidate: Option<KeyframeReason>,
}

/// All metrics run at a reduced width; detection doesn't need full frames.
const DETECT_WIDTH: u32 = 256;

/// Histogram bins per channel (hue × saturation).
const HIST_BINS: usize = 32;

const SSIM_WINDOW: u32 = 8;

/// Reduced-scale representation of a frame, kept for the reference keyframe
/// so static scenes don't re-derive it every tick.
struct Prepared {
    /// Source dimensions, to notice stream resizes.
    source_width: u32,
    source_height: u32,
    histogram: Vec<f32>,
    luma: GrayImage,
}

pub struct ChangeDetector {
    change_threshold: f64,
    early_exit_similarity: f64,
    global_weight: f64,
    blur_sigma: f32,
    reference: Option<Prepared>,
    pending: Option<Prepared>,
}

impl ChangeDetector {
    pub fn new(config: &EngineConfig) -> Self {
        ChangeDetector {
            change_threshold: config.change_threshold,
            early_exit_similarity: config.early_exit_similarity,
            global_weight: config.global_weight,
            blur_sigma: config.blur_sigma,
            reference: None,
            pending: None,
        }
    }

    /// Evaluates one frame against the current reference keyframe.
    ///
    /// If the caller accepts the frame (directly or via the debouncer's
    /// max-gap forcing), it must call [`ChangeDetector::commit`] before the
    /// next `evaluate` so the reference advances.
    pub fn evaluate(&mut self, frame: &Frame) -> Evaluation {
        let prepared = prepare(&frame.image, self.blur_sigma);
        let evaluation = match &self.reference {
            None => Evaluation {
                score: 1.0,
                global_similarity: 0.0,
                local_similarity: None,
                candidate: Some(KeyframeReason::First),
            },
            Some(reference)
                if (reference.source_width, reference.source_height)
                    != (prepared.source_width, prepared.source_height) =>
            {
                // Stream resize: nothing meaningful to compare against.
                Evaluation {
                    score: 1.0,
                    global_similarity: 0.0,
                    local_similarity: None,
                    candidate: Some(KeyframeReason::First),
                }
            }
            Some(reference) => {
                let global = correlation(&reference.histogram, &prepared.histogram);
                if global >= self.early_exit_similarity {
                    Evaluation {
                        score: 1.0 - global,
                        global_similarity: global,
                        local_similarity: None,
                        candidate: None,
                    }
                } else {
                    let local = mean_ssim(&reference.luma, &prepared.luma);
                    let combined =
                        self.global_weight * global + (1.0 - self.global_weight) * local;
                    let score = (1.0 - combined).clamp(0.0, 1.0);
                    Evaluation {
                        score,
                        global_similarity: global,
                        local_similarity: Some(local),
                        candidate: (score >= self.change_threshold)
                            .then_some(KeyframeReason::Changed),
                    }
                }
            }
        };
        self.pending = Some(prepared);
        evaluation
    }

    /// Promotes the most recently evaluated frame to be the reference.
    pub fn commit(&mut self) {
        if let Some(p) = self.pending.take() {
            self.reference = Some(p);
        }
    }
}

fn prepare(image: &RgbImage, blur_sigma: f32) -> Prepared {
    let (source_width, source_height) = image.dimensions();
    let scaled = if source_width > DETECT_WIDTH {
        let h = (u64::from(source_height) * u64::from(DETECT_WIDTH) / u64::from(source_width))
            .max(1) as u32;
        image::imageops::resize(image, DETECT_WIDTH, h, FilterType::Triangle)
    } else {
        image.clone()
    };
    let blurred = if blur_sigma > 0.0 {
        image::imageops::blur(&scaled, blur_sigma)
    } else {
        scaled
    };
    Prepared {
        source_width,
        source_height,
        histogram: hs_histogram(&blurred),
        luma: image::imageops::grayscale(&blurred),
    }
}

/// Normalized 2-D hue/saturation histogram; value is deliberately ignored so
/// plain illumination shifts don't register as change.
fn hs_histogram(image: &RgbImage) -> Vec<f32> {
    let mut hist = vec![0f32; HIST_BINS * HIST_BINS];
    for pixel in image.pixels() {
        let (h, s) = rgb_to_hue_sat(pixel.0[0], pixel.0[1], pixel.0[2]);
        let hi = ((h / 360.0 * HIST_BINS as f32) as usize).min(HIST_BINS - 1);
        let si = ((s * HIST_BINS as f32) as usize).min(HIST_BINS - 1);
        hist[hi * HIST_BINS + si] += 1.0;
    }
    let total = image.width() as f32 * image.height() as f32;
    for bin in &mut hist {
        *bin /= total;
    }
    hist
}

fn rgb_to_hue_sat(r: u8, g: u8, b: u8) -> (f32, f32) {
    let (r, g, b) = (r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };
    (hue, saturation)
}

/// Pearson correlation between two histograms, clamped to [0, 1]:
/// anticorrelation is just "completely different" for our purposes.
fn correlation(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len() as f64;
    let mean_a = a.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let dx = x as f64 - mean_a;
        let dy = y as f64 - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a == 0.0 || var_b == 0.0 {
        // A flat histogram correlates with nothing; identical flats match.
        return if a == b { 1.0 } else { 0.0 };
    }
    (cov / (var_a.sqrt() * var_b.sqrt())).clamp(0.0, 1.0)
}

/// Mean SSIM over non-overlapping 8×8 windows of the luminance plane.
fn mean_ssim(a: &GrayImage, b: &GrayImage) -> f64 {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
    const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

    let (width, height) = a.dimensions();
    let mut total = 0.0;
    let mut windows = 0u32;
    let mut y = 0;
    while y < height {
        let mut x = 0;
        while x < width {
            let wx = SSIM_WINDOW.min(width - x);
            let wy = SSIM_WINDOW.min(height - y);
            let n = (wx * wy) as f64;
            let (mut sum_a, mut sum_b) = (0.0, 0.0);
            let (mut sq_a, mut sq_b, mut prod) = (0.0, 0.0, 0.0);
            for dy in 0..wy {
                for dx in 0..wx {
                    let pa = a.get_pixel(x + dx, y + dy).0[0] as f64;
                    let pb = b.get_pixel(x + dx, y + dy).0[0] as f64;
                    sum_a += pa;
                    sum_b += pb;
                    sq_a += pa * pa;
                    sq_b += pb * pb;
                    prod += pa * pb;
                }
            }
            let mu_a = sum_a / n;
            let mu_b = sum_b / n;
            let var_a = (sq_a / n - mu_a * mu_a).max(0.0);
            let var_b = (sq_b / n - mu_b * mu_b).max(0.0);
            let cov = prod / n - mu_a * mu_b;
            let ssim = ((2.0 * mu_a * mu_b + C1) * (2.0 * cov + C2))
                / ((mu_a * mu_a + mu_b * mu_b + C1) * (var_a + var_b + C2));
            total += ssim;
            windows += 1;
            x += SSIM_WINDOW;
        }
        y += SSIM_WINDOW;
    }
    if windows == 0 {
        return 1.0;
    }
    (total / windows as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn detector() -> ChangeDetector {
        ChangeDetector::new(&EngineConfig::default())
    }

    #[test]
    fn first_frame_is_always_emitted() {
        let mut d = detector();
        let f = testutil::solid_frame(0, 0.0, 64, 48, [10, 20, 30]);
        let e = d.evaluate(&f);
        assert_eq!(e.candidate, Some(KeyframeReason::First));
        assert_eq!(e.score, 1.0);
    }

    #[test]
    fn static_scene_early_exits() {
        let mut d = detector();
        let f0 = testutil::solid_frame(0, 0.0, 64, 48, [120, 90, 60]);
        d.evaluate(&f0);
        d.commit();

        let f1 = testutil::solid_frame(1, 0.3, 64, 48, [120, 90, 60]);
        let e = d.evaluate(&f1);
        assert!(e.global_similarity >= 0.95, "{e:?}");
        assert!(e.local_similarity.is_none(), "expensive stage must be skipped");
        assert_eq!(e.candidate, None);
    }

    #[test]
    fn scene_cut_scores_above_threshold() {
        let mut d = detector();
        let f0 = testutil::solid_frame(0, 0.0, 64, 48, [200, 30, 30]);
        d.evaluate(&f0);
        d.commit();

        let f1 = testutil::solid_frame(1, 3.0, 64, 48, [20, 40, 200]);
        let e = d.evaluate(&f1);
        assert_eq!(e.candidate, Some(KeyframeReason::Changed), "{e:?}");
        assert!(e.score >= 0.10, "{e:?}");
        assert!(e.local_similarity.is_some());
    }

    #[test]
    fn resolution_change_resets_reference() {
        let mut d = detector();
        let f0 = testutil::solid_frame(0, 0.0, 64, 48, [50, 50, 50]);
        d.evaluate(&f0);
        d.commit();

        let f1 = testutil::solid_frame(1, 1.0, 32, 24, [50, 50, 50]);
        let e = d.evaluate(&f1);
        assert_eq!(e.candidate, Some(KeyframeReason::First));
    }

    #[test]
    fn comparison_is_against_last_kept_keyframe() {
        // Without a commit, the reference must not drift forward.
        let mut d = detector();
        let f0 = testutil::solid_frame(0, 0.0, 64, 48, [200, 30, 30]);
        d.evaluate(&f0);
        d.commit();

        // A mild shift that doesn't cross the threshold, uncommitted.
        let f1 = testutil::solid_frame(1, 0.3, 64, 48, [195, 35, 30]);
        let e1 = d.evaluate(&f1);
        assert_eq!(e1.candidate, None, "{e1:?}");

        // Same mild shift again: compared against f0, not f1.
        let f2 = testutil::solid_frame(2, 0.6, 64, 48, [195, 35, 30]);
        let e2 = d.evaluate(&f2);
        assert_eq!(e2.candidate, None);
        assert!((e1.score - e2.score).abs() < 1e-9);
    }

    #[test]
    fn identical_ssim_is_one() {
        let a = image::imageops::grayscale(&testutil::solid_image(64, 48, [7, 7, 7]));
        assert!((mean_ssim(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn disjoint_histograms_do_not_correlate() {
        let red = hs_histogram(&testutil::solid_image(32, 32, [255, 0, 0]));
        let blue = hs_histogram(&testutil::solid_image(32, 32, [0, 0, 255]));
        assert!(correlation(&red, &blue) < 0.5);
        assert!((correlation(&red, &red) - 1.0).abs() < 1e-6);
    }
}
