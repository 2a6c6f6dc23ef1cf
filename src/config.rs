// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Engine tunables (`vigil.toml`).
//!
//! Every option has a default; a config file only needs the fields it
//! overrides. Unknown keys are warned about and ignored so old configs keep
//! working as the schema evolves.

use base::{bail, err, Error};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

fn default_sample_interval() -> f64 {
    0.3
}
fn default_change_threshold() -> f64 {
    0.10
}
fn default_min_change_interval() -> f64 {
    0.5
}
fn default_max_gap() -> f64 {
    10.0
}
fn default_early_exit_similarity() -> f64 {
    0.95
}
fn default_blur_sigma() -> f32 {
    0.8
}
fn default_global_weight() -> f64 {
    0.4
}
fn default_keyframe_max_width() -> u32 {
    512
}
fn default_jpeg_quality() -> f64 {
    0.6
}
fn default_live_jpeg_quality() -> f64 {
    0.8
}
fn default_window_duration() -> f64 {
    6.0
}
fn default_first_window_duration() -> f64 {
    2.0
}
fn default_dispatch_batch_size() -> usize {
    5
}
fn default_rate_limit_per_minute() -> u32 {
    30
}
fn default_rate_limit_per_hour() -> u32 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Frame polling cadence (seconds) when decode outpaces the desired rate.
    #[serde(default = "default_sample_interval")]
    pub sample_interval: f64,

    /// Combined change score at or above which a frame becomes a keyframe
    /// candidate.
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,

    /// Minimum interval (seconds) between accepted keyframes.
    #[serde(default = "default_min_change_interval")]
    pub min_change_interval: f64,

    /// Force a keyframe if none has been accepted for this long (seconds).
    #[serde(default = "default_max_gap")]
    pub max_gap: f64,

    /// Global-stage similarity at or above which the expensive local stage
    /// is skipped.
    #[serde(default = "default_early_exit_similarity")]
    pub early_exit_similarity: f64,

    /// Gaussian blur applied before comparison, to suppress sensor noise.
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,

    /// Weight of the global (histogram) stage in the combined score; the
    /// local (structural) stage gets the remainder.
    #[serde(default = "default_global_weight")]
    pub global_weight: f64,

    /// Keyframes wider than this are downscaled for transport (pixels).
    #[serde(default = "default_keyframe_max_width")]
    pub keyframe_max_width: u32,

    /// JPEG quality in (0, 1] for bulk (file-analysis) keyframes.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: f64,

    /// JPEG quality in (0, 1] for live keyframes.
    #[serde(default = "default_live_jpeg_quality")]
    pub live_jpeg_quality: f64,

    /// Live analysis window length (seconds).
    #[serde(default = "default_window_duration")]
    pub window_duration: f64,

    /// Length of the very first live window (seconds), kept short for fast
    /// initial feedback.
    #[serde(default = "default_first_window_duration")]
    pub first_window_duration: f64,

    /// Maximum images per describe call.
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,

    /// Remote calls allowed per minute, across all sessions.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Remote calls allowed per hour, across all sessions.
    #[serde(default = "default_rate_limit_per_hour")]
    pub rate_limit_per_hour: u32,

    /// Catch-all for unrecognized keys; see [`EngineConfig::warn_unknown`].
    #[serde(default, flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sample_interval: default_sample_interval(),
            change_threshold: default_change_threshold(),
            min_change_interval: default_min_change_interval(),
            max_gap: default_max_gap(),
            early_exit_similarity: default_early_exit_similarity(),
            blur_sigma: default_blur_sigma(),
            global_weight: default_global_weight(),
            keyframe_max_width: default_keyframe_max_width(),
            jpeg_quality: default_jpeg_quality(),
            live_jpeg_quality: default_live_jpeg_quality(),
            window_duration: default_window_duration(),
            first_window_duration: default_first_window_duration(),
            dispatch_batch_size: default_dispatch_batch_size(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_per_hour: default_rate_limit_per_hour(),
            unknown: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            err!(
                InvalidArgument,
                msg("unable to read config {}", path.display()),
                source(e)
            )
        })?;
        let config: EngineConfig = toml::from_str(&raw).map_err(|e| {
            err!(
                InvalidArgument,
                msg("unable to parse config {}", path.display()),
                source(e)
            )
        })?;
        config.warn_unknown();
        config.validate()?;
        Ok(config)
    }

    /// Logs each unrecognized key once. They are otherwise ignored.
    pub fn warn_unknown(&self) {
        for key in self.unknown.keys() {
            warn!(key = %key, "ignoring unrecognized config key");
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.change_threshold) {
            bail!(
                InvalidArgument,
                msg("change_threshold {} not in [0, 1]", self.change_threshold)
            );
        }
        if !(0.0..=1.0).contains(&self.global_weight) {
            bail!(
                InvalidArgument,
                msg("global_weight {} not in [0, 1]", self.global_weight)
            );
        }
        if !(0.0..=1.0).contains(&self.early_exit_similarity) {
            bail!(
                InvalidArgument,
                msg(
                    "early_exit_similarity {} not in [0, 1]",
                    self.early_exit_similarity
                )
            );
        }
        for (name, q) in [
            ("jpeg_quality", self.jpeg_quality),
            ("live_jpeg_quality", self.live_jpeg_quality),
        ] {
            if !(q > 0.0 && q <= 1.0) {
                bail!(InvalidArgument, msg("{name} {q} not in (0, 1]"));
            }
        }
        for (name, secs) in [
            ("sample_interval", self.sample_interval),
            ("min_change_interval", self.min_change_interval),
            ("max_gap", self.max_gap),
            ("window_duration", self.window_duration),
            ("first_window_duration", self.first_window_duration),
        ] {
            if !(secs > 0.0 && secs.is_finite()) {
                bail!(InvalidArgument, msg("{name} {secs} must be positive"));
            }
        }
        if self.dispatch_batch_size == 0 {
            bail!(InvalidArgument, msg("dispatch_batch_size must be at least 1"));
        }
        if self.keyframe_max_width == 0 {
            bail!(InvalidArgument, msg("keyframe_max_width must be at least 1"));
        }
        Ok(())
    }

    pub fn window_duration_for(&self, window_index: u64) -> f64 {
        if window_index == 0 {
            self.first_window_duration
        } else {
            self.window_duration
        }
    }

    pub fn jpeg_quality_for(&self, live: bool) -> f64 {
        if live {
            self.live_jpeg_quality
        } else {
            self.jpeg_quality
        }
    }
}

/// Timeouts for the remote collaborators. Not user-tunable.
pub const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(60);
pub const EVALUATE_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let c: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(c.sample_interval, 0.3);
        assert_eq!(c.change_threshold, 0.10);
        assert_eq!(c.min_change_interval, 0.5);
        assert_eq!(c.max_gap, 10.0);
        assert_eq!(c.early_exit_similarity, 0.95);
        assert_eq!(c.keyframe_max_width, 512);
        assert_eq!(c.dispatch_batch_size, 5);
        assert_eq!(c.rate_limit_per_minute, 30);
        assert_eq!(c.rate_limit_per_hour, 500);
        c.validate().unwrap();
    }

    #[test]
    fn overrides_and_unknown_keys() {
        let c: EngineConfig = toml::from_str(
            r#"
            change_threshold = 0.2
            window_duration = 4.0
            some_future_option = "whatever"
            "#,
        )
        .unwrap();
        assert_eq!(c.change_threshold, 0.2);
        assert_eq!(c.window_duration, 4.0);
        assert_eq!(c.max_gap, 10.0);
        assert_eq!(c.unknown.len(), 1);
        c.warn_unknown(); // shouldn't panic; logs once per key
        c.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range() {
        let mut c = EngineConfig::default();
        c.change_threshold = 1.5;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.jpeg_quality = 0.0;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.dispatch_batch_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn first_window_is_shorter() {
        let c = EngineConfig::default();
        assert_eq!(c.window_duration_for(0), 2.0);
        assert_eq!(c.window_duration_for(1), 6.0);
        assert_eq!(c.window_duration_for(7), 6.0);
    }
}
