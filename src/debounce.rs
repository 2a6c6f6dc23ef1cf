// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Keyframe admission: minimum inter-keyframe interval plus a maximum gap
//! that forces periodic keyframes even in a static scene.
//!
//! Both rules operate on media timestamps. Min-interval is applied first,
//! then max-gap is checked on every tick, so suppressing a burst of change
//! candidates can still end in a forced keyframe once the gap elapses.

use crate::detect::KeyframeReason;

pub struct Debouncer {
    min_interval: f64,
    max_gap: f64,
    last_accepted: Option<f64>,
}

impl Debouncer {
    pub fn new(min_interval: f64, max_gap: f64) -> Self {
        Debouncer {
            min_interval,
            max_gap,
            last_accepted: None,
        }
    }

    /// Decides whether the frame at `timestamp` becomes a keyframe.
    /// Must be called for every evaluated frame, candidate or not, so the
    /// gap check ticks.
    pub fn decide(
        &mut self,
        timestamp: f64,
        candidate: Option<KeyframeReason>,
    ) -> Option<KeyframeReason> {
        let decision = match candidate {
            // A fresh reference (first frame, stream resize) is never
            // debounced.
            Some(KeyframeReason::First) => Some(KeyframeReason::First),
            Some(reason) => match self.last_accepted {
                None => Some(reason),
                Some(last) if timestamp - last >= self.min_interval => Some(reason),
                Some(_) => None,
            },
            None => None,
        };
        let decision = decision.or_else(|| match self.last_accepted {
            Some(last) if timestamp - last >= self.max_gap => Some(KeyframeReason::MaxGap),
            _ => None,
        });
        if decision.is_some() {
            self.last_accepted = Some(timestamp);
        }
        decision
    }

    /// End-of-stream: accept the final frame with reason `last` unless a
    /// keyframe was already accepted within the last `min_interval`.
    pub fn accept_last(&mut self, timestamp: f64) -> bool {
        match self.last_accepted {
            Some(last) if timestamp - last < self.min_interval => false,
            _ => {
                self.last_accepted = Some(timestamp);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use KeyframeReason::*;

    fn debouncer() -> Debouncer {
        Debouncer::new(0.5, 10.0)
    }

    #[test]
    fn first_always_passes() {
        let mut d = debouncer();
        assert_eq!(d.decide(0.0, Some(First)), Some(First));
        // A stream resize re-emits `first` immediately; not debounced.
        assert_eq!(d.decide(0.1, Some(First)), Some(First));
    }

    #[test]
    fn min_interval_suppresses_bursts() {
        let mut d = debouncer();
        assert_eq!(d.decide(0.0, Some(First)), Some(First));
        assert_eq!(d.decide(0.2, Some(Changed)), None);
        assert_eq!(d.decide(0.4, Some(Changed)), None);
        assert_eq!(d.decide(0.5, Some(Changed)), Some(Changed));
        assert_eq!(d.decide(0.7, Some(Changed)), None);
    }

    #[test]
    fn max_gap_forces_keyframes_in_static_scene() {
        let mut d = debouncer();
        assert_eq!(d.decide(0.0, Some(First)), Some(First));
        let mut forced = Vec::new();
        let mut t = 0.0;
        while t < 30.0 {
            t += 0.3;
            if let Some(reason) = d.decide(t, None) {
                forced.push((t, reason));
            }
        }
        // Constant scene over 30 s with a 10 s gap: forced keyframes at
        // ~10.2, ~20.4 (the tick cadence is 0.3 s).
        assert_eq!(forced.len(), 2);
        assert!(forced.iter().all(|&(_, r)| r == MaxGap));
        assert!((forced[0].0 - 10.2).abs() < 1e-9);
        assert!((forced[1].0 - 20.4).abs() < 1e-9);
    }

    #[test]
    fn accepted_pairs_honor_interval_or_are_forced() {
        // Quantified invariant: consecutive accepted keyframes are at least
        // min_interval apart, or the later one has reason max_gap.
        let mut d = debouncer();
        let mut accepted: Vec<(f64, KeyframeReason)> = Vec::new();
        let mut t = 0.0;
        for i in 0..200 {
            let candidate = match i {
                0 => Some(First),
                _ if i % 3 == 0 => Some(Changed),
                _ => None,
            };
            if let Some(r) = d.decide(t, candidate) {
                accepted.push((t, r));
            }
            t += 0.2;
        }
        for pair in accepted.windows(2) {
            let (t0, _) = pair[0];
            let (t1, r1) = pair[1];
            assert!(
                t1 - t0 >= 0.5 || r1 == MaxGap || r1 == First,
                "violated at {t0}..{t1} ({r1:?})"
            );
        }
    }

    #[test]
    fn gap_measured_from_last_accept_not_last_candidate() {
        let mut d = debouncer();
        assert_eq!(d.decide(0.0, Some(First)), Some(First));
        // Suppressed candidates must not reset the gap timer.
        assert_eq!(d.decide(0.3, Some(Changed)), None);
        assert_eq!(d.decide(10.0, None), Some(MaxGap));
    }

    #[test]
    fn last_frame_rule() {
        let mut d = debouncer();
        assert_eq!(d.decide(0.0, Some(First)), Some(First));
        assert!(!d.accept_last(0.3), "too close to the `first` keyframe");

        let mut d = debouncer();
        assert_eq!(d.decide(0.0, Some(First)), Some(First));
        assert!(d.accept_last(9.7));
    }

    #[test]
    fn short_file_yields_exactly_first() {
        // A file shorter than min_change_interval: one keyframe, `first`.
        let mut d = debouncer();
        let mut accepted = 0;
        for (i, t) in [0.0, 0.1, 0.2, 0.3].iter().enumerate() {
            let candidate = (i == 0).then_some(First);
            if d.decide(*t, candidate).is_some() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert!(!d.accept_last(0.3));
    }
}
