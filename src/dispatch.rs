// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Window dispatch: the only component that talks to the remote
//! collaborators.
//!
//! One dispatcher per session, processing one window at a time through an
//! explicit state machine — Idle → Describing → Evaluating → Reporting,
//! with bounded retries in between. At-most-one-in-flight is a stated
//! invariant here, not a coincidence of loop structure: the dispatcher is
//! `&mut self` per window and asserts it re-enters idle.
//!
//! Failures never raise out of a window. A window that exhausts its retries
//! produces a partial report carrying whatever observations were collected
//! plus an error field.

use crate::collab::{condensed_prompt, Describer, EvaluateRequest, Evaluator, ReportBody};
use crate::config;
use crate::json::{FrameObservation, Policy, Report, Transcript, Verdict};
use crate::ratelimit::RateLimiter;
use crate::sink::Observation;
use base::clock::Clocks;
use base::{err, Error, ErrorKind};
use base64::Engine as _;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

/// One accumulated analysis window, ready for dispatch.
pub struct WindowJob {
    /// `session` for file analysis, `session:window` for live windows.
    pub video_id: String,
    pub observations: Vec<Observation>,
    pub transcript: Option<Transcript>,
    pub prior_context: Option<String>,
    pub total_frames: u64,
    /// Seconds of media this window covers.
    pub duration: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchState {
    Idle,
    Describing,
    Evaluating,
    Reporting,
    Retrying,
}

pub struct Dispatcher {
    describer: Arc<dyn Describer>,
    evaluator: Arc<dyn Evaluator>,
    limiter: Arc<RateLimiter>,
    clocks: Arc<dyn Clocks>,
    policy: Arc<Policy>,
    batch_size: usize,
    cancel: CancellationToken,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(
        describer: Arc<dyn Describer>,
        evaluator: Arc<dyn Evaluator>,
        limiter: Arc<RateLimiter>,
        clocks: Arc<dyn Clocks>,
        policy: Arc<Policy>,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Dispatcher {
            describer,
            evaluator,
            limiter,
            clocks,
            policy,
            batch_size,
            cancel,
            state: Mutex::new(DispatchState::Idle),
        }
    }

    pub fn state(&self) -> DispatchState {
        *self.state.lock().unwrap()
    }

    /// Runs one window through describe → evaluate → report.
    ///
    /// Returns `None` only on cancellation, in which case nothing further
    /// may be emitted for this session. Every other outcome is a report,
    /// possibly partial.
    pub async fn run_window(&mut self, mut job: WindowJob) -> Option<Report> {
        debug_assert_eq!(*self.state.lock().unwrap(), DispatchState::Idle, "window already in flight");

        *self.state.lock().unwrap() = DispatchState::Describing;
        let describe_error = match self.describe_all(&mut job.observations).await {
            Ok(()) => None,
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                *self.state.lock().unwrap() = DispatchState::Idle;
                return None;
            }
            Err(e) => Some(e),
        };
        if let Some(e) = describe_error {
            warn!(err = %e.chain(), video_id = %job.video_id, "describe failed; emitting partial report");
            *self.state.lock().unwrap() = DispatchState::Idle;
            return Some(self.partial_report(job, e));
        }

        *self.state.lock().unwrap() = DispatchState::Evaluating;
        let body = match self.evaluate(&job).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                *self.state.lock().unwrap() = DispatchState::Idle;
                return None;
            }
            Err(e) => {
                warn!(err = %e.chain(), video_id = %job.video_id, "evaluate failed; emitting partial report");
                *self.state.lock().unwrap() = DispatchState::Idle;
                return Some(self.partial_report(job, e));
            }
        };

        *self.state.lock().unwrap() = DispatchState::Reporting;
        let report = self.build_report(job, body, None);
        *self.state.lock().unwrap() = DispatchState::Idle;
        Some(report)
    }

    /// Fills in per-observation descriptions, batching up to `batch_size`
    /// images per describe call.
    async fn describe_all(&mut self, observations: &mut [Observation]) -> Result<(), Error> {
        let prompt = condensed_prompt(&self.policy);
        for batch in observations.chunks_mut(self.batch_size) {
            let images: SmallVec<[bytes::Bytes; 8]> =
                batch.iter().map(|o| o.jpeg.clone()).collect();
            self.limiter.acquire(&self.cancel).await?;
            let mut descriptions = self
                .with_retries("describe", config::DESCRIBE_TIMEOUT, || {
                    self.describer.describe(&images, &prompt)
                })
                .await?;
            if descriptions.len() != batch.len() {
                warn!(
                    got = descriptions.len(),
                    want = batch.len(),
                    "describe returned wrong count; padding"
                );
                descriptions.resize(batch.len(), String::new());
            }
            for (observation, description) in batch.iter_mut().zip(descriptions) {
                observation.description = Some(description);
            }
        }
        Ok(())
    }

    async fn evaluate(&mut self, job: &WindowJob) -> Result<ReportBody, Error> {
        self.limiter.acquire(&self.cancel).await?;
        let result = self
            .with_retries("evaluate", config::EVALUATE_TIMEOUT, || {
                self.evaluator.evaluate(EvaluateRequest {
                    observations: &job.observations,
                    transcript: job.transcript.as_ref(),
                    policy: &self.policy,
                    prior_context: job.prior_context.as_deref(),
                    strict: false,
                })
            })
            .await;
        match result {
            Err(e) if e.kind() == ErrorKind::Parse => {
                // One more try, telling the implementation to constrain the
                // model harder.
                warn!(err = %e.chain(), "evaluator output unparseable; retrying strict");
                self.limiter.acquire(&self.cancel).await?;
                self.attempt(config::EVALUATE_TIMEOUT, || {
                    self.evaluator.evaluate(EvaluateRequest {
                        observations: &job.observations,
                        transcript: job.transcript.as_ref(),
                        policy: &self.policy,
                        prior_context: job.prior_context.as_deref(),
                        strict: true,
                    })
                })
                .await
            }
            other => other,
        }
    }

    /// Runs `f` with a per-attempt timeout and exponential backoff on
    /// transient failures.
    async fn with_retries<T, F, Fut>(
        &self,
        what: &str,
        timeout: Duration,
        mut f: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let mut backoff = RETRY_BASE;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(timeout, &mut f).await {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) if e.kind().is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!(err = %e.chain(), attempt, "{what} failed; backing off {backoff:?}");
                    let resume = std::mem::replace(&mut *self.state.lock().unwrap(), DispatchState::Retrying);
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(err!(Cancelled, msg("cancelled during {what} backoff")));
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    *self.state.lock().unwrap() = resume;
                    backoff = (backoff * 2).min(RETRY_CAP);
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop returns on the final attempt");
    }

    /// One attempt: the call itself, racing the timeout and cancellation.
    async fn attempt<T, F, Fut>(&self, timeout: Duration, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(err!(Cancelled, msg("cancelled mid-call"))),
            result = tokio::time::timeout(timeout, f()) => match result {
                Ok(r) => r,
                Err(_) => Err(err!(Unavailable, msg("call exceeded {timeout:?}"))),
            },
        }
    }

    fn partial_report(&self, job: WindowJob, error: Error) -> Report {
        let summary = format!("analysis failed: {error}");
        let chain = error.chain().to_string();
        self.build_report(
            job,
            ReportBody {
                summary,
                verdicts: Vec::new(),
                recommendations: Vec::new(),
            },
            Some(chain),
        )
    }

    fn build_report(&self, job: WindowJob, body: ReportBody, error: Option<String>) -> Report {
        // Drop verdicts naming rules this policy doesn't have: every verdict
        // in a report must trace back to the policy that produced it.
        let all_verdicts: Vec<Verdict> = body
            .verdicts
            .into_iter()
            .filter(|v| {
                let known = self.policy.rule(&v.rule_id).is_some();
                if !known {
                    warn!(rule_id = %v.rule_id, "evaluator invented a rule id; dropping verdict");
                }
                known
            })
            .collect();
        let incidents: Vec<Verdict> = all_verdicts.iter().filter(|v| !v.compliant).cloned().collect();
        let overall_compliant = incidents.is_empty() && error.is_none();
        let base64 = base64::engine::general_purpose::STANDARD;
        let frame_observations = job
            .observations
            .iter()
            .map(|o| FrameObservation {
                timestamp: o.timestamp,
                description: o.description.clone().unwrap_or_default(),
                trigger: o.reason,
                change_score: o.change_score,
                image_base64: base64.encode(&o.jpeg),
            })
            .collect();
        debug!(
            video_id = %job.video_id,
            verdicts = all_verdicts.len(),
            incidents = incidents.len(),
            "report assembled"
        );
        Report {
            video_id: job.video_id,
            summary: body.summary,
            overall_compliant,
            incidents,
            all_verdicts,
            recommendations: body.recommendations,
            frame_observations,
            transcript: job.transcript,
            analyzed_at: self.clocks.realtime(),
            total_frames_analyzed: job.total_frames,
            video_duration: job.duration,
            error,
        }
    }
}
