// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Session lifecycle: one [`Session`] owns everything for a running
//! analysis — source task, detector state, capture ring, sink, dispatcher —
//! and exposes only start/stop/progress.
//!
//! File analysis runs decode and detection to completion, then dispatches a
//! single window. Live monitoring runs a grabber, a detector, and a
//! dispatcher concurrently; windows rotate on media time, and window N+1
//! may accumulate while window N is still being dispatched, but dispatch
//! itself stays strictly one-at-a-time.
//!
//! Cross-window state (prior context, checklist satisfactions) advances
//! only after a window's report has been emitted, so the next window always
//! sees a consistent view.

use crate::collab::{Describer, Evaluator, Transcriber};
use crate::config::EngineConfig;
use crate::debounce::Debouncer;
use crate::detect::{ChangeDetector, KeyframeReason};
use crate::dispatch::{Dispatcher, WindowJob};
use crate::json::{
    ChecklistStatus, ExitStatus, Policy, ProgressEvent, Report, Transcript, Verdict,
};
use crate::ratelimit::{RateLimiter, RateLimits};
use crate::ring;
use crate::sink::{KeyframeSink, Observation};
use crate::source::{Frame, Opener, RetryingSource, Source, SourceOptions};
use base::clock::{Clocks, RealClocks, TimerGuard};
use base::{Error, ErrorKind};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process-global record of checklist satisfactions and their expiry. Lives
/// across sessions: "the inspection was done this morning" must hold for
/// its whole validity window no matter how many sessions come and go.
pub struct ChecklistLedger {
    /// rule id → expiry; `None` means the satisfaction never lapses.
    entries: base::Mutex<HashMap<String, Option<jiff::Timestamp>>>,
}

impl ChecklistLedger {
    pub fn global() -> &'static ChecklistLedger {
        static LEDGER: OnceLock<ChecklistLedger> = OnceLock::new();
        LEDGER.get_or_init(|| ChecklistLedger {
            entries: base::Mutex::new(HashMap::new()),
        })
    }

    pub fn reset(&self) {
        self.entries.lock().clear();
    }

    /// Applies checklist semantics to a window's verdicts: a satisfied rule
    /// stays compliant until its validity lapses; on the first window after
    /// expiry it reads `expired` and is re-evaluated from scratch.
    fn stamp(&self, now: jiff::Timestamp, policy: &Policy, verdicts: &mut [Verdict]) {
        let mut entries = self.entries.lock();
        for verdict in verdicts {
            let Some(rule) = policy.rule(&verdict.rule_id) else {
                continue;
            };
            if rule.mode != crate::json::RuleMode::Checklist {
                continue;
            }
            let held = match entries.get(&verdict.rule_id) {
                Some(&expiry) => match expiry {
                    Some(at) if now >= at => {
                        entries.remove(&verdict.rule_id);
                        verdict.status = Some(ChecklistStatus::Expired);
                        false
                    }
                    _ => {
                        verdict.compliant = true;
                        verdict.status = Some(ChecklistStatus::Compliant);
                        verdict.expires_at = expiry;
                        true
                    }
                },
                None => false,
            };
            if held {
                continue;
            }
            if verdict.compliant {
                let expiry = rule
                    .validity_duration
                    .map(|secs| now + jiff::SignedDuration::from_secs(secs as i64));
                entries.insert(verdict.rule_id.clone(), expiry);
                verdict.status = Some(ChecklistStatus::Compliant);
                verdict.expires_at = expiry;
            } else if verdict.status != Some(ChecklistStatus::Expired) {
                verdict.status = Some(ChecklistStatus::Pending);
            }
        }
    }
}

/// Clears process-wide checklist state. Prior context is per-session and
/// dies with its session; rate-limit buckets track provider usage and are
/// deliberately not touched.
pub fn reset_process_state() {
    ChecklistLedger::global().reset();
}

/// Session-local memory of previous windows, for prior-context propagation.
#[derive(Default)]
struct PriorState {
    /// rule id → last window's compliance.
    last: HashMap<String, bool>,
    /// rule id → compliant windows seen, for `at_least_*` rules.
    occurrences: HashMap<String, u32>,
}

impl PriorState {
    /// Builds the evaluator's prior-context string. The rule-frequency
    /// distinction lives here: `always` rules get their previous verdict as
    /// context and are re-evaluated, never suppressed; `at_least_*` rules
    /// are marked SATISFIED once met so the evaluator doesn't re-flag them.
    fn build_context(&self, policy: &Policy) -> Option<String> {
        let mut lines = Vec::new();
        if let Some(base) = &policy.prior_context {
            lines.push(base.clone());
        }
        for rule in &policy.rules {
            match rule.required_occurrences() {
                None => {
                    if let Some(&compliant) = self.last.get(&rule.id) {
                        lines.push(format!(
                            "rule {}: previous window was {}; re-evaluate on the new evidence",
                            rule.id,
                            if compliant { "compliant" } else { "non-compliant" },
                        ));
                    }
                }
                Some(required) => {
                    let count = self.occurrences.get(&rule.id).copied().unwrap_or(0);
                    if count >= required {
                        lines.push(format!(
                            "rule {}: SATISFIED ({count} of {required} required occurrences \
                             observed in earlier windows); do not re-flag it",
                            rule.id,
                        ));
                    } else if count > 0 {
                        lines.push(format!(
                            "rule {}: {count} of {required} required occurrences observed so far",
                            rule.id,
                        ));
                    }
                }
            }
        }
        (!lines.is_empty()).then(|| lines.join("\n"))
    }

    fn is_satisfied(&self, rule: &crate::json::Rule) -> bool {
        match rule.required_occurrences() {
            None => false,
            Some(required) => self.occurrences.get(&rule.id).copied().unwrap_or(0) >= required,
        }
    }

    /// Even if the evaluator ignores the prior context and re-flags an
    /// already-satisfied rule, the verdict is forced back to compliant.
    fn enforce_satisfied(&self, policy: &Policy, verdicts: &mut [Verdict]) {
        for verdict in verdicts {
            let Some(rule) = policy.rule(&verdict.rule_id) else {
                continue;
            };
            if !verdict.compliant && self.is_satisfied(rule) {
                debug!(rule_id = %verdict.rule_id, "suppressing re-flag of satisfied rule");
                verdict.compliant = true;
                verdict.reason = "satisfied in an earlier window".to_owned();
            }
        }
    }

    fn update(&mut self, policy: &Policy, verdicts: &[Verdict]) {
        for verdict in verdicts {
            self.last.insert(verdict.rule_id.clone(), verdict.compliant);
            if verdict.compliant {
                if let Some(rule) = policy.rule(&verdict.rule_id) {
                    if rule.required_occurrences().is_some() {
                        *self.occurrences.entry(verdict.rule_id.clone()).or_insert(0) += 1;
                    }
                }
            }
        }
    }
}

/// Re-derives the report's aggregates after session-side verdict rewrites.
fn finalize_report(report: &mut Report, policy: &Policy, prior: &PriorState, now: jiff::Timestamp) {
    prior.enforce_satisfied(policy, &mut report.all_verdicts);
    ChecklistLedger::global().stamp(now, policy, &mut report.all_verdicts);
    report.incidents = report
        .all_verdicts
        .iter()
        .filter(|v| !v.compliant)
        .cloned()
        .collect();
    report.overall_compliant = report.incidents.is_empty() && report.error.is_none();
}

pub struct SessionManager {
    config: EngineConfig,
    clocks: Arc<dyn Clocks>,
    describer: Arc<dyn Describer>,
    evaluator: Arc<dyn Evaluator>,
    transcriber: Option<Arc<dyn Transcriber>>,
    keyframe_dir: Option<PathBuf>,
    /// Rate-limit bucket name; one bucket per provider, process-wide.
    provider: String,
}

impl SessionManager {
    pub fn new(
        config: EngineConfig,
        describer: Arc<dyn Describer>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        SessionManager {
            config,
            clocks: Arc::new(RealClocks::new()),
            describer,
            evaluator,
            transcriber: None,
            keyframe_dir: None,
            provider: "default".to_owned(),
        }
    }

    pub fn with_clocks(mut self, clocks: Arc<dyn Clocks>) -> Self {
        self.clocks = clocks;
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn with_keyframe_dir(mut self, dir: PathBuf) -> Self {
        self.keyframe_dir = Some(dir);
        self
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = provider.to_owned();
        self
    }

    fn limiter(&self) -> Arc<RateLimiter> {
        RateLimiter::global(
            &self.provider,
            RateLimits {
                per_minute: self.config.rate_limit_per_minute,
                per_hour: self.config.rate_limit_per_hour,
            },
        )
    }

    /// Analyzes a bounded source to completion: one report, then
    /// `complete` (or `error:<reason>`).
    pub fn start_file_analysis(
        &self,
        opener: Arc<dyn Opener>,
        uri: &str,
        policy: Policy,
    ) -> Session {
        policy.warn_unknown();
        let id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = mpsc::channel(16);
        let ctx = SessionContext {
            id,
            uri: uri.to_owned(),
            config: self.config.clone(),
            clocks: self.clocks.clone(),
            policy: Arc::new(policy),
            describer: self.describer.clone(),
            evaluator: self.evaluator.clone(),
            transcriber: self.transcriber.clone(),
            limiter: self.limiter(),
            keyframe_dir: self.keyframe_dir.clone(),
            cancel: cancel.clone(),
            progress: progress_tx,
        };
        let driver = tokio::spawn(file_driver(ctx, opener));
        Session {
            id,
            cancel,
            progress: progress_rx,
            driver,
        }
    }

    /// Monitors an unbounded source until [`Session::stop`]: one report per
    /// window.
    pub fn start_live_monitoring(
        &self,
        opener: Arc<dyn Opener>,
        uri: &str,
        policy: Policy,
        window_duration: Option<f64>,
    ) -> Session {
        policy.warn_unknown();
        let id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = mpsc::channel(16);
        let mut config = self.config.clone();
        if let Some(secs) = window_duration {
            config.window_duration = secs;
        }
        let ctx = SessionContext {
            id,
            uri: uri.to_owned(),
            config,
            clocks: self.clocks.clone(),
            policy: Arc::new(policy),
            describer: self.describer.clone(),
            evaluator: self.evaluator.clone(),
            transcriber: self.transcriber.clone(),
            limiter: self.limiter(),
            keyframe_dir: self.keyframe_dir.clone(),
            cancel: cancel.clone(),
            progress: progress_tx,
        };
        let driver = tokio::spawn(live_driver(ctx, opener));
        Session {
            id,
            cancel,
            progress: progress_rx,
            driver,
        }
    }
}

/// Handle to a running analysis. Dropping it does *not* stop the work;
/// call [`Session::stop`].
pub struct Session {
    id: Uuid,
    cancel: CancellationToken,
    progress: mpsc::Receiver<ProgressEvent>,
    driver: tokio::task::JoinHandle<()>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cooperative cancel: every task observes it at its next suspension
    /// point; in-flight collaborator calls are discarded.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Next progress event; `None` after `Ended` has been consumed.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.progress.recv().await
    }

    /// Drains the progress stream to completion and tears down.
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.progress.recv().await {
            events.push(event);
        }
        let _ = self.driver.await;
        events
    }
}

struct SessionContext {
    id: Uuid,
    uri: String,
    config: EngineConfig,
    clocks: Arc<dyn Clocks>,
    policy: Arc<Policy>,
    describer: Arc<dyn Describer>,
    evaluator: Arc<dyn Evaluator>,
    transcriber: Option<Arc<dyn Transcriber>>,
    limiter: Arc<RateLimiter>,
    keyframe_dir: Option<PathBuf>,
    cancel: CancellationToken,
    progress: mpsc::Sender<ProgressEvent>,
}

impl SessionContext {
    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.describer.clone(),
            self.evaluator.clone(),
            self.limiter.clone(),
            self.clocks.clone(),
            self.policy.clone(),
            self.config.dispatch_batch_size,
            self.cancel.clone(),
        )
    }

    async fn emit(&self, event: ProgressEvent) {
        let _ = self.progress.send(event).await;
    }
}

/// What the decode+detect pass over a bounded source produced.
struct Collected {
    observations: Vec<Observation>,
    total_frames: u64,
    duration: f64,
    audio: Option<bytes::Bytes>,
    /// Fatal error that stopped collection early, if any.
    error: Option<Error>,
}

async fn file_driver(ctx: SessionContext, opener: Arc<dyn Opener>) {
    ctx.emit(ProgressEvent::Started { session_id: ctx.id }).await;

    let sink = KeyframeSink::new(
        ctx.config.keyframe_max_width,
        ctx.config.jpeg_quality_for(false),
        ctx.keyframe_dir.clone(),
    );
    let collected = {
        let config = ctx.config.clone();
        let cancel = ctx.cancel.clone();
        let clocks = ctx.clocks.clone();
        let uri = ctx.uri.clone();
        let want_audio = ctx.policy.include_audio;
        tokio::task::spawn_blocking(move || {
            collect_bounded(&*opener, &uri, &config, &clocks, &cancel, sink, want_audio)
        })
        .await
    };
    let (collected, sink_drops) = match collected {
        Ok((collected, sink)) => (collected, sink.finish().await),
        Err(join_error) => {
            warn!(err = %join_error, "collection task panicked");
            ctx.emit(ProgressEvent::Ended {
                status: ExitStatus::Error("internal collection failure".to_owned()),
            })
            .await;
            return;
        }
    };
    if sink_drops > 0 {
        debug!(sink_drops, "some keyframe disk writes were shed");
    }

    if ctx.cancel.is_cancelled() {
        ctx.emit(ProgressEvent::Ended {
            status: ExitStatus::Stopped,
        })
        .await;
        return;
    }

    let transcript = match (&ctx.policy.include_audio, &ctx.transcriber) {
        (true, Some(transcriber)) => Some(match collected.audio.clone() {
            Some(audio) => transcriber
                .transcribe(audio, None)
                .await
                .unwrap_or_else(|e| {
                    warn!(err = %e.chain(), "transcription failed; continuing without");
                    Transcript::default()
                }),
            None => Transcript::default(),
        }),
        (true, None) => Some(Transcript::default()),
        _ => None,
    };

    let prior = PriorState::default();
    let job = WindowJob {
        video_id: ctx.id.to_string(),
        observations: collected.observations,
        transcript,
        prior_context: prior.build_context(&ctx.policy),
        total_frames: collected.total_frames,
        duration: collected.duration,
    };

    let status = match collected.error {
        Some(e) => {
            // Best effort: no remote calls on a dead session, but the report
            // still carries everything collected plus the error.
            let mut report = error_report(&ctx, job, &e);
            finalize_report(&mut report, &ctx.policy, &prior, ctx.clocks.realtime());
            ctx.emit(ProgressEvent::Report {
                report: Box::new(report),
            })
            .await;
            ExitStatus::Error(e.chain().to_string())
        }
        None => {
            let mut dispatcher = ctx.dispatcher();
            match dispatcher.run_window(job).await {
                Some(mut report) => {
                    finalize_report(&mut report, &ctx.policy, &prior, ctx.clocks.realtime());
                    ctx.emit(ProgressEvent::Report {
                        report: Box::new(report),
                    })
                    .await;
                    ExitStatus::Complete
                }
                None => ExitStatus::Stopped,
            }
        }
    };
    info!(session_id = %ctx.id, status = %status, "file analysis finished");
    ctx.emit(ProgressEvent::Ended { status }).await;
}

/// Builds a report for a window that never reached the collaborators.
fn error_report(ctx: &SessionContext, job: WindowJob, error: &Error) -> Report {
    use base64::Engine as _;
    let b64 = base64::engine::general_purpose::STANDARD;
    Report {
        video_id: job.video_id,
        summary: format!("analysis failed: {error}"),
        overall_compliant: false,
        incidents: Vec::new(),
        all_verdicts: Vec::new(),
        recommendations: Vec::new(),
        frame_observations: job
            .observations
            .iter()
            .map(|o| crate::json::FrameObservation {
                timestamp: o.timestamp,
                description: o.description.clone().unwrap_or_default(),
                trigger: o.reason,
                change_score: o.change_score,
                image_base64: b64.encode(&o.jpeg),
            })
            .collect(),
        transcript: job.transcript,
        analyzed_at: ctx.clocks.realtime(),
        total_frames_analyzed: job.total_frames,
        video_duration: job.duration,
        error: Some(error.chain().to_string()),
    }
}

/// Decode + detect over a bounded source, to completion or fatal error.
/// Runs on a blocking thread; detection is pure CPU.
fn collect_bounded(
    opener: &dyn Opener,
    uri: &str,
    config: &EngineConfig,
    clocks: &Arc<dyn Clocks>,
    cancel: &CancellationToken,
    mut sink: KeyframeSink,
    want_audio: bool,
) -> (Collected, KeyframeSink) {
    let mut collected = Collected {
        observations: Vec::new(),
        total_frames: 0,
        duration: 0.0,
        audio: None,
        error: None,
    };
    let mut source = {
        let _t = TimerGuard::new(clocks, || format!("opening {uri}"));
        match opener.open(uri, SourceOptions::default()) {
            Ok(source) => source,
            Err(e) => {
                collected.error = Some(e);
                return (collected, sink);
            }
        }
    };

    let mut detector = ChangeDetector::new(config);
    let mut debouncer = Debouncer::new(config.min_change_interval, config.max_gap);
    let mut last_sampled: Option<f64> = None;
    let mut last_frame: Option<(Frame, f64)> = None; // frame + its change score

    loop {
        if cancel.is_cancelled() {
            return (collected, sink);
        }
        let frame = match source.next() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.kind() == ErrorKind::Decode => {
                debug!(err = %e.chain(), "transient decode error; skipping frame");
                continue;
            }
            Err(e) => {
                collected.error = Some(e);
                break;
            }
        };
        collected.total_frames += 1;
        collected.duration = frame.timestamp;

        if last_sampled.is_some_and(|t| frame.timestamp - t < config.sample_interval - 1e-9) {
            last_frame = Some((frame, 0.0));
            continue;
        }
        last_sampled = Some(frame.timestamp);

        let evaluation = detector.evaluate(&frame);
        if let Some(reason) = debouncer.decide(frame.timestamp, evaluation.candidate) {
            detector.commit();
            match sink.accept(&frame, reason, evaluation.score) {
                Ok(observation) => collected.observations.push(observation),
                Err(e) => warn!(err = %e.chain(), "keyframe encode failed; skipping"),
            }
        }
        last_frame = Some((frame, evaluation.score));
    }

    // End of stream: surface the final frame unless a keyframe just covered
    // it.
    if collected.error.is_none() {
        if let Some((frame, score)) = last_frame {
            if debouncer.accept_last(frame.timestamp) {
                match sink.accept(&frame, KeyframeReason::Last, score) {
                    Ok(observation) => collected.observations.push(observation),
                    Err(e) => warn!(err = %e.chain(), "keyframe encode failed; skipping"),
                }
            }
        }
        if want_audio {
            match source.take_audio() {
                Ok(audio) => collected.audio = audio,
                Err(e) => warn!(err = %e.chain(), "audio extraction failed; continuing without"),
            }
        }
    }
    (collected, sink)
}

/// One accumulating live window.
struct WindowAccum {
    index: u64,
    start: f64,
    end: f64,
    observations: Vec<Observation>,
    frames: u64,
}

impl WindowAccum {
    fn first(config: &EngineConfig) -> Self {
        WindowAccum {
            index: 0,
            start: 0.0,
            end: config.window_duration_for(0),
            observations: Vec::new(),
            frames: 0,
        }
    }

    fn job(&mut self, session_id: Uuid, duration: f64) -> WindowJob {
        WindowJob {
            video_id: format!("{session_id}:{}", self.index),
            observations: std::mem::take(&mut self.observations),
            transcript: None,
            prior_context: None, // filled by the dispatch loop
            total_frames: self.frames,
            duration,
        }
    }

    fn advance(&mut self, config: &EngineConfig) {
        self.index += 1;
        self.start = self.end;
        self.end = self.start + config.window_duration_for(self.index);
        self.frames = 0;
    }
}

async fn live_driver(ctx: SessionContext, opener: Arc<dyn Opener>) {
    ctx.emit(ProgressEvent::Started { session_id: ctx.id }).await;

    let (ring_put, ring_take) = ring::channel();
    let (job_tx, job_rx) = mpsc::channel::<WindowJob>(1);

    let grabber = {
        let cancel = ctx.cancel.clone();
        let clocks = ctx.clocks.clone();
        let uri = ctx.uri.clone();
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let source = opener.open(&uri, SourceOptions::default())?;
            let mut source = RetryingSource::new(source, clocks);
            loop {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match source.next()? {
                    Some(frame) => ring_put.put(frame),
                    // A live source that ends wasn't so live after all.
                    None => return Ok(()),
                }
            }
        })
    };

    let detect = {
        let config = ctx.config.clone();
        let cancel = ctx.cancel.clone();
        let session_id = ctx.id;
        let sink = KeyframeSink::new(
            config.keyframe_max_width,
            config.jpeg_quality_for(true),
            ctx.keyframe_dir.clone(),
        );
        tokio::spawn(detect_loop(ring_take, config, cancel, session_id, sink, job_tx))
    };

    let dispatch = {
        let ctx_policy = ctx.policy.clone();
        let clocks = ctx.clocks.clone();
        let progress = ctx.progress.clone();
        let cancel = ctx.cancel.clone();
        let mut dispatcher = ctx.dispatcher();
        let mut job_rx = job_rx;
        tokio::spawn(async move {
            let mut prior = PriorState::default();
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = job_rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let mut job = job;
                job.prior_context = prior.build_context(&ctx_policy);
                match dispatcher.run_window(job).await {
                    Some(mut report) => {
                        finalize_report(&mut report, &ctx_policy, &prior, clocks.realtime());
                        // Emit first; cross-window state advances only after
                        // the report is out.
                        let verdicts = report.all_verdicts.clone();
                        let _ = progress
                            .send(ProgressEvent::Report {
                                report: Box::new(report),
                            })
                            .await;
                        prior.update(&ctx_policy, &verdicts);
                    }
                    None => break, // cancelled mid-flight; emit nothing further
                }
            }
        })
    };

    let grabber_result = grabber.await;
    let detect_result = detect.await;
    let _ = dispatch.await;

    let status = if ctx.cancel.is_cancelled() {
        ExitStatus::Stopped
    } else {
        match grabber_result {
            Ok(Ok(())) => match detect_result {
                Ok(()) => ExitStatus::SourceUnreachable, // live EOF
                Err(_) => ExitStatus::Error("internal detector failure".to_owned()),
            },
            Ok(Err(e)) if e.kind() == ErrorKind::UnreadableSource => {
                warn!(err = %e.chain(), "source unreachable");
                ExitStatus::SourceUnreachable
            }
            Ok(Err(e)) => ExitStatus::Error(e.chain().to_string()),
            Err(join_error) => {
                warn!(err = %join_error, "grabber panicked");
                ExitStatus::Error("internal grabber failure".to_owned())
            }
        }
    };
    info!(session_id = %ctx.id, status = %status, "live monitoring finished");
    ctx.emit(ProgressEvent::Ended { status }).await;
}

/// Live detection: ring → sample gate → detector → debouncer → sink,
/// rotating windows on media time. Window N+1 keeps accumulating while the
/// dispatcher is busy with window N; the handoff waits, dispatch doesn't
/// overlap.
async fn detect_loop(
    mut ring_take: ring::RingTake,
    config: EngineConfig,
    cancel: CancellationToken,
    session_id: Uuid,
    mut sink: KeyframeSink,
    job_tx: mpsc::Sender<WindowJob>,
) {
    let mut detector = ChangeDetector::new(&config);
    let mut debouncer = Debouncer::new(config.min_change_interval, config.max_gap);
    let mut window = WindowAccum::first(&config);
    let mut last_sampled: Option<f64> = None;
    let mut last_ts = 0.0f64;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ring_take.take() => match frame {
                Some(frame) => frame,
                None => break, // grabber gone
            },
        };
        last_ts = frame.timestamp;

        // Rotate elapsed windows. If the dispatcher still has a window
        // queued behind the one in flight, keep accumulating into the
        // current window and retry on the next frame; detection never
        // stalls on dispatch.
        while frame.timestamp >= window.end {
            if window.observations.is_empty() {
                debug!(window = window.index, "window had no keyframes; skipping dispatch");
                window.advance(&config);
                continue;
            }
            match job_tx.try_reserve() {
                Ok(permit) => {
                    let duration = window.end - window.start;
                    permit.send(window.job(session_id, duration));
                    window.advance(&config);
                }
                Err(mpsc::error::TrySendError::Full(())) => break,
                Err(mpsc::error::TrySendError::Closed(())) => return,
            }
        }

        window.frames += 1;
        if last_sampled.is_some_and(|t| frame.timestamp - t < config.sample_interval - 1e-9) {
            continue;
        }
        last_sampled = Some(frame.timestamp);

        let evaluation = detector.evaluate(&frame);
        if let Some(reason) = debouncer.decide(frame.timestamp, evaluation.candidate) {
            detector.commit();
            match sink.accept(&frame, reason, evaluation.score) {
                Ok(observation) => window.observations.push(observation),
                Err(e) => warn!(err = %e.chain(), "keyframe encode failed; skipping"),
            }
        }
    }

    // Flush the partial trailing window so its keyframes aren't lost.
    if !window.observations.is_empty() {
        let duration = (last_ts - window.start).max(0.0);
        let job = window.job(session_id, duration);
        let _ = job_tx.send(job).await;
    }
    let dropped_frames = ring_take.dropped();
    if dropped_frames > 0 {
        debug!(dropped_frames, "capture ring shed frames while detection was busy");
    }
    let dropped_writes = sink.finish().await;
    if dropped_writes > 0 {
        debug!(dropped_writes, "sink shed disk writes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::ReportBody;
    use crate::json::{Frequency, Rule, RuleMode, Severity};
    use crate::testutil::{
        self, FixedTranscriber, ScriptedDescriber, ScriptedEvaluator, SyntheticSource, VecOpener,
    };
    use base::clock::SimulatedClocks;
    use std::time::Duration;

    const FPS: f64 = 5.0;
    const PACE: Duration = Duration::from_millis(10);

    fn rule(id: &str, frequency: Frequency) -> Rule {
        Rule {
            id: id.to_owned(),
            description: format!("rule {id}"),
            severity: Severity::High,
            mode: RuleMode::Incident,
            validity_duration: None,
            frequency,
            frequency_count: None,
        }
    }

    fn checklist_rule(id: &str, validity_secs: u64) -> Rule {
        Rule {
            id: id.to_owned(),
            description: format!("rule {id}"),
            severity: Severity::Medium,
            mode: RuleMode::Checklist,
            validity_duration: Some(validity_secs),
            frequency: Frequency::AtLeastOnce,
            frequency_count: None,
        }
    }

    fn verdict_for(rule: &Rule, compliant: bool, reason: &str) -> Verdict {
        Verdict {
            rule_id: rule.id.clone(),
            compliant,
            severity: rule.severity,
            reason: reason.to_owned(),
            timestamp: 1.0,
            mode: rule.mode,
            status: None,
            expires_at: None,
        }
    }

    fn body(verdicts: Vec<Verdict>) -> ReportBody {
        ReportBody {
            summary: "scripted".to_owned(),
            verdicts,
            recommendations: Vec::new(),
        }
    }

    fn manager(
        provider: &str,
        policy_evaluator: Arc<ScriptedEvaluator>,
    ) -> (SessionManager, Arc<ScriptedDescriber>, SimulatedClocks) {
        let describer = Arc::new(ScriptedDescriber::echoing());
        let clocks = SimulatedClocks::new("2025-04-26T00:00:00Z".parse().unwrap());
        let manager = SessionManager::new(
            EngineConfig::default(),
            describer.clone(),
            policy_evaluator,
        )
        .with_clocks(Arc::new(clocks.clone()))
        .with_provider(provider);
        (manager, describer, clocks)
    }

    fn reports(events: &[ProgressEvent]) -> Vec<&Report> {
        events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Report { report } => Some(report.as_ref()),
                _ => None,
            })
            .collect()
    }

    fn ended_status(events: &[ProgressEvent]) -> &ExitStatus {
        match events.last().expect("no events") {
            ProgressEvent::Ended { status } => status,
            other => panic!("last event was {other:?}, not Ended"),
        }
    }

    #[tokio::test]
    async fn file_static_scene_yields_first_and_last() {
        testutil::init();
        let r = rule("static-r1", Frequency::Always);
        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![verdict_for(
            &r, true, "scene acceptable",
        )])));
        let (manager, _, _) = manager("file-static", evaluator.clone());

        let frames = testutil::scene_frames(FPS, &[(10.0, [90, 120, 40])], 64, 48);
        let opener = Arc::new(VecOpener::new(vec![SyntheticSource::file(frames)]));
        let policy = Policy {
            rules: vec![r],
            ..Policy::default()
        };
        let session = manager.start_file_analysis(opener, "static.mp4", policy);
        let events = session.collect().await;

        assert!(matches!(events[0], ProgressEvent::Started { .. }));
        assert_eq!(*ended_status(&events), ExitStatus::Complete);
        let reports = reports(&events);
        assert_eq!(reports.len(), 1);
        let report = reports[0];

        // Static 10 s clip: the opening keyframe plus the end-of-stream one.
        assert_eq!(report.frame_observations.len(), 2);
        assert_eq!(report.frame_observations[0].trigger, KeyframeReason::First);
        assert_eq!(report.frame_observations[0].timestamp, 0.0);
        assert_eq!(report.frame_observations[1].trigger, KeyframeReason::Last);
        assert!((report.frame_observations[1].timestamp - 9.8).abs() < 1e-9);
        assert!((report.video_duration - 9.8).abs() < 1e-9);
        assert_eq!(report.total_frames_analyzed, 50);
        assert!(report.overall_compliant);
        assert!(report.incidents.is_empty());
        assert!(report.error.is_none());
        // Descriptions came back filled in.
        assert!(report.frame_observations.iter().all(|o| !o.description.is_empty()));
    }

    #[tokio::test]
    async fn file_scene_change_emits_changed_keyframe() {
        testutil::init();
        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![])));
        let (manager, _, _) = manager("file-cut", evaluator);

        let frames = testutil::scene_frames(
            FPS,
            &[(3.0, [200, 30, 30]), (4.0, [30, 30, 200])],
            64,
            48,
        );
        let opener = Arc::new(VecOpener::new(vec![SyntheticSource::file(frames)]));
        let session = manager.start_file_analysis(opener, "cut.mp4", Policy::default());
        let events = session.collect().await;

        assert_eq!(*ended_status(&events), ExitStatus::Complete);
        let reports = reports(&events);
        let observations = &reports[0].frame_observations;
        // first @ 0.0, changed @ ~3.0, last @ ~6.8.
        assert_eq!(observations.len(), 3);
        assert_eq!(observations[1].trigger, KeyframeReason::Changed);
        assert!(observations[1].timestamp >= 3.0 && observations[1].timestamp < 3.5);
        assert!(observations[1].change_score >= 0.10);
        // Timestamps never regress.
        for pair in observations.windows(2) {
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
    }

    #[tokio::test]
    async fn file_open_failure_still_emits_best_effort_report() {
        testutil::init();
        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![])));
        let (manager, describer, _) = manager("file-unreadable", evaluator.clone());

        let opener = Arc::new(VecOpener::new(vec![]));
        let session = manager.start_file_analysis(opener, "missing.mp4", Policy::default());
        let events = session.collect().await;

        let reports = reports(&events);
        assert_eq!(reports.len(), 1, "error sessions still report");
        assert!(reports[0].error.is_some());
        assert!(reports[0].summary.contains("analysis failed"));
        assert!(reports[0].frame_observations.is_empty());
        assert!(!reports[0].overall_compliant);
        assert!(matches!(ended_status(&events), ExitStatus::Error(_)));
        // A dead session makes no remote calls.
        assert_eq!(describer.calls(), 0);
        assert_eq!(evaluator.calls(), 0);
    }

    #[tokio::test]
    async fn file_audio_policy_gets_transcript() {
        testutil::init();
        let r = rule("audio-r1", Frequency::Always);
        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![verdict_for(
            &r,
            false,
            "no speech detected",
        )])));
        let (manager, _, _) = manager("file-audio", evaluator.clone());
        let transcriber = Arc::new(FixedTranscriber::new(Transcript::default()));
        let manager = manager.with_transcriber(transcriber.clone());

        let frames = testutil::scene_frames(FPS, &[(2.0, [10, 10, 10])], 64, 48);
        let source =
            SyntheticSource::file(frames).with_audio(bytes::Bytes::from_static(b"silence"));
        let opener = Arc::new(VecOpener::new(vec![source]));
        let policy = Policy {
            rules: vec![r],
            include_audio: true,
            ..Policy::default()
        };
        let session = manager.start_file_analysis(opener, "silent.mp4", policy);
        let events = session.collect().await;

        let reports = reports(&events);
        let transcript = reports[0].transcript.as_ref().expect("transcript attached");
        assert_eq!(transcript.full_text, "");
        assert!(transcript.segments.is_empty());
        assert_eq!(transcriber.calls(), 1);
        assert!(evaluator.seen()[0].had_transcript);
        // The audio rule failed as the evaluator said; nothing suppressed it.
        assert_eq!(reports[0].incidents.len(), 1);
        assert_eq!(reports[0].incidents[0].reason, "no speech detected");
    }

    #[tokio::test]
    async fn live_windows_rotate_and_report_in_order() {
        testutil::init();
        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![])));
        let (manager, _, _) = manager("live-rotate", evaluator.clone());

        // Scene cuts at 2 s and 8 s line up with the first (2 s) and steady
        // (6 s) windows.
        let frames = testutil::scene_frames(
            FPS,
            &[(2.0, [200, 30, 30]), (6.0, [30, 30, 200]), (6.0, [30, 200, 30])],
            64,
            48,
        );
        let source = SyntheticSource::live(frames).with_pacing(PACE);
        let opener = Arc::new(VecOpener::new(vec![source]));
        let session =
            manager.start_live_monitoring(opener, "rtsp://cam/main", Policy::default(), None);
        let id = session.id();
        let events = session.collect().await;

        // A live source that ends is an unreachable source, not a clean end.
        assert_eq!(*ended_status(&events), ExitStatus::SourceUnreachable);
        let reports = reports(&events);
        assert_eq!(reports.len(), 3, "three windows held keyframes");
        for (i, report) in reports.iter().enumerate() {
            assert_eq!(report.video_id, format!("{id}:{i}"));
        }
        assert_eq!(
            reports[0].frame_observations[0].trigger,
            KeyframeReason::First
        );
        assert!(reports[1..]
            .iter()
            .all(|r| r.frame_observations[0].trigger == KeyframeReason::Changed));
    }

    #[tokio::test]
    async fn live_at_least_once_rule_stays_satisfied() {
        testutil::init();
        let r = rule("phrase-once", Frequency::AtLeastOnce);
        // Window 0: satisfied. Windows 1-2: the evaluator tries to re-flag.
        let evaluator = Arc::new(ScriptedEvaluator::queue(vec![
            body(vec![verdict_for(&r, true, "phrase was said")]),
            body(vec![verdict_for(&r, false, "phrase not heard this window")]),
            body(vec![verdict_for(&r, false, "phrase not heard this window")]),
        ]));
        let (manager, _, _) = manager("live-satisfied", evaluator.clone());

        let frames = testutil::scene_frames(
            FPS,
            &[(2.0, [200, 30, 30]), (6.0, [30, 30, 200]), (6.0, [30, 200, 30])],
            64,
            48,
        );
        let source = SyntheticSource::live(frames).with_pacing(PACE);
        let opener = Arc::new(VecOpener::new(vec![source]));
        let policy = Policy {
            rules: vec![r],
            ..Policy::default()
        };
        let session = manager.start_live_monitoring(opener, "rtsp://cam/main", policy, None);
        let events = session.collect().await;

        let reports = reports(&events);
        assert_eq!(reports.len(), 3);
        assert!(reports[0].all_verdicts[0].compliant);

        // Later windows: the evaluator was told, and even though it re-flagged
        // anyway, the verdict stays compliant with no new incident.
        let calls = evaluator.seen();
        assert!(calls[0].prior_context.is_none());
        for call in &calls[1..] {
            let context = call.prior_context.as_deref().expect("prior context");
            assert!(context.contains("SATISFIED"), "{context}");
        }
        for report in &reports[1..] {
            assert!(report.all_verdicts[0].compliant);
            assert!(report.incidents.is_empty());
            assert!(report.overall_compliant);
        }
    }

    #[tokio::test]
    async fn live_always_rule_reflags_every_window() {
        testutil::init();
        let r = rule("helmet-always", Frequency::Always);
        let evaluator = Arc::new(ScriptedEvaluator::queue(vec![
            body(vec![verdict_for(&r, true, "helmet present")]),
            body(vec![verdict_for(&r, false, "helmet absent")]),
        ]));
        let (manager, _, _) = manager("live-always", evaluator.clone());

        let frames = testutil::scene_frames(
            FPS,
            &[(2.0, [200, 30, 30]), (6.0, [30, 30, 200])],
            64,
            48,
        );
        let source = SyntheticSource::live(frames).with_pacing(PACE);
        let opener = Arc::new(VecOpener::new(vec![source]));
        let policy = Policy {
            rules: vec![r],
            ..Policy::default()
        };
        let session = manager.start_live_monitoring(opener, "rtsp://cam/main", policy, None);
        let events = session.collect().await;

        let reports = reports(&events);
        assert_eq!(reports.len(), 2);
        assert!(reports[0].overall_compliant);
        // A compliant window K never shields window K+1.
        assert_eq!(reports[1].incidents.len(), 1);
        assert_eq!(reports[1].incidents[0].reason, "helmet absent");
        assert!(!reports[1].overall_compliant);

        let calls = evaluator.seen();
        let context = calls[1].prior_context.as_deref().unwrap();
        assert!(context.contains("previous window was compliant"), "{context}");
        assert!(context.contains("re-evaluate"), "{context}");
    }

    #[tokio::test]
    async fn live_stop_mid_describe_emits_no_further_reports() {
        testutil::init();
        let describer = Arc::new(ScriptedDescriber::hanging());
        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![])));
        let clocks = SimulatedClocks::new("2025-04-26T00:00:00Z".parse().unwrap());
        let manager = SessionManager::new(EngineConfig::default(), describer, evaluator)
            .with_clocks(Arc::new(clocks))
            .with_provider("live-stop");

        let frames = testutil::scene_frames(FPS, &[(3.0, [200, 30, 30])], 64, 48);
        let source = SyntheticSource::live(frames).with_pacing(PACE);
        let opener = Arc::new(VecOpener::new(vec![source]));
        let mut session =
            manager.start_live_monitoring(opener, "rtsp://cam/main", Policy::default(), None);

        assert!(matches!(
            session.next_event().await,
            Some(ProgressEvent::Started { .. })
        ));
        // Give the dispatcher time to get stuck in the hanging describe call.
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.stop();
        let events = session.collect().await;

        assert!(reports(&events).is_empty(), "no report may follow a stop");
        assert_eq!(*ended_status(&events), ExitStatus::Stopped);
    }

    #[tokio::test]
    async fn live_unreachable_source_reports_status() {
        testutil::init();
        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![])));
        let (manager, _, _) = manager("live-unreachable", evaluator);
        let opener = Arc::new(VecOpener::new(vec![]));
        let session =
            manager.start_live_monitoring(opener, "rtsp://nowhere/main", Policy::default(), None);
        let events = session.collect().await;
        assert_eq!(*ended_status(&events), ExitStatus::SourceUnreachable);
        assert!(reports(&events).is_empty());
    }

    /// The checklist ledger is process-global; tests that touch it (or
    /// reset it) must not interleave.
    fn ledger_guard() -> base::MutexGuard<'static, ()> {
        static LOCK: base::Mutex<()> = base::Mutex::new(());
        LOCK.lock()
    }

    #[tokio::test]
    async fn checklist_satisfaction_holds_across_sessions_until_expiry() {
        testutil::init();
        let _guard = ledger_guard();
        let r = checklist_rule("inspection-ledger", 3600);
        let clocks = SimulatedClocks::new("2025-04-26T08:00:00Z".parse().unwrap());
        let frames = || testutil::scene_frames(FPS, &[(2.0, [90, 120, 40])], 64, 48);
        let policy = || Policy {
            rules: vec![r.clone()],
            ..Policy::default()
        };
        let run = |evaluator: Arc<ScriptedEvaluator>| {
            let describer = Arc::new(ScriptedDescriber::echoing());
            let manager = SessionManager::new(EngineConfig::default(), describer, evaluator)
                .with_clocks(Arc::new(clocks.clone()))
                .with_provider("checklist-ledger");
            let opener = Arc::new(VecOpener::new(vec![SyntheticSource::file(frames())]));
            manager.start_file_analysis(opener, "clip.mp4", policy())
        };

        // Session 1: the checklist item is seen done.
        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![verdict_for(
            &r, true, "inspection performed",
        )])));
        let events = run(evaluator).collect().await;
        let first = reports(&events)[0].all_verdicts[0].clone();
        assert_eq!(first.status, Some(ChecklistStatus::Compliant));
        let expires_at = first.expires_at.expect("validity recorded");

        // Session 2, within validity: held satisfied even though the
        // evaluator can't see it this time.
        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![verdict_for(
            &r, false, "not visible",
        )])));
        let events = run(evaluator).collect().await;
        let held = &reports(&events)[0].all_verdicts[0];
        assert!(held.compliant);
        assert_eq!(held.status, Some(ChecklistStatus::Compliant));
        assert_eq!(held.expires_at, Some(expires_at));

        // Session 3, after validity lapsed: expired, and the failure counts
        // again.
        clocks.sleep(Duration::from_secs(2 * 3600));
        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![verdict_for(
            &r, false, "not visible",
        )])));
        let events = run(evaluator).collect().await;
        let expired = &reports(&events)[0].all_verdicts[0];
        assert!(!expired.compliant);
        assert_eq!(expired.status, Some(ChecklistStatus::Expired));
    }

    #[tokio::test]
    async fn reset_process_state_clears_the_ledger() {
        testutil::init();
        let _guard = ledger_guard();
        let r = checklist_rule("inspection-reset", 3600);
        let clocks = SimulatedClocks::new("2025-04-26T08:00:00Z".parse().unwrap());
        let run = |evaluator: Arc<ScriptedEvaluator>| {
            let describer = Arc::new(ScriptedDescriber::echoing());
            let manager = SessionManager::new(EngineConfig::default(), describer, evaluator)
                .with_clocks(Arc::new(clocks.clone()))
                .with_provider("checklist-reset");
            let frames = testutil::scene_frames(FPS, &[(2.0, [90, 120, 40])], 64, 48);
            let opener = Arc::new(VecOpener::new(vec![SyntheticSource::file(frames)]));
            let policy = Policy {
                rules: vec![r.clone()],
                ..Policy::default()
            };
            manager.start_file_analysis(opener, "clip.mp4", policy)
        };

        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![verdict_for(
            &r, true, "done",
        )])));
        run(evaluator).collect().await;

        reset_process_state();

        let evaluator = Arc::new(ScriptedEvaluator::always(body(vec![verdict_for(
            &r,
            false,
            "not visible",
        )])));
        let events = run(evaluator).collect().await;
        let verdict = &reports(&events)[0].all_verdicts[0];
        assert!(!verdict.compliant, "reset must forget the satisfaction");
        assert_eq!(verdict.status, Some(ChecklistStatus::Pending));
    }
}
