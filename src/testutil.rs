// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing: synthetic frame sources and scripted
//! collaborators.

use crate::collab::{Describer, EvaluateRequest, Evaluator, ReportBody, Transcriber};
use crate::json::Transcript;
use crate::source::{Frame, Opener, Source, SourceKind, SourceOptions};
use async_trait::async_trait;
use base::{err, Error, ErrorKind};
use bytes::Bytes;
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: logging through the test
/// writer. (Output can be confusing unless `RUST_TEST_THREADS=1` is set.)
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
    });
}

pub fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(width, height, image::Rgb(rgb))
}

pub fn solid_frame(index: u64, timestamp: f64, width: u32, height: u32, rgb: [u8; 3]) -> Frame {
    Frame {
        index,
        timestamp,
        image: Arc::new(solid_image(width, height, rgb)),
    }
}

/// Builds a frame sequence from scene segments of `(duration_secs, color)`,
/// decoded at `fps`. A color change is a scene cut.
pub fn scene_frames(fps: f64, segments: &[(f64, [u8; 3])], width: u32, height: u32) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut index = 0u64;
    let mut segment_start = 0.0;
    for &(duration, color) in segments {
        let count = (duration * fps).round() as u64;
        for i in 0..count {
            let timestamp = segment_start + i as f64 / fps;
            frames.push(solid_frame(index, timestamp, width, height, color));
            index += 1;
        }
        segment_start += duration;
    }
    frames
}

/// In-memory [`Source`] with an optional failure plan.
pub struct SyntheticSource {
    kind: SourceKind,
    frames: VecDeque<Frame>,
    audio: Option<Bytes>,
    /// Emit this many frames, then fail `failures_left` times.
    fail_after: Option<u64>,
    failures_left: u32,
    emitted: u64,
    /// Sleep between frames, approximating capture rate. Without it a live
    /// grabber floods the ring faster than any consumer can take.
    pace: Option<std::time::Duration>,
}

impl SyntheticSource {
    pub fn file(frames: Vec<Frame>) -> Self {
        SyntheticSource {
            kind: SourceKind::File,
            frames: frames.into(),
            audio: None,
            fail_after: None,
            failures_left: 0,
            emitted: 0,
            pace: None,
        }
    }

    pub fn live(frames: Vec<Frame>) -> Self {
        SyntheticSource {
            kind: SourceKind::Live,
            ..Self::file(frames)
        }
    }

    pub fn with_audio(mut self, audio: Bytes) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_failures_after(mut self, emitted: u64, failures: u32) -> Self {
        self.fail_after = Some(emitted);
        self.failures_left = failures;
        self
    }

    pub fn with_pacing(mut self, pace: std::time::Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

impl Source for SyntheticSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn next(&mut self) -> Result<Option<Frame>, Error> {
        if self.fail_after == Some(self.emitted) && self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(err!(Decode, msg("scripted decode failure")));
        }
        match self.frames.pop_front() {
            Some(frame) => {
                if let Some(pace) = self.pace {
                    std::thread::sleep(pace);
                }
                self.emitted += 1;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    fn take_audio(&mut self) -> Result<Option<Bytes>, Error> {
        Ok(self.audio.take())
    }
}

/// Hands out scripted sources in order; fails once they run out.
pub struct VecOpener {
    sources: base::Mutex<VecDeque<SyntheticSource>>,
}

impl VecOpener {
    pub fn new(sources: Vec<SyntheticSource>) -> Self {
        VecOpener {
            sources: base::Mutex::new(sources.into()),
        }
    }
}

impl Opener for VecOpener {
    fn open(&self, uri: &str, _options: SourceOptions) -> Result<Box<dyn Source>, Error> {
        match self.sources.lock().pop_front() {
            Some(source) => Ok(Box::new(source)),
            None => Err(err!(UnreadableSource, msg("no more scripted sources for {uri}"))),
        }
    }
}

enum DescribeMode {
    Echo,
    FailThenEcho { kind: ErrorKind, remaining: AtomicU32 },
    Hang,
}

pub struct ScriptedDescriber {
    mode: DescribeMode,
    calls: AtomicU32,
    described: AtomicU64,
}

impl ScriptedDescriber {
    /// Returns "image N described" with a global running index.
    pub fn echoing() -> Self {
        Self::with_mode(DescribeMode::Echo)
    }

    pub fn failing_then_echoing(kind: ErrorKind, failures: u32) -> Self {
        Self::with_mode(DescribeMode::FailThenEcho {
            kind,
            remaining: AtomicU32::new(failures),
        })
    }

    /// Never returns; for cancellation tests.
    pub fn hanging() -> Self {
        Self::with_mode(DescribeMode::Hang)
    }

    fn with_mode(mode: DescribeMode) -> Self {
        ScriptedDescriber {
            mode,
            calls: AtomicU32::new(0),
            described: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Describer for ScriptedDescriber {
    async fn describe(&self, images: &[Bytes], _prompt: &str) -> Result<Vec<String>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            DescribeMode::Echo => {}
            DescribeMode::FailThenEcho { kind, remaining } => {
                if remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
                    .is_ok()
                {
                    return Err(err!(Internal, msg("scripted describe failure")).map_kind(*kind));
                }
            }
            DescribeMode::Hang => std::future::pending().await,
        }
        Ok(images
            .iter()
            .map(|_| {
                let n = self.described.fetch_add(1, Ordering::SeqCst);
                format!("image {n} described")
            })
            .collect())
    }
}

enum EvaluateMode {
    Always(ReportBody),
    Fail(ErrorKind),
    ParseFailThen(ReportBody),
    Queue(base::Mutex<VecDeque<ReportBody>>),
}

#[derive(Clone, Debug)]
pub struct EvaluateCall {
    pub strict: bool,
    pub prior_context: Option<String>,
    pub observation_count: usize,
    pub had_transcript: bool,
}

pub struct ScriptedEvaluator {
    mode: EvaluateMode,
    seen: base::Mutex<Vec<EvaluateCall>>,
}

impl ScriptedEvaluator {
    pub fn always(body: ReportBody) -> Self {
        Self::with_mode(EvaluateMode::Always(body))
    }

    pub fn always_failing(kind: ErrorKind) -> Self {
        Self::with_mode(EvaluateMode::Fail(kind))
    }

    pub fn parse_fail_then(body: ReportBody) -> Self {
        Self::with_mode(EvaluateMode::ParseFailThen(body))
    }

    /// One body per window, in order; default bodies once exhausted.
    pub fn queue(bodies: Vec<ReportBody>) -> Self {
        Self::with_mode(EvaluateMode::Queue(base::Mutex::new(bodies.into())))
    }

    fn with_mode(mode: EvaluateMode) -> Self {
        ScriptedEvaluator {
            mode,
            seen: base::Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.seen.lock().len() as u32
    }

    pub fn strict_flags(&self) -> Vec<bool> {
        self.seen.lock().iter().map(|c| c.strict).collect()
    }

    pub fn seen(&self) -> Vec<EvaluateCall> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, request: EvaluateRequest<'_>) -> Result<ReportBody, Error> {
        let call_index = {
            let mut seen = self.seen.lock();
            seen.push(EvaluateCall {
                strict: request.strict,
                prior_context: request.prior_context.map(str::to_owned),
                observation_count: request.observations.len(),
                had_transcript: request.transcript.is_some(),
            });
            seen.len()
        };
        match &self.mode {
            EvaluateMode::Always(body) => Ok(body.clone()),
            EvaluateMode::Fail(kind) => {
                Err(err!(Internal, msg("scripted evaluate failure")).map_kind(*kind))
            }
            EvaluateMode::ParseFailThen(body) => {
                if call_index == 1 {
                    Err(err!(Parse, msg("scripted parse failure")))
                } else {
                    Ok(body.clone())
                }
            }
            EvaluateMode::Queue(queue) => {
                Ok(queue.lock().pop_front().unwrap_or_default())
            }
        }
    }
}

pub struct FixedTranscriber {
    transcript: Transcript,
    calls: AtomicU32,
}

impl FixedTranscriber {
    pub fn new(transcript: Transcript) -> Self {
        FixedTranscriber {
            transcript,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(
        &self,
        _audio: Bytes,
        _language_hint: Option<&str>,
    ) -> Result<Transcript, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.transcript.clone())
    }
}
