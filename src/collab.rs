// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! External collaborator contracts: the vision describer, the policy
//! evaluator, and the optional transcriber.
//!
//! Provider integrations (wire formats, authentication, prompt engineering)
//! live outside this crate; the engine sees only these traits. Implementors
//! classify their failures into [`base::ErrorKind`]s — `Unavailable` for
//! timeouts/429/5xx, `Rejected` for other 4xx and auth failures, `Parse`
//! for structured output that doesn't validate — and the dispatch engine
//! takes it from there.

use crate::json::{Policy, Transcript, Verdict};
use crate::sink::Observation;
use async_trait::async_trait;
use base::Error;
use bytes::Bytes;
use itertools::Itertools;

/// Describes a batch of images. Output must be one description per input
/// image, in order.
#[async_trait]
pub trait Describer: Send + Sync {
    async fn describe(&self, images: &[Bytes], prompt: &str) -> Result<Vec<String>, Error>;
}

/// What the evaluator needs to produce verdicts for one analysis window.
pub struct EvaluateRequest<'a> {
    pub observations: &'a [Observation],
    pub transcript: Option<&'a Transcript>,
    pub policy: &'a Policy,
    pub prior_context: Option<&'a str>,
    /// Set on the retry after a parse failure: the implementation should
    /// constrain the model harder (stricter schema prompt, lower
    /// temperature, whatever it has).
    pub strict: bool,
}

/// The evaluator's structured output: the body of a report.
#[derive(Clone, Debug, Default)]
pub struct ReportBody {
    pub summary: String,
    pub verdicts: Vec<Verdict>,
    pub recommendations: Vec<String>,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: EvaluateRequest<'_>) -> Result<ReportBody, Error>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Bytes, language_hint: Option<&str>)
        -> Result<Transcript, Error>;
}

/// Condenses a policy into the describe-call prompt so the model focuses on
/// what the rules actually care about. Mechanical: rule descriptions, the
/// caller's custom context, and the enabled reference checks.
pub fn condensed_prompt(policy: &Policy) -> String {
    let mut parts = Vec::new();
    if !policy.custom_prompt.is_empty() {
        parts.push(format!("Context: {}", policy.custom_prompt));
    }
    if !policy.rules.is_empty() {
        parts.push(format!(
            "Describe each image with attention to: {}",
            policy.rules.iter().map(|r| r.description.as_str()).join("; ")
        ));
    }
    let reference_checks = policy
        .enabled_references()
        .flat_map(|r| r.checks.iter().map(move |c| format!("{} — {}", r.label, c)))
        .join("; ");
    if !reference_checks.is_empty() {
        parts.push(format!("Also note: {reference_checks}"));
    }
    if parts.is_empty() {
        parts.push("Describe each image factually and concisely.".to_owned());
    }
    parts.join("\n")
}

/// Stand-in describer for running without a provider integration linked in:
/// keyframe selection still works end to end, descriptions stay empty.
pub struct OfflineDescriber;

#[async_trait]
impl Describer for OfflineDescriber {
    async fn describe(&self, images: &[Bytes], _prompt: &str) -> Result<Vec<String>, Error> {
        Ok(vec![String::new(); images.len()])
    }
}

/// Stand-in evaluator: reports what the engine itself knows and leaves
/// every rule unjudged.
pub struct OfflineEvaluator;

#[async_trait]
impl Evaluator for OfflineEvaluator {
    async fn evaluate(&self, request: EvaluateRequest<'_>) -> Result<ReportBody, Error> {
        Ok(ReportBody {
            summary: format!(
                "offline analysis: {} keyframes selected; no evaluator configured, \
                 {} rule(s) not judged",
                request.observations.len(),
                request.policy.rules.len(),
            ),
            verdicts: Vec::new(),
            recommendations: Vec::new(),
        })
    }
}
