// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON-compatible serde types for the policy input and report output
//! surfaces. These are the canonical schemas; everything a caller sends or
//! receives round-trips through this module.

use crate::detect::KeyframeReason;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    #[default]
    Incident,
    Checklist,
}

/// How often a rule must hold: in every frame (the default), or at least
/// once (or N times) over the whole session. The distinction drives
/// prior-context propagation; see [`crate::session`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    #[default]
    Always,
    AtLeastOnce,
    AtLeastN,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub mode: RuleMode,
    /// Checklist only: how long a satisfaction holds, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_duration: Option<u64>,
    #[serde(default)]
    pub frequency: Frequency,
    /// `at_least_n` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_count: Option<u32>,
}

impl Rule {
    /// Occurrences needed before the rule counts as satisfied; `None` for
    /// `always` rules, which are never "done".
    pub fn required_occurrences(&self) -> Option<u32> {
        match self.frequency {
            Frequency::Always => None,
            Frequency::AtLeastOnce => Some(1),
            Frequency::AtLeastN => Some(self.frequency_count.unwrap_or(1).max(1)),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceCategory {
    People,
    Badges,
    Objects,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    MustMatch,
    MustNotMatch,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub id: String,
    pub label: String,
    pub image_base64: String,
    pub category: ReferenceCategory,
    pub match_mode: MatchMode,
    #[serde(default)]
    pub checks: Vec<String>,
}

/// A full policy, as supplied per session (or per live window). Immutable
/// for the duration of a session; changing it means stop + start.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub custom_prompt: String,
    #[serde(default)]
    pub include_audio: bool,
    #[serde(default)]
    pub reference_images: Vec<ReferenceImage>,
    #[serde(default)]
    pub enabled_reference_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_context: Option<String>,
    /// Fields this build doesn't know about: kept so the policy round-trips
    /// unchanged, warned about once per session, otherwise ignored.
    #[serde(default, flatten)]
    pub(crate) unknown: std::collections::BTreeMap<String, serde_json::Value>,
}

impl Policy {
    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Logs each unrecognized field once.
    pub fn warn_unknown(&self) {
        for key in self.unknown.keys() {
            tracing::warn!(field = %key, "ignoring unrecognized policy field");
        }
    }

    /// Reference images selected for this run, in declaration order.
    pub fn enabled_references(&self) -> impl Iterator<Item = &ReferenceImage> {
        self.reference_images
            .iter()
            .filter(|r| self.enabled_reference_ids.iter().any(|id| *id == r.id))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Pending,
    Compliant,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub rule_id: String,
    pub compliant: bool,
    pub severity: Severity,
    pub reason: String,
    /// Media timestamp (seconds) of the evidence this verdict rests on.
    pub timestamp: f64,
    pub mode: RuleMode,
    /// Checklist only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ChecklistStatus>,
    /// Checklist only: wall clock at which the satisfaction lapses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<jiff::Timestamp>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub full_text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// One described keyframe as it appears in a report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameObservation {
    pub timestamp: f64,
    pub description: String,
    pub trigger: KeyframeReason,
    pub change_score: f64,
    pub image_base64: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Session id for file analysis; `session:window` for live windows.
    pub video_id: String,
    pub summary: String,
    pub overall_compliant: bool,
    /// The subset of `all_verdicts` with `compliant = false`.
    pub incidents: Vec<Verdict>,
    pub all_verdicts: Vec<Verdict>,
    pub recommendations: Vec<String>,
    pub frame_observations: Vec<FrameObservation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,
    pub analyzed_at: jiff::Timestamp,
    pub total_frames_analyzed: u64,
    /// Seconds of media covered by this report.
    pub video_duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a session ended, as it appears on the progress stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    Complete,
    Stopped,
    SourceUnreachable,
    Error(String),
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Complete => f.write_str("complete"),
            ExitStatus::Stopped => f.write_str("stopped"),
            ExitStatus::SourceUnreachable => f.write_str("source_unreachable"),
            ExitStatus::Error(reason) => write!(f, "error:{reason}"),
        }
    }
}

impl Serialize for ExitStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExitStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "complete" => ExitStatus::Complete,
            "stopped" => ExitStatus::Stopped,
            "source_unreachable" => ExitStatus::SourceUnreachable,
            other => match other.strip_prefix("error:") {
                Some(reason) => ExitStatus::Error(reason.to_owned()),
                None => {
                    return Err(serde::de::Error::unknown_variant(
                        other,
                        &["complete", "stopped", "source_unreachable", "error:<reason>"],
                    ))
                }
            },
        })
    }
}

/// Events on a session's progress stream: finite for files, indefinite for
/// live monitoring. `Ended` is always the final event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { session_id: Uuid },
    Report { report: Box<Report> },
    Ended { status: ExitStatus },
}
