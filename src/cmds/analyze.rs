// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::collab::{OfflineDescriber, OfflineEvaluator};
use crate::json::{ExitStatus, ProgressEvent};
use crate::session::SessionManager;
use crate::source::DefaultOpener;
use base::clock::{Clocks, RealClocks};
use base::{err, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Analyzes a video file against a policy and prints the report as JSON.
#[derive(Bpaf, Debug)]
#[bpaf(command("analyze"))]
pub struct Args {
    /// Engine tunables (TOML); defaults apply if omitted.
    #[bpaf(long, argument("PATH"))]
    config: Option<PathBuf>,

    /// Policy (JSON, canonical schema); an empty policy if omitted.
    #[bpaf(long, argument("PATH"))]
    policy: Option<PathBuf>,

    /// Also persist selected keyframes as JPEGs into this directory.
    #[bpaf(long, argument("DIR"))]
    keyframe_dir: Option<PathBuf>,

    /// Clear process-wide checklist state before starting.
    #[bpaf(long)]
    reset_state: bool,

    /// Video file to analyze.
    #[bpaf(positional("FILE"))]
    file: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = super::load_config(args.config.as_deref())?;
    let policy = super::load_policy(args.policy.as_deref())?;
    if args.reset_state {
        crate::session::reset_process_state();
    }
    super::runtime()?.block_on(async move {
        let clocks: Arc<dyn Clocks> = Arc::new(RealClocks::new());
        let mut manager = SessionManager::new(
            config,
            Arc::new(OfflineDescriber),
            Arc::new(OfflineEvaluator),
        )
        .with_clocks(clocks.clone());
        if let Some(dir) = args.keyframe_dir {
            manager = manager.with_keyframe_dir(dir);
        }
        let uri = args
            .file
            .to_str()
            .ok_or_else(|| err!(InvalidArgument, msg("file path isn't UTF-8")))?
            .to_owned();
        let opener = Arc::new(DefaultOpener::new(clocks));
        let mut session = manager.start_file_analysis(opener, &uri, policy);
        info!(session_id = %session.id(), uri = %uri, "file analysis started");

        while let Some(event) = session.next_event().await {
            match event {
                ProgressEvent::Started { .. } => {}
                ProgressEvent::Report { report } => {
                    let json = serde_json::to_string_pretty(&report)
                        .map_err(|e| err!(Internal, msg("report serialization"), source(e)))?;
                    println!("{json}");
                }
                ProgressEvent::Ended { status } => {
                    return Ok(match status {
                        ExitStatus::Complete => 0,
                        status => {
                            error!(%status, "analysis did not complete");
                            1
                        }
                    });
                }
            }
        }
        Ok(1)
    })
}
