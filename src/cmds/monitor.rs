// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::collab::{OfflineDescriber, OfflineEvaluator};
use crate::json::{ExitStatus, ProgressEvent};
use crate::session::SessionManager;
use crate::source::DefaultOpener;
use base::clock::{Clocks, RealClocks};
use base::{bail, err, Error};
use bpaf::Bpaf;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Monitors a live source until interrupted, printing one report per window.
#[derive(Bpaf, Debug)]
#[bpaf(command("monitor"))]
pub struct Args {
    /// Engine tunables (TOML); defaults apply if omitted.
    #[bpaf(long, argument("PATH"))]
    config: Option<PathBuf>,

    /// Policy (JSON, canonical schema); an empty policy if omitted.
    #[bpaf(long, argument("PATH"))]
    policy: Option<PathBuf>,

    /// Analysis window length in seconds; overrides the config file.
    #[bpaf(long, argument("SECONDS"))]
    window: Option<f64>,

    /// Also persist selected keyframes as JPEGs into this directory.
    #[bpaf(long, argument("DIR"))]
    keyframe_dir: Option<PathBuf>,

    /// Clear process-wide checklist state before starting.
    #[bpaf(long)]
    reset_state: bool,

    /// Live source: rtsp://, http(s)://, or a /dev/video* device.
    #[bpaf(positional("URL"))]
    url: String,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = super::load_config(args.config.as_deref())?;
    let policy = super::load_policy(args.policy.as_deref())?;
    if args.reset_state {
        crate::session::reset_process_state();
    }
    if crate::source::classify(&args.url) == crate::source::SourceKind::File {
        warn!(url = %args.url, "this looks like a file; `analyze` is the better fit");
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
        let opener = Arc::new(DefaultOpener::new(clocks));
        let mut session =
            manager.start_live_monitoring(opener, &args.url, policy, args.window);
        info!(session_id = %session.id(), url = %args.url, "live monitoring started");

        let mut int = signal(SignalKind::interrupt())
            .map_err(|e| err!(Internal, msg("can't install SIGINT handler"), source(e)))?;
        let mut term = signal(SignalKind::terminate())
            .map_err(|e| err!(Internal, msg("can't install SIGTERM handler"), source(e)))?;
        let mut stopping = false;

        loop {
            tokio::select! {
                _ = int.recv() => {
                    if stopping {
                        bail!(Cancelled, msg("immediate shutdown due to second signal"));
                    }
                    info!("received SIGINT; stopping gracefully. Send another to stop immediately.");
                    session.stop();
                    stopping = true;
                }
                _ = term.recv() => {
                    if stopping {
                        bail!(Cancelled, msg("immediate shutdown due to second signal"));
                    }
                    info!("received SIGTERM; stopping gracefully. Send another to stop immediately.");
                    session.stop();
                    stopping = true;
                }
                event = session.next_event() => match event {
                    None => return Ok(1),
                    Some(ProgressEvent::Started { .. }) => {}
                    Some(ProgressEvent::Report { report }) => {
                        let json = serde_json::to_string(&report)
                            .map_err(|e| err!(Internal, msg("report serialization"), source(e)))?;
                        println!("{json}");
                    }
                    Some(ProgressEvent::Ended { status }) => {
                        return Ok(match status {
                            ExitStatus::Stopped => 0,
                            status => {
                                error!(%status, "monitoring ended");
                                1
                            }
                        });
                    }
                },
            }
        }
    })
}
