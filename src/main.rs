// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::Bpaf;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cmds;
mod collab;
mod config;
mod debounce;
mod detect;
mod dispatch;
#[cfg(feature = "ffmpeg")]
mod ffmpeg;
mod json;
mod ratelimit;
mod ring;
mod session;
mod sink;
mod source;
#[cfg(test)]
mod testutil;

/// Vigil: watches video sources and reports compliance against a policy.
#[derive(Bpaf, Debug)]
#[bpaf(options, version)]
enum Args {
    Analyze(#[bpaf(external(cmds::analyze::args))] cmds::analyze::Args),
    Monitor(#[bpaf(external(cmds::monitor::args))] cmds::monitor::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Analyze(a) => cmds::analyze::run(a),
            Args::Monitor(a) => cmds::monitor::run(a),
        }
    }
}

fn main() {
    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked via a symlink),
    // falling back to the crate name if conversion to UTF-8 fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
