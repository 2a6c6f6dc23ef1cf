// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommands.

use crate::config::EngineConfig;
use crate::json::Policy;
use base::{err, Error};
use std::path::Path;

pub mod analyze;
pub mod monitor;

fn load_config(path: Option<&Path>) -> Result<EngineConfig, Error> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    }
}

fn load_policy(path: Option<&Path>) -> Result<Policy, Error> {
    let Some(path) = path else {
        return Ok(Policy::default());
    };
    let raw = std::fs::read(path).map_err(|e| {
        err!(
            InvalidArgument,
            msg("unable to read policy {}", path.display()),
            source(e)
        )
    })?;
    serde_json::from_slice(&raw).map_err(|e| {
        err!(
            InvalidArgument,
            msg("unable to parse policy {}", path.display()),
            source(e)
        )
    })
}

fn runtime() -> Result<tokio::runtime::Runtime, Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| err!(Internal, msg("can't build async runtime"), source(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn load_policy_defaults_and_parses() {
        assert!(load_policy(None).unwrap().rules.is_empty());

        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"rules": [{{"id": "r1", "description": "d", "severity": "low"}}]}}"#
        )
        .unwrap();
        let policy = load_policy(Some(f.path())).unwrap();
        assert_eq!(policy.rules.len(), 1);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, "not json").unwrap();
        assert!(load_policy(Some(bad.path())).is_err());
    }
}
