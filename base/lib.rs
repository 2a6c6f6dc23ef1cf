// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared infrastructure: the error taxonomy, testable clocks, and tracing
//! setup.

pub mod clock;
mod error;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorChain, ErrorKind};

// Non-poisoning locks; a panicked holder shouldn't take every other task
// down with a poison error.
pub use parking_lot::{Condvar, Mutex, MutexGuard};
