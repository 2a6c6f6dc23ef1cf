// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Frame sources: decoded video as a lazy sequence of [`Frame`]s.
//!
//! [`Opener`] is a trait for test injection; the real implementation lives
//! in [`crate::ffmpeg`] behind the `ffmpeg` feature. Sources decode strictly
//! forward — no container seeking, which on compressed video is several
//! times slower than sequential decode with a frame counter.

use base::clock::Clocks;
use base::{Error, ErrorKind};
use bytes::Bytes;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// One decoded frame.
///
/// Cloning is cheap: the pixel buffer is shared. The capture ring relies on
/// this.
#[derive(Clone)]
pub struct Frame {
    /// Strictly increasing per source, by construction.
    pub index: u64,
    /// Seconds from source start: container PTS for files, synthesized from
    /// the monotonic clock at decode for live sources.
    pub timestamp: f64,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SourceKind {
    /// Bounded; reaches end-of-stream.
    File,
    /// Unbounded; decode errors are recoverable.
    Live,
}

/// Classifies a URI the way cameras are usually addressed: network schemes
/// and V4L2 device nodes are live, everything else is a file path.
pub fn classify(uri: &str) -> SourceKind {
    if let Ok(url) = url::Url::parse(uri) {
        if matches!(url.scheme(), "rtsp" | "rtsps" | "http" | "https" | "udp" | "tcp") {
            return SourceKind::Live;
        }
    }
    if uri.starts_with("/dev/video") {
        return SourceKind::Live;
    }
    SourceKind::File
}

#[derive(Clone, Debug, Default)]
pub struct SourceOptions {
    /// Requested capture size for live devices that negotiate one.
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Opens a source. This is a trait for test injection.
pub trait Opener: Send + Sync {
    fn open(&self, uri: &str, options: SourceOptions) -> Result<Box<dyn Source>, Error>;
}

pub trait Source: Send {
    fn kind(&self) -> SourceKind;

    /// Returns the next frame, `None` at end-of-stream (bounded sources
    /// only), or an error. Blocking; run from a blocking context.
    fn next(&mut self) -> Result<Option<Frame>, Error>;

    /// Container audio for transcription, if this source carries any.
    /// Bounded sources may return the demuxable container bytes; live
    /// sources typically have nothing here.
    fn take_audio(&mut self) -> Result<Option<Bytes>, Error> {
        Ok(None)
    }
}

const RETRY_MIN: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

/// Wraps a live source so transient decode errors recover with bounded
/// exponential backoff (reset on success). After
/// [`MAX_CONSECUTIVE_FAILURES`] consecutive failures the source is
/// considered unreadable and the error becomes fatal.
pub struct RetryingSource<C: Clocks> {
    inner: Box<dyn Source>,
    clocks: C,
    consecutive_failures: u32,
    backoff: Duration,
}

impl<C: Clocks> RetryingSource<C> {
    pub fn new(inner: Box<dyn Source>, clocks: C) -> Self {
        RetryingSource {
            inner,
            clocks,
            consecutive_failures: 0,
            backoff: RETRY_MIN,
        }
    }
}

impl<C: Clocks> Source for RetryingSource<C> {
    fn kind(&self) -> SourceKind {
        self.inner.kind()
    }

    fn next(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            match self.inner.next() {
                Ok(frame) => {
                    self.consecutive_failures = 0;
                    self.backoff = RETRY_MIN;
                    return Ok(frame);
                }
                Err(e) if e.kind() == ErrorKind::Decode => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e.map_kind(ErrorKind::UnreadableSource));
                    }
                    warn!(
                        err = %e.chain(),
                        failures = self.consecutive_failures,
                        "live decode error; sleeping {:?} before retry",
                        self.backoff,
                    );
                    self.clocks.sleep(self.backoff);
                    self.backoff = (self.backoff * 2).min(RETRY_MAX);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn take_audio(&mut self) -> Result<Option<Bytes>, Error> {
        self.inner.take_audio()
    }
}

/// The built-in opener: ffmpeg when compiled in, otherwise a useful error.
/// Callers with their own [`Opener`] (tests, embedders) don't go through
/// this.
pub struct DefaultOpener {
    /// Live sources synthesize timestamps from this clock at decode.
    #[cfg_attr(not(feature = "ffmpeg"), allow(dead_code))]
    clocks: Arc<dyn Clocks>,
}

impl DefaultOpener {
    pub fn new(clocks: Arc<dyn Clocks>) -> Self {
        DefaultOpener { clocks }
    }
}

impl Opener for DefaultOpener {
    #[cfg(feature = "ffmpeg")]
    fn open(&self, uri: &str, options: SourceOptions) -> Result<Box<dyn Source>, Error> {
        tracing::info!(uri, "opening via ffmpeg");
        crate::ffmpeg::FfmpegOpener::new(self.clocks.clone()).open(uri, options)
    }

    #[cfg(not(feature = "ffmpeg"))]
    fn open(&self, uri: &str, _options: SourceOptions) -> Result<Box<dyn Source>, Error> {
        base::bail!(
            UnreadableSource,
            msg("no decoder for {uri}; rebuild with the `ffmpeg` feature")
        );
    }
}
