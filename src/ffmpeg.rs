// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Container decode via ffmpeg (feature `ffmpeg`).
//!
//! Files decode strictly forward with timestamps taken from container PTS,
//! rebased so the first frame is t=0. Live sources (RTSP/HTTP/devices)
//! synthesize timestamps from the wall clock at the point of decode and set
//! a 5 s read timeout so a stalled feed surfaces as a recoverable decode
//! error rather than a hang.

use crate::source::{classify, Frame, Opener, Source, SourceKind, SourceOptions};
use base::clock::Clocks;
use base::{bail, err, Error};
use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Microseconds before a stalled live read errors out.
const LIVE_READ_TIMEOUT_USEC: &str = "5000000";

pub struct FfmpegOpener {
    clocks: Arc<dyn Clocks>,
}

impl FfmpegOpener {
    pub fn new(clocks: Arc<dyn Clocks>) -> Self {
        FfmpegOpener { clocks }
    }
}

impl Opener for FfmpegOpener {
    fn open(&self, uri: &str, _options: SourceOptions) -> Result<Box<dyn Source>, Error> {
        ffmpeg::init().map_err(|e| err!(Internal, msg("ffmpeg init failed"), source(e)))?;
        let kind = classify(uri);
        let input = match kind {
            SourceKind::File => ffmpeg::format::input(&uri).map_err(|e| {
                err!(UnreadableSource, msg("can't open file {uri}"), source(e))
            })?,
            SourceKind::Live => {
                let mut options = ffmpeg::Dictionary::new();
                options.set("rtsp_transport", "tcp");
                options.set("rw_timeout", LIVE_READ_TIMEOUT_USEC);
                ffmpeg::format::input_with_dictionary(&uri, options).map_err(|e| {
                    err!(UnreadableSource, msg("can't open stream {uri}"), source(e))
                })?
            }
        };
        let decode = DecodeState::new(uri, input)?;
        info!(uri, ?kind, "source opened");
        Ok(match kind {
            SourceKind::File => Box::new(FfmpegFileSource {
                path: uri.to_owned(),
                decode,
                audio_taken: false,
                timestamps: FileTimestamps {
                    start_pts: None,
                    last: 0.0,
                },
                index: 0,
            }),
            SourceKind::Live => Box::new(FfmpegLiveSource {
                decode,
                started: self.clocks.monotonic(),
                clocks: self.clocks.clone(),
                index: 0,
            }),
        })
    }
}

/// Demux + decode + scale-to-RGB24 plumbing shared by both source kinds.
struct DecodeState {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    time_base: (i32, i32),
    draining: bool,
}

impl DecodeState {
    fn new(uri: &str, input: ffmpeg::format::context::Input) -> Result<Self, Error> {
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| err!(UnreadableSource, msg("{uri} has no video track")))?;
        let stream_index = input_stream.index();
        let time_base = (
            input_stream.time_base().numerator(),
            input_stream.time_base().denominator(),
        );
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(|e| err!(UnreadableSource, msg("bad decoder parameters"), source(e)))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| err!(UnreadableSource, msg("can't open video decoder"), source(e)))?;
        Ok(DecodeState {
            input,
            stream_index,
            decoder,
            scaler: None,
            time_base,
            draining: false,
        })
    }

    fn pts_to_secs(&self, pts: i64) -> f64 {
        pts as f64 * self.time_base.0 as f64 / self.time_base.1 as f64
    }

    /// Decodes until one video frame is available. `Ok(None)` is
    /// end-of-stream (after the decoder has drained).
    fn next_image(&mut self) -> Result<Option<(RgbImage, Option<i64>)>, Error> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let image = self.to_rgb(&decoded)?;
                return Ok(Some((image, decoded.pts())));
            }
            if self.draining {
                return Ok(None);
            }
            // Feed the next video packet; the iterator resumes from the
            // demuxer's current position each call.
            let mut fed = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .map_err(|e| err!(Decode, msg("send packet failed"), source(e)))?;
                fed = true;
                break;
            }
            if !fed {
                // Demuxer exhausted: flush the decoder's delayed frames.
                self.draining = true;
                self.decoder
                    .send_eof()
                    .map_err(|e| err!(Decode, msg("decoder eof failed"), source(e)))?;
            }
        }
    }

    fn to_rgb(&mut self, decoded: &ffmpeg::frame::Video) -> Result<RgbImage, Error> {
        let (width, height) = (decoded.width(), decoded.height());
        // (Re)build the scaler on the first frame and on stream resizes.
        let rebuild = match &self.scaler {
            Some(s) => s.input().width != width || s.input().height != height,
            None => true,
        };
        if rebuild {
            self.scaler = Some(
                ffmpeg::software::scaling::Context::get(
                    decoded.format(),
                    width,
                    height,
                    ffmpeg::util::format::pixel::Pixel::RGB24,
                    width,
                    height,
                    ffmpeg::software::scaling::flag::Flags::BILINEAR,
                )
                .map_err(|e| err!(Decode, msg("can't create scaler"), source(e)))?,
            );
        }
        let mut rgb = ffmpeg::frame::Video::empty();
        self.scaler
            .as_mut()
            .expect("scaler just built")
            .run(decoded, &mut rgb)
            .map_err(|e| err!(Decode, msg("scale to rgb failed"), source(e)))?;

        let row_bytes = width as usize * 3;
        let stride = rgb.stride(0);
        let data = rgb.data(0);
        let pixels = if stride == row_bytes {
            data[..row_bytes * height as usize].to_vec()
        } else {
            let mut pixels = Vec::with_capacity(row_bytes * height as usize);
            for row in 0..height as usize {
                let start = row * stride;
                pixels.extend_from_slice(&data[start..start + row_bytes]);
            }
            pixels
        };
        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| err!(Decode, msg("frame buffer size mismatch")))
    }
}

struct FfmpegFileSource {
    path: String,
    decode: DecodeState,
    audio_taken: bool,
    timestamps: FileTimestamps,
    index: u64,
}

/// File frames are indexed and timestamped by construction: a maintained
/// counter plus container PTS rebased to the first frame. No seeking, ever.
struct FileTimestamps {
    start_pts: Option<i64>,
    last: f64,
}

impl Source for FfmpegFileSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn next(&mut self) -> Result<Option<Frame>, Error> {
        let Some((image, pts)) = self.decode.next_image()? else {
            return Ok(None);
        };
        let timestamp = match pts {
            Some(pts) => {
                let start = *self.timestamps.start_pts.get_or_insert(pts);
                self.decode.pts_to_secs(pts - start).max(0.0)
            }
            None => self.timestamps.last,
        };
        self.timestamps.last = timestamp;
        let index = self.index;
        self.index += 1;
        Ok(Some(Frame {
            index,
            timestamp,
            image: Arc::new(image),
        }))
    }

    fn take_audio(&mut self) -> Result<Option<Bytes>, Error> {
        if self.audio_taken {
            return Ok(None);
        }
        self.audio_taken = true;
        // The transcriber demuxes for itself; hand it the container bytes.
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) => Err(err!(Decode, msg("can't read {} for audio", self.path), source(e))),
        }
    }
}

struct FfmpegLiveSource {
    decode: DecodeState,
    /// Monotonic reading at open; frame timestamps are relative to it.
    started: Duration,
    clocks: Arc<dyn Clocks>,
    index: u64,
}

impl Source for FfmpegLiveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    fn next(&mut self) -> Result<Option<Frame>, Error> {
        let Some((image, _pts)) = self.decode.next_image()? else {
            // A live demuxer that runs dry has lost its feed; the retry
            // wrapper upstream decides whether that's fatal yet.
            bail!(Decode, msg("live stream returned no data"));
        };
        let index = self.index;
        self.index += 1;
        Ok(Some(Frame {
            index,
            // Live feeds rarely carry trustworthy timestamps; the clock at
            // the point of decode is the contract.
            timestamp: self
                .clocks
                .monotonic()
                .saturating_sub(self.started)
                .as_secs_f64(),
            image: Arc::new(image),
        }))
    }
}
