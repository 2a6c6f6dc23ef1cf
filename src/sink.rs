// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Keyframe sink: turns accepted frames into transport-ready observations.
//!
//! Downscaling and JPEG encoding happen inline on the detection path (CPU,
//! bounded by the detector-scale image sizes). Disk persistence never does:
//! writes go to a dedicated task through a small bounded queue that drops
//! its *oldest* pending entry on overflow. The in-memory observation
//! sequence is authoritative; disk is best effort.

use crate::detect::KeyframeReason;
use crate::source::Frame;
use base::{err, Error};
use bytes::Bytes;
use image::RgbImage;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A keyframe prepared for dispatch. `description` is filled in after the
/// describe call returns.
#[derive(Clone, Debug)]
pub struct Observation {
    /// Strictly monotonic within a session.
    pub index: u64,
    pub timestamp: f64,
    pub reason: KeyframeReason,
    pub change_score: f64,
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
    pub description: Option<String>,
}

const WRITE_QUEUE_BOUND: usize = 16;

pub struct KeyframeSink {
    max_width: u32,
    /// JPEG quality as 1..=100, converted from the configured fraction.
    quality: u8,
    next_index: u64,
    last_timestamp: Option<f64>,
    writer: Option<DiskWriter>,
}

impl KeyframeSink {
    pub fn new(max_width: u32, quality_fraction: f64, keyframe_dir: Option<PathBuf>) -> Self {
        KeyframeSink {
            max_width,
            quality: ((quality_fraction * 100.0).round() as u8).clamp(1, 100),
            next_index: 0,
            last_timestamp: None,
            writer: keyframe_dir.map(DiskWriter::spawn),
        }
    }

    /// Converts an accepted keyframe into an [`Observation`] and queues the
    /// optional disk write.
    pub fn accept(
        &mut self,
        frame: &Frame,
        reason: KeyframeReason,
        change_score: f64,
    ) -> Result<Observation, Error> {
        if let Some(last) = self.last_timestamp {
            debug_assert!(frame.timestamp >= last, "keyframe timestamps regressed");
        }
        self.last_timestamp = Some(frame.timestamp);

        let scaled = downscale(&frame.image, self.max_width);
        let image = scaled.as_ref().unwrap_or(&frame.image);
        let jpeg = encode_jpeg(image, self.quality)?;
        let observation = Observation {
            index: self.next_index,
            timestamp: frame.timestamp,
            reason,
            change_score,
            jpeg: jpeg.clone(),
            width: image.width(),
            height: image.height(),
            description: None,
        };
        self.next_index += 1;
        debug!(
            index = observation.index,
            timestamp = frame.timestamp,
            %reason,
            change_score,
            "keyframe accepted"
        );
        if let Some(writer) = &self.writer {
            writer.enqueue(PendingWrite {
                filename: format!(
                    "keyframe-{:06}-{:08.3}s-{}.jpg",
                    observation.index, frame.timestamp, reason
                ),
                jpeg,
            });
        }
        Ok(observation)
    }

    pub fn observations_emitted(&self) -> u64 {
        self.next_index
    }

    /// Flushes the disk writer and reports how many pending writes were
    /// dropped on overflow over the sink's lifetime.
    pub async fn finish(self) -> u64 {
        match self.writer {
            Some(writer) => writer.finish().await,
            None => 0,
        }
    }
}

fn downscale(image: &RgbImage, max_width: u32) -> Option<RgbImage> {
    let (w, h) = image.dimensions();
    if w <= max_width {
        return None;
    }
    let scaled_h = (u64::from(h) * u64::from(max_width) / u64::from(w)).max(1) as u32;
    Some(image::imageops::resize(
        image,
        max_width,
        scaled_h,
        image::imageops::FilterType::Triangle,
    ))
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, Error> {
    let mut buf = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    image
        .write_with_encoder(encoder)
        .map_err(|e| err!(Internal, msg("jpeg encode failed"), source(e)))?;
    Ok(Bytes::from(buf))
}

struct PendingWrite {
    filename: String,
    jpeg: Bytes,
}

struct WriteQueue {
    entries: base::Mutex<VecDeque<PendingWrite>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

struct DiskWriter {
    queue: Arc<WriteQueue>,
    task: tokio::task::JoinHandle<()>,
}

impl DiskWriter {
    fn spawn(dir: PathBuf) -> Self {
        let queue = Arc::new(WriteQueue {
            entries: base::Mutex::new(VecDeque::with_capacity(WRITE_QUEUE_BOUND)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let task = tokio::spawn(run_writer(dir, queue.clone()));
        DiskWriter { queue, task }
    }

    fn enqueue(&self, write: PendingWrite) {
        {
            let mut entries = self.queue.entries.lock();
            entries.push_back(write);
            if entries.len() > WRITE_QUEUE_BOUND {
                entries.pop_front();
                self.queue.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.queue.notify.notify_one();
    }

    async fn finish(self) -> u64 {
        self.queue.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();
        let _ = self.task.await;
        let dropped = self.queue.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(dropped, "keyframe writes dropped on queue overflow");
        }
        dropped
    }
}

async fn run_writer(dir: PathBuf, queue: Arc<WriteQueue>) {
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!(dir = %dir.display(), err = %e, "can't create keyframe dir; disabling writes");
        return;
    }
    loop {
        let next = queue.entries.lock().pop_front();
        match next {
            Some(write) => {
                let path = dir.join(&write.filename);
                if let Err(e) = tokio::fs::write(&path, &write.jpeg).await {
                    warn!(path = %path.display(), err = %e, "keyframe write failed");
                }
            }
            None => {
                if queue.closed.load(Ordering::Acquire) {
                    return;
                }
                queue.notify.notified().await;
            }
        }
    }
}
