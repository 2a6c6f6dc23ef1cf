// This file is part of Vigil, a streaming video compliance monitor.
// Copyright (C) 2025 The Vigil Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Single-slot capture ring for live sources.
//!
//! Decouples decode rate from detection rate with bounded memory: the slot
//! holds exactly one frame, `put` overwrites whatever is there, and `take`
//! always returns the newest frame. Intermediate frames are intentionally
//! lost; a consumer that falls behind catches up to the present instead of
//! chewing through a growing backlog of stale video.

use crate::source::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub fn channel() -> (RingPut, RingTake) {
    let (tx, rx) = watch::channel(None);
    let puts = Arc::new(AtomicU64::new(0));
    let takes = Arc::new(AtomicU64::new(0));
    (
        RingPut {
            tx,
            puts: puts.clone(),
            takes: takes.clone(),
        },
        RingTake { rx, puts, takes },
    )
}

/// Producer half, used from the grabber's blocking context. Dropping it ends
/// the stream: `take` returns `None` once the slot has drained.
pub struct RingPut {
    tx: watch::Sender<Option<Frame>>,
    puts: Arc<AtomicU64>,
    takes: Arc<AtomicU64>,
}

impl RingPut {
    pub fn put(&self, frame: Frame) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        // send only fails with no receivers, in which case the frame is
        // dropped just as if it had been superseded.
        let _ = self.tx.send(Some(frame));
    }

    /// Frames overwritten before the consumer saw them.
    pub fn dropped(&self) -> u64 {
        let puts = self.puts.load(Ordering::Relaxed);
        let takes = self.takes.load(Ordering::Relaxed);
        puts.saturating_sub(takes).saturating_sub(1)
    }
}

pub struct RingTake {
    rx: watch::Receiver<Option<Frame>>,
    puts: Arc<AtomicU64>,
    takes: Arc<AtomicU64>,
}

impl RingTake {
    /// Waits for a frame newer than the last one taken; `None` once the
    /// producer is gone and nothing unseen remains. (`changed` still
    /// succeeds after the producer drops if an unseen frame is in the slot,
    /// so the final frame is never lost.)
    pub async fn take(&mut self) -> Option<Frame> {
        self.rx.changed().await.ok()?;
        let frame = self.rx.borrow_and_update().clone();
        debug_assert!(frame.is_some(), "slot can't be empty after a put");
        self.takes.fetch_add(1, Ordering::Relaxed);
        frame
    }

    pub fn dropped(&self) -> u64 {
        let puts = self.puts.load(Ordering::Relaxed);
        let takes = self.takes.load(Ordering::Relaxed);
        puts.saturating_sub(takes).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[tokio::test]
    async fn take_returns_newest_and_drops_intermediates() {
        let (put, mut take) = channel();
        for i in 0..5 {
            put.put(testutil::solid_frame(i, i as f64 * 0.1, 8, 8, [0, 0, 0]));
        }
        let frame = take.take().await.unwrap();
        assert_eq!(frame.index, 4);
        assert_eq!(put.dropped(), 4);
    }

    #[tokio::test]
    async fn take_blocks_until_put() {
        let (put, mut take) = channel();
        let waiter = tokio::spawn(async move { take.take().await.map(|f| f.index) });
        tokio::task::yield_now().await;
        put.put(testutil::solid_frame(7, 0.7, 8, 8, [0, 0, 0]));
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn producer_drop_ends_stream() {
        let (put, mut take) = channel();
        put.put(testutil::solid_frame(0, 0.0, 8, 8, [0, 0, 0]));
        assert_eq!(take.take().await.unwrap().index, 0);
        drop(put);
        assert!(take.take().await.is_none());
    }

    #[tokio::test]
    async fn at_most_one_frame_retained() {
        // The watch slot holds exactly one frame; pointer identity of the
        // shared pixel buffer shows the older one was released.
        let (put, mut take) = channel();
        let f0 = testutil::solid_frame(0, 0.0, 8, 8, [1, 1, 1]);
        let weak = Arc::downgrade(&f0.image);
        put.put(f0);
        put.put(testutil::solid_frame(1, 0.1, 8, 8, [2, 2, 2]));
        assert!(weak.upgrade().is_none(), "superseded frame must be freed");
        assert_eq!(take.take().await.unwrap().index, 1);
    }
}
