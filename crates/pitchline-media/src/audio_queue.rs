//! Bounded drop-oldest audio queue between client ingress and the STT stream.
//!
//! The producer never waits: when the queue is full the oldest frame is
//! discarded so the freshest audio reaches the transcriber. Closing either
//! half closes the queue for both.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("audio queue closed")]
pub struct AudioQueueClosed;

#[derive(Debug)]
struct Shared {
    frames: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Create a queue holding at most `capacity` frames (minimum 1).
pub fn audio_queue(capacity: usize) -> (AudioSender, AudioReceiver) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        frames: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        pushed: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        AudioSender {
            shared: Arc::clone(&shared),
        },
        AudioReceiver { shared },
    )
}

/// Producer half.
#[derive(Debug)]
pub struct AudioSender {
    shared: Arc<Shared>,
}

impl AudioSender {
    /// Enqueue a frame. Returns `Ok(true)` when an older frame was evicted.
    pub fn push(&self, frame: Bytes) -> Result<bool, AudioQueueClosed> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(AudioQueueClosed);
        }
        let evicted = {
            let mut frames = self.shared.frames.lock();
            let evicted = if frames.len() >= self.shared.capacity {
                frames.pop_front().is_some()
            } else {
                false
            };
            frames.push_back(frame);
            evicted
        };
        self.shared.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        Ok(evicted)
    }

    /// Total frames accepted so far.
    pub fn pushed(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }

    /// Total frames evicted so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for AudioSender {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Consumer half. Buffered frames are still delivered after the sender closes.
#[derive(Debug)]
pub struct AudioReceiver {
    shared: Arc<Shared>,
}

impl AudioReceiver {
    /// Next frame, or `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            if let Some(frame) = self.shared.frames.lock().pop_front() {
                return Some(frame);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }
}

impl Drop for AudioReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}
