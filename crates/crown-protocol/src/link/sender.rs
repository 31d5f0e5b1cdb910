use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crown_wire::{Frame, FrameFlags, MAX_PAYLOAD_SIZE};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::queue::PriorityQueue;
use super::OutboundMessage;
use crate::transport::Connection;

/// Split an outbound message into wire frames.
///
/// Payloads within `MAX_PAYLOAD_SIZE` become exactly one frame.
/// Larger payloads become `ceil(len / MAX_PAYLOAD_SIZE)` chunk frames,
/// the last one flagged terminal. Chunks of one message are always
/// contiguous on the wire because splitting happens at drain time,
/// after the priority queue has already picked the whole message.
pub fn split_frames(source_id: u16, message: &OutboundMessage) -> Vec<Frame> {
    let source_id = message.source_override.unwrap_or(source_id);
    let payload = &message.payload;
    if payload.len() <= MAX_PAYLOAD_SIZE {
        let mut flags = message.flags;
        if !payload.is_empty() {
            flags = flags.with(FrameFlags::HAS_PAYLOAD);
        }
        return vec![Frame {
            flags,
            channel_id: message.channel_id,
            source_id,
            payload: payload.clone(),
        }];
    }

    let mut frames = Vec::with_capacity(payload.len().div_ceil(MAX_PAYLOAD_SIZE));
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + MAX_PAYLOAD_SIZE).min(payload.len());
        let mut flags = message
            .flags
            .with(FrameFlags::HAS_PAYLOAD)
            .with(FrameFlags::CHUNK);
        if end == payload.len() {
            flags = flags.with(FrameFlags::LAST_CHUNK);
        }
        frames.push(Frame {
            flags,
            channel_id: message.channel_id,
            source_id,
            payload: payload.slice(offset..end),
        });
        offset = end;
    }
    frames
}

/// Writer side of one connection's link.
///
/// Enqueue from any task; a single writer task drains the queue to the
/// connection, injecting keep-alive frames when idle. Activation and
/// deactivation are idempotent and never fail, even on a dead
/// connection.
pub struct FrameSender {
    source_id: u16,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
}

struct Shared {
    queue: Mutex<PriorityQueue>,
    wakeup: Notify,
}

impl FrameSender {
    pub fn new(source_id: u16) -> Self {
        FrameSender {
            source_id,
            shared: Arc::new(Shared {
                queue: Mutex::new(PriorityQueue::new()),
                wakeup: Notify::new(),
            }),
            task: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Queue a message. Accepted even while deactivated; it is sent
    /// once a writer task runs.
    pub fn enqueue(&self, priority: i32, message: OutboundMessage) {
        self.shared
            .queue
            .lock()
            .expect("sender queue poisoned")
            .push(priority, message);
        self.shared.wakeup.notify_one();
    }

    /// Number of queued messages (not yet handed to the connection).
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().expect("sender queue poisoned").len()
    }

    /// Start the writer task for `conn`. No-op if already active.
    pub fn activate(&self, conn: Arc<dyn Connection>, keep_alive: Duration) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        let source_id = self.source_id;
        let handle = tokio::spawn(writer_loop(shared, conn, source_id, keep_alive));
        *self.task.lock().expect("sender task lock poisoned") = Some(handle);
    }

    /// Stop the writer task. No-op if not active.
    pub fn deactivate(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.task.lock().expect("sender task lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        self.deactivate();
    }
}

async fn writer_loop(
    shared: Arc<Shared>,
    conn: Arc<dyn Connection>,
    source_id: u16,
    keep_alive: Duration,
) {
    loop {
        // Wait for work, sending keep-alives while idle.
        let message = loop {
            let popped = shared.queue.lock().expect("sender queue poisoned").pop();
            if let Some(message) = popped {
                break message;
            }
            tokio::select! {
                _ = shared.wakeup.notified() => {}
                _ = tokio::time::sleep(keep_alive) => {
                    let frame = Frame::keep_alive(source_id);
                    let bytes = frame.encode().expect("keep-alive frame always fits");
                    if conn.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
            }
        };

        for frame in split_frames(source_id, &message) {
            let bytes = match frame.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    // split_frames caps every chunk at MAX_PAYLOAD_SIZE,
                    // so this is unreachable in practice.
                    tracing::error!("frame encode failed: {e}");
                    continue;
                }
            };
            if conn.write_all(&bytes).await.is_err() {
                tracing::debug!(remote = %conn.remote_device(), "writer stopping: connection down");
                return;
            }
        }
    }
}
