use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use crown_wire::{Frame, FrameFlags, FrameHeader, FRAME_HEADER_LEN};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::InboundMessage;
use crate::transport::Connection;

/// Reader side of one connection's link.
///
/// A single reader task pulls frames off the connection, buffers chunk
/// runs until the terminal chunk, and delivers whole messages in
/// arrival order. In forward-chunks mode raw chunk frames pass through
/// unassembled (used when relaying, to avoid double buffering).
pub struct FrameReceiver {
    forward_chunks: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
}

impl FrameReceiver {
    pub fn new() -> Self {
        FrameReceiver {
            forward_chunks: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Hand raw chunk frames to listeners instead of reassembling.
    pub fn set_forward_chunks(&self, forward: bool) {
        self.forward_chunks.store(forward, Ordering::SeqCst);
    }

    /// Start the reader task for `conn`, delivering into `inbound_tx`.
    /// No-op if already active.
    pub fn activate(&self, conn: Arc<dyn Connection>, inbound_tx: mpsc::Sender<InboundMessage>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let forward = self.forward_chunks.clone();
        let handle = tokio::spawn(reader_loop(conn, inbound_tx, forward));
        *self.task.lock().expect("receiver task lock poisoned") = Some(handle);
    }

    /// Stop the reader task. No-op if not active.
    pub fn deactivate(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self
            .task
            .lock()
            .expect("receiver task lock poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl Default for FrameReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.deactivate();
    }
}

async fn reader_loop(
    conn: Arc<dyn Connection>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    forward_chunks: Arc<AtomicBool>,
) {
    let from = conn.remote_device();
    let mut assembly: Option<(Frame, BytesMut)> = None;

    loop {
        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        if conn.read_exact(&mut header_bytes).await.is_err() {
            return;
        }
        let header = match FrameHeader::decode(&header_bytes) {
            Ok(header) => header,
            Err(e) => {
                // Desynced or foreign stream; the connection is useless.
                tracing::warn!(remote = %from, "bad frame header, tearing down: {e}");
                conn.disconnect().await;
                return;
            }
        };

        let mut payload = vec![0u8; header.payload_len as usize];
        if conn.read_exact(&mut payload).await.is_err() {
            return;
        }
        let frame = Frame::from_parts(header, Bytes::from(payload));

        if frame.is_keep_alive() {
            continue;
        }

        if frame.is_chunk() && !forward_chunks.load(Ordering::SeqCst) {
            let last = frame.is_last_chunk();
            match assembly.as_mut() {
                Some((_, buffer)) => buffer.extend_from_slice(&frame.payload),
                None => {
                    let mut buffer = BytesMut::new();
                    buffer.extend_from_slice(&frame.payload);
                    assembly = Some((frame, buffer));
                }
            }
            if !last {
                continue;
            }
            let (first, buffer) = assembly.take().expect("assembly set above");
            let message = Frame {
                flags: first
                    .flags
                    .without(FrameFlags::CHUNK)
                    .without(FrameFlags::LAST_CHUNK),
                channel_id: first.channel_id,
                source_id: first.source_id,
                payload: buffer.freeze(),
            };
            if inbound_tx
                .send(InboundMessage {
                    from: from.clone(),
                    frame: message,
                })
                .await
                .is_err()
            {
                return;
            }
            continue;
        }

        if inbound_tx
            .send(InboundMessage {
                from: from.clone(),
                frame,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{split_frames, OutboundMessage};
    use crate::transport::mem;
    use crate::types::DeviceId;
    use crown_wire::MAX_PAYLOAD_SIZE;

    async fn write_frames(conn: &Arc<mem::MemConnection>, frames: &[Frame]) {
        for frame in frames {
            conn.write_all(&frame.encode().unwrap()).await.unwrap();
        }
    }

    fn receiver_on(
        conn: Arc<dyn Connection>,
    ) -> (FrameReceiver, mpsc::Receiver<InboundMessage>) {
        let receiver = FrameReceiver::new();
        let (tx, rx) = mpsc::channel(64);
        receiver.activate(conn, tx);
        (receiver, rx)
    }

    #[tokio::test]
    async fn delivers_plain_frames_in_order() {
        let (near, far) = mem::pair(DeviceId::new("a"), DeviceId::new("b"));
        let (_receiver, mut rx) = receiver_on(far);

        let frames: Vec<Frame> = (0..5u8)
            .map(|i| Frame::new(1, 9, Bytes::from(vec![i; 3])))
            .collect();
        write_frames(&near, &frames).await;

        for i in 0..5u8 {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.frame.payload[0], i);
            assert_eq!(message.from, DeviceId::new("a"));
        }
    }

    #[tokio::test]
    async fn reassembles_chunked_message() {
        let (near, far) = mem::pair(DeviceId::new("a"), DeviceId::new("b"));
        let (_receiver, mut rx) = receiver_on(far);

        let payload: Vec<u8> = (0..(MAX_PAYLOAD_SIZE * 5 / 2))
            .map(|i| (i % 251) as u8)
            .collect();
        let msg = OutboundMessage::app(3, Bytes::from(payload.clone()));
        let frames = split_frames(9, &msg);
        assert_eq!(frames.len(), 3);
        write_frames(&near, &frames).await;

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.frame.payload, Bytes::from(payload));
        assert!(!delivered.frame.is_chunk());
        assert_eq!(delivered.frame.channel_id, 3);
    }

    #[tokio::test]
    async fn keep_alive_is_swallowed() {
        let (near, far) = mem::pair(DeviceId::new("a"), DeviceId::new("b"));
        let (_receiver, mut rx) = receiver_on(far);

        write_frames(
            &near,
            &[Frame::keep_alive(1), Frame::new(2, 1, Bytes::from_static(b"real"))],
        )
        .await;

        let message = rx.recv().await.unwrap();
        assert_eq!(&message.frame.payload[..], b"real");
    }

    #[tokio::test]
    async fn forward_chunks_passes_raw_frames() {
        let (near, far) = mem::pair(DeviceId::new("a"), DeviceId::new("b"));
        let receiver = FrameReceiver::new();
        receiver.set_forward_chunks(true);
        let (tx, mut rx) = mpsc::channel(64);
        receiver.activate(far, tx);

        let msg =
            OutboundMessage::app(3, Bytes::from(vec![7u8; MAX_PAYLOAD_SIZE + 10]));
        let frames = split_frames(9, &msg);
        write_frames(&near, &frames).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.frame.is_chunk());
        assert!(!first.frame.is_last_chunk());
        assert!(second.frame.is_last_chunk());
    }

    #[tokio::test]
    async fn activate_is_idempotent_and_deactivate_safe_after_close() {
        let (near, far) = mem::pair(DeviceId::new("a"), DeviceId::new("b"));
        let far: Arc<dyn Connection> = far;
        let receiver = FrameReceiver::new();
        let (tx, _rx) = mpsc::channel(4);
        receiver.activate(far.clone(), tx.clone());
        receiver.activate(far.clone(), tx); // no second task

        near.disconnect().await;
        receiver.deactivate();
        receiver.deactivate(); // still a no-op
    }
}
