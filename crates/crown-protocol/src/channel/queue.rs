use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::Notify;

use super::config::{ChannelConfig, PickerStrategy};

/// One queued publish, waiting for the channel's dispatcher.
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub payload: Bytes,
    pub include_reflexive: bool,
}

/// A pub/sub topic's local send side.
///
/// `publish` never blocks: it either admits the payload to the pending
/// queue or reports that it could not, according to the configured
/// picker. A dispatcher task owned by the manager drains the queue and
/// does the actual routing.
pub struct Channel {
    id: i16,
    config: RwLock<ChannelConfig>,
    pending: Mutex<VecDeque<Outgoing>>,
    wakeup: Notify,
}

impl Channel {
    pub(crate) fn new(id: i16, config: ChannelConfig) -> Self {
        Channel {
            id,
            config: RwLock::new(config),
            pending: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
        }
    }

    pub fn id(&self) -> i16 {
        self.id
    }

    pub fn config(&self) -> ChannelConfig {
        self.config.read().expect("channel config lock").clone()
    }

    /// Replace the channel's tuning. Takes effect on the next publish
    /// and the dispatcher's next cycle.
    pub fn set_config(&self, config: ChannelConfig) {
        *self.config.write().expect("channel config lock") = config;
        // Kick the dispatcher so a rate change takes effect promptly.
        self.wakeup.notify_one();
    }

    /// Queue `payload` for subscribers, honoring the configured
    /// reflexive setting. Returns false when the pending queue is full.
    pub fn publish(&self, payload: Bytes) -> bool {
        let reflexive = self.config().transmit_reflexive;
        self.publish_with_reflexive(payload, reflexive)
    }

    /// Like [`publish`](Self::publish) with an explicit per-message
    /// reflexive override.
    pub fn publish_with_reflexive(&self, payload: Bytes, include_reflexive: bool) -> bool {
        let config = self.config();
        let outgoing = Outgoing {
            payload,
            include_reflexive,
        };
        let mut pending = self.pending.lock().expect("channel pending lock");
        match config.picker {
            PickerStrategy::ProcessAll => {
                if pending.len() >= config.queue_capacity {
                    return false;
                }
                pending.push_back(outgoing);
            }
            PickerStrategy::DiscardNew => {
                if pending.is_empty() {
                    pending.push_back(outgoing);
                }
                // else: dropped by strategy, not backpressure
            }
            PickerStrategy::DiscardOld => {
                pending.clear();
                pending.push_back(outgoing);
            }
        }
        drop(pending);
        self.wakeup.notify_one();
        true
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("channel pending lock").len()
    }

    pub(crate) async fn wait_for_publish(&self) {
        self.wakeup.notified().await;
    }

    /// Drain everything queued, oldest first.
    pub(crate) fn take_all(&self) -> Vec<Outgoing> {
        self.pending
            .lock()
            .expect("channel pending lock")
            .drain(..)
            .collect()
    }

    /// Keep only the newest queued message, dropping the rest.
    pub(crate) fn take_latest(&self) -> Option<Outgoing> {
        let mut pending = self.pending.lock().expect("channel pending lock");
        let latest = pending.pop_back();
        pending.clear();
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(byte: u8) -> Bytes {
        Bytes::from(vec![byte])
    }

    #[test]
    fn process_all_admits_until_capacity() {
        let channel = Channel::new(
            1,
            ChannelConfig {
                queue_capacity: 2,
                ..ChannelConfig::default()
            },
        );
        assert!(channel.publish(payload(1)));
        assert!(channel.publish(payload(2)));
        assert!(!channel.publish(payload(3)));
        assert_eq!(channel.pending_len(), 2);

        let drained = channel.take_all();
        assert_eq!(drained[0].payload, payload(1));
        assert_eq!(drained[1].payload, payload(2));
    }

    #[test]
    fn discard_new_keeps_the_oldest() {
        let channel = Channel::new(
            1,
            ChannelConfig {
                picker: PickerStrategy::DiscardNew,
                ..ChannelConfig::default()
            },
        );
        assert!(channel.publish(payload(1)));
        assert!(channel.publish(payload(2)));
        let drained = channel.take_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, payload(1));
    }

    #[test]
    fn discard_old_keeps_the_newest() {
        let channel = Channel::new(
            1,
            ChannelConfig {
                picker: PickerStrategy::DiscardOld,
                ..ChannelConfig::default()
            },
        );
        assert!(channel.publish(payload(1)));
        assert!(channel.publish(payload(2)));
        let drained = channel.take_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, payload(2));
    }

    #[test]
    fn take_latest_discards_older_pending() {
        let channel = Channel::new(1, ChannelConfig::default());
        channel.publish(payload(1));
        channel.publish(payload(2));
        channel.publish(payload(3));
        let latest = channel.take_latest().unwrap();
        assert_eq!(latest.payload, payload(3));
        assert_eq!(channel.pending_len(), 0);
    }

    #[tokio::test]
    async fn publish_wakes_a_waiting_dispatcher() {
        use std::sync::Arc;
        let channel = Arc::new(Channel::new(1, ChannelConfig::default()));
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel.wait_for_publish().await;
                channel.take_all()
            })
        };
        tokio::task::yield_now().await;
        channel.publish(payload(9));
        let drained = waiter.await.unwrap();
        assert_eq!(drained.len(), 1);
    }
}
