use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::OutboundMessage;

/// Outbound priority queue for one connection.
///
/// Lower priority value drains first; equal priorities drain FIFO
/// (enqueue sequence breaks the tie). Not thread-safe by itself — the
/// sender wraps it in a mutex.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

#[derive(Debug)]
struct Entry {
    priority: i32,
    seq: u64,
    message: OutboundMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest
        // (priority, seq) pair is popped first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: i32, message: OutboundMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            priority,
            seq,
            message,
        });
    }

    pub fn pop(&mut self) -> Option<OutboundMessage> {
        self.heap.pop().map(|entry| entry.message)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(label: &str) -> OutboundMessage {
        OutboundMessage::app(0, Bytes::from(label.to_string()))
    }

    #[test]
    fn drains_in_priority_order() {
        let mut queue = PriorityQueue::new();
        for priority in [-1, 2, -3, 4, -5] {
            queue.push(priority, msg(&priority.to_string()));
        }

        let drained: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|m| String::from_utf8(m.payload.to_vec()).unwrap())
            .collect();
        assert_eq!(drained, vec!["-5", "-3", "-1", "2", "4"]);
    }

    #[test]
    fn equal_priorities_drain_fifo() {
        let mut queue = PriorityQueue::new();
        queue.push(0, msg("first"));
        queue.push(0, msg("second"));
        queue.push(0, msg("third"));

        let drained: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|m| String::from_utf8(m.payload.to_vec()).unwrap())
            .collect();
        assert_eq!(drained, vec!["first", "second", "third"]);
    }

    #[test]
    fn empty_pop_is_none() {
        let mut queue = PriorityQueue::new();
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
        queue.push(1, msg("x"));
        assert_eq!(queue.len(), 1);
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
    }
}
