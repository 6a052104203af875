//! Per-connection outbound FIFO and the send-failed side table.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

use crate::packet::Packet;
use crate::sync::lock;

/// FIFO of packets waiting for the wire.
///
/// The head stays in the queue while it is being written and is popped only
/// when the write completes, so a failed or offline send can be retried
/// without reordering.
#[derive(Default)]
pub struct SendQueue {
    queue: Mutex<VecDeque<Packet>>,
    failed: Mutex<HashMap<String, Packet>>,
}

impl SendQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet at the tail.
    pub fn push(&self, packet: Packet) {
        lock(&self.queue).push_back(packet);
    }

    /// Copy of the head packet.
    pub fn peek(&self) -> Option<Packet> {
        lock(&self.queue).front().cloned()
    }

    /// Run `f` on the head packet in place.
    pub fn with_head<R>(&self, f: impl FnOnce(&mut Packet) -> R) -> Option<R> {
        lock(&self.queue).front_mut().map(f)
    }

    /// Remove the head packet.
    pub fn pop(&self) -> Option<Packet> {
        lock(&self.queue).pop_front()
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    /// Drop every queued packet, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = lock(&self.queue);
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Keep a packet that could not be delivered. Returns its manage id.
    pub fn record_failed(&self, packet: Packet) -> String {
        let manage_id = Uuid::new_v4().to_string();
        lock(&self.failed).insert(manage_id.clone(), packet);
        manage_id
    }

    /// Take a failed packet back out by manage id.
    pub fn pop_failed(&self, manage_id: &str) -> Option<Packet> {
        lock(&self.failed).remove(manage_id)
    }

    /// Number of packets held in the send-failed table.
    pub fn failed_len(&self) -> usize {
        lock(&self.failed).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MessageId;
    use bytes::Bytes;

    fn packet(id: u32) -> Packet {
        Packet::new(MessageId(id), Bytes::new())
    }

    #[test]
    fn test_fifo_order() {
        let queue = SendQueue::new();
        for id in 1..=3 {
            queue.push(packet(id));
        }
        let order: Vec<u32> = std::iter::from_fn(|| queue.pop())
            .map(|p| p.message_id().0)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_peek_leaves_head_in_place() {
        let queue = SendQueue::new();
        queue.push(packet(9));
        assert_eq!(queue.peek().unwrap().message_id(), MessageId(9));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_with_head_mutates_in_place() {
        let queue = SendQueue::new();
        queue.push(packet(1));
        queue.with_head(|p| p.send_retry_count += 1);
        assert_eq!(queue.peek().unwrap().send_retry_count, 1);
        assert!(SendQueue::new().with_head(|_| ()).is_none());
    }

    #[test]
    fn test_failed_table_round_trip() {
        let queue = SendQueue::new();
        let id = queue.record_failed(packet(4));
        assert_eq!(queue.failed_len(), 1);

        let recovered = queue.pop_failed(&id).unwrap();
        assert_eq!(recovered.message_id(), MessageId(4));
        assert!(queue.pop_failed(&id).is_none(), "Taken only once");
    }
}
