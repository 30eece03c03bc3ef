//! Thread-safe packet FIFO with byte and duration accounting.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::backend::Packet;
use crate::time::{clamp_ticks, TimeBase};

/// Per-stream FIFO of compressed packets.
///
/// All operations serialize on the queue-local mutex. `buffer_length` is the
/// sum of packet payload sizes; `duration` is the sum of packet durations,
/// clamped to zero per packet. Flush and empty sentinels carry no payload,
/// so neither counter moves for them.
#[derive(Debug, Default)]
pub struct PacketQueue {
    inner: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    packets: VecDeque<Packet>,
    buffer_length: u64,
    duration_ticks: i64,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet at the tail, updating the accounting.
    pub fn push(&self, packet: Packet) {
        let mut state = self.inner.lock().unwrap();
        state.buffer_length += packet.size() as u64;
        state.duration_ticks += clamp_ticks(packet.duration);
        state.packets.push_back(packet);
    }

    /// Put a packet back at the head after decoder back-pressure. The
    /// accounting is restored as if the packet had never been dequeued.
    pub fn requeue_front(&self, packet: Packet) {
        let mut state = self.inner.lock().unwrap();
        state.buffer_length += packet.size() as u64;
        state.duration_ticks += clamp_ticks(packet.duration);
        state.packets.push_front(packet);
    }

    /// Copy of the head packet, if any.
    pub fn peek(&self) -> Option<Packet> {
        self.inner.lock().unwrap().packets.front().cloned()
    }

    /// Remove and return the head packet.
    pub fn dequeue(&self) -> Option<Packet> {
        let mut state = self.inner.lock().unwrap();
        let packet = state.packets.pop_front()?;
        state.buffer_length = state.buffer_length.saturating_sub(packet.size() as u64);
        state.duration_ticks -= clamp_ticks(packet.duration);
        Some(packet)
    }

    /// Dispose every held packet and reset the accounting.
    pub fn clear(&self) {
        let mut state = self.inner.lock().unwrap();
        state.packets.clear();
        state.buffer_length = 0;
        state.duration_ticks = 0;
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().packets.len()
    }

    /// Total payload bytes currently queued.
    pub fn buffer_length(&self) -> u64 {
        self.inner.lock().unwrap().buffer_length
    }

    /// Accumulated packet duration under `time_base`, in seconds.
    pub fn duration(&self, time_base: TimeBase) -> f64 {
        time_base.to_seconds(self.inner.lock().unwrap().duration_ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Packet;

    fn data_packet(stream: usize, pts: i64, duration: i64, size: usize) -> Packet {
        Packet::new_data(
            stream,
            Some(pts),
            duration,
            true,
            TimeBase::MILLIS,
            vec![0u8; size],
        )
    }

    #[test]
    fn accounting_tracks_sizes_and_durations() {
        let queue = PacketQueue::new();
        queue.push(data_packet(0, 0, 40, 100));
        queue.push(data_packet(0, 40, 40, 60));
        assert_eq!(queue.count(), 2);
        assert_eq!(queue.buffer_length(), 160);
        assert!((queue.duration(TimeBase::MILLIS) - 0.080).abs() < 1e-9);

        let first = queue.dequeue().unwrap();
        assert_eq!(first.size(), 100);
        assert_eq!(queue.buffer_length(), 60);
        assert!((queue.duration(TimeBase::MILLIS) - 0.040).abs() < 1e-9);
    }

    #[test]
    fn negative_durations_do_not_reduce_the_total() {
        let queue = PacketQueue::new();
        queue.push(data_packet(0, 0, -50, 10));
        queue.push(data_packet(0, 0, 30, 10));
        assert!((queue.duration(TimeBase::MILLIS) - 0.030).abs() < 1e-9);
        queue.dequeue();
        queue.dequeue();
        assert_eq!(queue.duration(TimeBase::MILLIS), 0.0);
    }

    #[test]
    fn flush_packets_carry_no_accounting() {
        let queue = PacketQueue::new();
        queue.push(Packet::flush(0));
        assert_eq!(queue.count(), 1);
        assert_eq!(queue.buffer_length(), 0);
        assert_eq!(queue.duration(TimeBase::MILLIS), 0.0);
    }

    #[test]
    fn clear_resets_everything() {
        let queue = PacketQueue::new();
        queue.push(data_packet(0, 0, 40, 100));
        queue.clear();
        assert_eq!(queue.count(), 0);
        assert_eq!(queue.buffer_length(), 0);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn requeue_front_restores_order_and_accounting() {
        let queue = PacketQueue::new();
        queue.push(data_packet(0, 0, 40, 100));
        queue.push(data_packet(0, 40, 40, 60));
        let head = queue.dequeue().unwrap();
        queue.requeue_front(head);
        assert_eq!(queue.buffer_length(), 160);
        assert_eq!(queue.dequeue().unwrap().size(), 100);
    }
}
