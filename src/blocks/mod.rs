//! Fixed-capacity pool and playback window of reusable decoded blocks.

mod block;

pub use block::{Block, BlockMeta};

use std::sync::{Arc, Mutex};

use log::debug;

use crate::backend::{Frame, MediaType};
use crate::error::MediaError;

/// Discontinuity threshold in seconds for non-monotonic buffers, by media
/// type index. Tune per type if dropouts appear.
const DISCONTINUITY_THRESHOLD: [f64; 3] = [0.001, 0.001, 0.001];

/// Materializes a decoded frame into a recycled block. Returns `Ok(false)`
/// when the frame cannot be converted and the add should be skipped.
pub type Materialize<'a> =
    &'a mut dyn FnMut(Frame, &Block, Option<&Block>) -> Result<bool, MediaError>;

/// Capacity-bounded collection of blocks of one media type, split into a
/// free pool and a playback window kept sorted by start time.
///
/// Invariants: `pool.len() + playback.len() == capacity` at every
/// observation; playback blocks are strictly ordered by start time after
/// any mutation. Blocks are never dropped, only recycled.
#[derive(Debug)]
pub struct BlockBuffer {
    media_type: MediaType,
    capacity: usize,
    inner: Mutex<BufferState>,
}

#[derive(Debug)]
struct BufferState {
    pool: Vec<Arc<Block>>,
    playback: Vec<Arc<Block>>,
    /// Sticky: cleared the first time two durations differ, restored only
    /// by `clear`.
    is_monotonic: bool,
    monotonic_duration: f64,
    last_lookup: Option<(f64, usize)>,
}

impl BlockBuffer {
    pub fn new(media_type: MediaType, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let pool = (0..capacity)
            .map(|slot| Arc::new(Block::new(slot, media_type)))
            .collect();
        Self {
            media_type,
            capacity,
            inner: Mutex::new(BufferState {
                pool,
                playback: Vec::with_capacity(capacity),
                is_monotonic: true,
                monotonic_duration: 0.0,
                last_lookup: None,
            }),
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Materialize `frame` into a recycled block and insert it into the
    /// playback window. A playback block with an identical start time is
    /// returned to the pool first; when the pool is empty the oldest
    /// playback block is evicted.
    pub fn add(&self, frame: Frame, materialize: Materialize<'_>) -> Result<Option<Arc<Block>>, MediaError> {
        let (block, previous) = {
            let mut state = self.inner.lock().unwrap();
            let previous = state.playback.last().cloned();
            let block = match state.pool.pop() {
                Some(block) => block,
                None => {
                    let evicted = state.playback.remove(0);
                    state.last_lookup = None;
                    debug!(
                        "{} buffer full; evicting block at {:.3}s",
                        self.media_type,
                        evicted.start_time()
                    );
                    evicted
                }
            };
            (block, previous)
        };

        // The candidate block is owned by neither list here, so the list
        // lock is not held across the payload write.
        let materialized = materialize(frame, &block, previous.as_deref())?;

        let mut state = self.inner.lock().unwrap();
        if !materialized {
            state.pool.push(block);
            for (index, candidate) in state.playback.iter().enumerate() {
                candidate.set_index(index);
            }
            return Ok(None);
        }

        let meta = block.meta();
        if let Some(existing) = state
            .playback
            .iter()
            .position(|candidate| candidate.start_time() == meta.start_time)
        {
            let duplicate = state.playback.remove(existing);
            state.pool.push(duplicate);
        }

        if state.is_monotonic
            && !state.playback.is_empty()
            && (meta.duration - state.monotonic_duration).abs() > f64::EPSILON
        {
            state.is_monotonic = false;
        }
        state.monotonic_duration = meta.duration;

        let insert_at = state
            .playback
            .partition_point(|candidate| candidate.start_time() < meta.start_time);
        state.playback.insert(insert_at, block.clone());

        for (index, candidate) in state.playback.iter().enumerate() {
            candidate.set_index(index);
        }
        state.last_lookup = None;

        Ok(Some(block))
    }

    /// Return every playback block to the pool and reset cached properties.
    pub fn clear(&self) {
        let mut state = self.inner.lock().unwrap();
        while let Some(block) = state.playback.pop() {
            state.pool.push(block);
        }
        state.is_monotonic = true;
        state.monotonic_duration = 0.0;
        state.last_lookup = None;
    }

    /// Index of the playback block at `position`: the last block whose start
    /// time does not exceed it, memoized on the last queried position.
    pub fn index_of(&self, position: f64) -> Option<usize> {
        let mut state = self.inner.lock().unwrap();
        if state.playback.is_empty() {
            return None;
        }
        if let Some((last_position, index)) = state.last_lookup {
            if last_position == position && index < state.playback.len() {
                return Some(index);
            }
        }

        let upper = state
            .playback
            .partition_point(|candidate| candidate.start_time() <= position);
        let index = upper.saturating_sub(1);
        state.last_lookup = Some((position, index));
        Some(index)
    }

    /// Whether `position` falls inside the buffered range.
    pub fn contains(&self, position: f64) -> bool {
        let state = self.inner.lock().unwrap();
        match (state.playback.first(), state.playback.last()) {
            (Some(first), Some(last)) => {
                position >= first.start_time() && position <= last.end_time()
            }
            _ => false,
        }
    }

    /// `(previous, next, current)` around `position`. `current` is only set
    /// when the block actually contains the position.
    pub fn neighbors(
        &self,
        position: f64,
    ) -> (Option<Arc<Block>>, Option<Arc<Block>>, Option<Arc<Block>>) {
        let index = match self.index_of(position) {
            Some(index) => index,
            None => return (None, None, None),
        };
        let state = self.inner.lock().unwrap();
        let at = state.playback.get(index).cloned();
        let current = at.filter(|block| block.contains(position));
        let previous = if index > 0 {
            state.playback.get(index - 1).cloned()
        } else {
            None
        };
        let next = state.playback.get(index + 1).cloned();
        (previous, next, current)
    }

    /// The block following `block`, provided the gap between them is within
    /// the continuity threshold (half a block for monotonic buffers, the
    /// per-type constant otherwise).
    pub fn continuous_next(&self, block: &Block) -> Option<Arc<Block>> {
        let state = self.inner.lock().unwrap();
        let index = block.meta().index;
        let candidate = state.playback.get(index + 1)?;
        let threshold = if state.is_monotonic {
            state.monotonic_duration / 2.0
        } else {
            DISCONTINUITY_THRESHOLD[self.media_type.index()]
        };
        let gap = candidate.start_time() - block.end_time();
        if gap <= threshold {
            Some(candidate.clone())
        } else {
            None
        }
    }

    /// For monotonic buffers, the start time of the block containing
    /// `position`, or of the following block when the position has passed
    /// the block's end.
    pub fn snap_position(&self, position: f64) -> Option<f64> {
        if !self.is_monotonic() {
            return None;
        }
        let index = self.index_of(position)?;
        let state = self.inner.lock().unwrap();
        let block = state.playback.get(index)?;
        if position > block.end_time() {
            return state.playback.get(index + 1).map(|next| next.start_time());
        }
        Some(block.start_time())
    }

    /// Relative position of `position` inside the buffered range.
    pub fn range_percent(&self, position: f64) -> f64 {
        let duration = self.range_duration();
        if duration <= 0.0 {
            return 0.0;
        }
        (position - self.range_start_time()) / duration
    }

    /// Compressed bit rate of the buffered range, in bits per second.
    pub fn range_bit_rate(&self) -> f64 {
        let state = self.inner.lock().unwrap();
        if state.playback.len() < 2 {
            return 0.0;
        }
        let start = state.playback[0].start_time();
        let end = state.playback[state.playback.len() - 1].end_time();
        let duration = end - start;
        if duration <= 0.0 {
            return 0.0;
        }
        let bytes: usize = state
            .playback
            .iter()
            .map(|block| block.meta().compressed_size)
            .sum();
        8.0 * bytes as f64 / duration
    }

    pub fn range_start_time(&self) -> f64 {
        let state = self.inner.lock().unwrap();
        state
            .playback
            .first()
            .map(|block| block.start_time())
            .unwrap_or(0.0)
    }

    pub fn range_end_time(&self) -> f64 {
        let state = self.inner.lock().unwrap();
        state
            .playback
            .last()
            .map(|block| block.end_time())
            .unwrap_or(0.0)
    }

    pub fn range_mid_time(&self) -> f64 {
        let state = self.inner.lock().unwrap();
        match (state.playback.first(), state.playback.last()) {
            (Some(first), Some(last)) => {
                first.start_time() + (last.end_time() - first.start_time()) / 2.0
            }
            _ => 0.0,
        }
    }

    pub fn range_duration(&self) -> f64 {
        let state = self.inner.lock().unwrap();
        match (state.playback.first(), state.playback.last()) {
            (Some(first), Some(last)) => last.end_time() - first.start_time(),
            _ => 0.0,
        }
    }

    /// Average block duration: the common duration for monotonic buffers,
    /// otherwise the range spread across the block count.
    pub fn average_duration(&self) -> f64 {
        let state = self.inner.lock().unwrap();
        if state.playback.is_empty() {
            return 0.0;
        }
        if state.is_monotonic {
            return state.monotonic_duration;
        }
        let start = state.playback[0].start_time();
        let end = state.playback[state.playback.len() - 1].end_time();
        (end - start) / state.playback.len() as f64
    }

    pub fn is_monotonic(&self) -> bool {
        self.inner.lock().unwrap().is_monotonic
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().pool.is_empty()
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().unwrap().playback.len()
    }

    pub fn pool_count(&self) -> usize {
        self.inner.lock().unwrap().pool.len()
    }

    /// Block at a playback-window index, for render delivery.
    pub fn block_at(&self, index: usize) -> Option<Arc<Block>> {
        self.inner.lock().unwrap().playback.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Frame, VideoFrame};

    fn video_frame(pts: f64, duration: f64) -> Frame {
        Frame::Video(VideoFrame {
            pts: Some(pts),
            duration,
            width: 4,
            height: 4,
            pixel_format: crate::backend::PixelFormat::Rgb24,
            data: vec![0u8; 48],
            compressed_size: 24,
        })
    }

    fn add_simple(buffer: &BlockBuffer, pts: f64, duration: f64) -> Option<Arc<Block>> {
        let frame = video_frame(pts, duration);
        let mut materialize = |frame: Frame, block: &Block, _previous: Option<&Block>| {
            let mut payload = block.write_payload()?;
            payload.clear();
            if let Frame::Video(video) = &frame {
                payload.extend_from_slice(&video.data);
            }
            block.set_meta(BlockMeta {
                start_time: frame.start_time().unwrap_or(0.0),
                duration: frame.duration(),
                compressed_size: frame.compressed_size(),
                ..BlockMeta::default()
            });
            Ok(true)
        };
        buffer.add(frame, &mut materialize).unwrap()
    }

    #[test]
    fn pool_plus_playback_always_equals_capacity() {
        let buffer = BlockBuffer::new(MediaType::Video, 4);
        assert_eq!(buffer.pool_count() + buffer.block_count(), 4);
        for i in 0..6 {
            add_simple(&buffer, i as f64 * 0.04, 0.04);
            assert_eq!(buffer.pool_count() + buffer.block_count(), 4);
        }
        buffer.clear();
        assert_eq!(buffer.pool_count(), 4);
        assert_eq!(buffer.block_count(), 0);
    }

    #[test]
    fn playback_blocks_stay_sorted_even_with_out_of_order_adds() {
        let buffer = BlockBuffer::new(MediaType::Video, 8);
        for pts in [0.12, 0.0, 0.08, 0.04] {
            add_simple(&buffer, pts, 0.04);
        }
        let starts: Vec<f64> = (0..buffer.block_count())
            .map(|i| buffer.block_at(i).unwrap().start_time())
            .collect();
        assert_eq!(starts, vec![0.0, 0.04, 0.08, 0.12]);
    }

    #[test]
    fn identical_start_times_are_deduped() {
        let buffer = BlockBuffer::new(MediaType::Video, 4);
        add_simple(&buffer, 0.0, 0.04);
        add_simple(&buffer, 0.0, 0.04);
        assert_eq!(buffer.block_count(), 1);
        assert_eq!(buffer.pool_count(), 3);
    }

    #[test]
    fn eviction_recycles_the_oldest_block() {
        let buffer = BlockBuffer::new(MediaType::Video, 3);
        for i in 0..4 {
            add_simple(&buffer, i as f64 * 0.04, 0.04);
        }
        assert_eq!(buffer.block_count(), 3);
        assert!((buffer.range_start_time() - 0.04).abs() < 1e-9);
    }

    #[test]
    fn monotonic_flag_is_sticky_until_clear() {
        let buffer = BlockBuffer::new(MediaType::Video, 8);
        add_simple(&buffer, 0.0, 0.04);
        add_simple(&buffer, 0.04, 0.04);
        assert!(buffer.is_monotonic());
        add_simple(&buffer, 0.08, 0.02);
        assert!(!buffer.is_monotonic());
        // Equal durations again do not restore the flag.
        add_simple(&buffer, 0.10, 0.02);
        assert!(!buffer.is_monotonic());
        buffer.clear();
        assert!(buffer.is_monotonic());
    }

    #[test]
    fn snap_position_round_trips_on_monotonic_buffers() {
        let buffer = BlockBuffer::new(MediaType::Video, 8);
        for i in 0..4 {
            add_simple(&buffer, i as f64 * 0.04, 0.04);
        }
        let block = buffer.block_at(1).unwrap();
        assert_eq!(buffer.snap_position(block.start_time()), Some(block.start_time()));
        let past_end = block.end_time() + 1e-6;
        // Contiguous blocks: just past this block's end lands in the next.
        assert_eq!(
            buffer.snap_position(past_end),
            Some(buffer.block_at(2).unwrap().start_time())
        );
    }

    #[test]
    fn continuous_next_respects_the_gap_threshold() {
        let buffer = BlockBuffer::new(MediaType::Video, 8);
        add_simple(&buffer, 0.0, 0.04);
        add_simple(&buffer, 0.04, 0.04);
        add_simple(&buffer, 0.5, 0.04);
        let first = buffer.block_at(0).unwrap();
        let second = buffer.block_at(1).unwrap();
        assert!(buffer.continuous_next(&first).is_some());
        assert!(buffer.continuous_next(&second).is_none());
    }

    #[test]
    fn range_metrics() {
        let buffer = BlockBuffer::new(MediaType::Video, 8);
        for i in 0..4 {
            add_simple(&buffer, i as f64 * 0.04, 0.04);
        }
        assert!((buffer.range_duration() - 0.16).abs() < 1e-9);
        assert!((buffer.range_mid_time() - 0.08).abs() < 1e-9);
        assert!((buffer.range_percent(0.08) - 0.5).abs() < 1e-9);
        // 4 blocks × 24 bytes over 0.16 s.
        assert!((buffer.range_bit_rate() - 8.0 * 96.0 / 0.16).abs() < 1e-6);
        assert!((buffer.average_duration() - 0.04).abs() < 1e-9);
    }

    #[test]
    fn failed_materialization_returns_the_block_to_the_pool() {
        let buffer = BlockBuffer::new(MediaType::Video, 2);
        let mut failing = |_frame: Frame, _block: &Block, _previous: Option<&Block>| Ok(false);
        let added = buffer.add(video_frame(0.0, 0.04), &mut failing).unwrap();
        assert!(added.is_none());
        assert_eq!(buffer.pool_count(), 2);
    }
}
