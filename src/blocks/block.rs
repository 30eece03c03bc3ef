//! Pre-allocated presentation block.

use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::MediaType;
use crate::error::MediaError;

/// How long a writer waits for the payload lock before the materialization
/// is reported as contended.
const WRITER_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Presentation metadata for one block. Rewritten on every recycle.
#[derive(Debug, Clone, Default)]
pub struct BlockMeta {
    pub start_time: f64,
    pub duration: f64,
    pub stream_index: usize,
    pub compressed_size: usize,
    /// The start time was inferred from the previous block rather than read
    /// from a valid pts.
    pub is_start_time_guessed: bool,
    /// Position within the playback window; recomputed after each mutation.
    pub index: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
}

/// Reusable decoded output unit.
///
/// Blocks are created once at buffer construction and recycled mutably; a
/// block's identity is its pool slot, never its contents. The byte payload
/// sits behind a reader-writer lock: renderers hold read guards while the
/// decode path replaces contents under the write guard.
#[derive(Debug)]
pub struct Block {
    slot: usize,
    media_type: MediaType,
    payload: RwLock<Vec<u8>>,
    meta: Mutex<BlockMeta>,
}

impl Block {
    pub(crate) fn new(slot: usize, media_type: MediaType) -> Self {
        Self {
            slot,
            media_type,
            payload: RwLock::new(Vec::new()),
            meta: Mutex::new(BlockMeta::default()),
        }
    }

    /// Fixed pool slot; the block's identity.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn meta(&self) -> BlockMeta {
        self.meta.lock().unwrap().clone()
    }

    pub(crate) fn set_meta(&self, meta: BlockMeta) {
        *self.meta.lock().unwrap() = meta;
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.meta.lock().unwrap().index = index;
    }

    pub fn start_time(&self) -> f64 {
        self.meta.lock().unwrap().start_time
    }

    pub fn duration(&self) -> f64 {
        self.meta.lock().unwrap().duration
    }

    pub fn end_time(&self) -> f64 {
        let meta = self.meta.lock().unwrap();
        meta.start_time + meta.duration
    }

    pub fn contains(&self, position: f64) -> bool {
        let meta = self.meta.lock().unwrap();
        position >= meta.start_time && position <= meta.start_time + meta.duration
    }

    /// Read guard over the payload bytes.
    pub fn read_payload(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.payload.read().unwrap()
    }

    /// Write guard over the payload, bounded by the writer-lock timeout.
    /// Contention is reported as an error rather than a panic so the caller
    /// can skip the materialization.
    pub(crate) fn write_payload(&self) -> Result<RwLockWriteGuard<'_, Vec<u8>>, MediaError> {
        let deadline = Instant::now() + WRITER_LOCK_TIMEOUT;
        loop {
            match self.payload.try_write() {
                Ok(guard) => return Ok(guard),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(MediaError::Contention("block payload"));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(std::sync::TryLockError::Poisoned(_)) => {
                    return Err(MediaError::Contention("block payload"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_time_is_start_plus_duration() {
        let block = Block::new(0, MediaType::Video);
        block.set_meta(BlockMeta {
            start_time: 1.0,
            duration: 0.04,
            ..BlockMeta::default()
        });
        assert!((block.end_time() - 1.04).abs() < 1e-9);
        assert!(block.contains(1.02));
        assert!(!block.contains(1.05));
    }

    #[test]
    fn writer_times_out_while_a_reader_holds_the_payload() {
        let block = Block::new(0, MediaType::Audio);
        let _reader = block.read_payload();
        match block.write_payload() {
            Err(MediaError::Contention(_)) => {}
            other => panic!("expected contention, got {:?}", other.map(|_| ())),
        };
    }

    #[test]
    fn writer_succeeds_when_uncontended() {
        let block = Block::new(3, MediaType::Audio);
        {
            let mut payload = block.write_payload().unwrap();
            payload.extend_from_slice(&[1, 2, 3]);
        }
        assert_eq!(block.read_payload().as_slice(), &[1, 2, 3]);
        assert_eq!(block.slot(), 3);
    }
}
