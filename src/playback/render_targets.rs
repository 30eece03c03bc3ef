//! External renderer interfaces.
//!
//! The engine delivers blocks; turning samples into sound and pixels into
//! light is the host's concern. Renderer failures never propagate into the
//! pipeline.

use std::sync::{Arc, Mutex};

use crate::blocks::Block;
use crate::error::MediaError;

/// Receives blocks for one media type as the clock passes over them.
pub trait BlockRenderer: Send {
    fn render(&mut self, block: &Block, clock_position: f64) -> Result<(), MediaError>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullRenderer;

impl BlockRenderer for NullRenderer {
    fn render(&mut self, _block: &Block, _clock_position: f64) -> Result<(), MediaError> {
        Ok(())
    }
}

/// Records delivered block start times; useful for hosts prototyping
/// against the engine and for tests.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    delivered: Arc<Mutex<Vec<f64>>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the delivered start times.
    pub fn delivered(&self) -> Arc<Mutex<Vec<f64>>> {
        self.delivered.clone()
    }
}

impl BlockRenderer for RecordingRenderer {
    fn render(&mut self, block: &Block, _clock_position: f64) -> Result<(), MediaError> {
        self.delivered.lock().unwrap().push(block.start_time());
        Ok(())
    }
}

/// One renderer per media type. Defaults to discarding sinks.
pub struct RendererSet {
    pub audio: Box<dyn BlockRenderer>,
    pub video: Box<dyn BlockRenderer>,
    pub subtitle: Box<dyn BlockRenderer>,
}

impl Default for RendererSet {
    fn default() -> Self {
        Self {
            audio: Box::new(NullRenderer),
            video: Box::new(NullRenderer),
            subtitle: Box::new(NullRenderer),
        }
    }
}

impl RendererSet {
    pub fn for_type(&mut self, media_type: crate::backend::MediaType) -> &mut dyn BlockRenderer {
        match media_type {
            crate::backend::MediaType::Audio => self.audio.as_mut(),
            crate::backend::MediaType::Video => self.video.as_mut(),
            crate::backend::MediaType::Subtitle => self.subtitle.as_mut(),
        }
    }
}
