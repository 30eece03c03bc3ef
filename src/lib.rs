//! # Medley
//!
//! A media playback engine core. Medley demuxes a container into packets,
//! decodes them into time-stamped frames, materializes frames into
//! pre-allocated blocks, and delivers blocks to external renderers on a
//! real-time clock, with seekable playback, audio/video synchronization,
//! and sync-buffering on starvation.

pub mod backend;
pub mod blocks;
pub mod container;
pub mod error;
pub mod playback;
pub mod sim;
pub mod time;
pub mod timing;
