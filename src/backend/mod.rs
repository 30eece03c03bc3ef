//! Demuxer/decoder capability interface.
//!
//! The engine core consumes a deliberately narrow backend surface: open a
//! container, read packets, send packets / receive frames, seek, close.
//! Anything FFmpeg-like can sit behind these traits; the bundled
//! [`symphonia`](crate::backend::symphonia) adapter covers containers and
//! audio codecs out of the box.

pub mod symphonia;

use std::fmt::{Display, Formatter};

use crate::container::options::ContainerOptions;
use crate::time::TimeBase;

/// Media type of a stream, frame, or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
    Subtitle,
}

impl MediaType {
    pub const ALL: [MediaType; 3] = [MediaType::Audio, MediaType::Video, MediaType::Subtitle];

    /// Dense index used by the per-type tables (clocks, buffers, renderers).
    pub fn index(self) -> usize {
        match self {
            MediaType::Audio => 0,
            MediaType::Video => 1,
            MediaType::Subtitle => 2,
        }
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Audio => write!(f, "audio"),
            MediaType::Video => write!(f, "video"),
            MediaType::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// Error type at the backend boundary.
#[derive(Debug)]
pub enum BackendError {
    /// The codec needs the other half of the send/receive cycle first.
    TryAgain,
    /// The container or codec is fully drained.
    Eof,
    /// An in-flight read was interrupted by the abort callback.
    Aborted,
    Unsupported(String),
    Decode(String),
    Io(std::io::Error),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TryAgain => write!(f, "resource temporarily unavailable"),
            Self::Eof => write!(f, "end of stream"),
            Self::Aborted => write!(f, "read aborted"),
            Self::Unsupported(msg) => write!(f, "unsupported: {}", msg),
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
            Self::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Distinguishes ordinary data packets from the control sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Data,
    /// Requests a decoder buffer flush when dequeued.
    Flush,
    /// Null-data packet that drains the decoder at end of stream.
    Empty,
    /// One-shot still image embedded in the container (album art).
    AttachedPicture,
}

/// Compressed unit read from the demuxer, tagged with its stream.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    pub kind: PacketKind,
    /// Presentation timestamp in `time_base` ticks.
    pub pts: Option<i64>,
    /// Duration in `time_base` ticks; may be zero or negative in broken files.
    pub duration: i64,
    pub is_key: bool,
    pub time_base: TimeBase,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new_data(
        stream_index: usize,
        pts: Option<i64>,
        duration: i64,
        is_key: bool,
        time_base: TimeBase,
        data: Vec<u8>,
    ) -> Self {
        Self {
            stream_index,
            kind: PacketKind::Data,
            pts,
            duration,
            is_key,
            time_base,
            data,
        }
    }

    /// Sentinel instructing the decoder to clear buffered state.
    pub fn flush(stream_index: usize) -> Self {
        Self {
            stream_index,
            kind: PacketKind::Flush,
            pts: None,
            duration: 0,
            is_key: false,
            time_base: TimeBase::default(),
            data: Vec::new(),
        }
    }

    /// Null-data sentinel instructing the decoder to drain.
    pub fn empty(stream_index: usize) -> Self {
        Self {
            stream_index,
            kind: PacketKind::Empty,
            pts: None,
            duration: 0,
            is_key: false,
            time_base: TimeBase::default(),
            data: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_flush(&self) -> bool {
        self.kind == PacketKind::Flush
    }

    pub fn is_empty_data(&self) -> bool {
        self.kind == PacketKind::Empty
    }

    /// Start time in seconds, when the packet carries a valid pts.
    pub fn start_seconds(&self) -> Option<f64> {
        self.pts.map(|ts| self.time_base.to_seconds(ts))
    }

    pub fn duration_seconds(&self) -> f64 {
        self.time_base.to_seconds(self.duration.max(0))
    }
}

/// Pixel layout of a decoded video picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra32,
    Rgb24,
    Yuv420p,
}

impl PixelFormat {
    /// Packed bytes per pixel; planar formats report their averaged rate.
    pub fn bytes_per_pixel(self) -> f64 {
        match self {
            PixelFormat::Bgra32 => 4.0,
            PixelFormat::Rgb24 => 3.0,
            PixelFormat::Yuv420p => 1.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts: Option<f64>,
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved f32 samples.
    pub samples: Vec<f32>,
    pub compressed_size: usize,
}

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: Option<f64>,
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
    pub compressed_size: usize,
}

#[derive(Debug, Clone)]
pub struct SubtitleFrame {
    pub pts: Option<f64>,
    pub duration: f64,
    pub text: String,
    pub compressed_size: usize,
}

/// Decoded, uncompressed unit. Transient: frames exist only between
/// `receive_next_frame` and materialization into a block (or drop).
#[derive(Debug, Clone)]
pub enum Frame {
    Audio(AudioFrame),
    Video(VideoFrame),
    Subtitle(SubtitleFrame),
}

impl Frame {
    pub fn media_type(&self) -> MediaType {
        match self {
            Frame::Audio(_) => MediaType::Audio,
            Frame::Video(_) => MediaType::Video,
            Frame::Subtitle(_) => MediaType::Subtitle,
        }
    }

    /// Presentation start in seconds; `None` means the start time must be
    /// guessed from the preceding block.
    pub fn start_time(&self) -> Option<f64> {
        match self {
            Frame::Audio(f) => f.pts,
            Frame::Video(f) => f.pts,
            Frame::Subtitle(f) => f.pts,
        }
    }

    pub fn duration(&self) -> f64 {
        match self {
            Frame::Audio(f) => f.duration,
            Frame::Video(f) => f.duration,
            Frame::Subtitle(f) => f.duration,
        }
    }

    pub fn compressed_size(&self) -> usize {
        match self {
            Frame::Audio(f) => f.compressed_size,
            Frame::Video(f) => f.compressed_size,
            Frame::Subtitle(f) => f.compressed_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub frames_per_second: f64,
}

/// Static description of one demuxed stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub media_type: MediaType,
    pub codec: String,
    pub start_time: Option<f64>,
    pub duration: Option<f64>,
    pub time_base: TimeBase,
    /// Still-image stream (cover art); decodes exactly one picture.
    pub is_still_picture: bool,
    /// Album-art packet re-emitted after every seek.
    pub attached_picture: Option<Packet>,
    pub audio: Option<AudioParams>,
    pub video: Option<VideoParams>,
}

/// Callback polled by the demuxer during blocking reads; returning `true`
/// aborts the read with [`BackendError::Aborted`].
pub type InterruptCallback = Box<dyn Fn() -> bool + Send>;

/// Host-supplied input stream, the custom-IO alternative to a URL.
pub trait InputStream: Send + Sync {
    fn uri(&self) -> &str;
    fn can_seek(&self) -> bool;
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64>;
    fn byte_length(&self) -> Option<u64> {
        None
    }
    /// Called before the backend probes the stream.
    fn on_initializing(&mut self) {}
    /// Called once the container has been opened over this stream.
    fn on_initialized(&mut self) {}
}

/// Source of media bytes handed to [`MediaBackend::open`].
pub enum MediaInput {
    Url(String),
    Stream(Box<dyn InputStream>),
}

impl MediaInput {
    pub fn uri(&self) -> &str {
        match self {
            MediaInput::Url(url) => url,
            MediaInput::Stream(stream) => stream.uri(),
        }
    }
}

/// Container reader: stream table, sequential packet reads, seeking.
pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Read the next packet in container order. `Eof` at end of stream,
    /// `Aborted` when the interrupt callback fired mid-read.
    fn read_packet(&mut self) -> Result<Packet, BackendError>;

    /// Seek to the closest key frame at or before `seconds` on the stream.
    fn seek(&mut self, stream_index: usize, seconds: f64) -> Result<(), BackendError>;

    /// Install (or clear) the read-interrupt callback.
    fn set_interrupt(&mut self, callback: Option<InterruptCallback>);

    /// Create a decoder for one of this container's streams. The demuxer
    /// owns the codec parameters, so decoder creation lives here.
    fn create_decoder(
        &self,
        stream_index: usize,
        forced_codec: Option<&str>,
    ) -> Result<Box<dyn Decoder>, BackendError>;

    fn is_live(&self) -> bool {
        false
    }

    fn is_network(&self) -> bool {
        false
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// Stream decoder following the send/receive model: packets go in until the
/// codec pushes back with `TryAgain`, frames come out until `TryAgain`
/// (needs more input) or `Eof` (fully drained).
pub trait Decoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), BackendError>;

    fn receive_frame(&mut self) -> Result<Frame, BackendError>;

    /// Drop all buffered codec state.
    fn flush(&mut self);

    /// Single-shot decode used by subtitle codecs; `None` drains.
    fn decode_subtitle(&mut self, _packet: Option<&Packet>) -> Result<Option<Frame>, BackendError> {
        Err(BackendError::Unsupported(
            "subtitle decoding not provided by this decoder".to_string(),
        ))
    }
}

/// Factory opening demuxers over URLs or custom input streams.
pub trait MediaBackend: Send + Sync {
    fn open(
        &self,
        input: MediaInput,
        options: &ContainerOptions,
    ) -> Result<Box<dyn Demuxer>, BackendError>;
}
