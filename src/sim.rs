//! Synthetic scripted media backend.
//!
//! Generates deterministic packet and frame sequences without touching any
//! codec or file, which makes it useful for engine tests and for host
//! development against a predictable source. Packet payloads are zeroed
//! bytes; audio decodes to a constant-amplitude signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::backend::{
    AudioFrame, AudioParams, BackendError, Decoder, Demuxer, Frame, InterruptCallback,
    MediaBackend, MediaInput, MediaType, Packet, PacketKind, PixelFormat, StreamInfo,
    SubtitleFrame, VideoFrame, VideoParams,
};
use crate::container::options::ContainerOptions;
use crate::time::TimeBase;

/// Video key frames are emitted every this many frames.
const KEY_FRAME_INTERVAL: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct SimVideo {
    pub frames_per_second: f64,
    pub width: u32,
    pub height: u32,
    pub start_time: f64,
    pub with_attached_picture: bool,
    pub still_picture: bool,
}

impl Default for SimVideo {
    fn default() -> Self {
        Self {
            frames_per_second: 30.0,
            width: 16,
            height: 16,
            start_time: 0.0,
            with_attached_picture: false,
            still_picture: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub packet_duration: f64,
    pub start_time: f64,
}

impl Default for SimAudio {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            packet_duration: 0.02,
            start_time: 0.0,
        }
    }
}

/// Description of the synthetic container.
#[derive(Debug, Clone, Copy)]
pub struct SimSpec {
    pub duration: f64,
    pub video: Option<SimVideo>,
    pub audio: Option<SimAudio>,
    /// Emit one caption per second when set.
    pub subtitles: bool,
    pub is_live: bool,
    pub is_network: bool,
    pub is_seekable: bool,
}

impl Default for SimSpec {
    fn default() -> Self {
        Self {
            duration: 10.0,
            video: Some(SimVideo::default()),
            audio: None,
            subtitles: false,
            is_live: false,
            is_network: false,
            is_seekable: true,
        }
    }
}

/// Shared control handle for stalling reads (network-stall simulation).
#[derive(Debug, Clone, Default)]
pub struct SimControl {
    stalled: Arc<AtomicBool>,
}

impl SimControl {
    pub fn stall_reads(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn resume_reads(&self) {
        self.stalled.store(false, Ordering::SeqCst);
    }
}

/// Backend producing synthetic containers described by a [`SimSpec`].
#[derive(Debug, Default)]
pub struct SimBackend {
    spec: SimSpec,
    control: SimControl,
}

impl SimBackend {
    pub fn new(spec: SimSpec) -> Self {
        Self {
            spec,
            control: SimControl::default(),
        }
    }

    /// Handle for stalling and resuming reads from the outside.
    pub fn control(&self) -> SimControl {
        self.control.clone()
    }
}

impl MediaBackend for SimBackend {
    fn open(
        &self,
        _input: MediaInput,
        _options: &ContainerOptions,
    ) -> Result<Box<dyn Demuxer>, BackendError> {
        Ok(Box::new(SimDemuxer::new(self.spec, self.control.clone())))
    }
}

struct StreamCursor {
    /// Next packet start, in seconds.
    next_time: f64,
    packet_duration: f64,
    frame_counter: u32,
}

pub struct SimDemuxer {
    spec: SimSpec,
    streams: Vec<StreamInfo>,
    cursors: Vec<StreamCursor>,
    interrupt: Option<InterruptCallback>,
    control: SimControl,
}

impl SimDemuxer {
    fn new(spec: SimSpec, control: SimControl) -> Self {
        let mut streams = Vec::new();
        let mut cursors = Vec::new();

        if let Some(video) = spec.video {
            let index = streams.len();
            let frame_duration = 1.0 / video.frames_per_second.max(1.0);
            let attached_picture = video.with_attached_picture.then(|| Packet {
                stream_index: index,
                kind: PacketKind::AttachedPicture,
                pts: Some(0),
                duration: 0,
                is_key: true,
                time_base: TimeBase::MILLIS,
                data: vec![0u8; 256],
            });
            streams.push(StreamInfo {
                index,
                media_type: MediaType::Video,
                codec: "simvideo".to_string(),
                start_time: Some(video.start_time),
                duration: Some(spec.duration),
                time_base: TimeBase::MILLIS,
                is_still_picture: video.still_picture,
                attached_picture,
                audio: None,
                video: Some(VideoParams {
                    width: video.width,
                    height: video.height,
                    frames_per_second: video.frames_per_second,
                }),
            });
            cursors.push(StreamCursor {
                next_time: video.start_time,
                packet_duration: frame_duration,
                frame_counter: 0,
            });
        }

        if let Some(audio) = spec.audio {
            let index = streams.len();
            streams.push(StreamInfo {
                index,
                media_type: MediaType::Audio,
                codec: "simaudio".to_string(),
                start_time: Some(audio.start_time),
                duration: Some(spec.duration),
                time_base: TimeBase::MILLIS,
                is_still_picture: false,
                attached_picture: None,
                audio: Some(AudioParams {
                    sample_rate: audio.sample_rate,
                    channels: audio.channels,
                }),
                video: None,
            });
            cursors.push(StreamCursor {
                next_time: audio.start_time,
                packet_duration: audio.packet_duration,
                frame_counter: 0,
            });
        }

        if spec.subtitles {
            let index = streams.len();
            streams.push(StreamInfo {
                index,
                media_type: MediaType::Subtitle,
                codec: "simtext".to_string(),
                start_time: Some(0.0),
                duration: Some(spec.duration),
                time_base: TimeBase::MILLIS,
                is_still_picture: false,
                attached_picture: None,
                audio: None,
                video: None,
            });
            cursors.push(StreamCursor {
                next_time: 0.0,
                packet_duration: 1.0,
                frame_counter: 0,
            });
        }

        Self {
            spec,
            streams,
            cursors,
            interrupt: None,
            control,
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map(|callback| callback())
            .unwrap_or(false)
    }
}

impl Demuxer for SimDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Packet, BackendError> {
        // Block while stalled, honoring the interrupt callback the way a
        // real demuxer polls it inside a blocking read.
        while self.control.stalled.load(Ordering::SeqCst) {
            if self.is_interrupted() {
                return Err(BackendError::Aborted);
            }
            thread::sleep(Duration::from_millis(2));
        }
        if self.is_interrupted() {
            return Err(BackendError::Aborted);
        }

        // The stream with the earliest pending packet goes first.
        let mut chosen: Option<usize> = None;
        for (index, cursor) in self.cursors.iter().enumerate() {
            if cursor.next_time >= self.spec.duration {
                continue;
            }
            if chosen
                .map(|current| cursor.next_time < self.cursors[current].next_time)
                .unwrap_or(true)
            {
                chosen = Some(index);
            }
        }
        let Some(index) = chosen else {
            return Err(BackendError::Eof);
        };

        let stream = self.streams[index].clone();
        let cursor = &mut self.cursors[index];
        let pts = (cursor.next_time * 1000.0).round() as i64;
        let duration_ticks = (cursor.packet_duration * 1000.0).round() as i64;
        let (is_key, size) = match stream.media_type {
            MediaType::Video => {
                let key = cursor.frame_counter % KEY_FRAME_INTERVAL == 0;
                (key, if key { 200 } else { 80 })
            }
            MediaType::Audio => (true, 64),
            MediaType::Subtitle => (true, 24),
        };
        cursor.frame_counter += 1;
        cursor.next_time += cursor.packet_duration;

        let mut data = vec![0u8; size];
        // Subtitle payloads carry their caption text.
        if stream.media_type == MediaType::Subtitle {
            data = format!("caption at {:.0}s", cursor.next_time - 1.0).into_bytes();
        }

        Ok(Packet::new_data(
            index,
            Some(pts),
            duration_ticks,
            is_key,
            TimeBase::MILLIS,
            data,
        ))
    }

    fn seek(&mut self, stream_index: usize, seconds: f64) -> Result<(), BackendError> {
        if !self.spec.is_seekable {
            return Err(BackendError::Unsupported("container is not seekable".to_string()));
        }
        if stream_index >= self.streams.len() {
            return Err(BackendError::Unsupported("unknown stream index".to_string()));
        }
        let target = seconds.clamp(0.0, self.spec.duration);
        for (index, cursor) in self.cursors.iter_mut().enumerate() {
            let step = cursor.packet_duration;
            let mut aligned = (target / step).floor() * step;
            if self.streams[index].media_type == MediaType::Video {
                // Snap back to the key-frame grid.
                let key_step = step * KEY_FRAME_INTERVAL as f64;
                aligned = (target / key_step).floor() * key_step;
                cursor.frame_counter = ((aligned / step).round() as u32 / KEY_FRAME_INTERVAL)
                    * KEY_FRAME_INTERVAL;
            } else {
                cursor.frame_counter = (aligned / step).round() as u32;
            }
            cursor.next_time = aligned;
        }
        Ok(())
    }

    fn set_interrupt(&mut self, callback: Option<InterruptCallback>) {
        self.interrupt = callback;
    }

    fn create_decoder(
        &self,
        stream_index: usize,
        _forced_codec: Option<&str>,
    ) -> Result<Box<dyn Decoder>, BackendError> {
        let stream = self
            .streams
            .get(stream_index)
            .ok_or_else(|| BackendError::Unsupported("unknown stream index".to_string()))?;
        Ok(Box::new(SimDecoder {
            stream: stream.clone(),
            pending: None,
            draining: false,
        }))
    }

    fn is_live(&self) -> bool {
        self.spec.is_live
    }

    fn is_network(&self) -> bool {
        self.spec.is_network
    }

    fn is_seekable(&self) -> bool {
        self.spec.is_seekable
    }
}

/// One-packet-in, one-frame-out decoder for synthetic streams.
struct SimDecoder {
    stream: StreamInfo,
    pending: Option<Packet>,
    draining: bool,
}

impl SimDecoder {
    fn frame_from(&self, packet: &Packet) -> Frame {
        let pts = packet.start_seconds();
        let duration = packet.duration_seconds();
        match self.stream.media_type {
            MediaType::Video => {
                let params = self.stream.video.unwrap_or(VideoParams {
                    width: 16,
                    height: 16,
                    frames_per_second: 30.0,
                });
                Frame::Video(VideoFrame {
                    pts,
                    duration,
                    width: params.width,
                    height: params.height,
                    pixel_format: PixelFormat::Rgb24,
                    data: vec![0u8; (params.width * params.height * 3) as usize],
                    compressed_size: packet.size(),
                })
            }
            MediaType::Audio => {
                let params = self.stream.audio.unwrap_or(AudioParams {
                    sample_rate: 48_000,
                    channels: 2,
                });
                let frames = (duration * params.sample_rate as f64).round() as usize;
                Frame::Audio(AudioFrame {
                    pts,
                    duration,
                    sample_rate: params.sample_rate,
                    channels: params.channels,
                    samples: vec![0.1; frames.max(1) * params.channels as usize],
                    compressed_size: packet.size(),
                })
            }
            MediaType::Subtitle => Frame::Subtitle(SubtitleFrame {
                pts,
                duration,
                text: String::from_utf8_lossy(&packet.data).into_owned(),
                compressed_size: packet.size(),
            }),
        }
    }
}

impl Decoder for SimDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), BackendError> {
        if self.pending.is_some() {
            return Err(BackendError::TryAgain);
        }
        if packet.is_empty_data() {
            self.draining = true;
            return Ok(());
        }
        self.pending = Some(packet.clone());
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Frame, BackendError> {
        match self.pending.take() {
            Some(packet) => Ok(self.frame_from(&packet)),
            None if self.draining => Err(BackendError::Eof),
            None => Err(BackendError::TryAgain),
        }
    }

    fn flush(&mut self) {
        self.pending = None;
        self.draining = false;
    }

    fn decode_subtitle(&mut self, packet: Option<&Packet>) -> Result<Option<Frame>, BackendError> {
        if self.stream.media_type != MediaType::Subtitle {
            return Err(BackendError::Unsupported(
                "not a subtitle stream".to_string(),
            ));
        }
        Ok(packet.map(|packet| self.frame_from(packet)))
    }
}
