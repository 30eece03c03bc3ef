//! Per-stream decoder component: packet queue in, frames out, blocks
//! materialized on request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::backend::{
    AudioFrame, AudioParams, BackendError, Decoder, Frame, MediaType, Packet, StreamInfo,
    SubtitleFrame, VideoFrame,
};
use crate::blocks::{Block, BlockMeta};
use crate::container::options::MediaOptions;
use crate::container::packets::PacketQueue;
use crate::error::MediaError;

/// Output format every audio block is converted to.
const OUTPUT_AUDIO: AudioParams = AudioParams {
    sample_rate: 48_000,
    channels: 2,
};

/// Fallback presentation time for subtitle frames with no duration.
const SUBTITLE_FALLBACK_DURATION: f64 = 3.0;

fn count_threshold(media_type: MediaType) -> usize {
    match media_type {
        MediaType::Audio => 48,
        MediaType::Video => 24,
        // Zero threshold: subtitles never gate the read loop.
        MediaType::Subtitle => 0,
    }
}

fn duration_threshold(media_type: MediaType) -> f64 {
    match media_type {
        MediaType::Audio | MediaType::Video => 1.0,
        MediaType::Subtitle => 0.0,
    }
}

/// Converts decoded audio to the fixed output format. Reconfigured when the
/// source parameters change materially.
#[derive(Debug)]
pub struct Resampler {
    source: Option<AudioParams>,
    target: AudioParams,
}

impl Resampler {
    pub fn new(target: AudioParams) -> Self {
        Self {
            source: None,
            target,
        }
    }

    /// Convert one frame of interleaved samples to the target layout.
    pub fn convert(&mut self, frame: &AudioFrame) -> Vec<f32> {
        let params = AudioParams {
            sample_rate: frame.sample_rate,
            channels: frame.channels,
        };
        if self.source != Some(params) {
            debug!(
                "resampler configured: {}Hz x{} -> {}Hz x{}",
                params.sample_rate, params.channels, self.target.sample_rate, self.target.channels
            );
            self.source = Some(params);
        }

        let src_channels = params.channels.max(1) as usize;
        let dst_channels = self.target.channels.max(1) as usize;
        let src_frames = frame.samples.len() / src_channels;
        if src_frames == 0 {
            return Vec::new();
        }
        let dst_frames = ((src_frames as u64 * self.target.sample_rate as u64)
            / params.sample_rate.max(1) as u64) as usize;

        let mut output = Vec::with_capacity(dst_frames * dst_channels);
        for frame_index in 0..dst_frames {
            // Linear interpolation between neighboring source frames.
            let src_pos =
                frame_index as f64 * (src_frames - 1) as f64 / (dst_frames - 1).max(1) as f64;
            let lower = src_pos.floor() as usize;
            let upper = (lower + 1).min(src_frames - 1);
            let t = (src_pos - lower as f64) as f32;
            for channel in 0..dst_channels {
                let pick = channel.min(src_channels - 1);
                let a = frame.samples[lower * src_channels + pick];
                let b = frame.samples[upper * src_channels + pick];
                output.push(a + (b - a) * t);
            }
        }
        output
    }
}

/// Parsed audio filter chain built from the `audio_filter` option string.
/// Recognized filters: `volume=<gain>`. Unknown entries are warned and
/// skipped.
#[derive(Debug, Clone, PartialEq)]
struct FilterChain {
    spec: String,
    source: AudioParams,
    gain: f32,
}

impl FilterChain {
    fn build(spec: &str, source: AudioParams) -> Self {
        let mut gain = 1.0f32;
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once('=') {
                Some(("volume", value)) => match value.parse::<f32>() {
                    Ok(parsed) => gain *= parsed,
                    Err(_) => warn!("invalid volume filter value {:?}", value),
                },
                _ => warn!("unrecognized audio filter {:?}", entry),
            }
        }
        Self {
            spec: spec.to_string(),
            source,
            gain,
        }
    }

    fn apply(&self, samples: &mut [f32]) {
        if (self.gain - 1.0).abs() < f32::EPSILON {
            return;
        }
        for sample in samples {
            *sample *= self.gain;
        }
    }
}

#[derive(Debug)]
struct AudioState {
    resampler: Resampler,
    filter: Option<FilterChain>,
}

#[derive(Debug, Default)]
struct VideoState {
    /// Last materialized pts, used to flag duplicated frames.
    last_pts: Option<f64>,
}

enum ComponentKind {
    Audio(AudioState),
    Video(VideoState),
    Subtitle,
}

/// One stream's decoder, packet queue, and materialization logic.
pub struct MediaComponent {
    stream: StreamInfo,
    options: Arc<MediaOptions>,
    decoder: Mutex<Box<dyn Decoder>>,
    queue: PacketQueue,
    kind: Mutex<ComponentKind>,
    has_packets_in_codec: AtomicBool,
    is_disposed: AtomicBool,
    buffer_count_threshold: usize,
    buffer_duration_threshold: f64,
    duration: Mutex<Option<f64>>,
}

impl MediaComponent {
    pub fn new(stream: StreamInfo, decoder: Box<dyn Decoder>, options: Arc<MediaOptions>) -> Self {
        let kind = match stream.media_type {
            MediaType::Audio => ComponentKind::Audio(AudioState {
                resampler: Resampler::new(OUTPUT_AUDIO),
                filter: None,
            }),
            MediaType::Video => ComponentKind::Video(VideoState::default()),
            MediaType::Subtitle => ComponentKind::Subtitle,
        };
        let duration = stream.duration;
        Self {
            buffer_count_threshold: count_threshold(stream.media_type),
            buffer_duration_threshold: duration_threshold(stream.media_type),
            stream,
            options,
            decoder: Mutex::new(decoder),
            queue: PacketQueue::new(),
            kind: Mutex::new(kind),
            has_packets_in_codec: AtomicBool::new(false),
            is_disposed: AtomicBool::new(false),
            duration: Mutex::new(duration),
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.stream.media_type
    }

    pub fn stream_index(&self) -> usize {
        self.stream.index
    }

    pub fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    pub fn is_still_picture(&self) -> bool {
        self.stream.is_still_picture
    }

    pub fn start_time(&self) -> Option<f64> {
        self.stream.start_time
    }

    /// Stream duration, possibly extended by observed frame end times.
    pub fn duration(&self) -> Option<f64> {
        *self.duration.lock().unwrap()
    }

    pub fn packet_count(&self) -> usize {
        self.queue.count()
    }

    pub fn packet_buffer_length(&self) -> u64 {
        self.queue.buffer_length()
    }

    pub fn packet_buffer_duration(&self) -> f64 {
        self.queue.duration(self.stream.time_base)
    }

    pub fn count_threshold(&self) -> usize {
        self.buffer_count_threshold
    }

    pub fn has_packets_in_codec(&self) -> bool {
        self.has_packets_in_codec.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::SeqCst)
    }

    /// Queue a packet for decoding; `None` queues the drain sentinel.
    pub fn send_packet(&self, packet: Option<Packet>) {
        match packet {
            Some(packet) => self.queue.push(packet),
            None => self.send_empty_packet(),
        }
    }

    /// Queue the null-data sentinel that drains the codec at end of stream.
    pub fn send_empty_packet(&self) {
        self.queue.push(Packet::empty(self.stream.index));
    }

    /// Drain and dispose all queued packets; optionally flush the codec's
    /// internal buffers as well.
    pub fn clear_queued_packets(&self, flush_buffers: bool) {
        self.queue.clear();
        if flush_buffers {
            self.flush_codec_buffers();
        }
    }

    pub fn flush_codec_buffers(&self) {
        self.decoder.lock().unwrap().flush();
        self.has_packets_in_codec.store(false, Ordering::SeqCst);
    }

    /// Whether the read loop can stop fetching packets for this component.
    pub fn has_enough_packets(&self, is_read_aborted: bool, is_at_eof: bool) -> bool {
        if self.is_disposed()
            || self.buffer_count_threshold == 0
            || self.is_still_picture()
            || is_read_aborted
            || is_at_eof
        {
            return true;
        }
        self.packet_buffer_duration() >= self.buffer_duration_threshold
            && self.queue.count() >= self.buffer_count_threshold
    }

    /// Pull the next decoded frame, feeding queued packets as needed.
    ///
    /// Feeding starts with a single non-filling pass; afterwards filling
    /// passes repeat while they consume at least one packet. A hard decoder
    /// error drops the frame and ends the attempt.
    pub fn receive_next_frame(&self) -> Result<Option<Frame>, MediaError> {
        if self.is_disposed() {
            return Ok(None);
        }
        if matches!(*self.kind.lock().unwrap(), ComponentKind::Subtitle) {
            return self.receive_next_subtitle();
        }

        let mut fed_once = false;
        loop {
            let received = self.decoder.lock().unwrap().receive_frame();
            match received {
                Ok(frame) => {
                    self.extend_duration(&frame);
                    return Ok(Some(frame));
                }
                Err(BackendError::TryAgain) => {
                    let consumed = self.feed_packets(fed_once)?;
                    fed_once = true;
                    if consumed == 0 {
                        // The codec had nothing buffered either.
                        self.has_packets_in_codec.store(false, Ordering::SeqCst);
                        return Ok(None);
                    }
                }
                Err(BackendError::Eof) => {
                    self.flush_codec_buffers();
                    return Ok(None);
                }
                Err(err) => {
                    warn!(
                        "{} stream {}: frame dropped: {}",
                        self.stream.media_type, self.stream.index, err
                    );
                    return Ok(None);
                }
            }
        }
    }

    /// Dequeue packets into the codec. Flush sentinels reset the codec and
    /// are disposed without touching the accounting. On back-pressure the
    /// packet goes back to the head of the queue.
    fn feed_packets(&self, fill: bool) -> Result<usize, MediaError> {
        let mut consumed = 0usize;
        loop {
            let Some(packet) = self.queue.dequeue() else {
                break;
            };
            if packet.is_flush() {
                self.flush_codec_buffers();
                continue;
            }
            let sent = self.decoder.lock().unwrap().send_packet(&packet);
            match sent {
                Ok(()) => {
                    consumed += 1;
                    if !packet.is_empty_data() {
                        self.has_packets_in_codec.store(true, Ordering::SeqCst);
                    }
                    if !fill {
                        break;
                    }
                }
                Err(BackendError::TryAgain) => {
                    self.queue.requeue_front(packet);
                    break;
                }
                Err(err) => {
                    warn!(
                        "{} stream {}: packet dropped: {}",
                        self.stream.media_type, self.stream.index, err
                    );
                }
            }
        }
        Ok(consumed)
    }

    /// Subtitle codecs decode one packet per call; a null input drains.
    fn receive_next_subtitle(&self) -> Result<Option<Frame>, MediaError> {
        loop {
            let Some(packet) = self.queue.dequeue() else {
                return Ok(None);
            };
            if packet.is_flush() {
                self.flush_codec_buffers();
                continue;
            }
            let input = if packet.is_empty_data() {
                None
            } else {
                Some(&packet)
            };
            let decoded = self.decoder.lock().unwrap().decode_subtitle(input);
            match decoded {
                Ok(Some(frame)) => {
                    self.extend_duration(&frame);
                    return Ok(Some(frame));
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!("subtitle stream {}: {}", self.stream.index, err);
                    return Ok(None);
                }
            }
        }
    }

    fn extend_duration(&self, frame: &Frame) {
        let Some(pts) = frame.start_time() else {
            return;
        };
        let end = pts + frame.duration();
        let mut duration = self.duration.lock().unwrap();
        if duration.map(|current| end > current).unwrap_or(true) {
            *duration = Some(end);
        }
    }

    /// Media-type-specific conversion of a frame into a recycled block.
    /// Returns `Ok(false)` when the add should be skipped (wrong media
    /// type, empty conversion, or payload contention).
    pub fn materialize_frame(
        &self,
        frame: Frame,
        block: &Block,
        previous: Option<&Block>,
    ) -> Result<bool, MediaError> {
        let mut kind = self.kind.lock().unwrap();
        match (&mut *kind, frame) {
            (ComponentKind::Audio(state), Frame::Audio(audio)) => {
                self.materialize_audio(state, audio, block, previous)
            }
            (ComponentKind::Video(state), Frame::Video(video)) => {
                self.materialize_video(state, video, block, previous)
            }
            (ComponentKind::Subtitle, Frame::Subtitle(subtitle)) => {
                self.materialize_subtitle(subtitle, block, previous)
            }
            _ => Ok(false),
        }
    }

    fn materialize_audio(
        &self,
        state: &mut AudioState,
        frame: AudioFrame,
        block: &Block,
        previous: Option<&Block>,
    ) -> Result<bool, MediaError> {
        let params = AudioParams {
            sample_rate: frame.sample_rate,
            channels: frame.channels,
        };
        let spec = self.options.audio_filter.as_str();
        let needs_rebuild = match &state.filter {
            // No change in arguments: keep the existing graph.
            Some(chain) => chain.spec != spec || chain.source != params,
            None => !spec.is_empty(),
        };
        if needs_rebuild {
            debug!("rebuilding audio filter graph: {:?}", spec);
            state.filter = if spec.is_empty() {
                None
            } else {
                Some(FilterChain::build(spec, params))
            };
        }

        let mut samples = state.resampler.convert(&frame);
        if let Some(chain) = &state.filter {
            chain.apply(&mut samples);
        }
        if samples.is_empty() {
            return Ok(false);
        }

        let frames = samples.len() / OUTPUT_AUDIO.channels as usize;
        let duration = frames as f64 / OUTPUT_AUDIO.sample_rate as f64;
        let (start_time, guessed) = start_or_previous(frame.pts, previous);

        match block.write_payload() {
            Ok(mut payload) => {
                payload.clear();
                payload.reserve(samples.len() * 4);
                for sample in &samples {
                    payload.extend_from_slice(&sample.to_le_bytes());
                }
            }
            Err(MediaError::Contention(what)) => {
                warn!("audio materialization skipped: contention on {}", what);
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        block.set_meta(BlockMeta {
            start_time,
            duration,
            stream_index: self.stream.index,
            compressed_size: frame.compressed_size,
            is_start_time_guessed: guessed,
            index: 0,
            sample_rate: OUTPUT_AUDIO.sample_rate,
            channels: OUTPUT_AUDIO.channels,
            width: 0,
            height: 0,
        });
        Ok(true)
    }

    fn materialize_video(
        &self,
        state: &mut VideoState,
        frame: VideoFrame,
        block: &Block,
        previous: Option<&Block>,
    ) -> Result<bool, MediaError> {
        let (mut start_time, mut guessed) = start_or_previous(frame.pts, previous);
        // A repeated pts means the demuxer fabricated the timestamp.
        if frame.pts.is_some() && frame.pts == state.last_pts {
            guessed = true;
            if let Some(prev) = previous {
                start_time = prev.end_time();
            }
        }
        state.last_pts = frame.pts;

        let duration = match self.options.video_forced_fps {
            Some(fps) if fps > 0.0 => 1.0 / fps,
            _ if frame.duration > 0.0 => frame.duration,
            _ => self
                .stream
                .video
                .map(|params| 1.0 / params.frames_per_second.max(1.0))
                .unwrap_or(0.0),
        };

        match block.write_payload() {
            Ok(mut payload) => {
                payload.clear();
                payload.extend_from_slice(&frame.data);
            }
            Err(MediaError::Contention(what)) => {
                warn!("video materialization skipped: contention on {}", what);
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        block.set_meta(BlockMeta {
            start_time,
            duration,
            stream_index: self.stream.index,
            compressed_size: frame.compressed_size,
            is_start_time_guessed: guessed,
            index: 0,
            sample_rate: 0,
            channels: 0,
            width: frame.width,
            height: frame.height,
        });
        Ok(true)
    }

    fn materialize_subtitle(
        &self,
        frame: SubtitleFrame,
        block: &Block,
        previous: Option<&Block>,
    ) -> Result<bool, MediaError> {
        let (start_time, guessed) = start_or_previous(frame.pts, previous);
        let duration = if frame.duration > 0.0 {
            frame.duration
        } else {
            SUBTITLE_FALLBACK_DURATION
        };

        match block.write_payload() {
            Ok(mut payload) => {
                payload.clear();
                payload.extend_from_slice(frame.text.as_bytes());
            }
            Err(MediaError::Contention(what)) => {
                warn!("subtitle materialization skipped: contention on {}", what);
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        block.set_meta(BlockMeta {
            start_time,
            duration,
            stream_index: self.stream.index,
            compressed_size: frame.compressed_size,
            is_start_time_guessed: guessed,
            index: 0,
            sample_rate: 0,
            channels: 0,
            width: 0,
            height: 0,
        });
        Ok(true)
    }

    /// Dispose the component: clear packets and flush the codec.
    pub fn dispose(&self) {
        if self.is_disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.clear();
        self.decoder.lock().unwrap().flush();
        self.has_packets_in_codec.store(false, Ordering::SeqCst);
    }
}

/// Start time from the frame's pts, or guessed from the previous block.
fn start_or_previous(pts: Option<f64>, previous: Option<&Block>) -> (f64, bool) {
    match pts {
        Some(pts) => (pts, false),
        None => (previous.map(|block| block.end_time()).unwrap_or(0.0), true),
    }
}
