//! Symphonia-backed container and audio codec adapter.
//!
//! Probing follows the usual pattern: hint from the forced format or the
//! path extension, then a no-hint fallback probe. Only audio tracks get
//! bundled decoders; video and subtitle streams require a backend that
//! provides them.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymError;
use symphonia::core::formats::{
    FormatOptions, FormatReader, Packet as SymPacket, SeekMode, SeekTo,
};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::backend::{
    AudioFrame, AudioParams, BackendError, Decoder, Demuxer, Frame, InputStream,
    InterruptCallback, MediaBackend, MediaInput, MediaType, Packet, StreamInfo,
};
use crate::container::options::ContainerOptions;
use crate::time::TimeBase;

/// Backend over the pure-Rust symphonia demuxers and audio codecs.
#[derive(Debug, Default)]
pub struct SymphoniaBackend;

impl MediaBackend for SymphoniaBackend {
    fn open(
        &self,
        input: MediaInput,
        options: &ContainerOptions,
    ) -> Result<Box<dyn Demuxer>, BackendError> {
        for key in options.private_options.keys() {
            warn!("private option {:?} is not used by the symphonia backend", key);
        }

        let (source, extension, seekable, hook) = open_source(input)?;
        let demuxer = probe_source(source, extension.as_deref(), options, seekable)?;
        if let Some(stream) = hook {
            stream.lock().unwrap().on_initialized();
        }
        Ok(Box::new(demuxer))
    }
}

type SharedInputStream = Arc<Mutex<Box<dyn InputStream>>>;

fn open_source(
    input: MediaInput,
) -> Result<
    (
        Box<dyn MediaSource>,
        Option<String>,
        bool,
        Option<SharedInputStream>,
    ),
    BackendError,
> {
    match input {
        MediaInput::Url(url) => {
            let path_str = url.strip_prefix("file://").unwrap_or(&url);
            if path_str.contains("://") {
                return Err(BackendError::Unsupported(format!(
                    "protocol not handled by the symphonia backend: {}",
                    path_str
                )));
            }
            let path = Path::new(path_str);
            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_lowercase());
            let file = File::open(path)?;
            Ok((Box::new(file), extension, true, None))
        }
        MediaInput::Stream(mut stream) => {
            stream.on_initializing();
            let extension = Path::new(stream.uri())
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_lowercase());
            let seekable = stream.can_seek();
            let shared: SharedInputStream = Arc::new(Mutex::new(stream));
            let source = InputStreamSource {
                inner: shared.clone(),
            };
            Ok((Box::new(source), extension, seekable, Some(shared)))
        }
    }
}

/// Adapts a host [`InputStream`] to symphonia's `MediaSource`. The shared
/// handle lets the backend fire `on_initialized` after the stream has moved
/// into the format reader.
struct InputStreamSource {
    inner: SharedInputStream,
}

impl std::io::Read for InputStreamSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.lock().unwrap().read(buf)
    }
}

impl std::io::Seek for InputStreamSource {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.lock().unwrap().seek(pos)
    }
}

impl MediaSource for InputStreamSource {
    fn is_seekable(&self) -> bool {
        self.inner.lock().unwrap().can_seek()
    }

    fn byte_len(&self) -> Option<u64> {
        self.inner.lock().unwrap().byte_length()
    }
}

fn probe_source(
    source: Box<dyn MediaSource>,
    extension: Option<&str>,
    options: &ContainerOptions,
    seekable: bool,
) -> Result<SymphoniaDemuxer, BackendError> {
    // The forced format wins over the path extension; the probe itself
    // still scores every registered reader, so a wrong hint is recoverable.
    let hint_name = options
        .forced_input_format
        .clone()
        .or_else(|| extension.map(|ext| ext.to_string()));
    let mut hint = Hint::new();
    if let Some(name) = &hint_name {
        hint.with_extension(name);
    }

    let mss = MediaSourceStream::new(source, Default::default());
    let format_opts = FormatOptions::default();
    let metadata_opts = MetadataOptions::default();

    match symphonia::default::get_probe().format(&hint, mss, &format_opts, &metadata_opts) {
        Ok(probed) => {
            debug!("container probed with hint {:?}", hint_name);
            SymphoniaDemuxer::new(probed.format, seekable)
        }
        Err(err) => Err(map_error(err)),
    }
}

/// Demuxer over a symphonia `FormatReader`.
pub struct SymphoniaDemuxer {
    format: Box<dyn FormatReader>,
    streams: Vec<StreamInfo>,
    codec_params: Vec<CodecParameters>,
    track_ids: Vec<u32>,
    by_track: HashMap<u32, usize>,
    interrupt: Mutex<Option<InterruptCallback>>,
    seekable: bool,
}

impl SymphoniaDemuxer {
    fn new(format: Box<dyn FormatReader>, seekable: bool) -> Result<Self, BackendError> {
        let mut streams = Vec::new();
        let mut codec_params = Vec::new();
        let mut track_ids = Vec::new();
        let mut by_track = HashMap::new();

        for track in format.tracks() {
            let params = &track.codec_params;
            if params.codec == CODEC_TYPE_NULL || params.sample_rate.is_none() {
                debug!("skipping non-audio track {}", track.id);
                continue;
            }
            let time_base = params
                .time_base
                .map(|tb| TimeBase::new(tb.numer, tb.denom))
                .unwrap_or_default();
            let start_time = params
                .time_base
                .map(|tb| {
                    let time = tb.calc_time(params.start_ts);
                    time.seconds as f64 + time.frac
                })
                .filter(|start| *start > 0.0);
            let duration = match (params.time_base, params.n_frames) {
                (Some(tb), Some(frames)) => {
                    let time = tb.calc_time(params.start_ts + frames);
                    Some(time.seconds as f64 + time.frac)
                }
                _ => None,
            };
            let index = streams.len();
            streams.push(StreamInfo {
                index,
                media_type: MediaType::Audio,
                codec: codec_name(params),
                start_time,
                duration,
                time_base,
                is_still_picture: false,
                attached_picture: None,
                audio: Some(AudioParams {
                    sample_rate: params.sample_rate.unwrap_or(44_100),
                    channels: params.channels.map(|ch| ch.count() as u16).unwrap_or(2),
                }),
                video: None,
            });
            codec_params.push(params.clone());
            track_ids.push(track.id);
            by_track.insert(track.id, index);
        }

        if streams.is_empty() {
            return Err(BackendError::Unsupported(
                "container exposes no decodable streams".to_string(),
            ));
        }

        Ok(Self {
            format,
            streams,
            codec_params,
            track_ids,
            by_track,
            interrupt: Mutex::new(None),
            seekable,
        })
    }
}

impl Demuxer for SymphoniaDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Packet, BackendError> {
        loop {
            // Symphonia reads are not interruptible mid-call; the callback
            // is honored at packet granularity.
            if let Some(callback) = self.interrupt.lock().unwrap().as_ref() {
                if callback() {
                    return Err(BackendError::Aborted);
                }
            }

            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(err) => return Err(map_error(err)),
            };
            let Some(&index) = self.by_track.get(&packet.track_id()) else {
                continue;
            };
            let time_base = self.streams[index].time_base;
            return Ok(Packet::new_data(
                index,
                Some(packet.ts() as i64),
                packet.dur as i64,
                true,
                time_base,
                packet.data.into_vec(),
            ));
        }
    }

    fn seek(&mut self, stream_index: usize, seconds: f64) -> Result<(), BackendError> {
        let track_id = *self
            .track_ids
            .get(stream_index)
            .ok_or_else(|| BackendError::Unsupported("unknown stream index".to_string()))?;
        let seconds = seconds.max(0.0);
        let time = Time::new(seconds.floor() as u64, seconds.fract());
        self.format
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time,
                    track_id: Some(track_id),
                },
            )
            .map(|_| ())
            .map_err(map_error)
    }

    fn set_interrupt(&mut self, callback: Option<InterruptCallback>) {
        *self.interrupt.lock().unwrap() = callback;
    }

    fn create_decoder(
        &self,
        stream_index: usize,
        forced_codec: Option<&str>,
    ) -> Result<Box<dyn Decoder>, BackendError> {
        if let Some(name) = forced_codec {
            warn!("forced decoder {:?} ignored; symphonia selects by codec id", name);
        }
        let params = self
            .codec_params
            .get(stream_index)
            .ok_or_else(|| BackendError::Unsupported("unknown stream index".to_string()))?;
        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(map_error)?;
        Ok(Box::new(SymphoniaAudioDecoder {
            decoder,
            stream_index,
            track_id: self.track_ids[stream_index],
            time_base: self.streams[stream_index].time_base,
            pending: None,
            draining: false,
        }))
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }
}

/// Send/receive shim over a synchronous symphonia audio decoder.
struct SymphoniaAudioDecoder {
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    stream_index: usize,
    track_id: u32,
    time_base: TimeBase,
    pending: Option<Packet>,
    draining: bool,
}

impl Decoder for SymphoniaAudioDecoder {
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
        let Some(packet) = self.pending.take() else {
            if self.draining {
                return Err(BackendError::Eof);
            }
            return Err(BackendError::TryAgain);
        };

        let compressed_size = packet.size();
        let pts = packet.pts;
        let sym_packet = SymPacket::new_from_boxed_slice(
            self.track_id,
            pts.unwrap_or(0).max(0) as u64,
            packet.duration.max(0) as u64,
            packet.data.into_boxed_slice(),
        );

        let decoded = match self.decoder.decode(&sym_packet) {
            Ok(decoded) => decoded,
            Err(SymError::DecodeError(msg)) => {
                return Err(BackendError::Decode(msg.to_string()));
            }
            Err(err) => return Err(map_error(err)),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count() as u16;
        let frames = decoded.frames();
        let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let duration = if spec.rate > 0 {
            frames as f64 / spec.rate as f64
        } else {
            0.0
        };

        Ok(Frame::Audio(AudioFrame {
            pts: pts.map(|ts| self.time_base.to_seconds(ts)),
            duration,
            sample_rate: spec.rate,
            channels,
            samples: sample_buf.samples().to_vec(),
            compressed_size,
        }))
    }

    fn flush(&mut self) {
        self.decoder.reset();
        self.pending = None;
        self.draining = false;
        debug!("decoder flushed for stream {}", self.stream_index);
    }
}

fn codec_name(params: &CodecParameters) -> String {
    symphonia::default::get_codecs()
        .get_codec(params.codec)
        .map(|descriptor| descriptor.short_name.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn map_error(err: SymError) -> BackendError {
    match err {
        SymError::IoError(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            BackendError::Eof
        }
        SymError::IoError(io) => BackendError::Io(io),
        SymError::ResetRequired => BackendError::Eof,
        SymError::SeekError(_) => BackendError::Unsupported("seek not supported".to_string()),
        SymError::Unsupported(what) => BackendError::Unsupported(what.to_string()),
        SymError::DecodeError(msg) => BackendError::Decode(msg.to_string()),
        SymError::LimitError(msg) => BackendError::Decode(msg.to_string()),
    }
}
