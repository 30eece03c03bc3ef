//! Demuxer facade: open, read, seek, convert, close.

pub mod component;
pub mod options;
pub mod packets;
pub mod set;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, warn};

use crate::backend::{
    BackendError, Demuxer, Frame, MediaBackend, MediaInput, MediaType, Packet,
};
use crate::blocks::Block;
use crate::container::component::MediaComponent;
use crate::container::options::{ContainerOptions, MediaOptions};
use crate::container::set::{ComponentBufferState, ComponentSet};
use crate::error::MediaError;
use crate::timing::TimingSetup;

/// Soft cap on buffered packet bytes for network streams.
pub(crate) const NETWORK_BUFFER_LENGTH_MAX: u64 = 16 * 1024 * 1024;

/// Owns the demuxer and the component set for one media source.
///
/// Three outer mutexes guard the read, decode, and convert paths. They are
/// only ever taken together during `close`, in that fixed order.
pub struct MediaContainer {
    backend: Arc<dyn MediaBackend>,
    input: Mutex<Option<MediaInput>>,
    uri: String,
    options: ContainerOptions,
    media_options: Arc<MediaOptions>,

    demuxer: Mutex<Option<Box<dyn Demuxer>>>,
    decode_lock: Mutex<()>,
    convert_lock: Mutex<()>,
    components: ComponentSet,

    is_initialized: AtomicBool,
    is_open: AtomicBool,
    is_disposed: AtomicBool,
    is_at_eof: AtomicBool,
    empty_packets_sent: AtomicBool,
    requires_pictures: AtomicBool,

    signal_abort: Arc<AtomicBool>,
    abort_auto_reset: Arc<AtomicBool>,
    timeout_fired: Arc<AtomicBool>,
    read_started: Arc<Mutex<Option<Instant>>>,

    is_live: AtomicBool,
    is_network: AtomicBool,
    is_seekable: AtomicBool,
}

impl MediaContainer {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        input: MediaInput,
        options: ContainerOptions,
        media_options: MediaOptions,
    ) -> Self {
        let uri = match &input {
            MediaInput::Url(url) => options.apply_protocol_prefix(url),
            MediaInput::Stream(stream) => stream.uri().to_string(),
        };
        Self {
            backend,
            input: Mutex::new(Some(input)),
            uri,
            options,
            media_options: Arc::new(media_options),
            demuxer: Mutex::new(None),
            decode_lock: Mutex::new(()),
            convert_lock: Mutex::new(()),
            components: ComponentSet::new(),
            is_initialized: AtomicBool::new(false),
            is_open: AtomicBool::new(false),
            is_disposed: AtomicBool::new(false),
            is_at_eof: AtomicBool::new(false),
            empty_packets_sent: AtomicBool::new(false),
            requires_pictures: AtomicBool::new(false),
            signal_abort: Arc::new(AtomicBool::new(false)),
            abort_auto_reset: Arc::new(AtomicBool::new(false)),
            timeout_fired: Arc::new(AtomicBool::new(false)),
            read_started: Arc::new(Mutex::new(None)),
            is_live: AtomicBool::new(false),
            is_network: AtomicBool::new(false),
            is_seekable: AtomicBool::new(false),
        }
    }

    /// Probe and open the demuxer. May be called once per container.
    pub fn initialize(&self) -> Result<(), MediaError> {
        self.ensure_not_disposed()?;
        if self.is_initialized.swap(true, Ordering::SeqCst) {
            return Err(MediaError::State("container is already initialized".to_string()));
        }

        let input = self
            .input
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| MediaError::State("container input already consumed".to_string()))?;

        let mut demuxer = self.backend.open(input, &self.options)?;

        // Read-interrupt: abort on request or when a read overruns the
        // configured timeout. Auto-reset clears the latch as it fires.
        let signal_abort = self.signal_abort.clone();
        let auto_reset = self.abort_auto_reset.clone();
        let timeout_fired = self.timeout_fired.clone();
        let read_started = self.read_started.clone();
        let read_timeout = self.options.read_timeout;
        demuxer.set_interrupt(Some(Box::new(move || {
            if signal_abort.load(Ordering::SeqCst) {
                if auto_reset.load(Ordering::SeqCst) {
                    signal_abort.store(false, Ordering::SeqCst);
                }
                return true;
            }
            if read_timeout >= 0.0 {
                if let Some(started) = *read_started.lock().unwrap() {
                    if started.elapsed().as_secs_f64() > read_timeout {
                        timeout_fired.store(true, Ordering::SeqCst);
                        return true;
                    }
                }
            }
            false
        })));

        self.is_live.store(demuxer.is_live(), Ordering::SeqCst);
        self.is_network.store(demuxer.is_network(), Ordering::SeqCst);
        self.is_seekable.store(demuxer.is_seekable(), Ordering::SeqCst);
        info!(
            "container initialized: {} ({} streams)",
            self.uri,
            demuxer.streams().len()
        );

        *self.demuxer.lock().unwrap() = Some(demuxer);
        Ok(())
    }

    /// Select streams and build components. May be called once.
    pub fn open(&self) -> Result<(), MediaError> {
        self.ensure_not_disposed()?;
        if !self.is_initialized.load(Ordering::SeqCst) {
            return Err(MediaError::State("container is not initialized".to_string()));
        }
        if self.is_open.swap(true, Ordering::SeqCst) {
            return Err(MediaError::State("container is already open".to_string()));
        }

        let demuxer_guard = self.demuxer.lock().unwrap();
        let demuxer = demuxer_guard
            .as_ref()
            .ok_or_else(|| MediaError::State("demuxer is gone".to_string()))?;
        self.select_streams(demuxer.as_ref())?;
        Ok(())
    }

    /// Build one component per media type from the demuxer's stream table.
    fn select_streams(&self, demuxer: &dyn Demuxer) -> Result<(), MediaError> {
        for media_type in MediaType::ALL {
            let Some(stream) = demuxer
                .streams()
                .iter()
                .find(|stream| stream.media_type == media_type)
            else {
                continue;
            };
            let forced = self
                .media_options
                .decoder_codec
                .get(&stream.index)
                .map(|name| name.as_str());
            if media_type == MediaType::Video {
                if let Some(device) = &self.media_options.video_hardware_device {
                    debug!("video hardware device requested: {}", device);
                }
            }
            let params = self.media_options.decoder_params;
            if params.fast || params.low_delay || params.low_res_index > 0 {
                debug!(
                    "decoder flags for stream {}: fast={} low_delay={} low_res={}",
                    stream.index, params.fast, params.low_delay, params.low_res_index
                );
            }
            match demuxer.create_decoder(stream.index, forced) {
                Ok(decoder) => {
                    debug!(
                        "selected {} stream {} ({})",
                        media_type, stream.index, stream.codec
                    );
                    self.components.register(Arc::new(MediaComponent::new(
                        stream.clone(),
                        decoder,
                        self.media_options.clone(),
                    )));
                }
                Err(err) => {
                    // Non-fatal: the stream is simply not selected.
                    warn!(
                        "no decoder for {} stream {}: {}",
                        media_type, stream.index, err
                    );
                }
            }
        }

        if self.components.is_empty() {
            return Err(MediaError::Config(
                "no decodable streams in container".to_string(),
            ));
        }

        if let Some(video) = self.components.get(MediaType::Video) {
            if video.stream().attached_picture.is_some() {
                self.requires_pictures.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Re-run stream selection, disposing the current components first.
    /// Returns the media types now present.
    pub fn update_components(&self) -> Result<Vec<MediaType>, MediaError> {
        self.ensure_open()?;
        let demuxer_guard = self.demuxer.lock().unwrap();
        let demuxer = demuxer_guard
            .as_ref()
            .ok_or_else(|| MediaError::State("demuxer is gone".to_string()))?;
        self.components.dispose_all();
        self.select_streams(demuxer.as_ref())?;
        Ok(self
            .components
            .all()
            .iter()
            .map(|component| component.media_type())
            .collect())
    }

    /// Read one packet from the demuxer and dispatch it. Returns the media
    /// type that received the packet, or `None` for control outcomes
    /// (attached pictures only, data packets, end of stream).
    pub fn read(&self) -> Result<Option<MediaType>, MediaError> {
        self.ensure_open()?;
        let mut demuxer_guard = self.demuxer.lock().unwrap();
        let demuxer = demuxer_guard
            .as_mut()
            .ok_or_else(|| MediaError::State("demuxer is gone".to_string()))?;

        // Attached pictures re-enter the pipe before any decoded frames.
        if self.requires_pictures.swap(false, Ordering::SeqCst) {
            self.send_attached_picture();
        }

        self.read_locked(demuxer.as_mut())
    }

    fn send_attached_picture(&self) {
        let Some(video) = self.components.get(MediaType::Video) else {
            return;
        };
        let Some(picture) = video.stream().attached_picture.clone() else {
            return;
        };
        debug!("re-emitting attached picture");
        video.send_packet(Some(picture));
        video.send_empty_packet();
    }

    /// Read and dispatch with the demuxer lock already held.
    fn read_locked(&self, demuxer: &mut dyn Demuxer) -> Result<Option<MediaType>, MediaError> {
        *self.read_started.lock().unwrap() = Some(Instant::now());
        let result = demuxer.read_packet();
        *self.read_started.lock().unwrap() = None;

        let packet = match result {
            Ok(packet) => packet,
            Err(BackendError::Eof) => {
                if !self.empty_packets_sent.swap(true, Ordering::SeqCst) {
                    for component in self.components.all() {
                        component.send_empty_packet();
                    }
                }
                self.is_at_eof.store(true, Ordering::SeqCst);
                return Ok(None);
            }
            Err(BackendError::Aborted) => {
                if self.timeout_fired.swap(false, Ordering::SeqCst) {
                    return Err(MediaError::ReadTimeout);
                }
                return Ok(None);
            }
            Err(err) => return Err(MediaError::Backend(err)),
        };

        // Data-packet detour: streams outside the known media tables are
        // claimed here and disposed.
        if self.handle_data_packet(demuxer, &packet) {
            return Ok(None);
        }

        Ok(self.components.send_packet(packet))
    }

    fn handle_data_packet(&self, demuxer: &dyn Demuxer, packet: &Packet) -> bool {
        demuxer
            .streams()
            .iter()
            .all(|stream| stream.index != packet.stream_index)
    }

    /// Receive at most one frame from each component.
    pub fn decode(&self) -> Result<Vec<Frame>, MediaError> {
        self.ensure_open()?;
        let _decode = self.decode_lock.lock().unwrap();
        let mut frames = Vec::new();
        for component in self.components.all() {
            if let Some(frame) = component.receive_next_frame()? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Materialize a frame into a block via the owning component.
    pub fn convert(
        &self,
        frame: Frame,
        block: &Block,
        previous: Option<&Block>,
    ) -> Result<bool, MediaError> {
        self.ensure_open()?;
        let _convert = self.convert_lock.lock().unwrap();
        let Some(component) = self.components.get(frame.media_type()) else {
            return Ok(false);
        };
        component.materialize_frame(frame, block, previous)
    }

    /// Seek the seekable component to the closest key frame at or before
    /// `position` and decode forward to the last frame not past it.
    pub fn seek(&self, position: f64) -> Result<Option<Frame>, MediaError> {
        self.ensure_open()?;
        if !self.is_seekable() {
            return Err(MediaError::Seek("container is not seekable".to_string()));
        }
        let seekable = self
            .components
            .seekable()
            .ok_or_else(|| MediaError::Seek("no seekable component".to_string()))?;

        let mut demuxer_guard = self.demuxer.lock().unwrap();
        let demuxer = demuxer_guard
            .as_mut()
            .ok_or_else(|| MediaError::State("demuxer is gone".to_string()))?;

        let start = seekable.start_time().unwrap_or(0.0);
        let end = seekable
            .duration()
            .map(|duration| start + duration)
            .unwrap_or(f64::MAX);
        let position = position.clamp(start, end);

        if position <= start {
            return self.seek_to_start(demuxer.as_mut(), &seekable, start).map(|_| None);
        }

        let stream_index = seekable.stream_index();
        let mut relative_target = position;
        let result = loop {
            if let Err(err) = demuxer.seek(stream_index, relative_target) {
                self.flush_after_seek();
                return Err(MediaError::Seek(err.to_string()));
            }
            self.flush_after_seek();

            // Decode forward until a frame lands at or before the target.
            let mut outcome: Option<Frame> = None;
            let mut overshoot = false;
            loop {
                let received = {
                    let _decode = self.decode_lock.lock().unwrap();
                    seekable.receive_next_frame()?
                };
                match received {
                    Some(frame) => {
                        let frame_start = frame.start_time().unwrap_or(relative_target);
                        if frame_start <= position {
                            outcome = Some(frame);
                        } else {
                            overshoot = true;
                        }
                        break;
                    }
                    None => {
                        if self.is_at_end_of_stream() {
                            break;
                        }
                        match self.read_locked(demuxer.as_mut()) {
                            Ok(_) => {}
                            Err(MediaError::ReadTimeout) => {
                                warn!("read timed out while seeking");
                                break;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
            }

            if let Some(frame) = outcome {
                break Some(frame);
            }
            if overshoot && relative_target > start {
                // The key frame landed past the target; widen the window.
                relative_target = (relative_target - 1.0).max(start);
                continue;
            }
            break None;
        };

        self.requires_pictures.store(true, Ordering::SeqCst);
        Ok(result)
    }

    fn seek_to_start(
        &self,
        demuxer: &mut dyn Demuxer,
        seekable: &Arc<MediaComponent>,
        start: f64,
    ) -> Result<(), MediaError> {
        demuxer
            .seek(seekable.stream_index(), start)
            .map_err(|err| MediaError::Seek(err.to_string()))?;
        self.flush_after_seek();
        self.requires_pictures.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Clear all packet queues and codec buffers, and rearm EOS tracking.
    fn flush_after_seek(&self) {
        for component in self.components.all() {
            component.clear_queued_packets(true);
        }
        self.is_at_eof.store(false, Ordering::SeqCst);
        self.empty_packets_sent.store(false, Ordering::SeqCst);
    }

    /// Interrupt any in-flight demuxer read. With `auto_reset`, the abort
    /// latch clears itself on the next read-interrupt poll.
    pub fn signal_abort_reads(&self, auto_reset: bool) {
        self.abort_auto_reset.store(auto_reset, Ordering::SeqCst);
        self.signal_abort.store(true, Ordering::SeqCst);
    }

    /// Clear the abort latch so reads may proceed again.
    pub fn signal_resume_reads(&self) {
        self.signal_abort.store(false, Ordering::SeqCst);
        self.timeout_fired.store(false, Ordering::SeqCst);
    }

    /// Whether the read worker should keep pulling packets.
    pub fn should_read_more(&self) -> bool {
        if self.is_disposed() || self.is_read_aborted() || self.is_at_end_of_stream() {
            return false;
        }
        if self.is_live() {
            return true;
        }
        if self.is_network() && self.components.buffer_state().length >= NETWORK_BUFFER_LENGTH_MAX {
            return false;
        }
        !self
            .components
            .have_enough_packets(self.is_read_aborted(), self.is_at_end_of_stream())
    }

    pub fn components(&self) -> &ComponentSet {
        &self.components
    }

    pub fn buffer_state(&self) -> ComponentBufferState {
        self.components.buffer_state()
    }

    pub fn timing_setup(&self) -> TimingSetup {
        self.components.timing_setup(
            self.media_options.is_time_sync_disabled,
            self.is_live(),
            self.is_seekable(),
        )
    }

    pub fn media_options(&self) -> &Arc<MediaOptions> {
        &self.media_options
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst) && !self.is_disposed()
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::SeqCst)
    }

    pub fn is_at_end_of_stream(&self) -> bool {
        self.is_at_eof.load(Ordering::SeqCst)
    }

    pub fn is_read_aborted(&self) -> bool {
        self.signal_abort.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.is_live.load(Ordering::SeqCst)
    }

    pub fn is_network(&self) -> bool {
        self.is_network.load(Ordering::SeqCst)
    }

    pub fn is_seekable(&self) -> bool {
        self.is_seekable.load(Ordering::SeqCst)
    }

    fn ensure_not_disposed(&self) -> Result<(), MediaError> {
        if self.is_disposed() {
            return Err(MediaError::State("container is disposed".to_string()));
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        self.ensure_not_disposed()?;
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(MediaError::State("container is not open".to_string()));
        }
        Ok(())
    }

    /// Idempotent teardown: components first, then the demuxer and its
    /// input. Takes the read, decode, and convert locks in that order.
    pub fn close(&self) {
        if self.is_disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut demuxer_guard = self.demuxer.lock().unwrap();
        let _decode = self.decode_lock.lock().unwrap();
        let _convert = self.convert_lock.lock().unwrap();

        self.components.dispose_all();
        *demuxer_guard = None;
        *self.input.lock().unwrap() = None;
        info!("container closed: {}", self.uri);
    }
}

impl Drop for MediaContainer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimAudio, SimBackend, SimSpec, SimVideo};

    fn open_container(spec: SimSpec) -> MediaContainer {
        let backend = Arc::new(SimBackend::new(spec));
        let container = MediaContainer::new(
            backend,
            MediaInput::Url("sim://clip".to_string()),
            ContainerOptions::default(),
            MediaOptions::default(),
        );
        container.initialize().unwrap();
        container.open().unwrap();
        container
    }

    fn av_spec() -> SimSpec {
        SimSpec {
            duration: 2.0,
            video: Some(SimVideo::default()),
            audio: Some(SimAudio::default()),
            ..SimSpec::default()
        }
    }

    #[test]
    fn initialize_and_open_are_once_only() {
        let container = open_container(av_spec());
        assert!(matches!(
            container.initialize(),
            Err(MediaError::State(_))
        ));
        assert!(matches!(container.open(), Err(MediaError::State(_))));
    }

    #[test]
    fn read_dispatches_packets_to_components() {
        let container = open_container(av_spec());
        let mut media_types = Vec::new();
        for _ in 0..8 {
            if let Some(media_type) = container.read().unwrap() {
                media_types.push(media_type);
            }
        }
        assert!(media_types.contains(&MediaType::Audio));
        assert!(media_types.contains(&MediaType::Video));
        assert!(container.buffer_state().count > 0);
    }

    #[test]
    fn eof_sends_empty_packets_once() {
        let container = open_container(SimSpec {
            duration: 0.1,
            audio: Some(SimAudio::default()),
            video: None,
            ..SimSpec::default()
        });
        while !container.is_at_end_of_stream() {
            container.read().unwrap();
        }
        let audio = container.components().get(MediaType::Audio).unwrap();
        let count_at_eof = audio.packet_count();
        // Further reads at EOF add nothing.
        container.read().unwrap();
        assert_eq!(audio.packet_count(), count_at_eof);
    }

    #[test]
    fn seek_returns_a_frame_at_or_before_the_target() {
        let container = open_container(SimSpec {
            duration: 10.0,
            ..av_spec()
        });
        let frame = container.seek(5.0).unwrap().expect("seek frame");
        let start = frame.start_time().unwrap();
        assert!(start <= 5.0);
        assert_eq!(frame.media_type(), MediaType::Video);
        assert!(!container.is_at_end_of_stream());
    }

    #[test]
    fn seek_to_or_before_start_flushes_and_returns_none() {
        let container = open_container(av_spec());
        for _ in 0..16 {
            container.read().unwrap();
        }
        let frame = container.seek(0.0).unwrap();
        assert!(frame.is_none());
        assert_eq!(container.buffer_state().count, 0);
    }

    #[test]
    fn attached_picture_is_emitted_before_data_after_seek() {
        let spec = SimSpec {
            duration: 10.0,
            video: Some(SimVideo {
                with_attached_picture: true,
                ..SimVideo::default()
            }),
            audio: None,
            ..SimSpec::default()
        };
        let container = open_container(spec);
        let video = container.components().get(MediaType::Video).unwrap();

        // Initial open requires pictures: first read pushes picture + empty.
        container.read().unwrap();
        assert!(video.packet_count() >= 2);

        container.seek(5.0).unwrap();
        let count_after_seek = video.packet_count();
        container.read().unwrap();
        // Picture plus drain sentinel plus the demuxed packet.
        assert!(video.packet_count() >= count_after_seek + 2);
    }

    #[test]
    fn abort_without_auto_reset_gates_reads() {
        let container = open_container(av_spec());
        container.signal_abort_reads(false);
        assert!(container.is_read_aborted());
        assert_eq!(container.read().unwrap(), None);
        assert!(!container.should_read_more());

        container.signal_resume_reads();
        assert!(!container.is_read_aborted());
        assert!(container.should_read_more());
    }

    #[test]
    fn abort_with_auto_reset_clears_after_one_read() {
        let container = open_container(av_spec());
        container.signal_abort_reads(true);
        assert_eq!(container.read().unwrap(), None);
        // The interrupt cleared the latch while aborting.
        assert!(!container.is_read_aborted());
        assert!(container.read().unwrap().is_some());
    }

    #[test]
    fn close_is_idempotent_and_disposes_components() {
        let container = open_container(av_spec());
        container.close();
        container.close();
        assert!(container.is_disposed());
        assert!(matches!(container.read(), Err(MediaError::State(_))));
    }

    #[test]
    fn convert_routes_frames_to_the_owning_component() {
        let container = open_container(av_spec());
        for _ in 0..8 {
            container.read().unwrap();
        }
        let frames = container.decode().unwrap();
        assert!(!frames.is_empty());
        let block = Block::new(0, frames[0].media_type());
        let frame = frames.into_iter().next().unwrap();
        assert!(container.convert(frame, &block, None).unwrap());
    }
}
