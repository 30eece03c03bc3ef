//! Engine facade: commands, observed state, and worker lifecycle.

pub mod events;
pub mod render_targets;
pub mod workers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::backend::{MediaBackend, MediaInput, MediaType, StreamInfo};
use crate::blocks::BlockBuffer;
use crate::container::options::{ContainerOptions, MediaOptions};
use crate::container::{MediaContainer, NETWORK_BUFFER_LENGTH_MAX};
use crate::error::MediaError;
use crate::playback::events::{event_channel, EngineEvents, EventSink, MediaEvent};
use crate::playback::render_targets::RendererSet;
use crate::playback::workers::decode::spawn_decode_worker;
use crate::playback::workers::read::spawn_read_worker;
use crate::playback::workers::render::spawn_render_worker;
use crate::playback::workers::{StepTimer, Worker};
use crate::timing::TimingController;

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Close,
    Play,
    Pause,
    Stop,
}

/// Block-buffer capacity per media type.
fn buffer_capacity(media_type: MediaType) -> usize {
    match media_type {
        MediaType::Audio => 64,
        MediaType::Video => 30,
        MediaType::Subtitle => 8,
    }
}

/// State shared between the engine facade and its workers.
pub(crate) struct PlaybackShared {
    state: Mutex<MediaState>,
    pub is_seeking: AtomicBool,
    pub is_sync_buffering: AtomicBool,
    pub has_media_ended: AtomicBool,
    pub has_decoding_ended: AtomicBool,
    pub pending_commands: AtomicBool,
    pub decoding_bit_rate: Mutex<f64>,
    pub events: EventSink,
}

impl PlaybackShared {
    pub fn new(events: EventSink) -> Self {
        Self {
            state: Mutex::new(MediaState::Close),
            is_seeking: AtomicBool::new(false),
            is_sync_buffering: AtomicBool::new(false),
            has_media_ended: AtomicBool::new(false),
            has_decoding_ended: AtomicBool::new(false),
            pending_commands: AtomicBool::new(false),
            decoding_bit_rate: Mutex::new(0.0),
            events,
        }
    }

    pub fn state(&self) -> MediaState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, new: MediaState) {
        let old = {
            let mut state = self.state.lock().unwrap();
            let old = *state;
            *state = new;
            old
        };
        if old != new {
            self.events.emit(MediaEvent::MediaStateChanged { old, new });
        }
    }
}

/// Buffering progress in `0.0..=1.0`. Saturates once the stream is fully
/// read or decoded.
pub(crate) fn buffering_progress(container: &MediaContainer, shared: &PlaybackShared) -> f64 {
    if container.is_at_end_of_stream() || shared.has_decoding_ended.load(Ordering::SeqCst) {
        return 1.0;
    }
    let state = container.buffer_state();
    if state.count_threshold == 0 {
        return 1.0;
    }
    (state.count as f64 / state.count_threshold as f64).min(1.0)
}

/// Per-open playback resources: the container, its clocks, and one block
/// buffer per media type.
pub(crate) struct PlaybackSession {
    pub container: Arc<MediaContainer>,
    pub timing: Arc<TimingController>,
    buffers: [Arc<BlockBuffer>; 3],
}

impl PlaybackSession {
    pub fn new(container: Arc<MediaContainer>, timing: Arc<TimingController>) -> Self {
        let buffers = [
            Arc::new(BlockBuffer::new(
                MediaType::Audio,
                buffer_capacity(MediaType::Audio),
            )),
            Arc::new(BlockBuffer::new(
                MediaType::Video,
                buffer_capacity(MediaType::Video),
            )),
            Arc::new(BlockBuffer::new(
                MediaType::Subtitle,
                buffer_capacity(MediaType::Subtitle),
            )),
        ];
        Self {
            container,
            timing,
            buffers,
        }
    }

    /// Buffer for a media type; meaningful only when a component exists.
    pub fn buffer(&self, media_type: MediaType) -> Option<&Arc<BlockBuffer>> {
        self.container
            .components()
            .get(media_type)
            .map(|_| &self.buffers[media_type.index()])
    }

    /// The media type whose buffer and clock anchor rendering.
    pub fn main_type(&self) -> Option<MediaType> {
        self.container
            .components()
            .seekable()
            .map(|component| component.media_type())
    }

    pub fn clear_buffers(&self) {
        for buffer in &self.buffers {
            buffer.clear();
        }
    }
}

struct ActiveSession {
    session: Arc<PlaybackSession>,
    _step_timer: StepTimer,
    read: Worker,
    decode: Worker,
    render: Worker,
}

/// Clears the pending-command flag when a command finishes.
struct CommandGuard<'a>(&'a AtomicBool);

impl<'a> CommandGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for CommandGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The media playback engine.
///
/// Commands are expected to arrive serialized (the host's command queue is
/// external); a command mutex still guards against accidental overlap.
/// Everything observable is polled through the getters or received through
/// the event channel returned by [`MediaEngine::new`].
pub struct MediaEngine {
    backend: Arc<dyn MediaBackend>,
    container_options: Mutex<ContainerOptions>,
    media_options: Mutex<MediaOptions>,
    renderers: Mutex<Option<RendererSet>>,
    shared: Arc<PlaybackShared>,
    active: Mutex<Option<ActiveSession>>,
    command_lock: Mutex<()>,
}

impl MediaEngine {
    pub fn new(backend: Arc<dyn MediaBackend>) -> (Self, EngineEvents) {
        let (sink, events) = event_channel();
        (
            Self {
                backend,
                container_options: Mutex::new(ContainerOptions::default()),
                media_options: Mutex::new(MediaOptions::default()),
                renderers: Mutex::new(None),
                shared: Arc::new(PlaybackShared::new(sink)),
                active: Mutex::new(None),
                command_lock: Mutex::new(()),
            },
            events,
        )
    }

    /// Install renderers; applies to the next `open`.
    pub fn set_renderers(&self, renderers: RendererSet) {
        *self.renderers.lock().unwrap() = Some(renderers);
    }

    /// Container options; apply to the next `open`.
    pub fn set_container_options(&self, options: ContainerOptions) {
        *self.container_options.lock().unwrap() = options;
    }

    /// Per-open media options; apply to the next `open`.
    pub fn set_media_options(&self, options: MediaOptions) {
        *self.media_options.lock().unwrap() = options;
    }

    /// Open a media source and start the pipeline workers. The engine lands
    /// in the `Stop` state, pre-buffering until `play`.
    pub fn open(&self, input: MediaInput) -> Result<(), MediaError> {
        let _command = self.command_lock.lock().unwrap();
        let _pending = CommandGuard::new(&self.shared.pending_commands);

        if self.active.lock().unwrap().is_some() {
            return Err(MediaError::State(
                "close the current media before opening another".to_string(),
            ));
        }

        let container = Arc::new(MediaContainer::new(
            self.backend.clone(),
            input,
            self.container_options.lock().unwrap().clone(),
            self.media_options.lock().unwrap().clone(),
        ));
        container.initialize()?;
        container.open()?;

        let timing = Arc::new(TimingController::new());
        timing.setup(&container.timing_setup());

        let session = Arc::new(PlaybackSession::new(container, timing));
        let step_timer = StepTimer::new();
        let renderers = self.renderers.lock().unwrap().take().unwrap_or_default();

        self.shared.is_seeking.store(false, Ordering::SeqCst);
        self.shared.is_sync_buffering.store(false, Ordering::SeqCst);
        self.shared.has_media_ended.store(false, Ordering::SeqCst);
        self.shared.has_decoding_ended.store(false, Ordering::SeqCst);

        let read = spawn_read_worker(session.clone(), self.shared.clone(), step_timer.handle());
        let decode = spawn_decode_worker(session.clone(), self.shared.clone(), step_timer.handle());
        let render = spawn_render_worker(session.clone(), self.shared.clone(), renderers);

        info!("media opened: {}", session.container.uri());
        *self.active.lock().unwrap() = Some(ActiveSession {
            session,
            _step_timer: step_timer,
            read,
            decode,
            render,
        });
        self.shared.set_state(MediaState::Stop);
        Ok(())
    }

    /// Stop the workers and release the media. Idempotent.
    pub fn close(&self) {
        let _command = self.command_lock.lock().unwrap();
        let _pending = CommandGuard::new(&self.shared.pending_commands);

        let Some(active) = self.active.lock().unwrap().take() else {
            self.shared.set_state(MediaState::Close);
            return;
        };

        // Unblock any in-flight demuxer read before joining the workers.
        active.session.container.signal_abort_reads(false);
        active.render.stop();
        active.decode.stop();
        active.read.stop();
        active.session.container.close();
        self.shared.set_state(MediaState::Close);
    }

    /// Begin or resume playback.
    pub fn play(&self) -> Result<(), MediaError> {
        let _command = self.command_lock.lock().unwrap();
        let _pending = CommandGuard::new(&self.shared.pending_commands);
        let session = self.require_session()?;

        // Playing past the end restarts from the beginning.
        if self.shared.has_media_ended.load(Ordering::SeqCst) {
            self.seek_session(&session, 0.0)?;
            self.shared.has_media_ended.store(false, Ordering::SeqCst);
        }
        self.shared.set_state(MediaState::Play);
        Ok(())
    }

    /// Pause playback, freezing all clocks. Idempotent.
    pub fn pause(&self) -> Result<(), MediaError> {
        let _command = self.command_lock.lock().unwrap();
        let _pending = CommandGuard::new(&self.shared.pending_commands);
        let session = self.require_session()?;
        session.timing.pause(None);
        self.shared.set_state(MediaState::Pause);
        Ok(())
    }

    /// Stop playback and rewind to the start.
    pub fn stop(&self) -> Result<(), MediaError> {
        let _command = self.command_lock.lock().unwrap();
        let _pending = CommandGuard::new(&self.shared.pending_commands);
        let session = self.require_session()?;
        session.timing.pause(None);
        self.seek_session(&session, 0.0)?;
        session.timing.reset(None);
        self.shared.has_media_ended.store(false, Ordering::SeqCst);
        self.shared.set_state(MediaState::Stop);
        Ok(())
    }

    /// Seek to `position` seconds. The playback state is preserved.
    pub fn seek(&self, position: f64) -> Result<(), MediaError> {
        let _command = self.command_lock.lock().unwrap();
        let _pending = CommandGuard::new(&self.shared.pending_commands);
        let session = self.require_session()?;
        self.seek_session(&session, position)
    }

    fn seek_session(&self, session: &Arc<PlaybackSession>, position: f64) -> Result<(), MediaError> {
        self.shared.is_seeking.store(true, Ordering::SeqCst);
        session.timing.pause(None);

        let result = session.container.seek(position);
        session.clear_buffers();

        match result {
            Ok(frame) => {
                let target = self.clamp_to_media(session, position);
                if let Some(frame) = &frame {
                    info!(
                        "seek to {:.3}s landed on a frame at {:?}",
                        target,
                        frame.start_time()
                    );
                }
                session.timing.update(None, target);
                self.shared.has_media_ended.store(false, Ordering::SeqCst);
                self.shared.has_decoding_ended.store(false, Ordering::SeqCst);
                self.shared.is_seeking.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                warn!("seek to {:.3}s failed: {}", position, err);
                self.shared.is_seeking.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn clamp_to_media(&self, session: &PlaybackSession, position: f64) -> f64 {
        let Some(seekable) = session.container.components().seekable() else {
            return position.max(0.0);
        };
        let start = seekable.start_time().unwrap_or(0.0);
        let end = seekable
            .duration()
            .map(|duration| start + duration)
            .unwrap_or(f64::MAX);
        position.clamp(start, end)
    }

    /// While paused, advance to the next block of the main buffer.
    pub fn step_forward(&self) -> Result<(), MediaError> {
        self.step(true)
    }

    /// While paused, go back one block of the main buffer.
    pub fn step_backward(&self) -> Result<(), MediaError> {
        self.step(false)
    }

    fn step(&self, forward: bool) -> Result<(), MediaError> {
        let _command = self.command_lock.lock().unwrap();
        let _pending = CommandGuard::new(&self.shared.pending_commands);
        let session = self.require_session()?;
        session.timing.pause(None);
        self.shared.set_state(MediaState::Pause);

        let Some(main_type) = session.main_type() else {
            return Ok(());
        };
        let Some(buffer) = session.buffer(main_type) else {
            return Ok(());
        };
        let position = session.timing.position(Some(main_type));
        let (previous, next, _current) = buffer.neighbors(position);
        let target = if forward { next } else { previous };
        if let Some(block) = target {
            session.timing.update(None, block.start_time());
        }
        Ok(())
    }

    /// Re-evaluate stream selection without closing the container.
    pub fn change_media(&self) -> Result<Vec<MediaType>, MediaError> {
        let _command = self.command_lock.lock().unwrap();
        let _pending = CommandGuard::new(&self.shared.pending_commands);
        let session = self.require_session()?;
        let media_types = session.container.update_components()?;
        session.clear_buffers();
        session.timing.setup(&session.container.timing_setup());
        Ok(media_types)
    }

    /// Playback speed ratio applied to every clock.
    pub fn set_speed_ratio(&self, ratio: f64) {
        if let Some(session) = self.session() {
            session.timing.set_speed_ratio(ratio);
        }
    }

    pub fn speed_ratio(&self) -> f64 {
        self.session()
            .map(|session| session.timing.speed_ratio())
            .unwrap_or(1.0)
    }

    // ---- observed state ----

    pub fn media_state(&self) -> MediaState {
        self.shared.state()
    }

    pub fn position(&self) -> f64 {
        self.session()
            .map(|session| session.timing.position(None))
            .unwrap_or(0.0)
    }

    /// Start time of the video block containing the current position.
    pub fn frame_position(&self) -> Option<f64> {
        let session = self.session()?;
        let buffer = session.buffer(MediaType::Video)?.clone();
        let position = session.timing.position(Some(MediaType::Video));
        buffer
            .snap_position(position)
            .or_else(|| buffer.neighbors(position).2.map(|block| block.start_time()))
    }

    pub fn has_media_ended(&self) -> bool {
        self.shared.has_media_ended.load(Ordering::SeqCst)
    }

    pub fn is_buffering(&self) -> bool {
        self.shared.is_sync_buffering.load(Ordering::SeqCst)
    }

    pub fn has_audio(&self) -> bool {
        self.has_component(MediaType::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.has_component(MediaType::Video)
    }

    pub fn has_subtitles(&self) -> bool {
        self.has_component(MediaType::Subtitle)
    }

    fn has_component(&self, media_type: MediaType) -> bool {
        self.session()
            .map(|session| session.container.components().get(media_type).is_some())
            .unwrap_or(false)
    }

    /// Total duration reported by the seekable stream, extended by any
    /// frames observed past it.
    pub fn natural_duration(&self) -> Option<f64> {
        let session = self.session()?;
        let components = session.container.components();
        components
            .seekable()
            .and_then(|component| component.duration())
            .or_else(|| {
                components
                    .all()
                    .iter()
                    .filter_map(|component| component.duration())
                    .fold(None, |acc, duration| {
                        Some(acc.map_or(duration, |max: f64| max.max(duration)))
                    })
            })
    }

    pub fn playback_start_time(&self) -> Option<f64> {
        self.session()?
            .container
            .components()
            .seekable()
            .and_then(|component| component.start_time())
    }

    pub fn playback_end_time(&self) -> Option<f64> {
        let session = self.session()?;
        let seekable = session.container.components().seekable()?;
        let start = seekable.start_time().unwrap_or(0.0);
        seekable.duration().map(|duration| start + duration)
    }

    pub fn buffer_length(&self) -> u64 {
        self.session()
            .map(|session| session.container.buffer_state().length)
            .unwrap_or(0)
    }

    pub fn buffer_count(&self) -> usize {
        self.session()
            .map(|session| session.container.buffer_state().count)
            .unwrap_or(0)
    }

    pub fn buffer_duration(&self) -> f64 {
        self.session()
            .map(|session| session.container.buffer_state().duration)
            .unwrap_or(0.0)
    }

    pub fn buffering_progress(&self) -> f64 {
        self.session()
            .map(|session| buffering_progress(&session.container, &self.shared))
            .unwrap_or(0.0)
    }

    /// Fill level of the network packet buffer.
    pub fn download_progress(&self) -> f64 {
        let length = self.buffer_length();
        (length as f64 / NETWORK_BUFFER_LENGTH_MAX as f64).min(1.0)
    }

    pub fn decoding_bit_rate(&self) -> f64 {
        *self.shared.decoding_bit_rate.lock().unwrap()
    }

    pub fn is_live(&self) -> bool {
        self.session()
            .map(|session| session.container.is_live())
            .unwrap_or(false)
    }

    pub fn is_network(&self) -> bool {
        self.session()
            .map(|session| session.container.is_network())
            .unwrap_or(false)
    }

    pub fn is_seekable(&self) -> bool {
        self.session()
            .map(|session| session.container.is_seekable())
            .unwrap_or(false)
    }

    pub fn has_disconnected_clocks(&self) -> bool {
        self.session()
            .map(|session| session.timing.has_disconnected_clocks())
            .unwrap_or(false)
    }

    /// Codec metadata for the selected streams.
    pub fn media_info(&self) -> Vec<StreamInfo> {
        self.session()
            .map(|session| {
                session
                    .container
                    .components()
                    .all()
                    .iter()
                    .map(|component| component.stream().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn session(&self) -> Option<Arc<PlaybackSession>> {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|active| active.session.clone())
    }

    fn require_session(&self) -> Result<Arc<PlaybackSession>, MediaError> {
        self.session()
            .ok_or_else(|| MediaError::State("no media is open".to_string()))
    }
}

impl Drop for MediaEngine {
    fn drop(&mut self) {
        self.close();
    }
}
