//! Render worker: aligns clocks to buffered blocks, drives renderers, and
//! manages sync-buffering and end-of-playback detection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info};

use crate::backend::MediaType;
use crate::playback::events::MediaEvent;
use crate::playback::render_targets::RendererSet;
use crate::playback::workers::{CancellationToken, Worker, WorkerSchedule, RENDER_CYCLE};
use crate::playback::{buffering_progress, MediaState, PlaybackSession, PlaybackShared};

/// Minimum position delta before another position-changed event goes out.
const POSITION_EVENT_GRANULARITY: f64 = 0.1;

pub(crate) struct RenderCycleState {
    pub renderers: RendererSet,
    /// Start time of the last block delivered per media type.
    pub last_render_start: [Option<f64>; 3],
    pub last_position_event: f64,
}

impl RenderCycleState {
    pub fn new(renderers: RendererSet) -> Self {
        Self {
            renderers,
            last_render_start: [None; 3],
            last_position_event: f64::MIN,
        }
    }
}

pub(crate) fn spawn_render_worker(
    session: Arc<PlaybackSession>,
    shared: Arc<PlaybackShared>,
    renderers: RendererSet,
) -> Worker {
    let mut cycle_state = RenderCycleState::new(renderers);
    Worker::spawn(
        "media-render",
        WorkerSchedule::Thread(RENDER_CYCLE),
        move |token| {
            render_cycle(&session, &shared, &mut cycle_state, token);
        },
    )
}

pub(crate) fn render_cycle(
    session: &PlaybackSession,
    shared: &PlaybackShared,
    cycle_state: &mut RenderCycleState,
    token: &CancellationToken,
) {
    let container = &session.container;
    let timing = &session.timing;
    if !timing.is_ready() || container.is_disposed() {
        return;
    }
    let Some(main_type) = session.main_type() else {
        return;
    };
    let Some(main_buffer) = session.buffer(main_type) else {
        return;
    };

    // 1. While a seek is filling buffers, hold off. Bounded by cycle
    // cadence: the moment seek blocks land the cycle proceeds.
    if shared.is_seeking.load(Ordering::SeqCst) && main_buffer.block_count() == 0 {
        return;
    }

    let disconnected = timing.has_disconnected_clocks();

    // 2. Align clocks to blocks: pause starved clocks, clamp the rest into
    // the buffered range.
    if disconnected {
        for media_type in [MediaType::Audio, MediaType::Video] {
            let Some(buffer) = session.buffer(media_type) else {
                continue;
            };
            if buffer.block_count() == 0 {
                timing.pause(Some(media_type));
                continue;
            }
            let position = timing.position(Some(media_type));
            let clamped = position.clamp(buffer.range_start_time(), buffer.range_end_time());
            if clamped != position {
                timing.update(Some(media_type), clamped);
            }
        }
    } else if main_buffer.block_count() == 0 {
        timing.pause(None);
    } else {
        let position = timing.position(Some(main_type));
        let clamped = position.clamp(
            main_buffer.range_start_time(),
            main_buffer.range_end_time(),
        );
        if clamped != position {
            timing.update(None, clamped);
        }
    }

    let state_now = shared.state();

    // 3. Enter sync-buffering when a lagging component's window ends before
    // the main window even starts.
    if !shared.is_sync_buffering.load(Ordering::SeqCst)
        && !shared.is_seeking.load(Ordering::SeqCst)
        && !container.is_at_end_of_stream()
        && state_now == MediaState::Play
        && !disconnected
        && main_buffer.block_count() > 0
    {
        let main_start = main_buffer.range_start_time();
        let lagging = container.components().all().iter().any(|component| {
            if component.media_type() == main_type
                || component.media_type() == MediaType::Subtitle
                || component.is_still_picture()
            {
                return false;
            }
            match session.buffer(component.media_type()) {
                Some(buffer) => {
                    buffer.block_count() == 0 || buffer.range_end_time() < main_start
                }
                None => false,
            }
        });
        if lagging {
            info!("entering sync-buffering");
            shared.is_sync_buffering.store(true, Ordering::SeqCst);
            timing.pause(None);
            shared.events.emit(MediaEvent::BufferingStarted);
        }
    }

    // 4. Deliver the block under each clock. A block goes out once per
    // start time unless the type wants repeated delivery (audio, still
    // pictures).
    let mut deliveries: Vec<(MediaType, Arc<crate::blocks::Block>, f64)> = Vec::new();
    for media_type in MediaType::ALL {
        let Some(buffer) = session.buffer(media_type) else {
            continue;
        };
        let position = timing.position(Some(media_type));
        let (_, _, current) = buffer.neighbors(position);
        let Some(block) = current else {
            continue;
        };
        let repeated = match media_type {
            MediaType::Audio => true,
            MediaType::Video => container
                .components()
                .get(MediaType::Video)
                .map(|component| component.is_still_picture())
                .unwrap_or(false),
            MediaType::Subtitle => false,
        };
        let slot = media_type.index();
        if repeated || cycle_state.last_render_start[slot] != Some(block.start_time()) {
            cycle_state.last_render_start[slot] = Some(block.start_time());
            deliveries.push((media_type, block, position));
        }
    }
    deliver_blocks(container, cycle_state, deliveries);

    // 5. End of playback: decoding is done and no clock can advance.
    if shared.has_decoding_ended.load(Ordering::SeqCst)
        && state_now == MediaState::Play
        && !shared.has_media_ended.load(Ordering::SeqCst)
    {
        let exhausted = |media_type: MediaType| -> bool {
            match session.buffer(media_type) {
                Some(buffer) if buffer.block_count() > 0 => {
                    timing.position(Some(media_type)) >= buffer.range_end_time() - 1e-6
                }
                _ => true,
            }
        };
        let finished = if disconnected {
            MediaType::ALL.iter().all(|media_type| exhausted(*media_type))
        } else {
            exhausted(main_type)
        };
        if finished && !shared.has_media_ended.swap(true, Ordering::SeqCst) {
            timing.pause(None);
            timing.update(None, main_buffer.range_end_time());
            info!("media playback ended");
            shared.set_state(MediaState::Stop);
            shared.events.emit(MediaEvent::MediaEnded);
        }
    }

    // 6. Exit sync-buffering once the laggards pass the main midpoint, or
    // unconditionally when continuing to wait cannot help.
    if shared.is_sync_buffering.load(Ordering::SeqCst) {
        let must_exit = token.is_cancelled()
            || shared.has_decoding_ended.load(Ordering::SeqCst)
            || container.is_at_end_of_stream()
            || shared.has_media_ended.load(Ordering::SeqCst)
            || shared.pending_commands.load(Ordering::SeqCst)
            || disconnected;
        let caught_up = main_buffer.block_count() > 0
            && container.components().all().iter().all(|component| {
                if component.media_type() == main_type || component.is_still_picture() {
                    return true;
                }
                match session.buffer(component.media_type()) {
                    Some(buffer) => {
                        buffer.block_count() > 0
                            && buffer.range_end_time() >= main_buffer.range_mid_time()
                    }
                    None => true,
                }
            });
        if caught_up || must_exit {
            info!("leaving sync-buffering");
            shared.is_sync_buffering.store(false, Ordering::SeqCst);
            shared.events.emit(MediaEvent::BufferingEnded);
        }
    }

    // 7. Resume the clocks while playing, provided they can still advance.
    if state_now == MediaState::Play
        && !shared.is_sync_buffering.load(Ordering::SeqCst)
        && !shared.pending_commands.load(Ordering::SeqCst)
        && !shared.has_media_ended.load(Ordering::SeqCst)
    {
        let progress = buffering_progress(container, shared);
        let gated = progress < container.media_options().min_playback_buffer_percent;
        if !gated {
            if disconnected {
                for media_type in [MediaType::Audio, MediaType::Video] {
                    let Some(buffer) = session.buffer(media_type) else {
                        continue;
                    };
                    if buffer.range_end_time() > timing.position(Some(media_type)) {
                        timing.play(Some(media_type));
                    }
                }
            } else if main_buffer.block_count() > 0
                && main_buffer.range_end_time() > timing.position(Some(main_type))
            {
                timing.play(None);
            }
        }
    }

    // Bounded-rate position reporting.
    let position = timing.position(None);
    if (position - cycle_state.last_position_event).abs() >= POSITION_EVENT_GRANULARITY {
        shared.events.emit(MediaEvent::PositionChanged(position));
        cycle_state.last_position_event = position;
    }
}

/// Hand blocks to their renderers, optionally fanning the media types out
/// to scoped threads. Renderer failures are swallowed per block.
fn deliver_blocks(
    container: &crate::container::MediaContainer,
    cycle_state: &mut RenderCycleState,
    deliveries: Vec<(MediaType, Arc<crate::blocks::Block>, f64)>,
) {
    if deliveries.is_empty() {
        return;
    }
    let parallel = container.media_options().use_parallel_rendering && deliveries.len() > 1;
    if !parallel {
        for (media_type, block, position) in deliveries {
            if let Err(err) = cycle_state
                .renderers
                .for_type(media_type)
                .render(&block, position)
            {
                debug!("{} renderer error: {}", media_type, err);
            }
        }
        return;
    }

    // At most one delivery per type, so each renderer moves into exactly
    // one scoped thread.
    let mut slots: [Option<(Arc<crate::blocks::Block>, f64)>; 3] = [None, None, None];
    for (media_type, block, position) in deliveries {
        slots[media_type.index()] = Some((block, position));
    }
    let [audio_slot, video_slot, subtitle_slot] = slots;
    let RendererSet {
        audio,
        video,
        subtitle,
    } = &mut cycle_state.renderers;
    std::thread::scope(|scope| {
        if let Some((block, position)) = audio_slot {
            scope.spawn(move || {
                if let Err(err) = audio.render(&block, position) {
                    debug!("audio renderer error: {}", err);
                }
            });
        }
        if let Some((block, position)) = video_slot {
            scope.spawn(move || {
                if let Err(err) = video.render(&block, position) {
                    debug!("video renderer error: {}", err);
                }
            });
        }
        if let Some((block, position)) = subtitle_slot {
            scope.spawn(move || {
                if let Err(err) = subtitle.render(&block, position) {
                    debug!("subtitle renderer error: {}", err);
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Frame, MediaInput, VideoFrame};
    use crate::blocks::{Block, BlockBuffer, BlockMeta};
    use crate::container::options::{ContainerOptions, MediaOptions};
    use crate::container::MediaContainer;
    use crate::playback::events::{event_channel, EngineEvents};
    use crate::playback::PlaybackShared;
    use crate::sim::{SimAudio, SimBackend, SimSpec, SimVideo};

    fn make_session(spec: SimSpec) -> (Arc<PlaybackSession>, Arc<PlaybackShared>, EngineEvents) {
        let backend = Arc::new(SimBackend::new(spec));
        let container = Arc::new(MediaContainer::new(
            backend,
            MediaInput::Url("sim://render".to_string()),
            ContainerOptions::default(),
            MediaOptions::default(),
        ));
        container.initialize().unwrap();
        container.open().unwrap();
        let timing = Arc::new(crate::timing::TimingController::new());
        timing.setup(&container.timing_setup());
        let session = Arc::new(PlaybackSession::new(container, timing));
        let (sink, events) = event_channel();
        let shared = Arc::new(PlaybackShared::new(sink));
        (session, shared, events)
    }

    fn push_block(buffer: &BlockBuffer, start: f64, duration: f64) {
        let frame = Frame::Video(VideoFrame {
            pts: Some(start),
            duration,
            width: 4,
            height: 4,
            pixel_format: crate::backend::PixelFormat::Rgb24,
            data: vec![0u8; 48],
            compressed_size: 8,
        });
        let mut materialize = |frame: Frame, block: &Block, _prev: Option<&Block>| {
            block.set_meta(BlockMeta {
                start_time: frame.start_time().unwrap_or(0.0),
                duration: frame.duration(),
                ..BlockMeta::default()
            });
            Ok(true)
        };
        buffer.add(frame, &mut materialize).unwrap();
    }

    fn av_spec() -> SimSpec {
        SimSpec {
            duration: 10.0,
            video: Some(SimVideo::default()),
            audio: Some(SimAudio::default()),
            ..SimSpec::default()
        }
    }

    #[test]
    fn starved_audio_enters_and_exits_sync_buffering() {
        let (session, shared, events) = make_session(av_spec());
        shared.set_state(MediaState::Play);
        let mut cycle_state = RenderCycleState::new(RendererSet::default());
        let token = CancellationToken::new();

        // Video has a window, audio is empty: one cycle enters buffering.
        let video = session.buffer(MediaType::Video).unwrap();
        for i in 0..6 {
            push_block(video, 0.5 + i as f64 * 0.04, 0.04);
        }
        render_cycle(&session, &shared, &mut cycle_state, &token);
        assert!(shared.is_sync_buffering.load(Ordering::SeqCst));
        assert!(!session.timing.is_running(None));

        let emitted: Vec<_> = events.try_iter().collect();
        assert!(emitted.contains(&MediaEvent::BufferingStarted));

        // Audio catches up past the video midpoint: buffering ends.
        let audio = session.buffer(MediaType::Audio).unwrap();
        for i in 0..40 {
            push_block(audio, 0.5 + i as f64 * 0.02, 0.02);
        }
        render_cycle(&session, &shared, &mut cycle_state, &token);
        assert!(!shared.is_sync_buffering.load(Ordering::SeqCst));
        let emitted: Vec<_> = events.try_iter().collect();
        assert!(emitted.contains(&MediaEvent::BufferingEnded));
    }

    #[test]
    fn ended_media_is_reported_exactly_once() {
        let (session, shared, events) = make_session(SimSpec {
            audio: None,
            ..av_spec()
        });
        shared.set_state(MediaState::Play);
        shared.has_decoding_ended.store(true, Ordering::SeqCst);
        let video = session.buffer(MediaType::Video).unwrap();
        push_block(video, 0.0, 0.04);
        session.timing.update(None, 0.1);

        let mut cycle_state = RenderCycleState::new(RendererSet::default());
        let token = CancellationToken::new();
        render_cycle(&session, &shared, &mut cycle_state, &token);
        render_cycle(&session, &shared, &mut cycle_state, &token);

        let ended: Vec<_> = events
            .try_iter()
            .filter(|event| matches!(event, MediaEvent::MediaEnded))
            .collect();
        assert_eq!(ended.len(), 1);
        assert_eq!(shared.state(), MediaState::Stop);
        // Position snapped to the end of the buffered range.
        assert!((session.timing.position(None) - video.range_end_time()).abs() < 0.05);
    }

    #[test]
    fn clock_clamps_into_the_buffered_range() {
        let (session, shared, _events) = make_session(SimSpec {
            audio: None,
            ..av_spec()
        });
        let video = session.buffer(MediaType::Video).unwrap();
        for i in 0..4 {
            push_block(video, 1.0 + i as f64 * 0.04, 0.04);
        }
        session.timing.update(None, 0.0);

        let mut cycle_state = RenderCycleState::new(RendererSet::default());
        render_cycle(&session, &shared, &mut cycle_state, &CancellationToken::new());
        assert!((session.timing.position(None) - 1.0).abs() < 0.05);
    }

    #[test]
    fn blocks_are_delivered_once_unless_repeated() {
        let (session, shared, _events) = make_session(SimSpec {
            audio: None,
            ..av_spec()
        });
        let video = session.buffer(MediaType::Video).unwrap();
        push_block(video, 0.0, 0.04);

        let recorder = crate::playback::render_targets::RecordingRenderer::new();
        let delivered = recorder.delivered();
        let renderers = RendererSet {
            video: Box::new(recorder),
            ..RendererSet::default()
        };
        let mut cycle_state = RenderCycleState::new(renderers);
        let token = CancellationToken::new();
        render_cycle(&session, &shared, &mut cycle_state, &token);
        render_cycle(&session, &shared, &mut cycle_state, &token);
        // Same start time: video goes out once.
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }
}
