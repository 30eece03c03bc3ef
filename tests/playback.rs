//! End-to-end playback scenarios over the synthetic backend.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use medley::backend::MediaInput;
use medley::container::options::ContainerOptions;
use medley::playback::events::{EngineEvents, MediaEvent, MessageLevel};
use medley::playback::{MediaEngine, MediaState};
use medley::sim::{SimAudio, SimBackend, SimControl, SimSpec, SimVideo};

fn open_engine(spec: SimSpec) -> (MediaEngine, EngineEvents, SimControl) {
    let backend = Arc::new(SimBackend::new(spec));
    let control = backend.control();
    let (engine, events) = MediaEngine::new(backend);
    (engine, events, control)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn video_only(duration: f64) -> SimSpec {
    SimSpec {
        duration,
        video: Some(SimVideo::default()),
        audio: None,
        ..SimSpec::default()
    }
}

#[test]
fn open_and_play_a_video_only_file() {
    let (engine, events, _control) = open_engine(video_only(10.0));
    engine
        .open(MediaInput::Url("sim://sample_10s_30fps".to_string()))
        .unwrap();

    assert!(engine.has_video());
    assert!(!engine.has_audio());
    let duration = engine.natural_duration().expect("natural duration");
    assert!((duration - 10.0).abs() < 0.05);
    assert_eq!(engine.media_state(), MediaState::Stop);

    engine.play().unwrap();
    assert_eq!(engine.media_state(), MediaState::Play);

    assert!(
        wait_until(Duration::from_secs(3), || engine.position() > 0.2),
        "position did not advance"
    );
    assert!(engine.position() < 2.0);
    assert!(wait_until(Duration::from_secs(3), || {
        engine.buffering_progress() >= 1.0
    }));

    let ended = events
        .try_iter()
        .any(|event| matches!(event, MediaEvent::MediaEnded));
    assert!(!ended, "media-ended fired during early playback");

    engine.close();
}

#[test]
fn playing_to_the_end_reports_media_ended_once() {
    let (engine, events, _control) = open_engine(video_only(0.6));
    engine
        .open(MediaInput::Url("sim://short".to_string()))
        .unwrap();
    engine.play().unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || engine.has_media_ended()),
        "media never ended"
    );
    // Let any trailing render cycles run before counting events.
    thread::sleep(Duration::from_millis(100));

    let ended_count = events
        .try_iter()
        .filter(|event| matches!(event, MediaEvent::MediaEnded))
        .count();
    assert_eq!(ended_count, 1);
    assert_eq!(engine.media_state(), MediaState::Stop);

    // Terminal position within one frame of the natural duration.
    let frame = 1.0 / 30.0;
    assert!((engine.position() - 0.6).abs() <= frame + 0.02);

    engine.close();
}

#[test]
fn seeking_backward_lands_at_or_before_the_target() {
    let (engine, _events, _control) = open_engine(video_only(10.0));
    engine
        .open(MediaInput::Url("sim://seekme".to_string()))
        .unwrap();
    engine.play().unwrap();
    assert!(wait_until(Duration::from_secs(3), || engine.position() > 0.3));

    engine.pause().unwrap();
    engine.seek(1.5).unwrap();
    thread::sleep(Duration::from_millis(120));

    let position = engine.position();
    assert!(position <= 1.5 + 1e-6, "seek overshot: {}", position);
    assert!(position >= 1.3, "seek landed too early: {}", position);

    if let Some(frame_position) = engine.frame_position() {
        assert!(frame_position <= position + 1e-6);
    }

    engine.close();
}

#[test]
fn large_av_start_skew_switches_to_disconnected_clocks() {
    let skewed = SimSpec {
        duration: 10.0,
        video: Some(SimVideo {
            start_time: 0.3,
            ..SimVideo::default()
        }),
        audio: Some(SimAudio::default()),
        ..SimSpec::default()
    };
    let (engine, _events, _control) = open_engine(skewed);
    engine
        .open(MediaInput::Url("sim://skewed".to_string()))
        .unwrap();
    assert!(engine.has_disconnected_clocks());
    engine.close();

    let aligned = SimSpec {
        duration: 10.0,
        video: Some(SimVideo::default()),
        audio: Some(SimAudio::default()),
        ..SimSpec::default()
    };
    let (engine, _events, _control) = open_engine(aligned);
    engine
        .open(MediaInput::Url("sim://aligned".to_string()))
        .unwrap();
    assert!(!engine.has_disconnected_clocks());
    engine.close();
}

#[test]
fn stalled_network_reads_time_out_and_recover() {
    let spec = SimSpec {
        duration: 60.0,
        video: Some(SimVideo::default()),
        audio: None,
        is_network: true,
        ..SimSpec::default()
    };
    let (engine, events, control) = open_engine(spec);
    let mut options = ContainerOptions::default();
    options.read_timeout = 0.1;
    engine.set_container_options(options);

    // Stall before the read worker spawns so its very first read blocks.
    control.stall_reads();
    engine
        .open(MediaInput::Url("sim://network".to_string()))
        .unwrap();

    let saw_timeout = wait_until(Duration::from_secs(3), || {
        events.try_iter().any(|event| {
            matches!(
                event,
                MediaEvent::MessageLogged {
                    level: MessageLevel::Warning,
                    ..
                }
            )
        })
    });
    assert!(saw_timeout, "no timeout report was emitted");

    let stalled_count = engine.buffer_count();
    control.resume_reads();
    assert!(
        wait_until(Duration::from_secs(3), || {
            engine.buffer_count() > stalled_count
        }),
        "reads did not resume after the stall cleared"
    );

    engine.close();
}

#[test]
fn stop_rewinds_to_the_start() {
    let (engine, _events, _control) = open_engine(video_only(10.0));
    engine
        .open(MediaInput::Url("sim://stopme".to_string()))
        .unwrap();
    engine.play().unwrap();
    assert!(wait_until(Duration::from_secs(3), || engine.position() > 0.2));

    engine.stop().unwrap();
    assert_eq!(engine.media_state(), MediaState::Stop);
    assert!(engine.position() <= 0.05);

    engine.close();
}

#[test]
fn position_is_monotonic_while_playing() {
    let (engine, _events, _control) = open_engine(video_only(10.0));
    engine
        .open(MediaInput::Url("sim://mono".to_string()))
        .unwrap();
    engine.play().unwrap();
    assert!(wait_until(Duration::from_secs(3), || engine.position() > 0.1));

    let mut last = engine.position();
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(20));
        let now = engine.position();
        assert!(now >= last - 1e-9, "position went backwards: {} -> {}", last, now);
        last = now;
    }

    engine.close();
}

#[test]
fn subtitles_flow_alongside_video() {
    let spec = SimSpec {
        duration: 5.0,
        video: Some(SimVideo::default()),
        audio: None,
        subtitles: true,
        ..SimSpec::default()
    };
    let (engine, _events, _control) = open_engine(spec);
    engine
        .open(MediaInput::Url("sim://subs".to_string()))
        .unwrap();
    assert!(engine.has_subtitles());
    engine.play().unwrap();
    assert!(wait_until(Duration::from_secs(3), || engine.position() > 0.2));
    engine.close();
}
