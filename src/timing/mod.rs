//! Per-media-type clocks, offsets, and reference selection.

mod clock;

pub use clock::RealTimeClock;

use std::sync::{Arc, Mutex};

use log::warn;

use crate::backend::MediaType;

/// Maximum tolerated skew between audio and video start times before the
/// controller overrides time sync and runs disconnected clocks.
const MAX_START_TIME_SKEW: f64 = 0.1;

/// Timing-relevant description of one selected stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    pub media_type: MediaType,
    pub start_time: Option<f64>,
    pub duration: Option<f64>,
    pub is_still_picture: bool,
}

/// Input to [`TimingController::setup`].
#[derive(Debug, Clone, Default)]
pub struct TimingSetup {
    pub streams: Vec<StreamTiming>,
    pub is_time_sync_disabled: bool,
    pub is_live: bool,
    pub is_seekable: bool,
    pub seekable_type: Option<MediaType>,
}

struct TimingState {
    clocks: [Arc<Mutex<RealTimeClock>>; 3],
    offsets: [f64; 3],
    durations: [Option<f64>; 3],
    has_disconnected_clocks: bool,
    reference_type: MediaType,
    speed_ratio: f64,
}

/// Clock registry for the pipeline.
///
/// When clocks are connected, the audio and video entries hold the same
/// underlying clock object and subtitle aliases video; disconnected mode
/// gives audio and video independent clocks. Every method is a no-op until
/// `setup` has run.
pub struct TimingController {
    inner: Mutex<Option<TimingState>>,
}

impl TimingController {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Build (or rebuild) the clock mapping. Positions and the speed ratio
    /// of a previous setup carry over so re-setup does not jump playback.
    pub fn setup(&self, setup: &TimingSetup) {
        let mut inner = self.inner.lock().unwrap();

        let previous: Option<([f64; 3], f64)> = inner.as_ref().map(|state| {
            let mut positions = [0.0; 3];
            for media_type in MediaType::ALL {
                positions[media_type.index()] =
                    state.clocks[media_type.index()].lock().unwrap().position();
            }
            (positions, state.speed_ratio)
        });

        let find = |media_type: MediaType| {
            setup
                .streams
                .iter()
                .find(|stream| stream.media_type == media_type)
                .copied()
        };
        let audio = find(MediaType::Audio);
        let video = find(MediaType::Video);

        let mut disconnected = false;
        if audio.is_some() && video.is_some() {
            if setup.is_time_sync_disabled {
                disconnected = true;
            } else {
                let audio_start = audio.and_then(|s| s.start_time).unwrap_or(0.0);
                let video_start = video.and_then(|s| s.start_time).unwrap_or(0.0);
                let skew = (audio_start - video_start).abs();
                if skew > MAX_START_TIME_SKEW {
                    warn!(
                        "audio/video start times differ by {:.3}s (max {:.3}s); \
                         overriding time sync and running disconnected clocks",
                        skew, MAX_START_TIME_SKEW
                    );
                    disconnected = true;
                }
            }
        }

        let audio_clock = Arc::new(Mutex::new(RealTimeClock::new()));
        let video_clock = if disconnected {
            Arc::new(Mutex::new(RealTimeClock::new()))
        } else {
            // Connected mode: one shared clock object for audio and video.
            audio_clock.clone()
        };
        // Subtitle always rides the video clock.
        let subtitle_clock = video_clock.clone();
        let clocks = [audio_clock, video_clock, subtitle_clock];

        let mut offsets = [0.0; 3];
        let mut durations = [None; 3];
        for stream in &setup.streams {
            offsets[stream.media_type.index()] = stream.start_time.unwrap_or(0.0);
            durations[stream.media_type.index()] = stream.duration;
        }

        let reference_type = if setup.is_live && !setup.is_seekable && audio.is_some() {
            MediaType::Audio
        } else if let Some(seekable) = setup.seekable_type {
            seekable
        } else if video.is_some() {
            MediaType::Video
        } else {
            MediaType::Audio
        };

        let speed_ratio = previous.map(|(_, ratio)| ratio).unwrap_or(1.0);
        if let Some((positions, ratio)) = previous {
            for media_type in MediaType::ALL {
                let mut clock = clocks[media_type.index()].lock().unwrap();
                clock.set_speed_ratio(ratio);
                clock.update(positions[media_type.index()]);
            }
        }

        *inner = Some(TimingState {
            clocks,
            offsets,
            durations,
            has_disconnected_clocks: disconnected,
            reference_type,
            speed_ratio,
        });
    }

    pub fn has_disconnected_clocks(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map(|state| state.has_disconnected_clocks)
            .unwrap_or(false)
    }

    pub fn reference_type(&self) -> Option<MediaType> {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map(|state| state.reference_type)
    }

    /// Position of one clock (or the reference clock for `None`), including
    /// the applicable start offset.
    pub fn position(&self, media_type: Option<MediaType>) -> f64 {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.as_ref() else {
            return 0.0;
        };
        let media_type = media_type.unwrap_or(state.reference_type);
        let offset_type = if state.has_disconnected_clocks {
            media_type
        } else {
            state.reference_type
        };
        let result = state.clocks[media_type.index()].lock().unwrap().position()
            + state.offsets[offset_type.index()];
        result
    }

    /// Stream end time for one media type: start offset plus duration.
    pub fn end_time(&self, media_type: MediaType) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        let state = inner.as_ref()?;
        state.durations[media_type.index()]
            .map(|duration| state.offsets[media_type.index()] + duration)
    }

    /// Start all clocks (`None`) or one of them.
    pub fn play(&self, media_type: Option<MediaType>) {
        self.with_clocks(media_type, |clock| clock.play());
    }

    pub fn pause(&self, media_type: Option<MediaType>) {
        self.with_clocks(media_type, |clock| clock.pause());
    }

    pub fn reset(&self, media_type: Option<MediaType>) {
        self.with_clocks(media_type, |clock| clock.reset());
    }

    /// Move one clock (or all) to `position` expressed with offset applied,
    /// preserving running state.
    pub fn update(&self, media_type: Option<MediaType>, position: f64) {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.as_ref() else {
            return;
        };
        let targets: Vec<usize> = match media_type {
            Some(media_type) => vec![media_type.index()],
            None => MediaType::ALL.iter().map(|t| t.index()).collect(),
        };
        for index in targets {
            let offset_type = if state.has_disconnected_clocks {
                index
            } else {
                state.reference_type.index()
            };
            state.clocks[index]
                .lock()
                .unwrap()
                .update(position - state.offsets[offset_type]);
        }
    }

    pub fn is_running(&self, media_type: Option<MediaType>) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.as_ref() else {
            return false;
        };
        let media_type = media_type.unwrap_or(state.reference_type);
        let result = state.clocks[media_type.index()].lock().unwrap().is_running();
        result
    }

    pub fn speed_ratio(&self) -> f64 {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map(|state| state.speed_ratio)
            .unwrap_or(1.0)
    }

    /// Apply a new speed ratio to every clock, re-basing offsets so the
    /// observed positions stay continuous.
    pub fn set_speed_ratio(&self, ratio: f64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.as_mut() else {
            return;
        };
        state.speed_ratio = ratio.max(0.0);
        for clock in &state.clocks {
            clock.lock().unwrap().set_speed_ratio(ratio);
        }
    }

    fn with_clocks(&self, media_type: Option<MediaType>, mut apply: impl FnMut(&mut RealTimeClock)) {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.as_ref() else {
            return;
        };
        match media_type {
            Some(media_type) => {
                apply(&mut state.clocks[media_type.index()].lock().unwrap());
            }
            None => {
                // Shared clock objects make some of these calls repeats;
                // all clock operations are idempotent.
                for media_type in MediaType::ALL {
                    apply(&mut state.clocks[media_type.index()].lock().unwrap());
                }
            }
        }
    }
}

impl Default for TimingController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(media_type: MediaType, start: f64, duration: f64) -> StreamTiming {
        StreamTiming {
            media_type,
            start_time: Some(start),
            duration: Some(duration),
            is_still_picture: false,
        }
    }

    fn av_setup(audio_start: f64, video_start: f64, sync_disabled: bool) -> TimingSetup {
        TimingSetup {
            streams: vec![
                stream(MediaType::Audio, audio_start, 10.0),
                stream(MediaType::Video, video_start, 10.0),
            ],
            is_time_sync_disabled: sync_disabled,
            is_live: false,
            is_seekable: true,
            seekable_type: Some(MediaType::Video),
        }
    }

    #[test]
    fn methods_are_noops_before_setup() {
        let controller = TimingController::new();
        controller.play(None);
        controller.update(None, 5.0);
        assert_eq!(controller.position(None), 0.0);
        assert!(!controller.is_ready());
    }

    #[test]
    fn aligned_av_shares_one_clock() {
        let controller = TimingController::new();
        controller.setup(&av_setup(0.0, 0.02, false));
        assert!(!controller.has_disconnected_clocks());
        controller.update(Some(MediaType::Audio), 3.0);
        // Shared clock object: the video entry moved too.
        assert!((controller.position(Some(MediaType::Video)) - 3.0).abs() < 0.05);
    }

    #[test]
    fn large_start_skew_forces_disconnected_clocks() {
        let controller = TimingController::new();
        controller.setup(&av_setup(0.0, 0.3, false));
        assert!(controller.has_disconnected_clocks());
        controller.update(Some(MediaType::Audio), 3.0);
        assert!(controller.position(Some(MediaType::Video)) < 1.0);
    }

    #[test]
    fn disabled_time_sync_forces_disconnected_clocks() {
        let controller = TimingController::new();
        controller.setup(&av_setup(0.0, 0.0, true));
        assert!(controller.has_disconnected_clocks());
    }

    #[test]
    fn single_stream_setups_stay_connected() {
        let controller = TimingController::new();
        controller.setup(&TimingSetup {
            streams: vec![stream(MediaType::Audio, 0.0, 10.0)],
            is_time_sync_disabled: false,
            is_live: false,
            is_seekable: true,
            seekable_type: Some(MediaType::Audio),
        });
        assert!(!controller.has_disconnected_clocks());
        assert_eq!(controller.reference_type(), Some(MediaType::Audio));
    }

    #[test]
    fn live_non_seekable_audio_is_the_continuous_reference() {
        let controller = TimingController::new();
        controller.setup(&TimingSetup {
            streams: vec![
                stream(MediaType::Audio, 0.0, 10.0),
                stream(MediaType::Video, 0.0, 10.0),
            ],
            is_time_sync_disabled: false,
            is_live: true,
            is_seekable: false,
            seekable_type: Some(MediaType::Video),
        });
        assert_eq!(controller.reference_type(), Some(MediaType::Audio));
    }

    #[test]
    fn re_setup_preserves_positions_and_ratio() {
        let controller = TimingController::new();
        controller.setup(&av_setup(0.0, 0.0, false));
        controller.set_speed_ratio(2.0);
        controller.update(None, 4.0);
        controller.setup(&av_setup(0.0, 0.0, false));
        assert!((controller.position(None) - 4.0).abs() < 0.1);
        assert_eq!(controller.speed_ratio(), 2.0);
    }

    #[test]
    fn pause_and_play_gate_advancement() {
        let controller = TimingController::new();
        controller.setup(&av_setup(0.0, 0.0, false));
        assert!(!controller.is_running(None));
        controller.play(None);
        assert!(controller.is_running(None));
        controller.pause(None);
        assert!(!controller.is_running(None));
    }
}
