//! Read worker: pulls packets from the container while more are wanted.

use std::sync::Arc;

use log::warn;

use crate::error::MediaError;
use crate::playback::events::MessageLevel;
use crate::playback::workers::{CancellationToken, StepTimerHandle, Worker, WorkerSchedule};
use crate::playback::{PlaybackSession, PlaybackShared};

pub(crate) fn spawn_read_worker(
    session: Arc<PlaybackSession>,
    shared: Arc<PlaybackShared>,
    timer: StepTimerHandle,
) -> Worker {
    Worker::spawn("media-read", WorkerSchedule::Interval(timer), move |token| {
        read_cycle(&session, &shared, token);
    })
}

/// One read cycle: keep pulling packets while the container wants more.
/// End of stream is absorbed by the container; timeouts are reported and
/// leave the loop so the abort latch can settle.
fn read_cycle(session: &PlaybackSession, shared: &PlaybackShared, token: &CancellationToken) {
    let container = &session.container;
    while container.should_read_more() && !token.is_cancelled() {
        match container.read() {
            Ok(_) => {}
            Err(MediaError::ReadTimeout) => {
                warn!("demuxer read timed out");
                shared
                    .events
                    .report(MessageLevel::Warning, "demuxer read timed out");
                break;
            }
            Err(err) => {
                warn!("read failed: {}", err);
                shared
                    .events
                    .report(MessageLevel::Error, format!("read failed: {}", err));
                break;
            }
        }
    }
}
