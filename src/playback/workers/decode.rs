//! Decode worker: drains packet queues into block buffers and detects the
//! end of decoding.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use log::{debug, warn};

use crate::backend::MediaType;
use crate::playback::workers::{CancellationToken, StepTimerHandle, Worker, WorkerSchedule};
use crate::playback::{PlaybackSession, PlaybackShared};

pub(crate) fn spawn_decode_worker(
    session: Arc<PlaybackSession>,
    shared: Arc<PlaybackShared>,
    timer: StepTimerHandle,
) -> Worker {
    Worker::spawn("media-decode", WorkerSchedule::Interval(timer), move |token| {
        decode_cycle(&session, &shared, token);
    })
}

fn decode_cycle(session: &PlaybackSession, shared: &PlaybackShared, token: &CancellationToken) {
    // Commands (seeks in particular) own the component decoders while they
    // run; skip the cycle instead of competing for frames.
    if shared.is_seeking.load(Ordering::SeqCst) || shared.pending_commands.load(Ordering::SeqCst) {
        return;
    }

    let parallel = session.container.media_options().use_parallel_decoding
        || session.timing.has_disconnected_clocks();

    let added_total: usize = if parallel {
        thread::scope(|scope| {
            let handles: Vec<_> = MediaType::ALL
                .iter()
                .map(|media_type| {
                    scope.spawn(move || fill_component_buffer(session, *media_type, token))
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap_or(0)).sum()
        })
    } else {
        MediaType::ALL
            .iter()
            .map(|media_type| fill_component_buffer(session, *media_type, token))
            .sum()
    };

    // Aggregate compressed bit rate across the buffered ranges.
    let bit_rate: f64 = MediaType::ALL
        .iter()
        .filter_map(|media_type| session.buffer(*media_type))
        .map(|buffer| buffer.range_bit_rate())
        .sum();
    *shared.decoding_bit_rate.lock().unwrap() = bit_rate;

    if added_total > 0 {
        shared.has_decoding_ended.store(false, Ordering::SeqCst);
        return;
    }

    // Nothing added: decoding has ended once the seekable component can no
    // longer produce packets or frames.
    let Some(seekable) = session.container.components().seekable() else {
        return;
    };
    if session.container.is_at_end_of_stream()
        && seekable.packet_count() == 0
        && !seekable.has_packets_in_codec()
        && !shared.has_decoding_ended.swap(true, Ordering::SeqCst)
    {
        debug!("decoding has ended");
    }
}

/// Add blocks for one media type until the window is comfortably ahead of
/// the clock, the component runs dry, or the cycle is cancelled. A full
/// buffer keeps rolling forward only while the clock is past its midpoint.
fn fill_component_buffer(
    session: &PlaybackSession,
    media_type: MediaType,
    token: &CancellationToken,
) -> usize {
    let Some(component) = session.container.components().get(media_type) else {
        return 0;
    };
    let Some(buffer) = session.buffer(media_type) else {
        return 0;
    };

    let mut added = 0usize;
    loop {
        if token.is_cancelled() {
            break;
        }
        let position = session.timing.position(Some(media_type));
        if buffer.is_full() && position <= buffer.range_mid_time() {
            break;
        }

        let frame = match component.receive_next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!("{} decode failed: {}", media_type, err);
                break;
            }
        };

        let container = &session.container;
        let mut materialize = |frame: crate::backend::Frame,
                               block: &crate::blocks::Block,
                               previous: Option<&crate::blocks::Block>| {
            container.convert(frame, block, previous)
        };
        match buffer.add(frame, &mut materialize) {
            Ok(Some(_)) => added += 1,
            Ok(None) => break,
            Err(err) => {
                warn!("{} block add failed: {}", media_type, err);
                break;
            }
        }
    }
    added
}
