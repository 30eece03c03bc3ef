//! Typed engine events delivered over a channel.

use std::sync::mpsc::{channel, Receiver, Sender, TryIter};
use std::sync::Mutex;

use super::MediaState;

/// Severity attached to a reported message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// Events the engine reports to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    MediaStateChanged { old: MediaState, new: MediaState },
    /// One-shot per playback: the media played to its natural end.
    MediaEnded,
    PositionChanged(f64),
    BufferingStarted,
    BufferingEnded,
    MessageLogged { level: MessageLevel, message: String },
}

/// Sending half owned by the engine and its workers. Emission never blocks
/// and silently drops events once the host lets the receiver go.
#[derive(Debug)]
pub struct EventSink {
    tx: Mutex<Sender<MediaEvent>>,
}

impl EventSink {
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.tx.lock().unwrap().send(event);
    }

    pub fn report(&self, level: MessageLevel, message: impl Into<String>) {
        self.emit(MediaEvent::MessageLogged {
            level,
            message: message.into(),
        });
    }
}

impl Clone for EventSink {
    fn clone(&self) -> Self {
        Self {
            tx: Mutex::new(self.tx.lock().unwrap().clone()),
        }
    }
}

/// Receiving half handed to the host.
pub struct EngineEvents {
    rx: Receiver<MediaEvent>,
}

impl EngineEvents {
    /// Drain currently queued events without blocking.
    pub fn try_iter(&self) -> TryIter<'_, MediaEvent> {
        self.rx.try_iter()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<MediaEvent, std::sync::mpsc::RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

pub fn event_channel() -> (EventSink, EngineEvents) {
    let (tx, rx) = channel();
    (
        EventSink { tx: Mutex::new(tx) },
        EngineEvents { rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_flow_in_order() {
        let (sink, events) = event_channel();
        sink.emit(MediaEvent::BufferingStarted);
        sink.emit(MediaEvent::BufferingEnded);
        let received: Vec<MediaEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![MediaEvent::BufferingStarted, MediaEvent::BufferingEnded]
        );
    }

    #[test]
    fn emission_survives_a_dropped_receiver() {
        let (sink, events) = event_channel();
        drop(events);
        sink.emit(MediaEvent::MediaEnded);
    }
}
