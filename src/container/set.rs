//! Aggregation of per-media-type components.

use std::sync::{Arc, Mutex};

use crate::backend::{MediaType, Packet};
use crate::container::component::MediaComponent;
use crate::timing::{StreamTiming, TimingSetup};

/// Aggregated packet-buffer statistics across components.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComponentBufferState {
    pub length: u64,
    pub count: usize,
    pub count_threshold: usize,
    pub duration: f64,
}

/// The set of active components, at most one per media type.
#[derive(Default)]
pub struct ComponentSet {
    slots: Mutex<[Option<Arc<MediaComponent>>; 3]>,
}

impl ComponentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a component, disposing any previous one of the same type.
    pub fn register(&self, component: Arc<MediaComponent>) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[component.media_type().index()];
        if let Some(previous) = slot.take() {
            previous.dispose();
        }
        *slot = Some(component);
    }

    pub fn get(&self, media_type: MediaType) -> Option<Arc<MediaComponent>> {
        self.slots.lock().unwrap()[media_type.index()].clone()
    }

    pub fn all(&self) -> Vec<Arc<MediaComponent>> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter_map(|slot| slot.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().unwrap().iter().all(|slot| slot.is_none())
    }

    /// Route a packet to the owning component by stream index. Returns the
    /// receiving media type; `None` means no component claims the stream
    /// and the packet should be disposed.
    pub fn send_packet(&self, packet: Packet) -> Option<MediaType> {
        let component = self
            .all()
            .into_iter()
            .find(|component| component.stream_index() == packet.stream_index)?;
        let media_type = component.media_type();
        component.send_packet(Some(packet));
        Some(media_type)
    }

    /// The component that authoritatively drives seeks: video unless it is
    /// a still picture, else audio.
    pub fn seekable(&self) -> Option<Arc<MediaComponent>> {
        if let Some(video) = self.get(MediaType::Video) {
            if !video.is_still_picture() {
                return Some(video);
            }
        }
        self.get(MediaType::Audio)
    }

    /// All components report enough queued packets.
    pub fn have_enough_packets(&self, is_read_aborted: bool, is_at_eof: bool) -> bool {
        self.all()
            .iter()
            .all(|component| component.has_enough_packets(is_read_aborted, is_at_eof))
    }

    /// Aggregate packet-buffer statistics. The duration is the minimum of
    /// the component durations, with video taking priority on ties.
    pub fn buffer_state(&self) -> ComponentBufferState {
        let mut state = ComponentBufferState::default();
        let mut duration: Option<f64> = None;
        let ordered = [MediaType::Video, MediaType::Audio, MediaType::Subtitle];
        for media_type in ordered {
            let Some(component) = self.get(media_type) else {
                continue;
            };
            state.length += component.packet_buffer_length();
            state.count += component.packet_count();
            state.count_threshold += component.count_threshold();
            if media_type != MediaType::Subtitle {
                let candidate = component.packet_buffer_duration();
                if duration.map(|current| candidate < current).unwrap_or(true) {
                    duration = Some(candidate);
                }
            }
        }
        state.duration = duration.unwrap_or(0.0);
        state
    }

    /// Timing descriptors for controller setup.
    pub fn timing_setup(
        &self,
        is_time_sync_disabled: bool,
        is_live: bool,
        is_seekable: bool,
    ) -> TimingSetup {
        let streams = self
            .all()
            .iter()
            .map(|component| StreamTiming {
                media_type: component.media_type(),
                start_time: component.start_time(),
                duration: component.duration(),
                is_still_picture: component.is_still_picture(),
            })
            .collect();
        TimingSetup {
            streams,
            is_time_sync_disabled,
            is_live,
            is_seekable,
            seekable_type: self.seekable().map(|component| component.media_type()),
        }
    }

    /// Dispose every component and empty the set.
    pub fn dispose_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if let Some(component) = slot.take() {
                component.dispose();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AudioParams, BackendError, Decoder, Frame, StreamInfo, VideoParams,
    };
    use crate::container::options::MediaOptions;
    use crate::time::TimeBase;

    struct NullDecoder;

    impl Decoder for NullDecoder {
        fn send_packet(&mut self, _packet: &Packet) -> Result<(), BackendError> {
            Ok(())
        }

        fn receive_frame(&mut self) -> Result<Frame, BackendError> {
            Err(BackendError::TryAgain)
        }

        fn flush(&mut self) {}
    }

    fn stream(index: usize, media_type: MediaType, still: bool) -> StreamInfo {
        StreamInfo {
            index,
            media_type,
            codec: "test".to_string(),
            start_time: Some(0.0),
            duration: Some(10.0),
            time_base: TimeBase::MILLIS,
            is_still_picture: still,
            attached_picture: None,
            audio: (media_type == MediaType::Audio).then_some(AudioParams {
                sample_rate: 48_000,
                channels: 2,
            }),
            video: (media_type == MediaType::Video).then_some(VideoParams {
                width: 4,
                height: 4,
                frames_per_second: 25.0,
            }),
        }
    }

    fn component(index: usize, media_type: MediaType, still: bool) -> Arc<MediaComponent> {
        Arc::new(MediaComponent::new(
            stream(index, media_type, still),
            Box::new(NullDecoder),
            Arc::new(MediaOptions::default()),
        ))
    }

    #[test]
    fn routes_packets_by_stream_index() {
        let set = ComponentSet::new();
        set.register(component(0, MediaType::Audio, false));
        set.register(component(1, MediaType::Video, false));

        let packet = Packet::new_data(1, Some(0), 40, true, TimeBase::MILLIS, vec![0u8; 8]);
        assert_eq!(set.send_packet(packet), Some(MediaType::Video));
        assert_eq!(set.get(MediaType::Video).unwrap().packet_count(), 1);
        assert_eq!(set.get(MediaType::Audio).unwrap().packet_count(), 0);

        let unclaimed = Packet::new_data(7, Some(0), 40, true, TimeBase::MILLIS, vec![0u8; 8]);
        assert_eq!(set.send_packet(unclaimed), None);
    }

    #[test]
    fn seekable_prefers_moving_video() {
        let set = ComponentSet::new();
        set.register(component(0, MediaType::Audio, false));
        set.register(component(1, MediaType::Video, false));
        assert_eq!(set.seekable().unwrap().media_type(), MediaType::Video);
    }

    #[test]
    fn still_picture_video_defers_to_audio() {
        let set = ComponentSet::new();
        set.register(component(0, MediaType::Audio, false));
        set.register(component(1, MediaType::Video, true));
        assert_eq!(set.seekable().unwrap().media_type(), MediaType::Audio);
    }

    #[test]
    fn buffer_state_takes_the_minimum_duration() {
        let set = ComponentSet::new();
        let audio = component(0, MediaType::Audio, false);
        let video = component(1, MediaType::Video, false);
        for i in 0..4 {
            audio.send_packet(Some(Packet::new_data(
                0,
                Some(i * 20),
                20,
                true,
                TimeBase::MILLIS,
                vec![0u8; 16],
            )));
        }
        video.send_packet(Some(Packet::new_data(
            1,
            Some(0),
            40,
            true,
            TimeBase::MILLIS,
            vec![0u8; 32],
        )));
        set.register(audio);
        set.register(video);

        let state = set.buffer_state();
        assert_eq!(state.length, 4 * 16 + 32);
        assert_eq!(state.count, 5);
        assert!((state.duration - 0.040).abs() < 1e-9);
    }

    #[test]
    fn dispose_all_empties_the_set() {
        let set = ComponentSet::new();
        set.register(component(0, MediaType::Audio, false));
        set.dispose_all();
        assert!(set.is_empty());
    }
}
