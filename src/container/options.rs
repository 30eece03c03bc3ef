//! Container and per-open media options.
//!
//! Plain-old-data structs with serde derives so hosts can persist them.
//! Unknown `private_options` keys are warned about by the backend adapter,
//! never rejected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Format-context level flags forwarded to the demuxer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatFlags {
    pub discard_corrupt: bool,
    pub enable_fast_seek: bool,
    pub enable_latm_mp4: bool,
    pub disable_fill_in: bool,
    pub generate_pts: bool,
    pub ignore_dts: bool,
    pub ignore_index: bool,
    pub keep_side_data: bool,
    pub no_buffer: bool,
    pub sort_dts: bool,
    pub stop_at_shortest: bool,
    pub enable_reduced_buffering: bool,
    pub packet_size: Option<u32>,
    pub probe_size: Option<u64>,
    pub seek_to_any: bool,
    pub max_analyze_duration: Option<f64>,
    pub protocol_whitelist: Option<String>,
}

/// Options applied when opening a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerOptions {
    /// Skips demuxer format autodetection when set.
    pub forced_input_format: Option<String>,
    /// Prepended to the URL unless it already carries a protocol.
    pub protocol_prefix: Option<String>,
    /// Forced to "1" when unset, matching demuxer expectations for TS input.
    pub scan_all_pmts: Option<String>,
    /// Passed verbatim to the demuxer open call.
    pub private_options: HashMap<String, String>,
    /// Read-interrupt threshold in seconds; negative disables the timeout.
    pub read_timeout: f64,
    pub global: FormatFlags,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            forced_input_format: None,
            protocol_prefix: None,
            scan_all_pmts: None,
            private_options: HashMap::new(),
            read_timeout: -1.0,
            global: FormatFlags::default(),
        }
    }
}

impl ContainerOptions {
    /// Effective `scan_all_pmts` value: always "1" if unset.
    pub fn effective_scan_all_pmts(&self) -> &str {
        self.scan_all_pmts.as_deref().unwrap_or("1")
    }

    /// Whether a read timeout is enforced at all.
    pub fn has_read_timeout(&self) -> bool {
        self.read_timeout >= 0.0
    }

    /// Apply the protocol prefix unless the URL already names one.
    pub fn apply_protocol_prefix(&self, url: &str) -> String {
        match &self.protocol_prefix {
            Some(prefix) if !url.contains("://") => format!("{}://{}", prefix, url),
            _ => url.to_string(),
        }
    }
}

/// Decoder flags applied per stream at codec-open time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DecoderParams {
    pub fast: bool,
    pub low_delay: bool,
    pub low_res_index: u8,
}

/// Per-open media options; these shape components and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaOptions {
    /// Audio filter-graph description; empty means no graph.
    pub audio_filter: String,
    pub video_hardware_device: Option<String>,
    /// Overrides the frame rate and packet time base for video.
    pub video_forced_fps: Option<f64>,
    /// Forced decoder name by stream index.
    pub decoder_codec: HashMap<usize, String>,
    pub decoder_params: DecoderParams,
    /// Audio and video advance on independent clocks when set.
    pub is_time_sync_disabled: bool,
    pub use_parallel_decoding: bool,
    pub use_parallel_rendering: bool,
    /// Buffering gate before playback resumes, in `0.0..=1.0`.
    pub min_playback_buffer_percent: f64,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            audio_filter: String::new(),
            video_hardware_device: None,
            video_forced_fps: None,
            decoder_codec: HashMap::new(),
            decoder_params: DecoderParams::default(),
            is_time_sync_disabled: false,
            use_parallel_decoding: false,
            use_parallel_rendering: false,
            min_playback_buffer_percent: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_prefix_applies_only_without_scheme() {
        let mut options = ContainerOptions::default();
        options.protocol_prefix = Some("file".to_string());
        assert_eq!(options.apply_protocol_prefix("/tmp/a.mkv"), "file:///tmp/a.mkv");
        assert_eq!(
            options.apply_protocol_prefix("http://host/a.mkv"),
            "http://host/a.mkv"
        );
    }

    #[test]
    fn scan_all_pmts_defaults_to_one() {
        let options = ContainerOptions::default();
        assert_eq!(options.effective_scan_all_pmts(), "1");
    }

    #[test]
    fn negative_read_timeout_is_disabled() {
        let options = ContainerOptions::default();
        assert!(!options.has_read_timeout());
    }

    #[test]
    fn media_options_round_trip_through_json() {
        let options = MediaOptions::default();
        let json = serde_json::to_string(&options).unwrap();
        let back: MediaOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.min_playback_buffer_percent, 0.5);
        assert!(!back.is_time_sync_disabled);
    }
}
