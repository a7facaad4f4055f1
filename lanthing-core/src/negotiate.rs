//! Session parameter negotiation.
//!
//! Runs once at session start on the host side: clamp the client's display
//! request to a mode the host can drive, then intersect the client's codec
//! preference list with the host's probed encode abilities. The first host
//! ability matching a client codec, walked in the *client's* preference
//! order, wins. No intersection fails the negotiation and the session
//! closes.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LtError;
use crate::types::{AudioCodec, EncoderBackend, VideoCodec};

// ── DisplaySetting ───────────────────────────────────────────────

/// A display mode request or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySetting {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
}

impl DisplaySetting {
    pub const fn new(width: u32, height: u32, refresh_hz: u32) -> Self {
        Self {
            width,
            height,
            refresh_hz,
        }
    }

    /// The fallback used when clamping fails entirely.
    pub const FALLBACK: DisplaySetting = DisplaySetting::new(1920, 1080, 60);
}

/// One probed encoder capability: a backend that can produce a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeAbility {
    pub backend: EncoderBackend,
    pub codec: VideoCodec,
}

// ── RateControlConfig ────────────────────────────────────────────

/// Centralized rate-control defaults, carried in [`SessionParams`] so both
/// sides agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateControlConfig {
    pub min_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub start_bitrate_bps: u32,
    /// Keyframe cadence fallback when no loss signal arrives.
    pub keyframe_interval_ms: u32,
    /// Receiver loss ratio (percent) above which a keyframe is forced.
    pub loss_threshold_pct: u8,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            min_bitrate_bps: 1_000_000,
            max_bitrate_bps: 8_000_000,
            start_bitrate_bps: 4_000_000,
            keyframe_interval_ms: 5_000,
            loss_threshold_pct: 5,
        }
    }
}

// ── SessionParams ────────────────────────────────────────────────

/// The negotiated session configuration. Immutable once agreed; any change
/// requires a re-negotiation round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    pub video: VideoParams,
    pub audio: AudioParams,
    pub enable_gamepad: bool,
    pub enable_driver_input: bool,
    /// Adapter the capture side selected; the encoder opens pool slots on
    /// the same device.
    pub luid: i64,
    pub rate_control: RateControlConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    pub codec: VideoCodec,
    pub encoder_backend: EncoderBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub codec: AudioCodec,
}

// ── Display negotiation ──────────────────────────────────────────

/// Modes the host is willing to drive when it cannot query the OS.
///
/// Real display enumeration is platform work done by the capture backend;
/// the negotiator only needs a clamp target.
const KNOWN_MODES: &[(u32, u32)] = &[
    (3840, 2160),
    (2560, 1440),
    (1920, 1200),
    (1920, 1080),
    (1600, 900),
    (1366, 768),
    (1280, 720),
];

/// Clamp the client's display request to a supported mode.
///
/// Picks the largest known mode that does not exceed the request. A
/// degenerate request (zero dimension) or one smaller than every known
/// mode falls back to [`DisplaySetting::FALLBACK`].
pub fn negotiate_display(client: DisplaySetting) -> DisplaySetting {
    if client.width == 0 || client.height == 0 || client.refresh_hz == 0 {
        warn!(
            "degenerate display request {}x{}@{}, falling back to {}x{}@{}",
            client.width,
            client.height,
            client.refresh_hz,
            DisplaySetting::FALLBACK.width,
            DisplaySetting::FALLBACK.height,
            DisplaySetting::FALLBACK.refresh_hz,
        );
        return DisplaySetting::FALLBACK;
    }
    for &(w, h) in KNOWN_MODES {
        if w <= client.width && h <= client.height {
            let refresh = client.refresh_hz.clamp(30, 240);
            let setting = DisplaySetting::new(w, h, refresh);
            debug!(
                "negotiated display {}x{}@{} (client asked {}x{}@{})",
                w, h, refresh, client.width, client.height, client.refresh_hz
            );
            return setting;
        }
    }
    DisplaySetting::FALLBACK
}

// ── Codec negotiation ────────────────────────────────────────────

/// Pick the first host ability matching the client's preference order.
pub fn negotiate_codec(
    client_preference: &[VideoCodec],
    host_abilities: &[EncodeAbility],
) -> Result<EncodeAbility, LtError> {
    for &wanted in client_preference {
        if let Some(ability) = host_abilities.iter().find(|a| a.codec == wanted) {
            debug!("negotiated video codec {:?} via {:?}", ability.codec, ability.backend);
            return Ok(*ability);
        }
    }
    let client: Vec<&str> = client_preference.iter().map(|c| c.as_str()).collect();
    let host: Vec<&str> = host_abilities.iter().map(|a| a.codec.as_str()).collect();
    Err(LtError::Negotiation(format!(
        "no common video codec, client supports {client:?}, host supports {host:?}"
    )))
}

/// Assemble the full [`SessionParams`] from the client request and the
/// host's probed capabilities.
pub fn negotiate(
    client_display: DisplaySetting,
    client_codecs: &[VideoCodec],
    host_abilities: &[EncodeAbility],
    audio: AudioParams,
    luid: i64,
) -> Result<SessionParams, LtError> {
    let display = negotiate_display(client_display);
    let ability = negotiate_codec(client_codecs, host_abilities)?;
    Ok(SessionParams {
        video: VideoParams {
            width: display.width,
            height: display.height,
            refresh_hz: display.refresh_hz,
            codec: ability.codec,
            encoder_backend: ability.backend,
        },
        audio,
        enable_gamepad: false,
        enable_driver_input: false,
        luid,
        rate_control: RateControlConfig::default(),
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn abilities(list: &[(EncoderBackend, VideoCodec)]) -> Vec<EncodeAbility> {
        list.iter()
            .map(|&(backend, codec)| EncodeAbility { backend, codec })
            .collect()
    }

    #[test]
    fn client_preference_order_wins() {
        // Client prefers H265 then H264; host only does H264.
        let host = abilities(&[(EncoderBackend::Software, VideoCodec::H264)]);
        let picked =
            negotiate_codec(&[VideoCodec::H265, VideoCodec::H264], &host).unwrap();
        assert_eq!(picked.codec, VideoCodec::H264);
    }

    #[test]
    fn preference_beats_host_order() {
        let host = abilities(&[
            (EncoderBackend::Software, VideoCodec::H264),
            (EncoderBackend::NvEnc, VideoCodec::H265),
        ]);
        let picked =
            negotiate_codec(&[VideoCodec::H265, VideoCodec::H264], &host).unwrap();
        assert_eq!(picked.codec, VideoCodec::H265);
        assert_eq!(picked.backend, EncoderBackend::NvEnc);
    }

    #[test]
    fn no_intersection_is_an_error() {
        let host = abilities(&[(EncoderBackend::Software, VideoCodec::H264)]);
        let err = negotiate_codec(&[VideoCodec::H265], &host).unwrap_err();
        assert!(matches!(err, LtError::Negotiation(_)));
    }

    #[test]
    fn display_clamps_down() {
        let got = negotiate_display(DisplaySetting::new(2000, 1100, 60));
        assert_eq!((got.width, got.height), (1920, 1080));
    }

    #[test]
    fn display_exact_match_kept() {
        let got = negotiate_display(DisplaySetting::new(2560, 1440, 144));
        assert_eq!((got.width, got.height, got.refresh_hz), (2560, 1440, 144));
    }

    #[test]
    fn degenerate_display_falls_back() {
        let got = negotiate_display(DisplaySetting::new(0, 1080, 60));
        assert_eq!(got, DisplaySetting::FALLBACK);
    }

    #[test]
    fn tiny_display_falls_back() {
        let got = negotiate_display(DisplaySetting::new(320, 200, 60));
        assert_eq!(got, DisplaySetting::FALLBACK);
    }

    #[test]
    fn full_negotiation_carries_rate_control() {
        let host = abilities(&[(EncoderBackend::Software, VideoCodec::H264)]);
        let audio = AudioParams {
            sample_rate: 48_000,
            channels: 2,
            codec: AudioCodec::Opus,
        };
        let params = negotiate(
            DisplaySetting::new(1920, 1080, 60),
            &[VideoCodec::H264],
            &host,
            audio,
            0x1234,
        )
        .unwrap();
        assert_eq!(params.video.codec, VideoCodec::H264);
        assert_eq!(params.luid, 0x1234);
        assert_eq!(params.rate_control, RateControlConfig::default());
    }
}
