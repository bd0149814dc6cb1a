use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// Whether producer composition offsets are zeroed before packaging.
///
/// Some players misinterpret the composition offsets of fragments built from
/// live sources, so on Linux builds every transport is corrected by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompositionCorrection {
    Keep,
    AdaptiveOnly,
    AllTransports,
}

impl CompositionCorrection {
    pub fn applies_to(self, kind: TransportKind) -> bool {
        match self {
            CompositionCorrection::Keep => false,
            CompositionCorrection::AdaptiveOnly => kind == TransportKind::Hls,
            CompositionCorrection::AllTransports => true,
        }
    }
}

impl Default for CompositionCorrection {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::AllTransports
        } else {
            Self::Keep
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagerConfig {
    /// Cut threshold for sessions without video.
    pub fragment_duration_ms: u64,
    pub composition_correction: CompositionCorrection,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            fragment_duration_ms: 1000,
            composition_correction: CompositionCorrection::default(),
        }
    }
}

impl PackagerConfig {
    pub fn fragment_duration(&self) -> Duration {
        Duration::from_millis(self.fragment_duration_ms)
    }
}

/// API endpoints of the platform resolvers. Only tests override these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub chzzk_api: Option<String>,
    pub chzzk_playback_api: Option<String>,
    pub youtube_api: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Verify TLS certificates of platform APIs and `rtmps`/`rtsps` servers.
    pub strict_tls: bool,
    /// Defaults to a Chrome user agent.
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub hls_retry: u32,

    pub rtmp_idle_timeout_ms: u64,
    pub rtsp_idle_timeout_ms: u64,

    pub srt_latency_ms: u64,
    pub srt_stall_timeout_ms: u64,
    pub srt_queue_capacity: usize,

    pub packager: PackagerConfig,
    pub platform: PlatformConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            strict_tls: false,
            user_agent: None,
            http_timeout_secs: 30,
            hls_retry: 3,
            rtmp_idle_timeout_ms: 30_000,
            rtsp_idle_timeout_ms: 30_000,
            srt_latency_ms: 120,
            srt_stall_timeout_ms: 2_000,
            srt_queue_capacity: 1024,
            packager: PackagerConfig::default(),
            platform: PlatformConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn rtmp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.rtmp_idle_timeout_ms)
    }

    pub fn rtsp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.rtsp_idle_timeout_ms)
    }

    pub fn srt_latency(&self) -> Duration {
        Duration::from_millis(self.srt_latency_ms)
    }

    pub fn srt_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.srt_stall_timeout_ms)
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| fake_user_agent::get_chrome_rua().to_string())
    }
}
