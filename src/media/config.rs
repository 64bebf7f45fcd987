#![forbid(unsafe_code)]

// Configuration for the media worker, router codecs and transports

use crate::media::types::{MediaError, MediaKind, MediaResult};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Main media server configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
    pub supervision: SupervisionConfig,
}

impl MediaConfig {
    /// Builds the configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    ///
    /// # Errors
    /// Returns `MediaError::Configuration` if the resulting port range is empty
    pub fn from_env() -> MediaResult<Self> {
        let mut config = Self::default();

        let worker = &mut config.worker_config;
        worker.rtc_min_port = env_or("RTC_MIN_PORT", worker.rtc_min_port);
        worker.rtc_max_port = env_or("RTC_MAX_PORT", worker.rtc_max_port);
        worker.log_level = env_or("WORKER_LOG_LEVEL", worker.log_level);
        worker.dtls_certificate_file = std::env::var("DTLS_CERT_FILE").ok();
        worker.dtls_private_key_file = std::env::var("DTLS_KEY_FILE").ok();

        let transport = &mut config.webrtc_transport_config;
        transport.listen_ip = env_or("LISTEN_IP", transport.listen_ip);
        if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
            transport.announced_address = Some(ip);
        }

        let supervision = &mut config.supervision;
        supervision.connect_timeout = Duration::from_secs(env_or(
            "TRANSPORT_CONNECT_TIMEOUT_SECS",
            supervision.connect_timeout.as_secs(),
        ));
        supervision.restart_backoff = Duration::from_millis(env_or(
            "WORKER_RESTART_BACKOFF_MS",
            supervision.restart_backoff.as_millis() as u64,
        ));
        supervision.restart_backoff_max = Duration::from_millis(env_or(
            "WORKER_RESTART_BACKOFF_MAX_MS",
            supervision.restart_backoff_max.as_millis() as u64,
        ));

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `MediaError::Configuration` for an empty port range or codec list
    pub fn validate(&self) -> MediaResult<()> {
        if self.worker_config.rtc_min_port > self.worker_config.rtc_max_port {
            return Err(MediaError::Configuration(format!(
                "RTC port range is empty: {}-{}",
                self.worker_config.rtc_min_port, self.worker_config.rtc_max_port
            )));
        }
        if self.router_config.media_codecs.is_empty() {
            return Err(MediaError::Configuration("No media codecs configured".to_string()));
        }
        Ok(())
    }
}

/// Reads and parses an environment variable, warning on garbage
fn env_or<T: FromStr + Copy + std::fmt::Debug>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid {}={:?}, using default {:?}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

/// Worker log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

impl FromStr for WorkerLogLevel {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "none" => Ok(Self::None),
            other => Err(MediaError::Configuration(format!("Unknown worker log level: {other}"))),
        }
    }
}

/// Worker log tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLogTag {
    Info,
    Ice,
    Dtls,
    Rtp,
    Rtcp,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub dtls_certificate_file: Option<String>,
    pub dtls_private_key_file: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
            ],
            rtc_min_port: 10000,
            rtc_max_port: 10100,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

/// Codecs the router can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecMimeType {
    #[serde(rename = "audio/opus")]
    Opus,
    #[serde(rename = "video/VP8")]
    Vp8,
    #[serde(rename = "video/VP9")]
    Vp9,
}

impl CodecMimeType {
    pub fn kind(&self) -> MediaKind {
        match self {
            CodecMimeType::Opus => MediaKind::Audio,
            CodecMimeType::Vp8 | CodecMimeType::Vp9 => MediaKind::Video,
        }
    }
}

/// One codec entry of the router capability set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecSpec {
    pub mime_type: CodecMimeType,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
}

impl CodecSpec {
    pub fn kind(&self) -> MediaKind {
        self.mime_type.kind()
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<CodecSpec>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// One audio codec and one video codec
    pub fn default_codecs() -> Vec<CodecSpec> {
        vec![
            CodecSpec {
                mime_type: CodecMimeType::Opus,
                clock_rate: 48000,
                channels: Some(2),
                preferred_payload_type: Some(111),
            },
            CodecSpec {
                mime_type: CodecMimeType::Vp8,
                clock_rate: 90000,
                channels: None,
                preferred_payload_type: Some(96),
            },
        ]
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_address: None,
            initial_available_outgoing_bitrate: 600_000,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the public IP address for the transport
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_address = Some(public_ip.to_string());
        self
    }
}

/// Timing knobs for the supervisor task
#[derive(Debug, Clone)]
pub struct SupervisionConfig {
    /// A transport not connected within this window is closed.
    pub connect_timeout: Duration,
    /// How often unconnected transports are checked against `connect_timeout`.
    pub sweep_interval: Duration,
    /// First delay between failed restart attempts; doubles up to `restart_backoff_max`.
    pub restart_backoff: Duration,
    pub restart_backoff_max: Duration,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            restart_backoff: Duration::from_millis(500),
            restart_backoff_max: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_codecs_one_audio_one_video() {
        let codecs = RouterConfig::default_codecs();
        assert_eq!(codecs.len(), 2);
        assert_eq!(codecs[0].kind(), MediaKind::Audio);
        assert_eq!(codecs[0].clock_rate, 48000);
        assert_eq!(codecs[0].channels, Some(2));
        assert_eq!(codecs[1].kind(), MediaKind::Video);
        assert_eq!(codecs[1].clock_rate, 90000);
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let mut config = MediaConfig::default();
        config.worker_config.rtc_min_port = 20000;
        config.worker_config.rtc_max_port = 10000;
        assert!(matches!(config.validate(), Err(MediaError::Configuration(_))));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARN".parse::<WorkerLogLevel>().unwrap(), WorkerLogLevel::Warn);
        assert!("loud".parse::<WorkerLogLevel>().is_err());
    }

    #[test]
    fn test_codec_wire_format() {
        let json = serde_json::to_value(&RouterConfig::default_codecs()[1]).unwrap();
        assert_eq!(json["mimeType"], "video/VP8");
        assert_eq!(json["clockRate"], 90000);
        assert!(json.get("channels").is_none());
    }
}
