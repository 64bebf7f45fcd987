#![forbid(unsafe_code)]

// mediasoup-backed implementation of the engine boundary

use crate::media::config::{
    CodecMimeType, CodecSpec, RouterConfig, WebRtcTransportConfig, WorkerConfig, WorkerLogLevel, WorkerLogTag,
};
use crate::media::engine::{
    EngineEvent, EngineEventSender, EngineProducer, EngineRouter, EngineTransport, EngineWorker, MediaEngine,
};
use crate::media::types::{DtlsState, MediaError, MediaKind, MediaResult, TransportParameters};
use async_trait::async_trait;
use mediasoup::prelude as ms;
use mediasoup::data_structures::DtlsState as MsDtlsState;
use mediasoup::prelude::Transport;
use mediasoup::worker_manager::WorkerManager;
use mediasoup::worker::{WorkerDtlsFiles, WorkerLogLevel as MsLogLevel, WorkerLogTag as MsLogTag};
use std::num::{NonZeroU32, NonZeroU8};
use tracing::{debug, error, info};

/// Spawns mediasoup worker processes
pub struct MediasoupEngine {
    manager: WorkerManager,
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MediasoupEngine {
    pub fn new() -> Self {
        Self {
            manager: WorkerManager::new(),
        }
    }
}

fn worker_settings(config: &WorkerConfig) -> ms::WorkerSettings {
    let mut settings = ms::WorkerSettings::default();

    settings.log_level = match config.log_level {
        WorkerLogLevel::Debug => MsLogLevel::Debug,
        WorkerLogLevel::Warn => MsLogLevel::Warn,
        WorkerLogLevel::Error => MsLogLevel::Error,
        WorkerLogLevel::None => MsLogLevel::None,
    };
    settings.log_tags = config
        .log_tags
        .iter()
        .map(|tag| match tag {
            WorkerLogTag::Info => MsLogTag::Info,
            WorkerLogTag::Ice => MsLogTag::Ice,
            WorkerLogTag::Dtls => MsLogTag::Dtls,
            WorkerLogTag::Rtp => MsLogTag::Rtp,
            WorkerLogTag::Rtcp => MsLogTag::Rtcp,
        })
        .collect();
    settings.rtc_port_range = config.rtc_min_port..=config.rtc_max_port;

    if let (Some(cert), Some(key)) = (&config.dtls_certificate_file, &config.dtls_private_key_file) {
        settings.dtls_files = Some(WorkerDtlsFiles {
            certificate: cert.clone().into(),
            private_key: key.clone().into(),
        });
    }

    settings
}

fn video_feedback() -> Vec<ms::RtcpFeedback> {
    vec![
        ms::RtcpFeedback::Nack,
        ms::RtcpFeedback::NackPli,
        ms::RtcpFeedback::CcmFir,
        ms::RtcpFeedback::GoogRemb,
        ms::RtcpFeedback::TransportCc,
    ]
}

fn codec_capability(spec: &CodecSpec) -> MediaResult<ms::RtpCodecCapability> {
    let clock_rate = NonZeroU32::new(spec.clock_rate)
        .ok_or_else(|| MediaError::Configuration(format!("Codec {:?} has a zero clock rate", spec.mime_type)))?;

    Ok(match spec.mime_type {
        CodecMimeType::Opus => ms::RtpCodecCapability::Audio {
            mime_type: ms::MimeTypeAudio::Opus,
            preferred_payload_type: spec.preferred_payload_type,
            clock_rate,
            channels: NonZeroU8::new(spec.channels.unwrap_or(2)).unwrap_or(NonZeroU8::MIN),
            parameters: ms::RtpCodecParametersParameters::from([
                ("minptime", 10_u32.into()),
                ("useinbandfec", 1_u32.into()),
            ]),
            rtcp_feedback: vec![ms::RtcpFeedback::TransportCc],
        },
        CodecMimeType::Vp8 => ms::RtpCodecCapability::Video {
            mime_type: ms::MimeTypeVideo::Vp8,
            preferred_payload_type: spec.preferred_payload_type,
            clock_rate,
            parameters: ms::RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
        CodecMimeType::Vp9 => ms::RtpCodecCapability::Video {
            mime_type: ms::MimeTypeVideo::Vp9,
            preferred_payload_type: spec.preferred_payload_type,
            clock_rate,
            parameters: ms::RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
    })
}

fn listen_info(config: &WebRtcTransportConfig, protocol: ms::Protocol) -> ms::ListenInfo {
    ms::ListenInfo {
        protocol,
        ip: config.listen_ip,
        announced_address: config.announced_address.clone(),
        port: None,
        port_range: None,
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
        expose_internal_ip: false,
    }
}

/// Listen infos in preference order
fn transport_options(config: &WebRtcTransportConfig) -> MediaResult<ms::WebRtcTransportOptions> {
    let mut protocols = Vec::with_capacity(2);
    if config.enable_udp {
        protocols.push(ms::Protocol::Udp);
    }
    if config.enable_tcp {
        protocols.push(ms::Protocol::Tcp);
    }
    if !config.prefer_udp {
        protocols.reverse();
    }

    let mut protocols = protocols.into_iter();
    let first = protocols
        .next()
        .ok_or_else(|| MediaError::Configuration("Neither UDP nor TCP is enabled".to_string()))?;

    let mut listen_infos = ms::WebRtcTransportListenInfos::new(listen_info(config, first));
    for protocol in protocols {
        listen_infos = listen_infos.insert(listen_info(config, protocol));
    }

    let mut options = ms::WebRtcTransportOptions::new(listen_infos);
    options.initial_available_outgoing_bitrate = config.initial_available_outgoing_bitrate;
    Ok(options)
}

fn dtls_state(state: MsDtlsState) -> DtlsState {
    match state {
        MsDtlsState::New => DtlsState::New,
        MsDtlsState::Connecting => DtlsState::Connecting,
        MsDtlsState::Connected => DtlsState::Connected,
        MsDtlsState::Failed => DtlsState::Failed,
        MsDtlsState::Closed => DtlsState::Closed,
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> MediaResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| MediaError::TransportFailed(format!("Failed to encode {what}: {e}")))
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn start_worker(
        &self,
        config: &WorkerConfig,
        events: EngineEventSender,
    ) -> MediaResult<Box<dyn EngineWorker>> {
        let worker = self
            .manager
            .create_worker(worker_settings(config))
            .await
            .map_err(|e| MediaError::WorkerFatal(format!("Failed to create worker: {e}")))?;

        let worker_id = worker.id().to_string();
        worker
            .on_dead({
                let worker_id = worker_id.clone();
                move |reason| {
                    error!("mediasoup worker {} exited: {:?}", worker_id, reason);
                    let _ = events.send(EngineEvent::WorkerDied {
                        worker_id,
                        reason: format!("{reason:?}"),
                    });
                }
            })
            .detach();

        info!("Spawned mediasoup worker {}", worker_id);
        Ok(Box::new(MediasoupWorker { worker }))
    }
}

struct MediasoupWorker {
    worker: ms::Worker,
}

#[async_trait]
impl EngineWorker for MediasoupWorker {
    fn id(&self) -> String {
        self.worker.id().to_string()
    }

    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Box<dyn EngineRouter>> {
        let codecs = config
            .media_codecs
            .iter()
            .map(codec_capability)
            .collect::<MediaResult<Vec<_>>>()?;

        let router = self
            .worker
            .create_router(ms::RouterOptions::new(codecs))
            .await
            .map_err(|e| MediaError::WorkerFatal(format!("Failed to create router: {e}")))?;

        Ok(Box::new(MediasoupRouter { router }))
    }
}

struct MediasoupRouter {
    router: ms::Router,
}

#[async_trait]
impl EngineRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.router.id().to_string()
    }

    fn rtp_capabilities(&self) -> MediaResult<serde_json::Value> {
        to_json(self.router.rtp_capabilities(), "router capabilities")
    }

    async fn create_webrtc_transport(
        &self,
        config: &WebRtcTransportConfig,
        events: EngineEventSender,
    ) -> MediaResult<Box<dyn EngineTransport>> {
        let transport = self
            .router
            .create_webrtc_transport(transport_options(config)?)
            .await
            .map_err(|e| MediaError::TransportFailed(format!("Failed to create transport: {e}")))?;

        let transport_id = transport.id().to_string();
        transport
            .on_dtls_state_change({
                let transport_id = transport_id.clone();
                move |state| {
                    debug!("DTLS state: {:?} for transport {}", state, transport_id);
                    let _ = events.send(EngineEvent::DtlsStateChanged {
                        transport_id: transport_id.clone(),
                        state: dtls_state(state),
                    });
                }
            })
            .detach();

        let parameters = TransportParameters {
            ice_parameters: to_json(transport.ice_parameters(), "ICE parameters")?,
            ice_candidates: to_json(transport.ice_candidates(), "ICE candidates")?,
            dtls_parameters: to_json(&transport.dtls_parameters(), "DTLS parameters")?,
        };

        Ok(Box::new(MediasoupTransport { transport, parameters }))
    }
}

struct MediasoupTransport {
    transport: ms::WebRtcTransport,
    parameters: TransportParameters,
}

#[async_trait]
impl EngineTransport for MediasoupTransport {
    fn id(&self) -> String {
        self.transport.id().to_string()
    }

    fn parameters(&self) -> &TransportParameters {
        &self.parameters
    }

    async fn connect(&self, dtls_parameters: serde_json::Value) -> MediaResult<()> {
        let dtls_parameters: ms::DtlsParameters = serde_json::from_value(dtls_parameters)
            .map_err(|e| MediaError::HandshakeFailed(format!("Malformed DTLS parameters: {e}")))?;

        self.transport
            .connect(ms::WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::HandshakeFailed(e.to_string()))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
        app_data: serde_json::Value,
    ) -> MediaResult<Box<dyn EngineProducer>> {
        let rtp_parameters: ms::RtpParameters = serde_json::from_value(rtp_parameters)
            .map_err(|e| MediaError::ProducerFailed(format!("Malformed RTP parameters: {e}")))?;

        let ms_kind = match kind {
            MediaKind::Audio => ms::MediaKind::Audio,
            MediaKind::Video => ms::MediaKind::Video,
        };
        let mut options = ms::ProducerOptions::new(ms_kind, rtp_parameters);
        options.app_data = ms::AppData::new(app_data);

        let producer = self
            .transport
            .produce(options)
            .await
            .map_err(|e| MediaError::ProducerFailed(format!("Failed to create producer: {e}")))?;

        Ok(Box::new(MediasoupProducer { producer, kind }))
    }
}

struct MediasoupProducer {
    producer: ms::Producer,
    kind: MediaKind,
}

impl EngineProducer for MediasoupProducer {
    fn id(&self) -> String {
        self.producer.id().to_string()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }
}
