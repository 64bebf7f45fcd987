#![forbid(unsafe_code)]

// sfu-gateway library - control plane of a mediasoup-based SFU

pub mod media;
pub mod metrics;
pub mod signaling;
