use crate::error::ConfigError;
use crate::peer::types::{IceCandidate, ServerConfig};
use log::{debug, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

// Добавляет схему протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Проверка пользовательских ICE серверов
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.is_empty() {
            return Err(ConfigError::InvalidIceServer(format!(
                "server {:?} has an empty URL",
                server.id
            )));
        }

        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(ConfigError::InvalidIceServer(format!(
                "TURN server {:?} requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}

pub fn to_rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: to_rtc_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );

    if !candidates.is_empty() && summary.relay == 0 {
        warn!("No TURN relay candidates sent - connection through symmetric NAT may fail");
    }
    summary
}
