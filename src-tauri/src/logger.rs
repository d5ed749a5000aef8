use crate::peer::types::IceCandidate;
use log::{debug, info, LevelFilter};
use std::io::Write;
use webrtc::peer_connection::RTCPeerConnection;

/// Логирование с временными метками
///
/// `RUST_LOG` wins over `filter`. Safe to call more than once.
pub fn init(filter: &str) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter));

    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        builder.filter_level(LevelFilter::Off);
    }

    let _ = builder
        .format(|buf, record| {
            writeln!(
                buf,
                "RUST: [{}] [{:<5}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
