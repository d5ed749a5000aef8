use crate::coordinator::CallCoordinator;
use crate::peer::{RtcPeerFactory, ServerConfig};
use crate::peer::ice::validate_ice_servers;
use crate::session::{CallSnapshot, ParticipantId, RoomId};
use crate::transport::WsTransport;
use log::{info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use tauri::{command, State};

/// Текущее websocket-подключение к серверу сигналинга
#[derive(Default)]
pub struct SignalingSlot(Mutex<Option<Arc<WsTransport>>>);

impl SignalingSlot {
    fn replace(&self, transport: Option<Arc<WsTransport>>) -> Option<Arc<WsTransport>> {
        std::mem::replace(
            &mut *self.0.lock().unwrap_or_else(PoisonError::into_inner),
            transport,
        )
    }
}

/// Подключение к серверу сигналинга; без `url` берём адрес из конфига
#[command]
pub async fn connect_signaling(
    coordinator: State<'_, CallCoordinator>,
    slot: State<'_, SignalingSlot>,
    url: Option<String>,
) -> Result<(), String> {
    let url = url
        .or_else(|| coordinator.config().signaling_url.clone())
        .ok_or_else(|| "No signaling URL configured".to_string())?;

    let (transport, events) = WsTransport::connect(&url)
        .await
        .map_err(|e| e.to_string())?;
    if let Some(old) = slot.replace(Some(transport.clone())) {
        old.disconnect();
    }
    coordinator.set_transport(transport);

    let coordinator = coordinator.inner().clone();
    tauri::async_runtime::spawn(async move {
        coordinator.run(events).await;
    });
    info!("Signaling connected to {url}");
    Ok(())
}

#[command]
pub fn disconnect_signaling(slot: State<'_, SignalingSlot>) {
    if let Some(transport) = slot.replace(None) {
        transport.disconnect();
    }
}

#[command]
pub async fn start_call(
    coordinator: State<'_, CallCoordinator>,
    recipient_id: ParticipantId,
    is_video: bool,
) -> Result<RoomId, String> {
    coordinator
        .start_call(recipient_id, is_video)
        .await
        .map_err(|e| e.to_string())
}

#[command]
pub async fn accept_call(coordinator: State<'_, CallCoordinator>) -> Result<(), String> {
    coordinator.accept_call().await.map_err(|e| e.to_string())
}

#[command]
pub async fn decline_call(coordinator: State<'_, CallCoordinator>) -> Result<(), String> {
    coordinator.decline_call().await.map_err(|e| e.to_string())
}

#[command]
pub async fn end_call(coordinator: State<'_, CallCoordinator>) -> Result<(), String> {
    coordinator.end_call().await;
    Ok(())
}

#[command]
pub fn toggle_mute(coordinator: State<'_, CallCoordinator>) -> Option<bool> {
    coordinator.toggle_mute()
}

#[command]
pub fn toggle_video(coordinator: State<'_, CallCoordinator>) -> Option<bool> {
    coordinator.toggle_video()
}

#[command]
pub fn call_status(coordinator: State<'_, CallCoordinator>) -> CallSnapshot {
    coordinator.snapshot()
}

/// Новые ICE серверы действуют со следующего звонка
#[command]
pub fn set_ice_servers(
    peers: State<'_, Arc<RtcPeerFactory>>,
    servers: Vec<ServerConfig>,
) -> Result<(), String> {
    if let Err(e) = validate_ice_servers(&servers) {
        warn!("Rejected ICE servers: {e}");
        return Err(e.to_string());
    }
    peers.set_ice_servers(servers);
    Ok(())
}

#[command]
pub fn get_ice_servers(peers: State<'_, Arc<RtcPeerFactory>>) -> Vec<ServerConfig> {
    peers.ice_servers()
}
