pub mod config;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod ui;
pub mod utils;

#[cfg(feature = "desktop")]
mod commands;

pub use config::CallConfig;
pub use coordinator::CallCoordinator;
pub use error::{CallError, ConfigError, ErrorCategory, MediaAccessCause, MediaAccessError};
pub use session::{CallSnapshot, CallStatus, Direction, ParticipantId, Role, RoomId};
pub use signaling::{InboundSignal, OutboundSignal};
pub use transport::{ChannelTransport, SignalingTransport, TransportEvent, WsTransport};
pub use ui::{CallNotice, CallPhase, Notifier};

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    use std::sync::Arc;
    use tauri::Manager;

    let config = CallConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Falling back to default call config: {e}");
        CallConfig::default()
    });
    logger::init(&config.log_filter);

    tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .setup(move |app| {
            let notifier: Arc<dyn Notifier> = Arc::new(app.handle().clone());
            let (coordinator, peers) = CallCoordinator::with_webrtc(config, notifier);
            app.manage(coordinator);
            app.manage(peers);
            app.manage(commands::SignalingSlot::default());
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            // Signaling
            commands::call_api::connect_signaling,
            commands::call_api::disconnect_signaling,

            // Call control
            commands::call_api::start_call,
            commands::call_api::accept_call,
            commands::call_api::decline_call,
            commands::call_api::end_call,
            commands::call_api::toggle_mute,
            commands::call_api::toggle_video,
            commands::call_api::call_status,

            // ICE settings
            commands::call_api::set_ice_servers,
            commands::call_api::get_ice_servers,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
