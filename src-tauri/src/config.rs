// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::ConfigError;
use crate::peer::ice::validate_ice_servers;
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Сколько ждём ответа на звонок, пока не сбросим его сами
pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 45;

/// Период ожидания перед тем, как считать соединение потерянным
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;

/// Дефолтные STUN серверы
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Runtime settings for the call coordinator and its transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket endpoint of the signaling relay.
    pub signaling_url: Option<String>,
    pub ice_servers: Vec<ServerConfig>,
    /// `None` keeps ringing until someone hangs up.
    pub ring_timeout_secs: Option<u64>,
    pub grace_period_secs: u64,
    pub log_filter: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: None,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            ring_timeout_secs: Some(DEFAULT_RING_TIMEOUT_SECS),
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            log_filter: "info".into(),
        }
    }
}

impl CallConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: CallConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Читает конфиг из файла и накладывает переменные окружения поверх
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_json(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for when there is no config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("SSC_SIGNALING_URL") {
            self.signaling_url = Some(url);
        }
        if let Ok(raw) = std::env::var("SSC_RING_TIMEOUT_SECS") {
            match raw.trim() {
                "" | "0" | "none" => self.ring_timeout_secs = None,
                value => match value.parse() {
                    Ok(secs) => self.ring_timeout_secs = Some(secs),
                    Err(_) => log::warn!("Ignoring invalid SSC_RING_TIMEOUT_SECS={value:?}"),
                },
            }
        }
        if let Ok(filter) = std::env::var("SSC_LOG") {
            self.log_filter = filter;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ice_servers(&self.ice_servers)
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        self.ring_timeout_secs.map(Duration::from_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = CallConfig::from_json("{}").unwrap();
        assert_eq!(config, CallConfig::default());
        assert_eq!(config.ring_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn null_ring_timeout_means_unbounded() {
        let config = CallConfig::from_json(r#"{"ring_timeout_secs": null}"#).unwrap();
        assert_eq!(config.ring_timeout(), None);
    }

    #[test]
    fn turn_server_without_credentials_is_rejected() {
        let raw = r#"{"ice_servers": [{"id": "t", "type": "turn", "url": "turn.example.org:3478"}]}"#;
        let err = CallConfig::from_json(raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIceServer(_)));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            CallConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
