use std::{collections::HashMap, fs, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::channel::ChannelConfig;

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub server_url: String,
    pub cache_url: String,
    pub shared_key_b64: String,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub typing_quiet_ms: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            cache_url: "sqlite://./data/chat.db".into(),
            // Dev-only placeholder; deployments provision the real key.
            shared_key_b64: STANDARD.encode([0u8; fintrack_codec::KEY_LEN]),
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            typing_quiet_ms: 1_000,
        }
    }
}

impl ChatSettings {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            server_url: self.server_url.clone(),
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
        }
    }

    pub fn typing_quiet(&self) -> Duration {
        Duration::from_millis(self.typing_quiet_ms)
    }
}

pub fn load_settings() -> ChatSettings {
    let mut settings = ChatSettings::default();

    if let Ok(raw) = fs::read_to_string("chat.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("cache_url") {
                settings.cache_url = v.clone();
            }
            if let Some(v) = file_cfg.get("shared_key_b64") {
                settings.shared_key_b64 = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_CACHE_URL") {
        settings.cache_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_SHARED_KEY_B64") {
        settings.shared_key_b64 = v;
    }
    if let Ok(v) = std::env::var("CHAT_RECONNECT_INITIAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_initial_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_RECONNECT_MAX_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_max_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_TYPING_QUIET_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.typing_quiet_ms = parsed;
        }
    }

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_a_parseable_key() {
        let settings = ChatSettings::default();
        assert!(fintrack_codec::BodyCodec::from_base64(&settings.shared_key_b64).is_ok());
        assert_eq!(settings.typing_quiet(), Duration::from_secs(1));
    }

    #[test]
    fn env_overrides_win() {
        std::env::set_var("CHAT_SERVER_URL", "https://chat.example.test");
        std::env::set_var("CHAT_TYPING_QUIET_MS", "250");

        let settings = load_settings();
        assert_eq!(settings.server_url, "https://chat.example.test");
        assert_eq!(settings.typing_quiet_ms, 250);

        std::env::remove_var("CHAT_SERVER_URL");
        std::env::remove_var("CHAT_TYPING_QUIET_MS");
    }

    #[test]
    fn unparseable_numeric_overrides_are_ignored() {
        std::env::set_var("CHAT_RECONNECT_MAX_MS", "soonish");
        let settings = load_settings();
        assert_eq!(
            settings.reconnect_max_ms,
            ChatSettings::default().reconnect_max_ms
        );
        std::env::remove_var("CHAT_RECONNECT_MAX_MS");
    }
}
