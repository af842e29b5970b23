use std::{collections::HashMap, fs, path::Path, time::Duration};

use shared::domain::UserId;
use tracing::warn;
use url::Url;

use crate::{error::ConfigError, reconnect::ReconnectPolicy};

pub const SETTINGS_FILE: &str = "chat_client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub auth_token: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub notification_ttl: Duration,
    pub presence_refresh_interval: Duration,
    pub recording_tick: Duration,
    pub sound_enabled: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".into(),
            auth_token: None,
            reconnect: ReconnectPolicy::default(),
            notification_ttl: Duration::from_millis(5000),
            presence_refresh_interval: Duration::from_secs(30),
            recording_tick: Duration::from_secs(1),
            sound_enabled: true,
        }
    }
}

impl ClientSettings {
    /// Websocket address for one user session: `{ws}/api/chat/ws/{user_id}`.
    pub fn websocket_url(&self, user_id: &UserId) -> Result<Url, ConfigError> {
        let mut url = self.parsed_server_url()?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ConfigError::InvalidServerUrl {
                    url: self.server_url.clone(),
                    reason: format!("unsupported scheme '{other}'"),
                })
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| ConfigError::InvalidServerUrl {
                url: self.server_url.clone(),
                reason: "cannot switch to websocket scheme".into(),
            })?;
        url.path_segments_mut()
            .map_err(|()| ConfigError::InvalidServerUrl {
                url: self.server_url.clone(),
                reason: "url cannot carry a path".into(),
            })?
            .pop_if_empty()
            .extend(["api", "chat", "ws", user_id.as_str()]);
        Ok(url)
    }

    /// REST endpoint under the chat API prefix.
    pub fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/chat/{}",
            self.server_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn parsed_server_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.server_url).map_err(|err| ConfigError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason: err.to_string(),
        })
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply(&mut settings, |key| file_cfg.get(key).cloned()),
            Err(err) => warn!(path = %path.display(), "ignoring unreadable settings file: {err}"),
        }
    }

    if let Some(v) = env("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    apply(&mut settings, |key| env(&format!("APP__{}", key.to_ascii_uppercase())));

    settings
}

fn apply(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("auth_token") {
        settings.auth_token = Some(v);
    }
    if let Some(v) = parse_u64(&lookup, "reconnect_base_delay_ms") {
        settings.reconnect.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = parse_u64(&lookup, "reconnect_max_delay_ms") {
        settings.reconnect.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = parse_u64(&lookup, "reconnect_max_attempts") {
        settings.reconnect.max_attempts = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = parse_u64(&lookup, "notification_ttl_ms") {
        settings.notification_ttl = Duration::from_millis(v);
    }
    if let Some(v) = parse_u64(&lookup, "presence_refresh_secs") {
        settings.presence_refresh_interval = Duration::from_secs(v.max(1));
    }
    if let Some(v) = lookup("sound_enabled") {
        if let Ok(parsed) = v.trim().parse::<bool>() {
            settings.sound_enabled = parsed;
        }
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(err) => {
            warn!(key, value = %raw, "ignoring invalid numeric setting: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_match_backoff_policy() {
        let settings = ClientSettings::default();
        assert_eq!(settings.reconnect.base_delay, Duration::from_millis(2000));
        assert_eq!(settings.reconnect.max_delay, Duration::from_millis(10000));
        assert_eq!(settings.reconnect.max_attempts, 3);
        assert_eq!(settings.notification_ttl, Duration::from_millis(5000));
        assert!(settings.sound_enabled);
    }

    #[test]
    fn websocket_url_switches_scheme_and_encodes_identity() {
        let mut settings = ClientSettings::default();
        settings.server_url = "https://chat.example.com/".into();
        let url = settings
            .websocket_url(&UserId::from("ana maria@example.com"))
            .expect("ws url");
        assert_eq!(
            url.as_str(),
            "wss://chat.example.com/api/chat/ws/ana%20maria@example.com"
        );

        settings.server_url = "http://localhost:8000".into();
        let url = settings.websocket_url(&UserId::from("bob")).expect("ws url");
        assert_eq!(url.as_str(), "ws://localhost:8000/api/chat/ws/bob");
    }

    #[test]
    fn rejects_non_http_server_urls() {
        let mut settings = ClientSettings::default();
        settings.server_url = "ftp://example.com".into();
        assert!(settings.websocket_url(&UserId::from("bob")).is_err());
        settings.server_url = "not a url".into();
        assert!(settings.websocket_url(&UserId::from("bob")).is_err());
    }

    #[test]
    fn api_url_joins_paths() {
        let mut settings = ClientSettings::default();
        settings.server_url = "http://localhost:8000/".into();
        assert_eq!(
            settings.api_url("/rooms"),
            "http://localhost:8000/api/chat/rooms"
        );
    }

    #[test]
    fn file_then_env_overrides_apply_in_order() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("chat_client_settings_{suffix}.toml"));
        fs::write(
            &path,
            "server_url = \"http://files.example.com\"\nreconnect_max_attempts = \"5\"\nsound_enabled = \"false\"\nnotification_ttl_ms = \"oops\"\n",
        )
        .expect("write settings");

        let settings = load_settings_from(&path, |key| match key {
            "APP__RECONNECT_BASE_DELAY_MS" => Some("500".into()),
            "CHAT_SERVER_URL" => Some("http://env.example.com".into()),
            _ => None,
        });
        fs::remove_file(&path).expect("cleanup");

        assert_eq!(settings.server_url, "http://env.example.com");
        assert_eq!(settings.reconnect.max_attempts, 5);
        assert_eq!(settings.reconnect.base_delay, Duration::from_millis(500));
        assert_eq!(settings.notification_ttl, Duration::from_millis(5000));
        assert!(!settings.sound_enabled);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings_from(Path::new("/nonexistent/chat_client.toml"), no_env);
        assert_eq!(settings, ClientSettings::default());
    }
}
