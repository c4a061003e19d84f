use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context};
use serde::Deserialize;
use url::Url;

use crate::realtime::ReconnectPolicy;

const DEFAULT_CONFIG_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub realtime_url: Option<String>,
    pub user_id: String,
    pub request_timeout_secs: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            realtime_url: None,
            user_id: String::new(),
            request_timeout_secs: 15,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 15_000,
            event_buffer: 1024,
        }
    }
}

impl ClientSettings {
    /// Explicit `realtime_url`, or `server_url` with a ws scheme and `/realtime` appended.
    pub fn realtime_url(&self) -> anyhow::Result<Url> {
        if let Some(raw) = self.realtime_url.as_deref().filter(|raw| !raw.trim().is_empty()) {
            return Url::parse(raw.trim()).with_context(|| format!("invalid realtime_url '{raw}'"));
        }

        let mut url = Url::parse(self.server_url.trim())
            .with_context(|| format!("invalid server_url '{}'", self.server_url))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => bail!("server_url must use http or https, got '{other}'"),
        };
        if url.set_scheme(scheme).is_err() {
            bail!("cannot derive realtime url from '{}'", self.server_url);
        }
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("server_url '{}' cannot be a base", self.server_url))?
            .pop_if_empty()
            .push("realtime");
        Ok(url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial_delay = Duration::from_millis(self.reconnect_initial_delay_ms.max(1));
        ReconnectPolicy {
            initial_delay,
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms).max(initial_delay),
        }
    }

    pub fn ensure_user(&self) -> anyhow::Result<()> {
        if self.user_id.trim().is_empty() {
            bail!("user_id is not configured (set it in the config file, CHAT_USER_ID or --user-id)");
        }
        Ok(())
    }
}

/// Defaults, then the TOML file, then environment overrides. An explicit
/// `path` must exist; without one `chat.toml` in the working directory is
/// read when present.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut settings = match path {
        Some(path) => read_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => read_file(Path::new(DEFAULT_CONFIG_FILE))?,
        None => ClientSettings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn read_file(path: &Path) -> anyhow::Result<ClientSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config file '{}'", path.display()))
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = var("CHAT_REALTIME_URL") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = var("APP__REALTIME_URL") {
        settings.realtime_url = Some(v);
    }

    if let Some(v) = var("CHAT_USER_ID") {
        settings.user_id = v;
    }
    if let Some(v) = var("APP__USER_ID") {
        settings.user_id = v;
    }

    if let Some(v) = var("APP__RECONNECT_INITIAL_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_initial_delay_ms = parsed;
        }
    }
    if let Some(v) = var("APP__RECONNECT_MAX_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_max_delay_ms = parsed;
        }
    }
}
