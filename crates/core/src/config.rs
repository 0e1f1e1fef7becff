use std::time::Duration;

/// Path of the push channel under the streaming base URL.
pub const STREAM_PATH: &str = "/ws/events";

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_EVENT_CAPACITY: usize = 200;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 200;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub api_url: String,
    /// Explicit streaming base; derived from `api_url` or `host` when unset.
    pub stream_url: Option<String>,
    /// Host the dashboard is served from, used as the last streaming fallback.
    pub host: Option<String>,
    pub token: Option<String>,
    pub event_capacity: usize,
    pub page_size: usize,
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub diagnostics_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            stream_url: None,
            host: None,
            token: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            page_size: DEFAULT_PAGE_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Streaming base URL: the explicit override, else the HTTP base with its
    /// scheme swapped, else the current host, else localhost.
    pub fn stream_base(&self) -> String {
        if let Some(ref url) = self.stream_url {
            return url.trim_end_matches('/').to_string();
        }
        if self.api_url.starts_with("http") {
            return self
                .api_url
                .replacen("http", "ws", 1)
                .trim_end_matches('/')
                .to_string();
        }
        match self.host {
            Some(ref host) => format!("ws://{}", host),
            None => "ws://localhost:8000".into(),
        }
    }

    /// Full URL of the push channel.
    pub fn stream_endpoint(&self) -> String {
        format!("{}{}", self.stream_base(), STREAM_PATH)
    }
}
