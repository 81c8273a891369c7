//! Client and relay configuration.
//!
//! Every knob has a `Default`; the CLI maps its arguments onto these structs.

use std::time::Duration;

use url::Url;

use crate::error::{RelayError, Result};

/// Lowest frame rate a publisher may be set to.
pub const MIN_FPS: u32 = 3;
/// Highest frame rate a publisher may be set to. Handheld capture devices
/// become unstable above this.
pub const MAX_FPS: u32 = 12;
/// Frame rate used when none is configured.
pub const DEFAULT_FPS: u32 = 6;

/// Interval between subscriber liveness pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
/// Length of the subscriber's alert history.
pub const DEFAULT_ALERT_HISTORY: usize = 50;

/// Relay path that viewers subscribe on.
pub const WATCH_PATH: &str = "/stream/ws";
/// Relay path that publishers push binary frames to.
pub const PUSH_PATH: &str = "/stream/push-ws";
/// HTTP fallback for publishers that cannot hold a socket open.
pub const PUSH_HTTP_PATH: &str = "/stream/push";
/// Control endpoints for relay-side pulling.
pub const START_PATH: &str = "/stream/start";
pub const STOP_PATH: &str = "/stream/stop";
pub const STATUS_PATH: &str = "/stream/status";

/// Reconnect delay policy for the [`ReconnectSupervisor`](crate::channel::ReconnectSupervisor).
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first consecutive failure.
    pub base: Duration,
    /// Multiplier applied per additional consecutive failure.
    pub factor: u32,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2,
            cap: Duration::from_secs(10),
        }
    }
}

/// Settings shared by publishers and subscribers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Page origin the client runs under, e.g. `https://site.example`.
    pub origin: String,
    /// Initial publisher frame rate.
    pub fps: u32,
    /// Subscriber liveness ping interval.
    pub ping_interval: Duration,
    /// Maximum alerts retained by a subscriber.
    pub alert_history: usize,
    /// Reconnect policy.
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            origin: "http://127.0.0.1:8000".to_string(),
            fps: DEFAULT_FPS,
            ping_interval: DEFAULT_PING_INTERVAL,
            alert_history: DEFAULT_ALERT_HISTORY,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// WebSocket URL viewers connect to.
    pub fn watch_url(&self) -> Result<String> {
        channel_url(&self.origin, WATCH_PATH)
    }

    /// WebSocket URL publishers push to.
    pub fn push_url(&self) -> Result<String> {
        channel_url(&self.origin, PUSH_PATH)
    }
}

/// Server-side relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the relay listens on.
    pub bind_addr: String,
    /// Per-watcher outbound queue depth. A watcher whose queue is full
    /// misses messages until it drains.
    pub watcher_queue: usize,
    /// Minimum spacing between frames taken from a pull source, whether
    /// polled snapshots or parts of a multipart stream.
    pub pull_interval: Duration,
    /// Delay after a failed poll before retrying.
    pub pull_retry: Duration,
    /// Timeout for a snapshot fetch, for response headers, and for the gap
    /// between chunks of a stream.
    pub pull_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            watcher_queue: 64,
            pull_interval: Duration::from_millis(100),
            pull_retry: Duration::from_millis(200),
            pull_timeout: Duration::from_secs(5),
        }
    }
}

/// Derive a channel endpoint from a page origin.
///
/// The WebSocket scheme follows the origin: `http` → `ws`, `https` → `wss`.
/// Any path on the origin is replaced by `path`.
///
/// `https://site.example/app` + `/stream/ws` → `wss://site.example/stream/ws`
pub fn channel_url(origin: &str, path: &str) -> Result<String> {
    let mut url = Url::parse(origin)
        .map_err(|e| RelayError::InvalidSource(format!("{origin}: {e}")))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RelayError::InvalidSource(format!(
                "unsupported origin scheme '{other}'"
            )));
        }
    };

    url.set_scheme(scheme)
        .map_err(|_| RelayError::InvalidSource(format!("cannot rewrite scheme of {origin}")))?;
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Join a control path onto an HTTP origin.
pub(crate) fn control_url(origin: &str, path: &str) -> Result<String> {
    let mut url = Url::parse(origin)
        .map_err(|e| RelayError::InvalidSource(format!("{origin}: {e}")))?;
    url.set_path(path);
    url.set_query(None);
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_origin_maps_to_ws() {
        assert_eq!(
            channel_url("http://localhost:5173", WATCH_PATH).unwrap(),
            "ws://localhost:5173/stream/ws"
        );
    }

    #[test]
    fn https_origin_maps_to_wss() {
        assert_eq!(
            channel_url("https://site.example/app/page", PUSH_PATH).unwrap(),
            "wss://site.example/stream/push-ws"
        );
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert!(matches!(
            channel_url("ftp://host", WATCH_PATH),
            Err(RelayError::InvalidSource(_))
        ));
    }

    #[test]
    fn garbage_origin_rejected() {
        assert!(channel_url("not a url", WATCH_PATH).is_err());
    }

    #[test]
    fn control_url_replaces_path() {
        assert_eq!(
            control_url("http://relay:8000/ui", "/stream/start").unwrap(),
            "http://relay:8000/stream/start"
        );
    }

    #[test]
    fn default_fps_within_bounds() {
        let cfg = ClientConfig::default();
        assert!((MIN_FPS..=MAX_FPS).contains(&cfg.fps));
    }
}
