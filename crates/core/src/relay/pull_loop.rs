//! Relay-side pulling from a camera URL.
//!
//! Two kinds of source are understood, told apart by the response's content
//! type:
//!
//! - **Snapshot**: every GET returns one JPEG. The URL is polled.
//! - **Stream**: a `multipart/x-mixed-replace` response carries JPEG parts
//!   indefinitely. It is read as it arrives and reopened if it ends.
//!
//! Either way frames are published no faster than the pull interval. At most
//! one pull runs at a time. Starting a new one replaces the old; the loop
//! also ends on its own if the source cannot be opened on the first try.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use super::Hub;
use super::multipart::{MultipartSplitter, stream_boundary};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::protocol::{Envelope, PullKind};

/// Error text viewers see when a source cannot be reached at all.
pub const CANNOT_OPEN: &str = "cannot open stream";

/// Largest amount of stream data buffered while waiting for one part.
const MAX_PART_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullSource {
    pub url: String,
    pub kind: PullKind,
}

struct Running {
    source: PullSource,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    interval: Duration,
    retry: Duration,
    timeout: Duration,
}

pub struct PullManager {
    http: reqwest::Client,
    hub: Arc<Hub>,
    timing: Timing,
    current: Mutex<Option<Running>>,
}

impl PullManager {
    pub fn new(hub: Arc<Hub>, config: &RelayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            hub,
            timing: Timing {
                interval: config.pull_interval,
                retry: config.pull_retry,
                timeout: config.pull_timeout,
            },
            current: Mutex::new(None),
        }
    }

    /// Begin pulling `url`, replacing any pull already running.
    pub fn start(&self, url: &str, kind: PullKind) -> Result<()> {
        let url = validate(url)?;
        let source = PullSource {
            url: url.to_string(),
            kind,
        };

        let task = tokio::spawn(run(
            self.http.clone(),
            url,
            kind,
            self.hub.clone(),
            self.timing,
        ));

        let previous = self.current.lock().replace(Running {
            source: source.clone(),
            task,
        });
        if let Some(previous) = previous {
            previous.task.abort();
            tracing::info!(old = %previous.source.url, new = %source.url, "pull source replaced");
        } else {
            tracing::info!(url = %source.url, %kind, "pull started");
        }
        Ok(())
    }

    /// Stop the current pull, if any. Returns whether one was running.
    pub fn stop(&self) -> bool {
        match self.current.lock().take() {
            Some(running) => {
                running.task.abort();
                tracing::info!(url = %running.source.url, "pull stopped");
                true
            }
            None => false,
        }
    }

    /// Source of the pull that is still running.
    pub fn current(&self) -> Option<PullSource> {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|r| r.task.is_finished()) {
            *current = None;
        }
        current.as_ref().map(|r| r.source.clone())
    }
}

impl Drop for PullManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn validate(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RelayError::InvalidSource("source URL is empty".to_string()));
    }
    let url = Url::parse(raw).map_err(|e| RelayError::InvalidSource(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RelayError::InvalidSource(format!(
            "unsupported source scheme '{other}'"
        ))),
    }
}

/// What an opened source delivers.
enum Delivery {
    Snapshot(Vec<u8>),
    Stream {
        response: reqwest::Response,
        boundary: String,
    },
}

async fn open(http: &reqwest::Client, url: &Url, timeout: Duration) -> Result<Delivery> {
    let response = tokio::time::timeout(timeout, http.get(url.clone()).send())
        .await
        .map_err(io::Error::from)??
        .error_for_status()?;

    let boundary = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(stream_boundary);
    if let Some(boundary) = boundary {
        return Ok(Delivery::Stream { response, boundary });
    }

    let body = tokio::time::timeout(timeout, response.bytes())
        .await
        .map_err(io::Error::from)??;
    if body.is_empty() {
        return Err(RelayError::InvalidSource("empty response body".to_string()));
    }
    Ok(Delivery::Snapshot(body.to_vec()))
}

/// Publish the parts of a multipart stream until it ends or fails.
/// Returns how many frames were published.
async fn read_stream(
    mut response: reqwest::Response,
    boundary: &str,
    kind: PullKind,
    hub: &Hub,
    timing: Timing,
) -> Result<u64> {
    let mut splitter = MultipartSplitter::new(boundary);
    let mut last: Option<Instant> = None;
    let mut published = 0;

    loop {
        let chunk = tokio::time::timeout(timing.timeout, response.chunk())
            .await
            .map_err(io::Error::from)??;
        let Some(chunk) = chunk else {
            return Ok(published);
        };
        splitter.push(&chunk);

        while let Some(jpeg) = splitter.next_part() {
            if jpeg.is_empty() {
                continue;
            }
            let now = Instant::now();
            if last.is_some_and(|at| now < at + timing.interval) {
                continue;
            }
            last = Some(now);
            hub.publish_frame(&jpeg, kind);
            published += 1;
        }

        if splitter.buffered() > MAX_PART_BYTES {
            return Err(RelayError::MalformedMessage(format!(
                "stream part exceeds {MAX_PART_BYTES} bytes"
            )));
        }
    }
}

async fn run(http: reqwest::Client, url: Url, kind: PullKind, hub: Arc<Hub>, timing: Timing) {
    let mut opened = false;
    loop {
        let started = Instant::now();
        match open(&http, &url, timing.timeout).await {
            Ok(Delivery::Snapshot(jpeg)) => {
                opened = true;
                hub.publish_frame(&jpeg, kind);
                tokio::time::sleep_until(started + timing.interval).await;
            }
            Ok(Delivery::Stream { response, boundary }) => {
                if !opened {
                    tracing::info!(%url, %boundary, "pull source is a multipart stream");
                }
                opened = true;
                match read_stream(response, &boundary, kind, &hub, timing).await {
                    Ok(frames) => tracing::debug!(%url, frames, "pull stream ended, reopening"),
                    Err(e) => tracing::debug!(%url, error = %e, "pull stream failed, reopening"),
                }
                tokio::time::sleep(timing.retry).await;
            }
            Err(e) if !opened => {
                tracing::warn!(%url, error = %e, "pull source could not be opened");
                hub.broadcast(&Envelope::error(CANNOT_OPEN));
                return;
            }
            Err(e) => {
                tracing::debug!(%url, error = %e, "pull fetch failed, retrying");
                tokio::time::sleep(timing.retry).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::body::{Body, Bytes};
    use axum::http::header;
    use axum::routing::get;
    use futures_util::stream::Stream;

    use super::*;
    use crate::protocol::jpeg_data_url;
    use crate::relay::registry::Outgoing;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Endless MJPEG body: one tiny JPEG part every 100 ms, no Content-Length.
    fn mjpeg_parts() -> impl Stream<Item = std::result::Result<Bytes, std::convert::Infallible>> {
        futures_util::stream::unfold(0u8, |seq| async move {
            if seq > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let mut part =
                format!("--frame\r\nX-Sequence: {seq}\r\nContent-Type: image/jpeg\r\n\r\n")
                    .into_bytes();
            part.extend_from_slice(&[0xFF, 0xD8, seq]);
            part.extend_from_slice(b"\r\n");
            Some((Ok(Bytes::from(part)), seq.wrapping_add(1)))
        })
    }

    async fn next_frame(rx: &mut tokio::sync::mpsc::Receiver<Outgoing>) -> String {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no envelope from pull loop")
            .unwrap();
        match Envelope::parse(&msg).unwrap() {
            Some(Envelope::Frame(frame)) => frame.image,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_and_non_http_sources() {
        assert!(matches!(validate(""), Err(RelayError::InvalidSource(_))));
        assert!(matches!(validate("  "), Err(RelayError::InvalidSource(_))));
        assert!(matches!(validate("rtsp://cam/live"), Err(RelayError::InvalidSource(_))));
        assert!(matches!(validate("not a url"), Err(RelayError::InvalidSource(_))));
        assert_eq!(validate(" http://cam/capture ").unwrap().as_str(), "http://cam/capture");
    }

    #[tokio::test]
    async fn unreachable_source_reports_error_and_ends() {
        let hub = Arc::new(Hub::default());
        let (_watcher, mut rx) = hub.registry().register("test");
        let config = RelayConfig {
            pull_timeout: Duration::from_millis(500),
            ..RelayConfig::default()
        };
        let pulls = PullManager::new(hub, &config);

        // Port 9 on loopback refuses connections.
        pulls.start("http://127.0.0.1:9/capture", PullKind::Fire).unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Envelope::parse(&msg).unwrap(),
            Some(Envelope::error(CANNOT_OPEN))
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pulls.current(), None);
    }

    #[tokio::test]
    async fn start_replaces_and_stop_is_idempotent() {
        let pulls = PullManager::new(Arc::new(Hub::default()), &RelayConfig::default());
        pulls.start("http://127.0.0.1:9/a", PullKind::Both).unwrap();
        pulls.start("http://127.0.0.1:9/b", PullKind::Ppe).unwrap();
        // Nothing has yielded to the runtime yet, so the new loop is still live.
        assert_eq!(
            pulls.current(),
            Some(PullSource {
                url: "http://127.0.0.1:9/b".to_string(),
                kind: PullKind::Ppe,
            })
        );
        assert!(pulls.stop());
        assert!(!pulls.stop());
        assert_eq!(pulls.current(), None);
    }

    #[tokio::test]
    async fn multipart_stream_source_publishes_each_part() {
        let origin = serve(Router::new().route(
            "/mjpeg",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")],
                    Body::from_stream(mjpeg_parts()),
                )
            }),
        ))
        .await;

        let hub = Arc::new(Hub::default());
        let (_watcher, mut rx) = hub.registry().register("test");
        let config = RelayConfig {
            pull_interval: Duration::from_millis(10),
            ..RelayConfig::default()
        };
        let pulls = PullManager::new(hub, &config);
        pulls.start(&format!("{origin}/mjpeg"), PullKind::Both).unwrap();

        for seq in 0..3u8 {
            assert_eq!(next_frame(&mut rx).await, jpeg_data_url(&[0xFF, 0xD8, seq]));
        }
        assert!(pulls.current().is_some());
        assert!(pulls.stop());
    }

    #[tokio::test]
    async fn snapshot_source_is_polled() {
        let origin = serve(Router::new().route(
            "/still",
            get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], vec![0xFF, 0xD8, 0xFF, 0xD9]) }),
        ))
        .await;

        let hub = Arc::new(Hub::default());
        let (_watcher, mut rx) = hub.registry().register("test");
        let pulls = PullManager::new(hub, &RelayConfig::default());
        pulls.start(&format!("{origin}/still"), PullKind::Fire).unwrap();

        let still = jpeg_data_url(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(next_frame(&mut rx).await, still);
        assert_eq!(next_frame(&mut rx).await, still);
        assert!(pulls.stop());
    }
}
