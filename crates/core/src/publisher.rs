//! Capture → encode → rate-limit → send loop.
//!
//! A [`Publisher`] owns one capture source and pushes its frames to the relay
//! as binary messages over a supervised channel. The loop drops frames
//! rather than queueing them: when the channel is not open the tick is
//! skipped, and at most one encoded frame is ever waiting to go out.
//!
//! ## Tick
//!
//! ```text
//! channel open? ──no──> wait for next tick
//!      │yes
//! grab ──not ready / transient──> wait
//!      │             └─revoked / denied──> stop session, status = Failed
//! encode ──error──> log, wait
//!      │
//! still running and open? ──> send
//!      │
//! wait until tick start + 1/fps
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::{Backoff, ChannelHandle, ChannelMessage, Connector, ReconnectSupervisor};
use crate::channel::ws::WsConnector;
use crate::config::ClientConfig;
use crate::error::{RelayError, Result};
use crate::media::{
    CaptureError, CaptureSource, DeviceRegistry, FrameEncoder, JpegEncoder, RateBudget,
    RateLimiter,
};

/// Lifecycle of a publisher session as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherStatus {
    Idle,
    Streaming,
    /// The capture source was lost and the session ended on its own. Holds
    /// the reason; the condition is [`RelayError::CaptureUnavailable`].
    Failed(String),
}

/// Counters for one publisher, cumulative across sessions.
#[derive(Debug, Default)]
pub struct PublisherStats {
    ticks: AtomicU64,
    skipped_closed: AtomicU64,
    not_ready: AtomicU64,
    capture_errors: AtomicU64,
    encode_failures: AtomicU64,
    send_attempts: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Point-in-time copy of [`PublisherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub skipped_closed: u64,
    pub not_ready: u64,
    pub capture_errors: u64,
    pub encode_failures: u64,
    pub send_attempts: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped_closed: self.skipped_closed.load(Ordering::Relaxed),
            not_ready: self.not_ready.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            send_attempts: self.send_attempts.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared between the publisher handle and its loop task.
struct Shared {
    device_id: String,
    source: Mutex<Box<dyn CaptureSource>>,
    claimed: AtomicBool,
    running: AtomicBool,
    status: watch::Sender<PublisherStatus>,
    stats: PublisherStats,
}

impl Shared {
    /// Close the device and give up the exclusive claim. Idempotent.
    fn release_capture(&self) {
        if self.claimed.swap(false, Ordering::SeqCst) {
            self.source.lock().release();
            DeviceRegistry::global().release(&self.device_id);
            tracing::info!(device_id = %self.device_id, "capture source released");
        }
    }
}

struct Session {
    supervisor: Arc<ReconnectSupervisor>,
    task: JoinHandle<()>,
}

/// Pushes frames from one capture source to the relay.
pub struct Publisher {
    shared: Arc<Shared>,
    encoder: Arc<dyn FrameEncoder>,
    budget: RateBudget,
    backoff: Backoff,
    session: Mutex<Option<Session>>,
}

impl Publisher {
    pub fn new(
        source: Box<dyn CaptureSource>,
        encoder: Arc<dyn FrameEncoder>,
        backoff: Backoff,
    ) -> Self {
        let (status, _) = watch::channel(PublisherStatus::Idle);
        Self {
            shared: Arc::new(Shared {
                device_id: source.device_id().to_string(),
                source: Mutex::new(source),
                claimed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                status,
                stats: PublisherStats::default(),
            }),
            encoder,
            budget: RateBudget::default(),
            backoff,
            session: Mutex::new(None),
        }
    }

    /// Publisher with the default JPEG encoder and `config`'s rate and backoff.
    pub fn from_config(source: Box<dyn CaptureSource>, config: &ClientConfig) -> Self {
        let publisher = Self::new(
            source,
            Arc::new(JpegEncoder::default()),
            Backoff::new(config.backoff.clone()),
        );
        publisher.budget.set_fps(config.fps);
        publisher
    }

    /// Acquire the capture source and start streaming to `connector`.
    ///
    /// Fails with [`RelayError::CaptureUnavailable`] if the device is held by
    /// another publisher or refuses to open. Channel problems never fail
    /// `start`; they show up as channel state.
    pub fn start(&self, fps: u32, connector: Arc<dyn Connector>) -> Result<()> {
        let mut session = self.session.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }
        // A session that failed on its own leaves its handles behind.
        if let Some(ended) = session.take() {
            ended.task.abort();
            ended.supervisor.stop();
        }

        let device_id = self.shared.device_id.clone();
        if !DeviceRegistry::global().claim(&device_id) {
            return Err(RelayError::CaptureUnavailable(format!(
                "device {device_id} is in use"
            )));
        }
        self.shared.claimed.store(true, Ordering::SeqCst);

        let opened = self.shared.source.lock().open();
        if let Err(e) = opened {
            tracing::warn!(%device_id, error = %e, "capture open failed");
            self.shared.release_capture();
            return Err(e.into());
        }

        let fps = self.budget.set_fps(fps);
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.status.send_replace(PublisherStatus::Streaming);

        // Publishers ignore anything the relay sends back.
        let (supervisor, _inbound) = ReconnectSupervisor::spawn(connector, self.backoff.clone());
        let supervisor = Arc::new(supervisor);

        let ctx = LoopContext {
            shared: self.shared.clone(),
            encoder: self.encoder.clone(),
            limiter: RateLimiter::new(self.budget.clone()),
            channel: supervisor.handle(),
            supervisor: supervisor.clone(),
        };
        let task = tokio::spawn(ctx.run());

        tracing::info!(%device_id, fps, endpoint = %supervisor.target(), "publisher started");
        *session = Some(Session { supervisor, task });
        Ok(())
    }

    /// Start streaming to the relay's push endpoint for `config.origin`.
    pub fn start_with_config(&self, config: &ClientConfig) -> Result<()> {
        let connector = Arc::new(WsConnector::new(&config.push_url()?));
        self.start(config.fps, connector)
    }

    /// Stop streaming, close the channel without reconnecting and release the
    /// capture source. Safe to call at any time, any number of times.
    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        if let Some(session) = self.session.lock().take() {
            session.task.abort();
            session.supervisor.stop();
        }
        self.shared.release_capture();
        self.shared.status.send_if_modified(|s| {
            if *s == PublisherStatus::Streaming {
                *s = PublisherStatus::Idle;
                true
            } else {
                false
            }
        });
        if was_running {
            tracing::info!(device_id = %self.shared.device_id, "publisher stopped");
        }
    }

    /// Change the target frame rate. Takes effect on the next tick.
    /// Returns the clamped value.
    pub fn set_rate(&self, fps: u32) -> u32 {
        let applied = self.budget.set_fps(fps);
        tracing::info!(fps = applied, "publisher rate changed");
        applied
    }

    pub fn fps(&self) -> u32 {
        self.budget.fps()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PublisherStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PublisherStatus> {
        self.shared.status.subscribe()
    }

    /// Channel of the current session, if one is running.
    pub fn channel(&self) -> Option<ChannelHandle> {
        self.session.lock().as_ref().map(|s| s.supervisor.handle())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Grab {
    Image(crate::media::RawImage),
    Skip,
    Fatal(String),
}

struct LoopContext {
    shared: Arc<Shared>,
    encoder: Arc<dyn FrameEncoder>,
    limiter: RateLimiter,
    channel: ChannelHandle,
    supervisor: Arc<ReconnectSupervisor>,
}

impl LoopContext {
    async fn run(self) {
        let stats = &self.shared.stats;

        while self.shared.running.load(Ordering::SeqCst) {
            let tick = Instant::now();
            bump(&stats.ticks);

            if !self.channel.is_open() {
                bump(&stats.skipped_closed);
                self.limiter.wait(tick).await;
                continue;
            }

            match self.grab() {
                Grab::Image(image) => self.encode_and_send(image).await,
                Grab::Skip => {}
                Grab::Fatal(reason) => {
                    self.fail(reason);
                    return;
                }
            }

            self.limiter.wait(tick).await;
        }
        tracing::debug!(device_id = %self.shared.device_id, "publisher loop exited");
    }

    fn grab(&self) -> Grab {
        let stats = &self.shared.stats;
        let result = self.shared.source.lock().grab();
        match result {
            Ok(image) => Grab::Image(image),
            Err(CaptureError::NotReady) => {
                bump(&stats.not_ready);
                Grab::Skip
            }
            Err(CaptureError::Transient(reason)) => {
                bump(&stats.capture_errors);
                tracing::debug!(%reason, "capture error, skipping tick");
                Grab::Skip
            }
            Err(e @ (CaptureError::Denied(_) | CaptureError::Revoked(_))) => {
                if self.shared.running.load(Ordering::SeqCst) {
                    Grab::Fatal(e.to_string())
                } else {
                    // Released by stop() while this tick was in flight.
                    Grab::Skip
                }
            }
        }
    }

    async fn encode_and_send(&self, image: crate::media::RawImage) {
        let stats = &self.shared.stats;
        let encoder = self.encoder.clone();
        let encoded = tokio::task::spawn_blocking(move || encoder.encode(&image)).await;
        let frame = match encoded {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                bump(&stats.encode_failures);
                tracing::warn!(error = %e, "encode failed, skipping tick");
                return;
            }
            Err(e) => {
                bump(&stats.encode_failures);
                tracing::warn!(error = %e, "encode task failed, skipping tick");
                return;
            }
        };

        // stop() may have landed while encoding.
        if !self.shared.running.load(Ordering::SeqCst) || !self.channel.is_open() {
            return;
        }

        let len = frame.data.len();
        bump(&stats.send_attempts);
        if self.channel.try_send(ChannelMessage::Binary(frame.data)) {
            bump(&stats.frames_sent);
            stats.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
            tracing::trace!(bytes = len, "frame sent");
        }
    }

    fn fail(&self, reason: String) {
        tracing::error!(device_id = %self.shared.device_id, %reason, "capture source lost, publisher stopping");
        self.shared.running.store(false, Ordering::SeqCst);
        self.supervisor.stop();
        self.shared.release_capture();
        self.shared.status.send_replace(PublisherStatus::Failed(reason));
    }
}
