use clap::{Parser, Subcommand};
use relay::media::SyntheticCamera;
use relay::pull::HttpControlClient;
use relay::{
    ClientConfig, Envelope, Publisher, PublisherStatus, PullController, PullKind, RelayConfig,
    RelayServer, Subscriber,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "relay-server",
    about = "Live camera telemetry relay and operator tools"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay
    Serve {
        /// Bind address (host:port)
        #[arg(long, short, env = "RELAY_BIND", default_value = "0.0.0.0:8000")]
        bind: String,
        /// Per-viewer queue depth
        #[arg(long, default_value_t = 64)]
        watcher_queue: usize,
    },
    /// Print what the relay sends to viewers
    Watch {
        #[arg(long, env = "RELAY_ORIGIN", default_value = "http://127.0.0.1:8000")]
        origin: String,
    },
    /// Stream a synthetic test pattern to the relay
    Publish {
        #[arg(long, env = "RELAY_ORIGIN", default_value = "http://127.0.0.1:8000")]
        origin: String,
        /// Frames per second (clamped to 3-12)
        #[arg(long, default_value_t = relay::config::DEFAULT_FPS)]
        fps: u32,
        #[arg(long, default_value_t = 320)]
        width: u32,
        #[arg(long, default_value_t = 240)]
        height: u32,
    },
    /// Control relay-side pulling from a camera URL
    Pull {
        #[arg(long, env = "RELAY_ORIGIN", default_value = "http://127.0.0.1:8000")]
        origin: String,
        #[command(subcommand)]
        action: PullAction,
    },
}

#[derive(Subcommand)]
enum PullAction {
    /// Start pulling (replaces any running pull)
    Start {
        url: String,
        /// fire, ppe or both
        #[arg(long, default_value = "both")]
        kind: PullKind,
    },
    /// Stop pulling
    Stop,
    /// Show what the relay is pulling
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args.command).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> relay::Result<()> {
    match command {
        Command::Serve { bind, watcher_queue } => serve(bind, watcher_queue).await,
        Command::Watch { origin } => watch(origin).await,
        Command::Publish {
            origin,
            fps,
            width,
            height,
        } => publish(origin, fps, width, height).await,
        Command::Pull { origin, action } => pull(origin, action).await,
    }
}

async fn serve(bind: String, watcher_queue: usize) -> relay::Result<()> {
    let server = RelayServer::new(RelayConfig {
        bind_addr: bind,
        watcher_queue,
        ..RelayConfig::default()
    });
    let addr = server.start().await?;
    println!("relay on {addr}, press Ctrl-C to stop");

    shutdown_signal().await;
    server.stop();
    server.join().await;
    Ok(())
}

async fn watch(origin: String) -> relay::Result<()> {
    let config = ClientConfig {
        origin,
        ..ClientConfig::default()
    };
    let subscriber = Subscriber::new(&config);
    let mut notes = subscriber.notifications();
    subscriber.start_with_config(&config)?;

    loop {
        tokio::select! {
            _ = shutdown_signal() => break,
            note = notes.recv() => match note {
                Ok(Envelope::Frame(frame)) => {
                    let risk = frame.risk.map(|r| r.level.label()).unwrap_or("-");
                    println!("frame  {} bytes  risk {risk}", frame.image.len());
                }
                Ok(Envelope::Risk(risk)) => println!("risk   {} ({:.1})", risk.level.label(), risk.score),
                Ok(Envelope::Alert(alert)) => println!("ALERT  [{}] {}", alert.severity, alert.message),
                Ok(Envelope::Error { message }) => println!("error  {message}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "output fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    subscriber.stop();
    Ok(())
}

async fn publish(origin: String, fps: u32, width: u32, height: u32) -> relay::Result<()> {
    let config = ClientConfig {
        origin,
        fps,
        ..ClientConfig::default()
    };
    let camera = SyntheticCamera::new("synthetic:0", width, height);
    let publisher = Publisher::from_config(Box::new(camera), &config);
    publisher.start_with_config(&config)?;
    println!("publishing {width}x{height} at {} fps, press Ctrl-C to stop", publisher.fps());

    let mut status = publisher.subscribe_status();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = status.wait_for(|s| matches!(s, PublisherStatus::Failed(_))) => {}
    }

    let status = publisher.status();
    let stats = publisher.stats();
    publisher.stop();
    println!("sent {} frames ({} bytes)", stats.frames_sent, stats.bytes_sent);
    if let PublisherStatus::Failed(reason) = status {
        return Err(relay::RelayError::CaptureUnavailable(reason));
    }
    Ok(())
}

async fn pull(origin: String, action: PullAction) -> relay::Result<()> {
    match action {
        PullAction::Start { url, kind } => {
            PullController::http(&origin)?.start_pull(&url, kind).await?;
            println!("pulling {url} ({kind})");
        }
        PullAction::Stop => {
            PullController::http(&origin)?.stop_pull().await?;
            println!("pull stopped");
        }
        PullAction::Status => {
            let status = HttpControlClient::new(&origin)?.status().await?;
            match (status.url, status.kind) {
                (Some(url), Some(kind)) => println!("{}: {url} ({kind})", status.state),
                _ => println!("{}", status.state),
            }
            println!("{} viewer(s)", status.watchers);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
