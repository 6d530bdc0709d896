use clap::Parser;
use client::network::{ClientConfig, RelayClient};
use log::{info, warn};
use rand::Rng;
use shared::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_HOST, DEFAULT_PORT};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Headless stand-in for a game loop: walks a circle, pushes the position to
/// the relay every frame and logs the peers it hears about.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay server address
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Relay server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Participant id (random if omitted)
    #[arg(short, long)]
    id: Option<String>,

    /// Frame / send interval in milliseconds
    #[arg(short, long, default_value = "50")]
    send_interval_ms: u64,

    /// Connect timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)]
    connect_timeout_ms: u64,

    /// Forget peers not refreshed for this many milliseconds
    #[arg(long)]
    peer_ttl_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let id = args
        .id
        .unwrap_or_else(|| format!("p{}", rand::thread_rng().gen_range(1000..10000)));

    let config = ClientConfig {
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
        ..ClientConfig::default()
    };

    info!("Starting client '{}'", id);
    let connected = RelayClient::connect_with_config(&args.host, args.port, id, config).await;
    let mut relay = match connected {
        Ok(relay) => Some(relay),
        Err(e) => {
            warn!("{}; continuing in local-only mode", e);
            None
        }
    };

    let frame = Duration::from_millis(args.send_interval_ms.max(1));
    let mut ticker = interval(frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut ang: f64 = 0.0;
    let mut frames: u64 = 0;
    let frames_per_report = (1000 / frame.as_millis().max(1)).max(1) as u64;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
            _ = ticker.tick() => {}
        }

        ang = (ang + 0.05) % std::f64::consts::TAU;
        let (x, y) = (400.0 + 100.0 * ang.cos(), 300.0 + 100.0 * ang.sin());
        frames += 1;

        let Some(active) = relay.as_ref() else {
            continue;
        };

        active.send_state(x, y, ang).await;

        if let Some(ttl) = args.peer_ttl_ms {
            active.prune_stale(Duration::from_millis(ttl)).await;
        }

        if frames % frames_per_report == 0 {
            let peers = active.peers().await;
            info!(
                "At ({:.1}, {:.1}); {} peer(s): {:?}",
                x,
                y,
                peers.len(),
                peers.keys().collect::<Vec<_>>()
            );
        }

        release_if_lost(&mut relay).await;
    }

    if let Some(relay) = relay {
        relay.stop().await;
    }

    Ok(())
}

/// Drops a relay whose connection has gone down so the loss is reported once.
async fn release_if_lost(relay: &mut Option<RelayClient>) {
    if !matches!(relay, Some(active) if !active.is_running()) {
        return;
    }
    warn!("Relay connection lost; continuing in local-only mode");
    if let Some(lost) = relay.take() {
        lost.stop().await;
    }
}
