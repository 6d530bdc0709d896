use clap::Parser;
use log::info;
use server::network::{RelayServer, ServerConfig};
use shared::{
    DEFAULT_BIND_ADDRESS, DEFAULT_PORT, DEFAULT_READ_TIMEOUT, DEFAULT_TICK_INTERVAL,
    DEFAULT_WRITE_TIMEOUT, MAX_LINE_LEN,
};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Position relay server", long_about = None)]
struct Args {
    /// Address to bind the listener to
    #[arg(short, long, default_value = DEFAULT_BIND_ADDRESS)]
    bind: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Broadcast period in milliseconds
    #[arg(short, long, default_value_t = DEFAULT_TICK_INTERVAL.as_millis() as u64)]
    tick_ms: u64,

    /// Per-read timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT.as_millis() as u64)]
    read_timeout_ms: u64,

    /// Per-connection write timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT.as_millis() as u64)]
    write_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        tick_interval: Duration::from_millis(args.tick_ms.max(1)),
        read_timeout: Duration::from_millis(args.read_timeout_ms.max(1)),
        write_timeout: Duration::from_millis(args.write_timeout_ms.max(1)),
        max_line_len: MAX_LINE_LEN,
    };

    let server = RelayServer::start_with_config(&args.bind, args.port, config).await?;
    info!("Relay server running on {}", server.local_addr()?);

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    server.stop().await;

    Ok(())
}
