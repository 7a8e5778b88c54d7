use clap::Parser;
use client::interpolation::SnapshotBuffer;
use client::network::{ClientEvent, SyncClient};
use log::{info, warn};
use serde_json::json;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Stable id presented to the server; reuse it to resume the session
    #[arg(short = 'i', long, default_value = "viewer")]
    client_id: String,

    /// Star system to watch
    #[arg(long, default_value = "sol")]
    system: String,

    /// Interpolation delay in milliseconds
    #[arg(short = 'd', long, default_value = "100")]
    delay: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Connecting to {} as {}", args.server, args.client_id);
    let mut client = SyncClient::connect(&args.server, &args.client_id).await?;

    let whoami = client.call("session.whoami", json!(null)).await?;
    info!("Session: {}", whoami);

    let input = json!({ "system": args.system });
    let ships = client.call("fleet.list", input.clone()).await?;
    info!("Ships in {}: {}", args.system, ships);

    client.subscribe("fleet.list", input.clone()).await?;
    client.stream_subscribe("fleet.positions", input).await?;

    let mut buffer = SnapshotBuffer::new(args.delay);
    let mut report = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            event = client.next_event() => match event {
                Some(ClientEvent::Snapshot(snapshot)) => {
                    buffer.push(snapshot);
                }
                Some(ClientEvent::Published { path, result, .. }) => {
                    info!("{} changed: {}", path, result);
                }
                Some(ClientEvent::Disconnected { reason }) => {
                    warn!("Disconnected: {}", reason);
                    break;
                }
                None => break,
            },
            _ = report.tick() => {
                let entities = buffer.sample();
                info!("Tracking {} ships ({} snapshots buffered)", entities.len(), buffer.len());
                for entity in &entities {
                    if let Some([x, y, z]) = entity.fields.position() {
                        info!("  {:<10} ({:8.1}, {:8.1}, {:8.1})", entity.id, x, y, z);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting...");
                client.close().await?;
                return Ok(());
            }
        }
    }

    Ok(())
}
