use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::game::{run_simulation, FleetWorld, DEFAULT_SYSTEMS};
use server::network::Server;
use server::routes::demo_routes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Snapshot broadcasts per second
    #[clap(short, long, default_value = "20")]
    broadcast_rate: u32,
    /// Simulation ticks per second
    #[clap(short, long, default_value = "30")]
    tick_rate: u32,
    /// Seconds a new connection may take to identify
    #[clap(long, default_value = "60")]
    identify_timeout: u64,
    /// Minutes a disconnected session is kept (0 keeps sessions forever)
    #[clap(long, default_value = "30")]
    session_idle_minutes: u64,
    /// Maximum number of concurrent connections
    #[clap(short, long, default_value = "256")]
    max_connections: usize,
    /// Client ids granted host rights (default: first client to connect)
    #[clap(long = "host-id")]
    host_ids: Vec<String>,
    /// Per-tick movement treated as a teleport
    #[clap(long, default_value = "50.0")]
    hard_cut_distance: f32,
    /// Number of ships in the demo fleet
    #[clap(long, default_value = "24")]
    ships: usize,
    /// Chance per simulation tick that a random ship jumps systems
    #[clap(long, default_value = "0.01")]
    jump_chance: f64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            broadcast_period: Duration::from_secs_f64(1.0 / self.broadcast_rate.max(1) as f64),
            identify_timeout: Duration::from_secs(self.identify_timeout),
            session_idle_timeout: match self.session_idle_minutes {
                0 => None,
                minutes => Some(Duration::from_secs(minutes * 60)),
            },
            max_connections: self.max_connections,
            host_ids: self.host_ids.clone(),
            hard_cut_distance: self.hard_cut_distance,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = args.server_config();

    let world = Arc::new(RwLock::new(FleetWorld::new(args.ships, &DEFAULT_SYSTEMS)));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(demo_routes(command_tx)?);

    let server = Server::bind(config, registry, Arc::clone(&world)).await?;
    let handle = server.handle();
    info!("Serving demo fleet of {} ships on {}", args.ships, server.local_addr());

    let simulation = tokio::spawn(run_simulation(
        world,
        server.broker(),
        command_rx,
        args.tick_rate,
        args.jump_chance,
    ));
    let mut network = tokio::spawn(server.run());

    // Handle shutdown gracefully
    tokio::select! {
        result = &mut network => {
            match result {
                Ok(Err(e)) => error!("Server stopped: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = simulation => {
            if let Err(e) = result {
                error!("Simulation task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(2), network).await;
        }
    }

    Ok(())
}
