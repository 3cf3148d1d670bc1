use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use fleet_daemon::{db, AppState, Settings};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "fleetd", author, version, about = "Local machine control plane", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "FLEETD_LISTEN", default_value = "127.0.0.1:3030")]
    listen: SocketAddr,

    /// SQLite database path (default: ~/.fleetd/fleet.db)
    #[arg(long, env = "FLEETD_DB")]
    db: Option<PathBuf>,

    /// Keep all state in memory only
    #[arg(long, conflicts_with = "db")]
    ephemeral: bool,

    /// Time a replaced instance takes to converge, in milliseconds
    #[arg(long, env = "FLEETD_CONVERGENCE_DELAY_MS", default_value_t = 500)]
    convergence_delay_ms: u64,

    /// Seconds between expired-lease sweeps
    #[arg(long, env = "FLEETD_SWEEP_INTERVAL_SECS", default_value_t = 10)]
    sweep_interval_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let conn = if cli.ephemeral {
        info!("using in-memory database");
        db::init_memory_db()
    } else {
        let db_path = cli.db.unwrap_or_else(db::default_db_path);
        info!(path = %db_path.display(), "using database");
        db::init_db(&db_path)
    };
    let conn = match conn {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "failed to initialize database");
            return ExitCode::FAILURE;
        }
    };

    let settings = Settings {
        convergence_delay: Duration::from_millis(cli.convergence_delay_ms),
        sweep_interval: Duration::from_secs(cli.sweep_interval_secs.max(1)),
    };
    let state = match AppState::load(conn, settings) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "failed to load state");
            return ExitCode::FAILURE;
        }
    };

    let listener = match tokio::net::TcpListener::bind(cli.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %cli.listen, error = %e, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %cli.listen, "listening");

    match fleet_daemon::serve(listener, state).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}
