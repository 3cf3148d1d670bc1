use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use fleet_client::{HttpControlPlane, RunReport};
use fleet_common::{CreateVolumeRequest, MachineConfig, DEFAULT_LEASE_TTL_SECS};
use fleet_orchestrator::plan::describe_image;
use fleet_orchestrator::{
    desired_config, image_update_plan, AppConfig, CancellationToken, ControlPlane,
    FleetOrchestrator, FleetSnapshot, OrchestratorConfig,
};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "fleetctl", author, version, about = "Roll updates across a fleet of machines", long_about = None)]
struct Cli {
    /// Control plane base URL
    #[arg(long, global = true, env = "FLEET_API_URL", default_value = "http://localhost:3030")]
    api_url: String,

    /// Owner recorded on leases this client takes
    #[arg(long, global = true, env = "FLEET_OWNER", default_value = "fleetctl")]
    owner: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an update plan from an app config and roll it out
    Deploy {
        /// App config file
        #[arg(short, long, default_value = "fleet.toml")]
        config: PathBuf,

        /// App name (overrides the config file)
        #[arg(long)]
        app: Option<String>,

        /// Image to deploy (overrides the config file)
        #[arg(long)]
        image: Option<String>,

        /// Region for the first machine of an empty app
        #[arg(long)]
        region: Option<String>,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Image-only updates
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },
    /// List an app's machines
    Status {
        #[arg(long)]
        app: String,
    },
    /// List active leases
    Leases,
    /// Take a lease on a machine by hand
    Lease {
        machine_id: String,
        /// TTL in seconds
        #[arg(long, default_value_t = DEFAULT_LEASE_TTL_SECS)]
        ttl: u64,
    },
    /// Release a lease taken with `lease`
    Release { machine_id: String, nonce: String },
    /// Manage volumes
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },
}

#[derive(Subcommand)]
enum ImageCommands {
    /// Swap the image on every machine, keeping the rest of their config
    Update {
        #[arg(long)]
        app: String,

        #[arg(long)]
        image: String,

        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    Create {
        name: String,
        #[arg(long)]
        app: String,
        #[arg(long)]
        region: String,
        /// Size in GB
        #[arg(long)]
        size: Option<u32>,
    },
    List {
        #[arg(long)]
        app: String,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Lease TTL in seconds
    #[arg(long, default_value_t = DEFAULT_LEASE_TTL_SECS)]
    lease_ttl: u64,

    /// Seconds to wait for each machine to converge
    #[arg(long, default_value_t = 120)]
    wait_timeout: u64,

    /// Machines updated at once
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Re-check each machine still exists right before leasing it
    #[arg(long)]
    revalidate: bool,

    /// Print the run result as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            lease_ttl: Duration::from_secs(self.lease_ttl.max(1)),
            wait_timeout: Duration::from_secs(self.wait_timeout.max(1)),
            concurrency: self.concurrency.max(1),
            revalidate_membership: self.revalidate,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let control_plane = Arc::new(HttpControlPlane::new(cli.api_url, cli.owner));

    match cli.command {
        Commands::Deploy {
            config,
            app,
            image,
            region,
            run,
        } => {
            let mut app_config = AppConfig::load(&config)?;
            if let Some(app) = app {
                app_config.app = app;
            }
            let region = region.unwrap_or_else(|| app_config.region().to_string());
            let plan = desired_config(&app_config, image.as_deref())?;
            rollout(control_plane, &app_config.app, &region, plan, &run).await
        }
        Commands::Image {
            command: ImageCommands::Update { app, image, run },
        } => {
            let snapshot = FleetSnapshot::fetch(control_plane.as_ref(), &app).await?;
            let Some(first) = snapshot.machines.first() else {
                bail!("app {app} has no machines to take a base config from; use deploy");
            };
            let plan = image_update_plan(&first.config, &image)?;
            let region = first.region.clone();
            rollout(control_plane, &app, &region, plan, &run).await
        }
        Commands::Status { app } => {
            let machines = control_plane
                .list(&app)
                .await
                .with_context(|| format!("failed to list machines for {app}"))?;
            if machines.is_empty() {
                println!("No machines for {app}");
            }
            let holders: HashMap<String, String> = control_plane
                .list_leases()
                .await?
                .into_iter()
                .map(|l| (l.machine_id, l.owner))
                .collect();
            for machine in machines {
                println!(
                    "{}  {:<10} {:<6} {}{}",
                    machine.id,
                    machine.state.as_str(),
                    machine.region,
                    describe_image(&machine.config),
                    holders
                        .get(&machine.id)
                        .map(|owner| format!("  (leased by {owner})"))
                        .unwrap_or_default()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Leases => {
            let leases = control_plane.list_leases().await?;
            println!("Active Leases:");
            for lease in leases {
                println!(
                    "Machine: {}, Owner: {}, Expires: {}",
                    lease.machine_id, lease.owner, lease.expires_at
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Lease { machine_id, ttl } => {
            let lease = control_plane
                .acquire_lease(&machine_id, Duration::from_secs(ttl))
                .await?;
            println!("Leased {} until {}", lease.machine_id, lease.expires_at);
            println!("Nonce: {}", lease.nonce);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Release { machine_id, nonce } => {
            control_plane.release_lease(&machine_id, &nonce).await?;
            println!("Released lease on {machine_id}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Volume {
            command:
                VolumeCommands::Create {
                    name,
                    app,
                    region,
                    size,
                },
        } => {
            let req = CreateVolumeRequest {
                name,
                region,
                size_gb: size,
            };
            let volume = control_plane.create_volume(&app, &req).await?;
            println!(
                "Created volume {} ({}, {} GB in {})",
                volume.name, volume.id, volume.size_gb, volume.region
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Volume {
            command: VolumeCommands::List { app },
        } => {
            for volume in control_plane.list_volumes(&app).await? {
                println!(
                    "{}  {:<16} {:<6} {} GB",
                    volume.id, volume.name, volume.region, volume.size_gb
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn rollout(
    control_plane: Arc<HttpControlPlane>,
    app: &str,
    region: &str,
    plan: MachineConfig,
    run: &RunArgs,
) -> anyhow::Result<ExitCode> {
    let image = describe_image(&plan);
    let orchestrator = FleetOrchestrator::new(control_plane, run.orchestrator_config());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, releasing leases and stopping");
            on_signal.cancel();
        }
    });

    let result = orchestrator
        .apply_fleet_update(app, region, plan, cancel)
        .await?;
    let report = RunReport::new(app, &image, &result);
    if run.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }

    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
