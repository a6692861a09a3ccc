use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use soda_hub::config::SodaHubConfig;
use soda_hub::hub::{start_hub, HubServer};
use soda_hub::orchestrator::{
    Collaborators, Orchestrator, OrchestratorSettings, OrchestratorSnapshot, RunPhase,
    SpawnOutcome, SpawnRequest,
};
use soda_hub::telemetry::{create_coordination_span, generate_correlation_id, init_telemetry};
use soda_hub::{CoordinationClient, ShutdownCoordinator};

#[derive(Parser)]
#[command(name = "soda-hub")]
#[command(about = "Project-scoped coordination hub and lifecycle orchestrator for coding agents")]
#[command(long_about = "soda-hub keeps agents from stepping on each other: work items are claimed \
                       through a shared hub, status changes are broadcast to everyone in the same \
                       project, and the orchestrator runs agents under a concurrency ceiling with \
                       validation and retries. Start with 'soda-hub serve'.")]
struct Cli {
    /// Directory holding soda-hub.toml / .soda-hub-rc
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination hub and accept agent connections over TCP
    Serve {
        /// Address to listen on
        #[arg(long, help = "Overrides hub.bind_address")]
        bind: Option<String>,
    },
    /// List work items nobody has claimed
    Available {
        /// Only items of this epic
        #[arg(long)]
        epic: Option<String>,
        /// Hub to ask
        #[arg(long, help = "Hub address, defaults to hub.bind_address")]
        hub: Option<String>,
    },
    /// Show completion progress for an epic
    Progress {
        epic: String,
        #[arg(long, help = "Hub address, defaults to hub.bind_address")]
        hub: Option<String>,
    },
    /// List agent identities claimed on the hub
    Identities {
        /// Only identities in this project
        #[arg(long)]
        project: Option<String>,
        #[arg(long, help = "Hub address, defaults to hub.bind_address")]
        hub: Option<String>,
    },
    /// Run every spawn request in a TOML task file through the orchestrator
    Orchestrate {
        /// Task file with [[spawn]] tables
        tasks: PathBuf,
        /// Use a remote hub instead of an in-process one
        #[arg(long, help = "Hub address; without it an in-process hub is started")]
        hub: Option<String>,
        /// Override orchestrator.max_concurrent
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
}

/// Contents of an orchestrate task file
#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    spawn: Vec<SpawnRequest>,
}

fn load_task_file(path: &Path) -> Result<Vec<SpawnRequest>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file {}", path.display()))?;
    let file: TaskFile = toml::from_str(&contents)
        .with_context(|| format!("Malformed task file {}", path.display()))?;
    Ok(file.spawn)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = SodaHubConfig::load_env_file();
    let config = SodaHubConfig::load_from(&cli.config_dir)?;

    match cli.command {
        Commands::Serve { bind } => tokio::runtime::Runtime::new()?.block_on(async {
            init_telemetry(&config.observability)?;
            serve_command(config, bind).await
        }),
        Commands::Available { epic, hub } => tokio::runtime::Runtime::new()?.block_on(async {
            available_command(hub_address(&config, hub), epic).await
        }),
        Commands::Progress { epic, hub } => tokio::runtime::Runtime::new()?.block_on(async {
            progress_command(hub_address(&config, hub), epic).await
        }),
        Commands::Identities { project, hub } => tokio::runtime::Runtime::new()?.block_on(async {
            identities_command(hub_address(&config, hub), project).await
        }),
        Commands::Orchestrate {
            tasks,
            hub,
            max_concurrent,
        } => tokio::runtime::Runtime::new()?.block_on(async {
            init_telemetry(&config.observability)?;
            orchestrate_command(config, tasks, hub, max_concurrent).await
        }),
    }
}

fn hub_address(config: &SodaHubConfig, explicit: Option<String>) -> String {
    explicit.unwrap_or_else(|| config.hub.bind_address.clone())
}

async fn serve_command(config: SodaHubConfig, bind: Option<String>) -> Result<()> {
    let address = bind.unwrap_or_else(|| config.hub.bind_address.clone());
    let (hub, _task) = start_hub(&config.hub)?;
    let server = HubServer::bind(&address, hub.clone()).await?;
    println!("🥤 soda-hub listening on {}", server.local_addr()?);
    println!("   project: {}", config.hub.default_project);
    println!("   Ctrl-C to stop");

    let span = create_coordination_span(
        "serve",
        Some(&config.hub.default_project),
        None,
        Some(&generate_correlation_id()),
    );
    tokio::select! {
        result = server.run().instrument(span) => result?,
        result = ShutdownCoordinator::wait_for_signal() => result?,
    }

    ShutdownCoordinator::new()
        .with_hub(hub)
        .shutdown_all_services()
        .await
}

async fn available_command(address: String, epic: Option<String>) -> Result<()> {
    let client = CoordinationClient::connect_tcp(&address).await?;
    let items = client.list_available(epic.as_deref()).await?;
    client.disconnect().await;

    if items.is_empty() {
        println!("📋 No available work items");
        return Ok(());
    }
    println!("📋 {} available work item(s):", items.len());
    for item in items {
        println!("  {} (epic {}, project {}): {}", item.id, item.epic_id, item.project, item.status);
    }
    Ok(())
}

async fn progress_command(address: String, epic: String) -> Result<()> {
    let client = CoordinationClient::connect_tcp(&address).await?;
    let progress = client.epic_progress(&epic).await?;
    client.disconnect().await;

    println!("📊 Epic {}: {}% complete", progress.epic_id, progress.pct);
    println!("   total:       {}", progress.total);
    println!("   completed:   {}", progress.completed);
    println!("   in progress: {}", progress.in_progress);
    println!("   available:   {}", progress.available);
    Ok(())
}

async fn identities_command(address: String, project: Option<String>) -> Result<()> {
    let client = CoordinationClient::connect_tcp(&address).await?;
    let identities = client.list_identities(project.as_deref()).await?;
    client.disconnect().await;

    if identities.is_empty() {
        println!("👤 No identities claimed");
        return Ok(());
    }
    for identity in identities {
        println!("👤 {} ({})", identity.full_name(), identity.role);
    }
    Ok(())
}

async fn orchestrate_command(
    mut config: SodaHubConfig,
    tasks: PathBuf,
    hub: Option<String>,
    max_concurrent: Option<usize>,
) -> Result<()> {
    let requests = load_task_file(&tasks)?;
    if let Some(max_concurrent) = max_concurrent {
        config.orchestrator.max_concurrent = max_concurrent;
    }

    let mut local_hub = None;
    let client = match hub.or_else(|| config.orchestrator.hub_address.clone()) {
        Some(address) => CoordinationClient::connect_tcp(&address).await?,
        None => {
            let (handle, _task) = start_hub(&config.hub)?;
            local_hub = Some(handle.clone());
            CoordinationClient::connect_local(handle).await?
        }
    };

    let settings = OrchestratorSettings::from_config(&config);
    let (orchestrator, _task) = Orchestrator::start(
        settings,
        Arc::new(client),
        Collaborators::local(&config),
    )
    .await?;

    println!("🚀 Submitting {} spawn request(s)", requests.len());
    for request in requests {
        let item_id = request.work_item.id.clone();
        match orchestrator.spawn(request).await? {
            SpawnOutcome::Admitted { agent_id } => println!("  ▶ {item_id} → {agent_id}"),
            SpawnOutcome::Queued { position, priority } => {
                println!("  ⏳ {item_id} queued at position {position} ({priority})")
            }
        }
    }

    let snapshot = tokio::select! {
        snapshot = wait_until_idle(&orchestrator) => Some(snapshot?),
        result = ShutdownCoordinator::wait_for_signal() => {
            result?;
            None
        }
    };

    let mut coordinator = ShutdownCoordinator::new().with_orchestrator(orchestrator.clone());
    if let Some(hub) = local_hub {
        coordinator = coordinator.with_hub(hub);
    }
    let summary = match snapshot {
        Some(snapshot) => snapshot,
        None => orchestrator.snapshot().await.unwrap_or_default(),
    };
    coordinator.shutdown_all_services().await?;

    print_summary(&summary);
    Ok(())
}

async fn wait_until_idle(orchestrator: &Orchestrator) -> Result<OrchestratorSnapshot> {
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        poll.tick().await;
        let snapshot = orchestrator.snapshot().await?;
        if snapshot.active.is_empty() && snapshot.queued.is_empty() {
            return Ok(snapshot);
        }
    }
}

fn print_summary(snapshot: &OrchestratorSnapshot) {
    println!();
    println!("📋 Run summary:");
    for record in &snapshot.archived {
        match record.phase {
            RunPhase::Completed => println!(
                "  ✅ {} ({}) completed after {} retr{}",
                record.work_item.id,
                record.agent_id,
                record.retry_count,
                if record.retry_count == 1 { "y" } else { "ies" }
            ),
            _ => println!(
                "  ❌ {} ({}) failed: {}",
                record.work_item.id,
                record.agent_id,
                record
                    .failure_reason
                    .as_ref()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string)
            ),
        }
    }
    for record in &snapshot.active {
        println!("  ⏸ {} ({}) still {:?}", record.work_item.id, record.agent_id, record.phase);
    }
}
