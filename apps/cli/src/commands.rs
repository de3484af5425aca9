//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use waymark_core::{
    Pipeline, build_rag_context, cleanup_expired, format_sources, refresh_stale_corridors,
    search_content,
};
use waymark_providers::{EmbeddingClient, ResearchClient, SynthesisClient};
use waymark_shared::{AppConfig, StepStatus, expand_home, init_config, load_config};
use waymark_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Waymark — personalized migration checklists from community knowledge.
#[derive(Parser)]
#[command(
    name = "waymark",
    version,
    about = "Research a migration corridor and keep its checklist fresh, ordered, and sourced.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Manage corridors (origin → destination contexts).
    Corridor {
        #[command(subcommand)]
        action: CorridorAction,
    },

    /// Run the full pipeline for a corridor: research, synthesize,
    /// order, attribute, persist. Creates the corridor on first use.
    Refresh {
        /// Origin country code (e.g., NG).
        origin: String,

        /// Destination country code (e.g., DE).
        destination: String,
    },

    /// Re-run synthesis over existing research content only — the cheap
    /// repair path when facts haven't changed.
    Resynthesize {
        /// Origin country code.
        origin: String,

        /// Destination country code.
        destination: String,
    },

    /// Ask a question against ingested content (corridor-first search
    /// with global fallback).
    Ask {
        /// The question.
        question: String,

        /// Scope to a corridor, as ORIGIN:DESTINATION (e.g., NG:DE).
        #[arg(short, long)]
        corridor: Option<String>,
    },

    /// Maintenance sweeps.
    Sweep {
        #[command(subcommand)]
        action: SweepAction,
    },

    /// Update a checklist step's status.
    Step {
        #[command(subcommand)]
        action: StepAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Corridor subcommands.
#[derive(Subcommand)]
pub(crate) enum CorridorAction {
    /// Create a corridor.
    Add {
        /// Origin country code.
        origin: String,
        /// Destination country code.
        destination: String,
    },

    /// List corridors with their freshness state.
    List,

    /// Show pipeline status for a corridor.
    Status {
        /// Origin country code.
        origin: String,
        /// Destination country code.
        destination: String,
    },
}

/// Sweep subcommands.
#[derive(Subcommand)]
pub(crate) enum SweepAction {
    /// Delete content and cache entries past their retention windows.
    Content,

    /// Refresh stale corridors, oldest first, a bounded batch.
    Corridors,
}

/// Step status subcommands.
#[derive(Subcommand)]
pub(crate) enum StepAction {
    /// Mark a step in progress.
    Start { id: String },
    /// Mark a step completed.
    Done { id: String },
    /// Mark a step blocked.
    Block { id: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Write a default config file if none exists.
    Init,
    /// Print the effective configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "waymark=info",
        1 => "waymark=debug",
        _ => "waymark=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Corridor { action } => match action {
            CorridorAction::Add {
                origin,
                destination,
            } => cmd_corridor_add(&origin, &destination).await,
            CorridorAction::List => cmd_corridor_list().await,
            CorridorAction::Status {
                origin,
                destination,
            } => cmd_corridor_status(&origin, &destination).await,
        },
        Command::Refresh {
            origin,
            destination,
        } => cmd_refresh(&origin, &destination).await,
        Command::Resynthesize {
            origin,
            destination,
        } => cmd_resynthesize(&origin, &destination).await,
        Command::Ask { question, corridor } => cmd_ask(&question, corridor.as_deref()).await,
        Command::Sweep { action } => match action {
            SweepAction::Content => cmd_sweep_content().await,
            SweepAction::Corridors => cmd_sweep_corridors().await,
        },
        Command::Step { action } => match action {
            StepAction::Start { id } => cmd_step_status(&id, StepStatus::InProgress).await,
            StepAction::Done { id } => cmd_step_status(&id, StepStatus::Completed).await,
            StepAction::Block { id } => cmd_step_status(&id, StepStatus::Blocked).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring helpers
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = expand_home(&config.defaults.db_path);
    Ok(Arc::new(Storage::open(&path).await?))
}

fn build_pipeline(
    config: &AppConfig,
    storage: Arc<Storage>,
) -> Result<Pipeline<ResearchClient, SynthesisClient, EmbeddingClient>> {
    let research = ResearchClient::new(
        config.providers.research.clone(),
        &config.quota,
        &config.cache,
        storage,
    )?;
    let synthesis = SynthesisClient::new(config.providers.synthesis.clone())?;
    let embedder = EmbeddingClient::new(config.providers.embedding.clone())?;
    Ok(Pipeline::new(
        research,
        synthesis,
        embedder,
        config.pipeline.clone(),
        config.attribution.clone(),
    ))
}

/// Find a corridor by its country pair, creating it on first use.
async fn find_or_create_corridor(
    storage: &Storage,
    origin: &str,
    destination: &str,
) -> Result<waymark_shared::Corridor> {
    if let Some(existing) = storage.find_corridor(origin, destination).await? {
        return Ok(existing);
    }
    let created = storage.create_corridor(origin, destination).await?;
    println!("Created corridor {origin} → {destination}");
    Ok(created)
}

fn parse_corridor_pair(pair: &str) -> Result<(String, String)> {
    pair.split_once(':')
        .map(|(o, d)| (o.to_string(), d.to_string()))
        .ok_or_else(|| eyre!("corridor must be ORIGIN:DESTINATION, e.g. NG:DE"))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_corridor_add(origin: &str, destination: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;

    if storage.find_corridor(origin, destination).await?.is_some() {
        println!("Corridor {origin} → {destination} already exists");
        return Ok(());
    }
    let corridor = storage.create_corridor(origin, destination).await?;
    println!("Created corridor {origin} → {destination} ({})", corridor.id);
    println!("Run `waymark refresh {origin} {destination}` to build its checklist.");
    Ok(())
}

async fn cmd_corridor_list() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;

    let corridors = storage.list_corridors().await?;
    if corridors.is_empty() {
        println!("No corridors yet. Create one with `waymark corridor add <origin> <dest>`.");
        return Ok(());
    }
    for corridor in corridors {
        let age = waymark_core::freshness::research_age(
            corridor.last_researched_at,
            chrono::Utc::now(),
        );
        println!(
            "{} → {}  [{}]  steps: {}  researched: {}",
            corridor.origin,
            corridor.destination,
            corridor.research_status.as_str(),
            corridor.protocol_count,
            age,
        );
        if let Some(error) = corridor.error_message {
            println!("    last error: {error}");
        }
    }
    Ok(())
}

async fn cmd_corridor_status(origin: &str, destination: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;

    let corridor = storage
        .find_corridor(origin, destination)
        .await?
        .ok_or_else(|| eyre!("no corridor {origin} → {destination}"))?;
    let status =
        waymark_core::pipeline_status(&storage, corridor.id, config.pipeline.freshness_days)
            .await?;

    println!("Corridor {origin} → {destination}");
    println!("  status:        {}", status.corridor.research_status.as_str());
    println!(
        "  fresh:         {} (researched {})",
        status.fresh, status.research_age
    );
    println!(
        "  steps:         {} ({} generated)",
        status.step_count, status.generated_step_count
    );
    println!("  content items: {}", status.content_count);
    if let Some(scraped) = status.last_content_scraped {
        println!("  last scrape:   {scraped}");
    }
    if let Some(error) = &status.corridor.error_message {
        println!("  last error:    {error}");
    }
    Ok(())
}

async fn cmd_refresh(origin: &str, destination: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let pipeline = build_pipeline(&config, storage.clone())?;

    let corridor = find_or_create_corridor(&storage, origin, destination).await?;
    let report = pipeline.refresh_in_background(&storage, corridor.id).await?;

    if !report.started {
        println!("A refresh is already in flight for {origin} → {destination}; skipped.");
        return Ok(());
    }
    if report.success {
        println!(
            "Refreshed {origin} → {destination}: {} steps.",
            report.protocol_count
        );
        for error in &report.errors {
            println!("  note: {error}");
        }
        print_steps(&storage, corridor.id).await?;
    } else {
        println!("Refresh failed for {origin} → {destination}:");
        for error in &report.errors {
            println!("  {error}");
        }
    }
    Ok(())
}

async fn cmd_resynthesize(origin: &str, destination: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let pipeline = build_pipeline(&config, storage.clone())?;

    let corridor = storage
        .find_corridor(origin, destination)
        .await?
        .ok_or_else(|| eyre!("no corridor {origin} → {destination}"))?;

    let outcome = pipeline
        .resynthesize(&storage, corridor.id, &config.defaults.language)
        .await?;
    println!(
        "Resynthesized {origin} → {destination}: {} steps.",
        outcome.step_ids.len()
    );
    for error in &outcome.errors {
        println!("  note: {error}");
    }
    print_steps(&storage, corridor.id).await?;
    Ok(())
}

async fn print_steps(storage: &Storage, corridor_id: waymark_shared::CorridorId) -> Result<()> {
    for step in storage.steps_by_corridor(corridor_id).await? {
        let attribution = step
            .attribution
            .as_ref()
            .map(|a| format!("  [{}]", a.source_url))
            .unwrap_or_default();
        println!(
            "  {:>2}. [{}/{}] {}{attribution}",
            step.order,
            step.category.as_str(),
            step.priority.as_str(),
            step.title,
        );
    }
    Ok(())
}

async fn cmd_ask(question: &str, corridor_pair: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let embedder = EmbeddingClient::new(config.providers.embedding.clone())?;

    let corridor_id = match corridor_pair {
        Some(pair) => {
            let (origin, destination) = parse_corridor_pair(pair)?;
            Some(
                storage
                    .find_corridor(&origin, &destination)
                    .await?
                    .ok_or_else(|| eyre!("no corridor {origin} → {destination}"))?
                    .id,
            )
        }
        None => None,
    };

    let response = search_content(
        &storage,
        &embedder,
        question,
        corridor_id,
        config.pipeline.retrieval_limit,
        config.pipeline.min_results,
    )
    .await?;

    if response.hits.is_empty() {
        println!("No stored content matches. Refresh a corridor first.");
        return Ok(());
    }
    if corridor_id.is_some() && !response.corridor_specific {
        println!("(Not enough corridor-specific content — including general results.)\n");
    }

    let rag = build_rag_context(&response);
    println!("{}", rag.context);
    println!("\nSources:\n{}", format_sources(&rag.sources));
    Ok(())
}

async fn cmd_sweep_content() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;

    let report = cleanup_expired(&storage).await?;
    println!(
        "Swept {} expired content chunks and {} cache entries.",
        report.content_deleted, report.cache_deleted
    );
    Ok(())
}

async fn cmd_sweep_corridors() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let pipeline = build_pipeline(&config, storage.clone())?;

    let outcomes = refresh_stale_corridors(
        &pipeline,
        &storage,
        config.pipeline.sweep_batch,
        Duration::from_secs(config.pipeline.sweep_pause_secs),
    )
    .await?;

    if outcomes.is_empty() {
        println!("No stale corridors.");
        return Ok(());
    }
    for outcome in outcomes {
        if outcome.success {
            println!(
                "{} → {}: refreshed, {} steps",
                outcome.origin, outcome.destination, outcome.protocol_count
            );
        } else {
            println!(
                "{} → {}: failed ({})",
                outcome.origin,
                outcome.destination,
                outcome.error.unwrap_or_else(|| "unknown".into())
            );
        }
    }
    Ok(())
}

async fn cmd_step_status(id: &str, status: StepStatus) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;

    let step_id: waymark_shared::StepId = id.parse().map_err(|_| eyre!("invalid step id: {id}"))?;
    storage.update_step_status(step_id, status).await?;
    println!("Step {id} marked {}.", status.as_str());
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config at {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
