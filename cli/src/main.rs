// attune — desktop operator CLI
//
// Owns a local node (profile, inbox, acks, connection log) on disk and runs
// in-process multi-node simulations over the loopback radio.

mod config;
mod simulate;

use anyhow::{Context, Result};
use attune_core::personality::RunStatus;
use attune_core::store::{AckStore, ConnectionLog, InboxStore};
use attune_core::{
    Dimension, PersonalityModel, PersonalityProfile, SledStorage, StorageBackend,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "attune")]
#[command(about = "Attune — offline profile exchange over BLE", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the local node
    Init,
    /// Show or train the personality profile
    Profile {
        #[command(subcommand)]
        action: Option<ProfileAction>,
    },
    /// List received messages
    Inbox {
        #[arg(short, long)]
        sender: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Remove the listed messages from the inbox
        #[arg(long)]
        drain: bool,
    },
    /// List acknowledgements we have issued
    Acks {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// List recorded connections
    Connections {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Hand the records off and clear the log
        #[arg(long)]
        drain: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show node status
    Status,
    /// Run several nodes against each other over the loopback radio
    Simulate {
        #[arg(short, long, default_value = "3")]
        nodes: usize,
        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    Show,
    /// Record a direct user action on one dimension
    Act {
        dimension: String,
        /// Observed value in [0, 1]
        signal: f64,
    },
    /// Closed life phases
    Phases,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_init(),
        Commands::Profile { action } => cmd_profile(action),
        Commands::Inbox {
            sender,
            limit,
            drain,
        } => cmd_inbox(sender, limit, drain),
        Commands::Acks { limit } => cmd_acks(limit),
        Commands::Connections { limit, drain } => cmd_connections(limit, drain),
        Commands::Config { action } => cmd_config(action),
        Commands::Status => cmd_status(),
        Commands::Simulate { nodes, seconds } => cmd_simulate(nodes, seconds).await,
    }
}

fn open_backend(config: &config::Config) -> Result<Arc<dyn StorageBackend>> {
    let dir = config.storage_dir()?;
    std::fs::create_dir_all(&dir).context("Failed to create storage directory")?;
    let path = dir
        .to_str()
        .context("Storage path is not valid UTF-8")?
        .to_string();
    let storage = SledStorage::open(&path).context("Failed to open node storage")?;
    Ok(Arc::new(storage))
}

fn cmd_init() -> Result<()> {
    println!("{}", "Initializing Attune...".bold());
    println!();

    let config = config::Config::load()?;
    println!("  {} Configuration", "✓".green());

    let storage_dir = config.storage_dir()?;
    let backend = open_backend(&config)?;
    println!("  {} Storage: {}", "✓".green(), storage_dir.display());

    let node_id = attune_core::load_or_create_node_id(backend.as_ref())?;
    let model = PersonalityModel::open(backend, attune_core::unix_millis())?;
    println!("  {} Profile loaded", "✓".green());
    println!();

    println!("{}", "Node Information:".bold());
    println!("  ID:         {}", node_id.bright_cyan());
    println!(
        "  Confidence: {}",
        format!("{:.2}", model.profile().confidence).bright_yellow()
    );
    println!();

    println!("{}", "Next steps:".bold());
    println!(
        "  • Train profile: {}",
        "attune profile act novelty_seeking 0.8".bright_green()
    );
    println!("  • Try a crowd:   {}", "attune simulate --nodes 4".bright_green());

    Ok(())
}

fn cmd_profile(action: Option<ProfileAction>) -> Result<()> {
    let config = config::Config::load()?;
    let model = PersonalityModel::open(open_backend(&config)?, attune_core::unix_millis())?;

    match action {
        None | Some(ProfileAction::Show) => {
            print_profile(&model.profile());
            println!();
            print_run_status(&model.run_status());
        }

        Some(ProfileAction::Act { dimension, signal }) => {
            let dim: Dimension = dimension.parse().map_err(anyhow::Error::msg)?;
            let phases_before = model.profile().evolution_timeline.len();
            let outcome = model
                .record_user_action(dim, signal, attune_core::unix_millis())
                .context("Failed to record action")?;
            println!("{} {}", "✓".green(), outcome.summary());

            let profile = model.profile();
            if profile.evolution_timeline.len() > phases_before {
                if let Some(phase) = profile.evolution_timeline.last() {
                    println!("{} New life phase: {}", "★".bright_magenta(), phase.trigger);
                }
            }
        }

        Some(ProfileAction::Phases) => {
            let profile = model.profile();
            if profile.evolution_timeline.is_empty() {
                println!("{}", "No closed life phases yet.".dimmed());
                return Ok(());
            }

            println!(
                "{} ({} total)",
                "Life Phases".bold(),
                profile.evolution_timeline.len()
            );
            println!();
            for phase in &profile.evolution_timeline {
                println!(
                    "  {} {} → {}",
                    "•".bright_green(),
                    format_timestamp(phase.started_at),
                    format_timestamp(phase.closed_at)
                );
                println!("    {}", phase.trigger.dimmed());
            }
        }
    }

    Ok(())
}

fn cmd_inbox(sender: Option<String>, limit: usize, drain: bool) -> Result<()> {
    let config = config::Config::load()?;
    let inbox = InboxStore::open(open_backend(&config)?, config.service.inbox_capacity)?;

    let messages = match (&sender, drain) {
        (_, true) => inbox.drain().context("Failed to drain inbox")?,
        (Some(sender), false) => inbox.messages_from(sender),
        (None, false) => inbox.messages(),
    };

    if messages.is_empty() {
        println!("{}", "Inbox is empty.".dimmed());
        return Ok(());
    }

    println!("{} ({} messages)", "Inbox".bold(), messages.len());
    println!();
    for msg in messages.iter().rev().take(limit) {
        println!(
            "{} {} #{} [{}]",
            "←".bright_blue(),
            msg.sender_id.bright_cyan(),
            msg.message_id,
            format_timestamp(msg.received_at).dimmed()
        );
        println!("   {} bytes: {}", msg.payload.len(), preview(&msg.payload));
    }

    Ok(())
}

fn cmd_acks(limit: usize) -> Result<()> {
    let config = config::Config::load()?;
    let acks = AckStore::open(open_backend(&config)?, config.service.ack_capacity)?;
    let all = acks.all();

    if all.is_empty() {
        println!("{}", "No acknowledgements.".dimmed());
        return Ok(());
    }

    println!("{} ({} total)", "Acknowledgements".bold(), all.len());
    println!();
    for ack in all.iter().rev().take(limit) {
        println!(
            "  {} {} #{} [{}]",
            "✓".green(),
            ack.sender_id.bright_cyan(),
            ack.message_id,
            format_timestamp(ack.acked_at).dimmed()
        );
    }

    Ok(())
}

fn cmd_connections(limit: usize, drain: bool) -> Result<()> {
    let config = config::Config::load()?;
    let log = ConnectionLog::open(open_backend(&config)?, config.service.connection_capacity)?;

    let records = if drain {
        log.drain_for_sync().context("Failed to drain connection log")?
    } else {
        log.pending()
    };

    if records.is_empty() {
        println!("{}", "No connections recorded.".dimmed());
        return Ok(());
    }

    println!("{} ({} records)", "Connections".bold(), records.len());
    println!();
    for record in records.iter().rev().take(limit) {
        println!(
            "  {} {} compat {} [{} · {}]",
            "•".bright_green(),
            record.peer_signature[..16.min(record.peer_signature.len())].bright_cyan(),
            format!("{:.2}", record.compatibility).bright_yellow(),
            record.context,
            format_timestamp(record.recorded_at).dimmed()
        );
        if let Some(resonance) = record.historical_resonance {
            println!("    resonance with a past phase: {:.2}", resonance);
        }
        for insight in &record.insights {
            println!("    {}", insight.dimmed());
        }
    }

    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn cmd_status() -> Result<()> {
    let config = config::Config::load()?;
    let backend = open_backend(&config)?;

    let node_id = attune_core::load_or_create_node_id(backend.as_ref())?;
    let inbox = InboxStore::open(backend.clone(), config.service.inbox_capacity)?;
    let acks = AckStore::open(backend.clone(), config.service.ack_capacity)?;
    let log = ConnectionLog::open(backend.clone(), config.service.connection_capacity)?;
    let model = PersonalityModel::open(backend, attune_core::unix_millis())?;
    let profile = model.profile();

    println!("{}", "Attune Status".bold());
    println!();
    println!("Node:        {}", node_id.bright_cyan());
    println!("Inbox:       {}", inbox.len());
    println!("Acks:        {}", acks.len());
    println!("Connections: {}", log.len());
    println!(
        "Profile:     confidence {:.2}, authenticity {:.2}, {} phase(s), {} context(s)",
        profile.confidence,
        profile.authenticity,
        profile.evolution_timeline.len(),
        profile.contextual_layers.len()
    );

    Ok(())
}

async fn cmd_simulate(nodes: usize, seconds: u64) -> Result<()> {
    if nodes < 2 {
        anyhow::bail!("A simulation needs at least two nodes");
    }
    let config = config::Config::load()?;

    println!(
        "{}",
        format!("Simulating {} nodes for {}s...", nodes, seconds).bold()
    );
    println!();

    let report = simulate::run(config.service, nodes, seconds).await?;

    for event in &report.events {
        println!(
            "  {} {} met {} · compat {} · {} insight(s)",
            "↔".bright_blue(),
            event.node.bright_cyan(),
            &event.record.peer_signature[..8.min(event.record.peer_signature.len())],
            format!("{:.2}", event.record.compatibility).bright_yellow(),
            event.record.insights.len()
        );
    }
    println!();

    println!("{}", "Drift per node:".bold());
    for node in &report.nodes {
        println!(
            "  {:<8} {} inbox, {} connections, moved {:.4}",
            node.address.bright_cyan(),
            node.inbox_len,
            node.connections_len,
            node.drift
        );
    }
    println!();

    if report.events.is_empty() {
        println!("{}", "No exchanges completed.".yellow());
    } else {
        println!(
            "{} {} exchanges completed",
            "✓".green(),
            report.events.len()
        );
    }

    Ok(())
}

fn print_profile(profile: &PersonalityProfile) {
    println!("{}", "Personality Profile".bold());
    println!();
    for dim in Dimension::ALL {
        let value = profile.core.get(dim);
        let origin = profile.phase_origin.get(dim);
        let bar = "█".repeat((value * 20.0).round() as usize);
        println!(
            "  {:<26} {:<20} {:.3} {}",
            dim.name(),
            bar.bright_green(),
            value,
            format!("(phase {:.3})", origin).dimmed()
        );
    }
    println!();
    println!("  Confidence:   {:.2}", profile.confidence);
    println!("  Authenticity: {:.2}", profile.authenticity);
    println!("  Updated:      {}", format_timestamp(profile.updated_at));

    if !profile.contextual_layers.is_empty() {
        println!();
        println!("{}", "Contexts:".bold());
        for (context, layer) in &profile.contextual_layers {
            let pending: f64 = layer.remainder.iter().map(|r| r.abs()).sum();
            println!(
                "  {:<18} blend {:.2}, pending pressure {:.3}",
                context.bright_cyan(),
                layer.blend_weight,
                pending
            );
        }
    }
}

fn print_run_status(status: &RunStatus) {
    println!("{}", "Transformation run:".bold());
    println!(
        "  {} day(s), user share {:.0}%, consistency {:.2}, confidence {:.2}",
        status.days,
        status.user_ratio * 100.0,
        status.consistency,
        status.confidence()
    );
}

fn preview(payload: &[u8]) -> String {
    let shown: String = payload.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    if payload.len() > 16 {
        format!("{}…", shown)
    } else {
        shown
    }
}

fn format_timestamp(millis: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp_millis(millis as i64).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
