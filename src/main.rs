use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waypoint_core::config::{expand_home, AppConfig};
use waypoint_core::error::WaypointError;
use waypoint_core::session::{ConversationPart, PartKind, SessionState};
use waypoint_core::traits::ConversationStore;
use waypoint_core::types::SessionId;

use waypoint_agent::prompt::node_system_prompt;
use waypoint_agent::{AgentDefinition, Session};
use waypoint_store::{list_session_ids, open_store, SessionLayout};
use waypoint_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "waypoint", version, about = "Multi-phase agent sessions: inspect, validate and manage")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "waypoint.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an agent graph (TOML or JSON) against the built-in tools
    Validate {
        /// Path to the agent graph file
        agent: PathBuf,
    },
    /// List persisted sessions
    Sessions,
    /// Show a session's state, memory and conversation parts
    Show {
        session_id: String,
        /// Number of most recent parts to print
        #[arg(long, default_value = "20")]
        parts: usize,
    },
    /// Print the system prompt the next turn of a session would use
    Prompt {
        /// Path to the agent graph file
        agent: PathBuf,
        session_id: String,
    },
    /// Delete conversation parts below a sequence number
    Prune {
        session_id: String,
        /// Parts with a sequence number strictly below this are removed
        #[arg(long)]
        before: u64,
    },
    /// Delete everything persisted for a session
    Destroy { session_id: String },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("waypoint=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "waypoint", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { agent } => validate(&agent)?,
        Commands::Sessions => list_sessions(&config).await?,
        Commands::Show { session_id, parts } => show(&config, &session_id, parts).await?,
        Commands::Prompt { agent, session_id } => prompt(&config, &agent, &session_id).await?,
        Commands::Prune { session_id, before } => {
            let (_, store) = open_session(&config, &session_id).await?;
            let removed = store.delete_parts_before(before).await?;
            store.close().await?;
            info!(session_id = %session_id, removed, "Pruned parts");
            println!("Removed {} part(s) before seq {}", removed, before);
        }
        Commands::Destroy { session_id } => {
            let id = SessionId::from_str(&session_id);
            let layout = SessionLayout::new(&config.sessions_dir(), &id);
            if layout.exists() {
                let store = open_store(config.storage.backend, &layout.conversations_dir()).await?;
                store.destroy().await?;
            } else {
                warn!(session_id = %session_id, "No such session");
            }
            layout.remove_all()?;
            println!("Destroyed {}", session_id);
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = expand_home("~/.waypoint/config.toml");
    if home_config.exists() {
        info!(path = %home_config.display(), "Using config from home directory");
        return Ok(AppConfig::load(&home_config)?);
    }
    Ok(AppConfig::default())
}

async fn open_session(
    config: &AppConfig,
    session_id: &str,
) -> anyhow::Result<(SessionLayout, Arc<dyn ConversationStore>)> {
    let id = SessionId::from_str(session_id);
    let layout = SessionLayout::new(&config.sessions_dir(), &id);
    if !layout.exists() {
        return Err(WaypointError::SessionNotFound(session_id.to_string()).into());
    }
    let store = open_store(config.storage.backend, &layout.conversations_dir()).await?;
    Ok((layout, store))
}

fn validate(agent: &Path) -> anyhow::Result<()> {
    let definition = AgentDefinition::load(agent, ToolRegistry::with_builtins())?;
    let graph = &definition.graph;

    let title = if graph.metadata.name.is_empty() {
        graph.id.as_str()
    } else {
        graph.metadata.name.as_str()
    };
    println!("{} is valid ({} nodes, {} edges)", title, graph.nodes.len(), graph.edges.len());
    for (name, node) in &graph.entry_points {
        println!("  entry {} -> {}", name, node);
    }
    for node in &graph.nodes {
        let mut flags = Vec::new();
        if node.client_facing {
            flags.push("client-facing".to_string());
        }
        if graph.is_terminal(&node.id) {
            flags.push("terminal".to_string());
        }
        flags.push(match node.max_node_visits {
            0 => "visits: unbounded".to_string(),
            n => format!("visits: {}", n),
        });
        println!(
            "  node {:<20} outputs: [{}]  tools: [{}]  ({})",
            node.id,
            node.output_keys.join(", "),
            node.tools.join(", "),
            flags.join(", ")
        );
    }
    Ok(())
}

async fn list_sessions(config: &AppConfig) -> anyhow::Result<()> {
    let ids = list_session_ids(&config.sessions_dir())?;
    if ids.is_empty() {
        println!("No sessions in {}", config.sessions_dir().display());
        return Ok(());
    }

    for id in ids {
        let layout = SessionLayout::new(&config.sessions_dir(), &id);
        let store = open_store(config.storage.backend, &layout.conversations_dir()).await?;
        match store.read_cursor().await {
            Ok(Some(cursor)) => println!(
                "{}  {:<15} {:<20} {}",
                id,
                cursor.state.label(),
                cursor.state.node_id().unwrap_or("-"),
                cursor.updated_at.format("%Y-%m-%d %H:%M:%S")
            ),
            Ok(None) => println!("{}  (no cursor)", id),
            Err(e) => println!("{}  (unreadable: {})", id, e),
        }
        store.close().await?;
    }
    Ok(())
}

async fn show(config: &AppConfig, session_id: &str, limit: usize) -> anyhow::Result<()> {
    let (_, store) = open_session(config, session_id).await?;
    let meta = store.read_meta().await?;
    let cursor = store.read_cursor().await?;
    let parts = store.read_parts().await?;
    store.close().await?;

    if let Some(meta) = &meta {
        println!("Session:    {}", meta.session_id);
        println!("Graph:      {} (entry point '{}')", meta.graph_id, meta.entry_point);
        println!("Node:       {} ({})", meta.node.id, meta.node.name);
        println!("Created:    {}", meta.created_at.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(cursor) = &cursor {
        println!("State:      {}", describe_state(&cursor.state));
        println!("Iteration:  {}", cursor.iteration);
        println!("Path:       {}", cursor.execution_path.join(" -> "));
        let visits: Vec<String> = cursor
            .node_visits
            .iter()
            .map(|(node, n)| format!("{}={}", node, n))
            .collect();
        println!("Visits:     {}", visits.join(", "));
        println!(
            "Tokens:     {} in / {} out",
            cursor.usage.input_tokens, cursor.usage.output_tokens
        );
        if let SessionState::Stalled { ticket } = &cursor.state {
            println!("Escalation:\n{}", serde_json::to_string_pretty(ticket)?);
        }
        if !cursor.memory.entries.is_empty() {
            println!("Memory:");
            for (key, entry) in &cursor.memory.entries {
                let value = match &entry.value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                println!(
                    "  {} (v{}, {}): {}",
                    key,
                    entry.version,
                    entry.written_by.as_deref().unwrap_or("input"),
                    truncate(&value, 120)
                );
            }
        }
    }

    println!("Parts:      {} persisted", parts.len());
    let skip = parts.len().saturating_sub(limit);
    for part in &parts[skip..] {
        println!("  {}", describe_part(part));
    }
    Ok(())
}

async fn prompt(config: &AppConfig, agent: &Path, session_id: &str) -> anyhow::Result<()> {
    let definition = AgentDefinition::load(agent, ToolRegistry::with_builtins())?;
    let (layout, store) = open_session(config, session_id).await?;
    let session = Session::load(SessionId::from_str(session_id), layout, store).await?;

    let node_id = session
        .state()
        .node_id()
        .unwrap_or(session.meta.node.id.as_str())
        .to_string();
    let node = definition.graph.node(&node_id)?;
    let prompt = node_system_prompt(
        &definition.graph,
        node,
        &session.memory,
        &session.cursor.execution_path,
        &config.accounts,
    );
    session.store.close().await?;
    println!("{}", prompt);
    Ok(())
}

fn describe_state(state: &SessionState) -> String {
    match state {
        SessionState::Running { node_id } => format!("running in {}", node_id),
        SessionState::AwaitingInput { node_id, prompt } => match prompt {
            Some(q) => format!("awaiting input in {}: {}", node_id, q),
            None => format!("awaiting input in {}", node_id),
        },
        SessionState::Stalled { ticket } => format!(
            "stalled in {} ({:?}, missing: {})",
            ticket.node_id,
            ticket.reason,
            ticket.missing_outputs.join(", ")
        ),
        SessionState::Terminal { node_id } => format!("complete at {}", node_id),
        SessionState::Failed { error } => format!("failed: {}", error),
    }
}

fn describe_part(part: &ConversationPart) -> String {
    let body = match &part.kind {
        PartKind::UserText { text } => format!("user: {}", truncate(text, 100)),
        PartKind::AssistantText { text } => format!("assistant: {}", truncate(text, 100)),
        PartKind::ToolCall { name, input, .. } => {
            format!("call {}({})", name, truncate(&input.to_string(), 80))
        }
        PartKind::ToolResult {
            content, is_error, ..
        } => {
            let tag = if *is_error { "error" } else { "result" };
            format!("{}: {}", tag, truncate(content, 100))
        }
        PartKind::TransitionMarker { from, to, .. } => format!("transition {} -> {}", from, to),
    };
    format!("#{:<5} [{}] {}", part.seq, part.phase_id, body)
}

fn truncate(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max).collect();
    format!("{}...", cut)
}
