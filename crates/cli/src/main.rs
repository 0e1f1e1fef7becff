use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use simsync::api::{ApiClient, CanonicalSource};
use simsync::config::{DEFAULT_API_URL, SyncConfig};
use simsync::connection::ConnectionManager;
use simsync::diagnostics::DiagnosticLog;
use simsync::simulation::SimulationControl;
use simsync::types::*;
use simsync::view::ViewScope;

#[derive(Parser)]
#[command(name = "simctl", about = "Operator CLI for the agent simulation backend")]
struct Cli {
    /// Backend address
    #[arg(long, global = true, default_value = DEFAULT_API_URL)]
    addr: String,

    /// Bearer token
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List agents with mood and energy
    Agents,

    /// Show one agent in full
    Agent {
        /// Agent ID
        id: String,
    },

    /// List relations between agents
    Relations,

    /// Show the most recent events
    Events {
        /// Max events shown
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// List group chats
    Chats,

    /// Create an agent
    CreateAgent {
        /// Agent name
        name: String,
        /// Initial mood, 0..1
        #[arg(long, default_value = "0.5")]
        mood: f64,
        /// Initial energy, 0..100
        #[arg(long, default_value = "80")]
        energy: f64,
        /// Traits (comma-separated)
        #[arg(long)]
        traits: Option<String>,
        /// Persona text
        #[arg(long)]
        persona: Option<String>,
    },

    /// Delete an agent
    DeleteAgent {
        /// Agent ID
        id: String,
    },

    /// Send a message to one agent
    Message {
        /// Agent ID
        id: String,
        /// Message text
        text: String,
        /// Emotion attached to the message
        #[arg(long)]
        emotion: Option<String>,
    },

    /// Post a message into a group chat
    GroupMessage {
        /// Group chat ID
        id: String,
        /// Message text
        text: String,
    },

    /// Set simulation speed (0.1 - 10)
    Speed {
        value: f64,
    },

    /// Pause the simulation
    Pause,

    /// Resume the simulation at the given speed
    Resume {
        #[arg(long, default_value = "1")]
        speed: f64,
    },

    /// Follow the live push stream
    Tail {
        /// Streaming base URL (defaults to the backend address with a ws scheme)
        #[arg(long)]
        stream_url: Option<String>,
        /// Reconnect delay in milliseconds
        #[arg(long, default_value = "2000")]
        reconnect_ms: u64,
        /// Only show events belonging to this group chat
        #[arg(long)]
        conversation: Option<String>,
    },
}

fn print_event(event: &Event) {
    let when = event
        .timestamp
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "  [{}] {} {} {}",
        when,
        event.kind.as_deref().unwrap_or("event"),
        event.actor_id.as_deref().unwrap_or("-"),
        event.description
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simctl=info,warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig {
        api_url: cli.addr,
        token: cli.token,
        ..Default::default()
    };
    let diagnostics = Arc::new(DiagnosticLog::default());
    let client = Arc::new(ApiClient::from_config(&config, diagnostics.clone()));

    match cli.command {
        Commands::Agents => {
            let agents = client.list_agents().await.context("Failed to connect")?;
            println!("Agents:");
            if agents.is_empty() {
                println!("  (none)");
            }
            for agent in &agents {
                println!(
                    "  {} {} mood={:.2} energy={:.0} {}",
                    agent.id,
                    agent.name,
                    agent.mood,
                    agent.energy,
                    agent.status.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Agent { id } => {
            let agent = client.get_agent(&id).await.context("Failed to connect")?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }

        Commands::Relations => {
            let relations = client.list_relations().await.context("Failed to connect")?;
            println!("Relations:");
            if relations.is_empty() {
                println!("  (none)");
            }
            for rel in &relations {
                println!(
                    "  {} --{:+.2}--> {} {}",
                    rel.source,
                    rel.affinity,
                    rel.target,
                    rel.label.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Events { limit } => {
            let mut events = client.list_events().await.context("Failed to connect")?;
            sort_events(&mut events);
            let skip = events.len().saturating_sub(limit);
            println!("Events ({} of {}):", events.len() - skip, events.len());
            for event in &events[skip..] {
                print_event(event);
            }
        }

        Commands::Chats => {
            let chats = client.list_conversations().await.context("Failed to connect")?;
            println!("Group chats:");
            if chats.is_empty() {
                println!("  (none)");
            }
            for chat in &chats {
                println!(
                    "  {} {} ({} participants){}",
                    chat.id,
                    chat.name,
                    chat.agent_ids.len(),
                    if chat.is_active { "" } else { " [inactive]" }
                );
            }
        }

        Commands::CreateAgent {
            name,
            mood,
            energy,
            traits,
            persona,
        } => {
            let mut req = CreateAgentRequest::named(name);
            req.mood = mood.clamp(0.0, 1.0);
            req.energy = energy.clamp(0.0, 100.0);
            req.traits = traits
                .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            req.persona = persona;

            let agent = client.create_agent(&req).await.context("Failed to connect")?;
            println!("Created agent {} ({})", agent.name, agent.id);
        }

        Commands::DeleteAgent { id } => {
            client.delete_agent(&id).await.context("Failed to connect")?;
            println!("Deleted agent {}", id);
        }

        Commands::Message { id, text, emotion } => {
            let payload = MessagePayload {
                message: text,
                emotion,
            };
            let event = client
                .post_agent_message(&id, &payload)
                .await
                .context("Failed to connect")?;
            print_event(&event);
        }

        Commands::GroupMessage { id, text } => {
            let payload = MessagePayload {
                message: text,
                emotion: None,
            };
            let events = client
                .post_conversation_message(&id, &payload)
                .await
                .context("Failed to connect")?;
            for event in &events {
                print_event(event);
            }
        }

        Commands::Speed { value } => {
            let control = SimulationControl::new(client.clone());
            let status = control.set_speed(value).await.context("Failed to connect")?;
            println!("Speed {}x (tick {}s)", status.speed, status.tick_seconds);
        }

        Commands::Pause => {
            let control = SimulationControl::new(client.clone());
            let status = control.pause().await.context("Failed to connect")?;
            println!("Paused: {}", status.is_paused);
        }

        Commands::Resume { speed } => {
            let control = SimulationControl::starting_at(client.clone(), speed);
            let status = control.resume().await.context("Failed to connect")?;
            println!("Resumed at {}x", status.speed);
        }

        Commands::Tail {
            stream_url,
            reconnect_ms,
            conversation,
        } => {
            let scope = match conversation {
                Some(id) => {
                    let chats = client.list_conversations().await.context("Failed to connect")?;
                    let chat = chats
                        .iter()
                        .find(|c| c.id == id)
                        .with_context(|| format!("Group chat '{}' not found", id))?;
                    ViewScope::from(chat)
                }
                None => ViewScope::Global,
            };
            let config = SyncConfig {
                stream_url,
                reconnect_delay: Duration::from_millis(reconnect_ms),
                ..config
            };
            let manager = ConnectionManager::from_config(&config, diagnostics.clone());
            info!(url = %manager.url(), "Following push stream");

            let mut handle = manager.open(
                move |message| match message {
                    PushMessage::EventCreated(event) => {
                        if scope.matches(&event) {
                            print_event(&event);
                        }
                    }
                    PushMessage::AgentUpdate(patch) => println!("  agent {} updated", patch.id),
                    PushMessage::RelationChanged(relations) => {
                        println!("  relations changed ({})", relations.len())
                    }
                    PushMessage::Unknown { kind } => println!("  ({})", kind),
                },
                |status| info!(status = %status, "Push connection"),
            );
            tokio::signal::ctrl_c().await?;
            handle.close();
            for entry in diagnostics.entries() {
                warn!(source = %entry.source, "{}", entry.message);
            }
        }
    }

    Ok(())
}
