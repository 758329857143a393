//! Interactive agent world in the terminal
//!
//! Loads (or creates) a world from the data directory, adds agents given on
//! the command line, then sends every stdin line into the world as the human.
//! Replies are streamed to stdout as they arrive.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use agent_world::config::Config;
use agent_world::{
    id_from_name, FileStorage, MessageId, ModelConfig, OpenAiProvider, StreamKind, World,
    WorldEvent, WorldManager, WorldMessage, HUMAN_SENDER,
};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agent-world")]
#[command(about = "Chat with a world of LLM agents")]
struct Cli {
    /// World name or id
    #[arg(long, default_value = "default")]
    world: String,

    /// Create the world instead of loading it
    #[arg(long)]
    create: bool,

    /// Agent to add, as NAME or NAME=MODEL (repeatable)
    #[arg(long = "agent", value_name = "NAME[=MODEL]")]
    agents: Vec<String>,

    /// Override the world's turn limit
    #[arg(long)]
    turn_limit: Option<u32>,

    /// Override AGENT_WORLD_DATA_DIR
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Print finished messages instead of streaming chunks
    #[arg(long)]
    no_stream: bool,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agent_world=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(dir) = cli.data_dir.clone() {
        config.data_dir = dir;
    }

    let provider = OpenAiProvider::from_config(&config).context("Failed to set up OpenAI")?;
    let storage = FileStorage::new(config.data_dir.clone());
    let manager = WorldManager::new(
        Arc::new(storage),
        Arc::new(provider),
        config.settings.clone(),
    )
    .context("Invalid world settings")?;

    let world = open_world(&manager, &cli).await?;
    add_agents(&manager, &world, &cli.agents, &config.default_model).await?;

    tracing::info!(
        world_id = %world.id(),
        agents = world.agents().len(),
        turn_limit = world.turn_limit(),
        "world ready"
    );

    let printer = tokio::spawn(print_world(
        world.bus().subscribe_messages(),
        world.bus().subscribe_events(),
        cli.no_stream,
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !run_command(&manager, &world, line).await? {
            break;
        }
    }

    manager
        .unload_world(world.id())
        .await
        .context("Failed to save the active chat")?;
    printer.abort();
    Ok(())
}

async fn open_world(manager: &WorldManager, cli: &Cli) -> Result<World> {
    let world_id = id_from_name(&cli.world);
    if cli.create {
        return manager
            .create_world(&cli.world, cli.turn_limit)
            .await
            .with_context(|| format!("Failed to create world {}", world_id));
    }

    let world = manager
        .load_world(&world_id)
        .await
        .with_context(|| format!("Failed to load world {} (use --create)", world_id))?;
    if let Some(limit) = cli.turn_limit {
        manager
            .set_turn_limit(&world, limit)
            .await
            .context("Failed to update turn limit")?;
    }
    Ok(world)
}

async fn add_agents(
    manager: &WorldManager,
    world: &World,
    agent_args: &[String],
    default_model: &str,
) -> Result<()> {
    for arg in agent_args {
        let (name, model) = match arg.split_once('=') {
            Some((name, model)) => (name.trim(), model.trim()),
            None => (arg.trim(), default_model),
        };
        if world.agent(&id_from_name(name)).is_some() {
            tracing::debug!(agent = %name, "agent already in world");
            continue;
        }
        manager
            .create_agent(world, name, ModelConfig::new("openai", model))
            .await
            .with_context(|| format!("Failed to add agent {}", name))?;
    }
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

/// Handle one input line. Returns false on `/quit`.
async fn run_command(manager: &WorldManager, world: &World, line: &str) -> Result<bool> {
    let chats = manager.chats();
    let mut parts = line.splitn(2, ' ');
    match (parts.next(), parts.next().map(str::trim)) {
        (Some("/quit"), _) => return Ok(false),
        (Some("/new"), _) => {
            let chat_id = chats.new_chat(world).await?;
            println!("* new chat {}", chat_id);
        }
        (Some("/chats"), _) => {
            let active = world.active_chat_id();
            for chat in chats.list_chats(world).await? {
                let marker = if Some(&chat.chat_id) == active.as_ref() { "*" } else { " " };
                println!(
                    "{} {}  {}  ({} messages)",
                    marker,
                    chat.chat_id,
                    chat.title.as_deref().unwrap_or("(untitled)"),
                    chat.message_count
                );
            }
        }
        (Some("/load"), Some(chat_id)) if !chat_id.is_empty() => {
            match chats.load_chat(world, chat_id).await {
                Ok(()) => println!("* loaded chat {}", chat_id),
                Err(e) if e.is_not_found() => println!("* {}", e),
                Err(e) => return Err(e.into()),
            }
        }
        (Some(cmd), _) if cmd.starts_with('/') => {
            println!("* commands: /new, /chats, /load <chat id>, /quit");
        }
        _ => {
            world.publish(line, HUMAN_SENDER);
        }
    }
    Ok(true)
}

// ============================================================================
// Output
// ============================================================================

/// Print world traffic until the bus closes.
///
/// When streaming, a finished message is printed again only if the published
/// text differs from what was streamed, as with a pass-token hand-back or an
/// added `@sender` prefix.
async fn print_world(
    mut messages: broadcast::Receiver<WorldMessage>,
    mut events: broadcast::Receiver<WorldEvent>,
    no_stream: bool,
) {
    let mut streamed: HashMap<MessageId, String> = HashMap::new();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event, no_stream, &mut streamed),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "output fell behind stream events");
                }
                Err(RecvError::Closed) => break,
            },
            message = messages.recv() => match message {
                Ok(message) => {
                    // A stream's End is published before its message.
                    while let Ok(event) = events.try_recv() {
                        print_event(&event, no_stream, &mut streamed);
                    }
                    if let Some(line) = finished_line(&message, no_stream, &mut streamed) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "output fell behind messages");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Line to print for a published message, if it was not already shown.
fn finished_line(
    message: &WorldMessage,
    no_stream: bool,
    streamed: &mut HashMap<MessageId, String>,
) -> Option<String> {
    if message.sender == HUMAN_SENDER {
        return None;
    }
    let shown = streamed.remove(&message.id);
    if !no_stream && shown.as_deref().map(str::trim) == Some(message.content.trim()) {
        return None;
    }
    Some(format!("[{}] {}", message.sender, message.content))
}

fn print_event(event: &WorldEvent, no_stream: bool, streamed: &mut HashMap<MessageId, String>) {
    match event {
        WorldEvent::Stream(stream) => match &stream.kind {
            StreamKind::Start if !no_stream => print!("[{}] ", stream.agent_id),
            StreamKind::Chunk { content } if !no_stream => {
                print!("{}", content);
                let _ = std::io::stdout().flush();
            }
            StreamKind::End { content, .. } if !no_stream => {
                println!();
                if !content.trim().is_empty() {
                    streamed.insert(stream.message_id, content.clone());
                }
            }
            StreamKind::Error { error } => eprintln!("! {} failed: {}", stream.agent_id, error),
            _ => {}
        },
        WorldEvent::System(notice) => println!("* {}", notice.content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(content: &str) -> WorldMessage {
        WorldMessage::new("w1", content, "alice")
    }

    #[test]
    fn test_streamed_reply_not_repeated() {
        let message = reply("Hello there.");
        let mut streamed = HashMap::from([(message.id, "Hello there.\n".to_string())]);
        assert_eq!(finished_line(&message, false, &mut streamed), None);
        assert!(streamed.is_empty());
    }

    #[test]
    fn test_rewritten_reply_printed_after_stream() {
        let message = reply("@human alice is passing control back to you.");
        let mut streamed = HashMap::from([(message.id, "<world>pass</world>".to_string())]);
        assert_eq!(
            finished_line(&message, false, &mut streamed).as_deref(),
            Some("[alice] @human alice is passing control back to you.")
        );

        let message = reply("@bob Sure.");
        let mut streamed = HashMap::from([(message.id, "Sure.".to_string())]);
        assert!(finished_line(&message, false, &mut streamed).is_some());
    }

    #[test]
    fn test_unstreamed_and_human_messages() {
        let mut streamed = HashMap::new();
        let notice = reply("@human alice reached the turn limit (3 model calls) and is waiting for a human or system message.");
        assert!(finished_line(&notice, false, &mut streamed).is_some());

        let typed = WorldMessage::new("w1", "hi", HUMAN_SENDER);
        assert_eq!(finished_line(&typed, false, &mut streamed), None);
        assert_eq!(finished_line(&typed, true, &mut streamed), None);
    }
}
