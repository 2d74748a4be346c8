use crate::config::Config;
use crate::http_client::HttpApi;
use crate::inbox::Inbox;
use crate::session::{SessionEvent, SessionHandle, TimelineView};
use crate::error::TimelineError;
use crate::timeline::{LoadState, TimelineChange};
use crate::types::{
    ConversationId, ConversationSummary, DeliveryTag, HistoryMessage, ImageFile, MessageType,
    ParticipantId,
};
use colored::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Shared CLI implementation for the `inbox` binary.
pub async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("inbox")
        .to_string();

    let (config, rest) = Config::from_args(&args[args.len().min(1)..])
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(command) = rest.first() else {
        print_usage(&bin);
        return Ok(());
    };

    match command.as_str() {
        "conversations" => {
            let all = rest.iter().any(|a| a == "--all");
            list_conversations(config, all).await?;
        }
        "history" => {
            let Some(id) = rest.get(1).and_then(|s| parse_conversation(s)) else {
                eprintln!("{}", format!("Usage: {} history <conversation_id> [pages]", bin).yellow());
                return Ok(());
            };
            let pages = rest.get(2).and_then(|s| s.parse::<usize>().ok()).unwrap_or(1);
            show_history(config, id, pages).await?;
        }
        "send" => {
            if rest.len() < 3 {
                eprintln!("{}", format!("Usage: {} send <conversation_id> <message>", bin).yellow());
                return Ok(());
            }
            let Some(id) = parse_conversation(&rest[1]) else {
                eprintln!("{} Invalid conversation id: {}", "✗".red().bold(), rest[1].red());
                return Ok(());
            };
            let message = rest[2..].join(" ");
            send_message(config, id, Outgoing::Text(message)).await?;
        }
        "send-image" => {
            if rest.len() < 3 {
                eprintln!("{}", format!("Usage: {} send-image <conversation_id> <path>", bin).yellow());
                return Ok(());
            }
            let Some(id) = parse_conversation(&rest[1]) else {
                eprintln!("{} Invalid conversation id: {}", "✗".red().bold(), rest[1].red());
                return Ok(());
            };
            let image = read_image(Path::new(&rest[2]))?;
            send_message(config, id, Outgoing::Image(image)).await?;
        }
        "watch" => {
            let Some(id) = rest.get(1).and_then(|s| parse_conversation(s)) else {
                eprintln!("{}", format!("Usage: {} watch <conversation_id>", bin).yellow());
                return Ok(());
            };
            watch(config, id).await?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

enum Outgoing {
    Text(String),
    Image(ImageFile),
}

fn parse_conversation(s: &str) -> Option<ConversationId> {
    s.parse::<u64>().ok().map(ConversationId)
}

fn print_usage(bin: &str) {
    println!("{}", "✉ Inbox CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--api-url URL] [--as ID] <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} [--all]            List conversations", "conversations".cyan());
    println!("  {} <id> [pages]             Print message history", "history".cyan());
    println!("  {} <id> <message>              Send a text message", "send".cyan());
    println!("  {} <id> <path>           Send an image", "send-image".cyan());
    println!("  {} <id>                       Follow a conversation live", "watch".cyan());
    println!();
    println!(
        "  {} {}",
        "-".dimmed(),
        "INBOX_API_URL, INBOX_PARTICIPANT_ID, INBOX_API_TOKEN override the defaults".dimmed()
    );
}

fn connect(config: Config) -> anyhow::Result<Inbox<HttpApi, HttpApi>> {
    let api = Arc::new(HttpApi::new(&config)?);
    Ok(Inbox::new(api.clone(), api, config))
}

async fn list_conversations(config: Config, all: bool) -> anyhow::Result<()> {
    let me = config.participant_id;
    let mut inbox = connect(config)?;
    loop {
        inbox.load_more_conversations().await?;
        if !all || !inbox.feed().has_more() {
            break;
        }
    }

    let feed = inbox.feed();
    if feed.is_empty() {
        println!("{}", "No conversations".yellow());
        return Ok(());
    }
    println!("Conversations ({}{}):", feed.len(), if feed.has_more() { "+" } else { "" });
    println!("{:-<60}", "");
    for conversation in feed.conversations() {
        print_conversation(conversation, me);
    }
    Ok(())
}

fn print_conversation(c: &ConversationSummary, me: ParticipantId) {
    let title = c
        .counterpart(me)
        .map(|p| p.display_name.clone())
        .unwrap_or_else(|| "(just you)".to_string());
    let trip = c
        .trip
        .as_ref()
        .and_then(|t| t.listing_title.clone().or(t.location.clone()))
        .unwrap_or_default();
    println!(
        "  {} {} {}",
        format!("#{}", c.id).cyan(),
        title.bright_white().bold(),
        trip.dimmed()
    );
    if let Some(last) = &c.last_message {
        let preview = last.content.clone().unwrap_or_else(|| "[image]".to_string());
        println!("      {} {}", last.created_at.format("%b %d %H:%M").to_string().dimmed(), preview);
    }
}

async fn open_ready(
    inbox: &mut Inbox<HttpApi, HttpApi>,
    id: ConversationId,
) -> anyhow::Result<(SessionHandle, TimelineView)> {
    let session = inbox.open_conversation(id).await?;
    let view = session
        .wait_until(|v| matches!(v.load_state, LoadState::Ready | LoadState::Failed(_)))
        .await?;
    if let LoadState::Failed(e) = &view.load_state {
        anyhow::bail!("Could not load conversation {}: {}", id, e);
    }
    Ok((session, view))
}

async fn show_history(config: Config, id: ConversationId, pages: usize) -> anyhow::Result<()> {
    let me = config.participant_id;
    let mut inbox = connect(config)?;
    let (session, mut view) = open_ready(&mut inbox, id).await?;

    let mut events = session.subscribe();
    for _ in 1..pages {
        if !view.older.has_more {
            break;
        }
        session.load_older()?;
        let failed = loop {
            match events.recv().await {
                Ok(SessionEvent::Changed(TimelineChange::Prepended { .. })) => break None,
                Ok(SessionEvent::Error(TimelineError::OlderPage(e))) => break Some(e),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => anyhow::bail!("Session closed while loading history"),
            }
        };
        view = session.snapshot();
        if let Some(e) = failed {
            eprintln!("{} Older messages failed: {}", "✗".red().bold(), e);
            break;
        }
    }

    for message in &view.messages {
        print_message(message, me);
    }
    if view.older.has_more {
        println!("{}", "  … older messages available".dimmed());
    }
    session.close();
    Ok(())
}

async fn send_message(config: Config, id: ConversationId, outgoing: Outgoing) -> anyhow::Result<()> {
    let mut inbox = connect(config)?;
    let (session, _) = open_ready(&mut inbox, id).await?;
    let mut events = session.subscribe();

    let temp_id = match outgoing {
        Outgoing::Text(text) => session.send_text(text).await?,
        Outgoing::Image(image) => session.send_image(image).await?,
    };

    let outcome = loop {
        match events.recv().await {
            Ok(SessionEvent::Changed(TimelineChange::Confirmed { temp_id: t, id: message_id })) if t == temp_id => {
                break Ok(message_id);
            }
            Ok(SessionEvent::Error(TimelineError::Send { temp_id: t, source })) if t == temp_id => {
                break Err(source);
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => anyhow::bail!("Session closed before the message was confirmed"),
        }
    };
    session.close();

    match outcome {
        Ok(message_id) => {
            println!("{} Message sent! ID: {}", "✓".green().bold(), message_id.to_string().cyan());
            Ok(())
        }
        Err(e) => {
            eprintln!("{} Message could not be sent: {}", "✗".red().bold(), e);
            std::process::exit(1);
        }
    }
}

async fn watch(config: Config, id: ConversationId) -> anyhow::Result<()> {
    let me = config.participant_id;
    let mut inbox = connect(config)?;
    let (session, view) = open_ready(&mut inbox, id).await?;
    let mut events = session.subscribe();

    let mut printed: HashSet<_> = HashSet::new();
    for message in &view.messages {
        print_message(message, me);
        printed.insert(message.id);
    }
    println!("{}", format!("Watching conversation {} (Ctrl+C to stop)", id).dimmed());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Changed(_)) => {
                    for message in session.snapshot().messages {
                        if message.id.is_confirmed() && printed.insert(message.id) {
                            print_message(&message, me);
                        }
                    }
                }
                Ok(SessionEvent::Error(e)) => eprintln!("{} {}", "✗".red().bold(), e),
                Ok(SessionEvent::Scroll(_)) => {}
                Err(RecvError::Lagged(n)) => eprintln!("{}", format!("(skipped {} events)", n).dimmed()),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close();
    Ok(())
}

fn print_message(m: &HistoryMessage, me: ParticipantId) {
    let when = m.created_at.format("%b %d %H:%M").to_string();
    let body = match (&m.content, &m.media) {
        (Some(text), _) => text.clone(),
        (None, Some(media)) => format!("[image {}]", media.url),
        (None, None) => String::new(),
    };
    if m.message_type == MessageType::System {
        println!("  {} {}", when.dimmed(), body.italic().dimmed());
        return;
    }
    let who = if m.sender_id == me {
        "you".green().bold()
    } else {
        format!("#{}", m.sender_id).cyan()
    };
    let status = match m.delivery {
        DeliveryTag::Sent => "".normal(),
        DeliveryTag::Sending(_) => " (sending)".yellow(),
        DeliveryTag::Error(_) => " (failed)".red(),
    };
    println!("  {} {}: {}{}", when.dimmed(), who, body, status);
}

fn read_image(path: &Path) -> anyhow::Result<ImageFile> {
    let data = std::fs::read(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    Ok(ImageFile::new(file_name, mime_type_for(path), data))
}

fn mime_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "webp" => "image/webp",
        _ => "image/jpeg",
    }
}
