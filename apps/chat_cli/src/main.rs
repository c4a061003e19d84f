use std::{collections::HashSet, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, ChatClient, ChatEvent, ChatHandle, SubscriptionState};
use shared::domain::{Conversation, ConversationId, DeliveryStatus, Message, MessageKey, UserId};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for farmer/buyer conversations")]
struct Cli {
    /// TOML settings file; `chat.toml` in the working directory is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List conversations, most recent first.
    Conversations,
    Messages {
        conversation_id: String,
    },
    Send {
        conversation_id: String,
        text: String,
    },
    /// Open a conversation and print updates until Ctrl-C.
    Watch {
        conversation_id: String,
    },
    Search {
        term: String,
    },
    Start {
        participant_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    if let Some(user_id) = cli.user_id {
        settings.user_id = user_id;
    }
    let client = ChatClient::from_settings(&settings).context("failed to build chat client")?;
    info!(user_id = %client.user_id(), server_url = %settings.server_url, "starting chat client");

    let result = run(&client, cli.command).await;
    client.shutdown().await;
    result
}

async fn run(client: &dyn ChatHandle, command: Command) -> Result<()> {
    if let Command::Search { term } = &command {
        for user in client.search(term).await? {
            println!("{}\t{}\t{:?}", user.user_id, user.display_name, user.role);
        }
        return Ok(());
    }

    let conversations = client.connect().await?;
    match command {
        Command::Conversations => {
            for conversation in &conversations {
                println!("{}", format_conversation(conversation));
            }
        }
        Command::Messages { conversation_id } => {
            let messages = client
                .open_conversation(&ConversationId::new(conversation_id))
                .await?;
            for message in &messages {
                println!("{}", format_message(message));
            }
        }
        Command::Send {
            conversation_id,
            text,
        } => {
            let message = client
                .send(&ConversationId::new(conversation_id), &text)
                .await?;
            println!("sent {}", message.id);
        }
        Command::Watch { conversation_id } => {
            watch(client, ConversationId::new(conversation_id)).await?;
        }
        Command::Start { participant_id } => {
            let conversation = client
                .start_new_conversation(&UserId::new(participant_id))
                .await?;
            println!("{}", format_conversation(&conversation));
        }
        Command::Search { .. } => {}
    }
    Ok(())
}

async fn watch(client: &dyn ChatHandle, conversation_id: ConversationId) -> Result<()> {
    let mut events = client.subscribe_events();
    let opened = client.open_conversation(&conversation_id).await?;
    let mut printed = HashSet::new();
    for message in unprinted(&mut printed, &opened) {
        println!("{}", format_message(message));
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.next() => match event {
                Some(ChatEvent::MessagesUpdated { conversation_id: updated, messages }) if updated == conversation_id => {
                    for message in unprinted(&mut printed, &messages) {
                        println!("{}", format_message(message));
                    }
                }
                Some(ChatEvent::SendFailed { error, .. }) => eprintln!("send failed: {error}"),
                Some(ChatEvent::SubscriptionChanged { channel, state }) if state != SubscriptionState::Active => {
                    eprintln!("[{channel}] {state:?}");
                }
                Some(ChatEvent::Error(err)) => eprintln!("error: {err}"),
                Some(_) => {}
                None => break,
            }
        }
    }
    Ok(())
}

/// Confirmed messages whose durable id has not been printed yet. Pending
/// placeholders are skipped; they print once the server confirms them.
fn unprinted<'a>(printed: &mut HashSet<MessageKey>, messages: &'a [Message]) -> Vec<&'a Message> {
    messages
        .iter()
        .filter(|message| message.status == DeliveryStatus::Confirmed)
        .filter(|message| printed.insert(message.id.clone()))
        .collect()
}

fn format_conversation(conversation: &Conversation) -> String {
    let when = conversation
        .last_message_at
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}\t{} ({:?})\tunread={}\t{}\t{}",
        conversation.id,
        conversation.participant_display_name,
        conversation.participant_role,
        conversation.unread_count,
        when,
        conversation.last_message_preview.as_deref().unwrap_or(""),
    )
}

fn format_message(message: &Message) -> String {
    let marker = match message.status {
        DeliveryStatus::Pending => " (sending)",
        DeliveryStatus::Failed => " (failed)",
        DeliveryStatus::Confirmed => "",
    };
    format!(
        "[{}] {}: {}{}",
        message.created_at.format("%H:%M:%S"),
        message.sender_id,
        message.content,
        marker
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shared::domain::{MessageId, ParticipantRole, TempMessageId};

    #[test]
    fn parses_send_with_overrides() {
        let cli = Cli::try_parse_from([
            "chat_cli",
            "--server-url",
            "http://127.0.0.1:9000",
            "--user-id",
            "buyer-1",
            "send",
            "c7",
            "is the honey still available?",
        ])
        .expect("parse");

        assert_eq!(cli.server_url.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(cli.user_id.as_deref(), Some("buyer-1"));
        assert!(matches!(
            cli.command,
            Command::Send { ref conversation_id, ref text }
                if conversation_id == "c7" && text == "is the honey still available?"
        ));
    }

    #[test]
    fn pending_messages_are_marked() {
        let message = Message {
            id: MessageKey::Durable(MessageId::new("m-1")),
            conversation_id: "c7".into(),
            sender_id: "buyer-1".into(),
            content: "hello".into(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            is_read: false,
            status: DeliveryStatus::Pending,
        };
        assert_eq!(format_message(&message), "[09:30:00] buyer-1: hello (sending)");
    }

    fn message(id: MessageKey, content: &str, status: DeliveryStatus) -> Message {
        Message {
            id,
            conversation_id: "c7".into(),
            sender_id: "buyer-1".into(),
            content: content.into(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            is_read: false,
            status,
        }
    }

    #[test]
    fn watch_prints_each_confirmed_message_once() {
        let first = message(MessageKey::Durable(MessageId::new("m-1")), "eggs?", DeliveryStatus::Confirmed);
        let pending = message(
            MessageKey::Temporary(TempMessageId::generate()),
            "two dozen",
            DeliveryStatus::Pending,
        );
        let mut printed = HashSet::new();

        let opened = [first.clone(), pending];
        let shown = unprinted(&mut printed, &opened);
        assert_eq!(shown, vec![&first]);

        // The placeholder was promoted in place and a push landed ahead of it.
        let promoted = message(MessageKey::Durable(MessageId::new("m-2")), "two dozen", DeliveryStatus::Confirmed);
        let pushed = message(MessageKey::Durable(MessageId::new("m-3")), "ok", DeliveryStatus::Confirmed);
        let reordered = [pushed.clone(), first, promoted.clone()];
        let shown = unprinted(&mut printed, &reordered);
        assert_eq!(shown, vec![&pushed, &promoted]);

        assert!(unprinted(&mut printed, &reordered).is_empty());
    }

    #[test]
    fn conversation_line_shows_unread_and_preview() {
        let conversation = Conversation {
            id: "c7".into(),
            participant_id: "farmer-1".into(),
            participant_display_name: "Green Acres".into(),
            participant_role: ParticipantRole::Farmer,
            last_message_preview: Some("eggs ready".into()),
            last_message_at: None,
            unread_count: 2,
        };
        assert_eq!(
            format_conversation(&conversation),
            "c7\tGreen Acres (Farmer)\tunread=2\t-\teggs ready"
        );
    }
}
