use std::io::{self, Write};

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use turnstream::channel::{ChannelEvent, ChannelStatus};
use turnstream::cli::{Args, Command};
use turnstream::protocol::{Attachment, NotificationEvent};
use turnstream::{ChatClient, ClientConfig, DraftStatus, Prompt, SessionState};

// ---------------------------------------------------------------------------
// Terminal rendering
// ---------------------------------------------------------------------------

/// Prints only what the draft gained since the last call.
#[derive(Default)]
struct DeltaPrinter {
    reasoning: usize,
    content: usize,
    show_reasoning: bool,
}

impl DeltaPrinter {
    fn print(&mut self, draft: &turnstream::Draft) {
        let mut out = io::stdout();
        if self.show_reasoning && draft.reasoning.len() > self.reasoning {
            let _ = write!(out, "{}", draft.reasoning[self.reasoning..].dimmed());
            self.reasoning = draft.reasoning.len();
        }
        if draft.content.len() > self.content {
            if self.content == 0 && self.reasoning > 0 {
                let _ = writeln!(out);
            }
            let _ = write!(out, "{}", &draft.content[self.content..]);
            self.content = draft.content.len();
        }
        let _ = out.flush();
    }
}

fn print_notification(event: &NotificationEvent) {
    let kind = match event {
        NotificationEvent::ConversationCreated { .. } => "conversation_created",
        NotificationEvent::ConversationDeleted { .. } => "conversation_deleted",
        NotificationEvent::MessageAdded { .. } => "message_added",
        NotificationEvent::MessageEdited { .. } => "message_edited",
        NotificationEvent::SummaryUpdated { .. } => "summary_updated",
    };
    println!(
        "{} {}",
        kind.bright_blue().bold(),
        event.conversation_id().unwrap_or("-").cyan()
    );
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn chat(
    config: ClientConfig,
    prompt: String,
    conversation: Option<String>,
    model: Option<String>,
    system: Option<String>,
    attachments: Vec<std::path::PathBuf>,
    show_reasoning: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = ChatClient::new(config);
    // Only needed so Ctrl-C can reach the server; failures here are logged.
    let _events = client.connect_notifications();

    if let Some(id) = &conversation {
        client.store().load_conversation(id).await?;
    }

    let mut files = Vec::with_capacity(attachments.len());
    for path in &attachments {
        files.push(Attachment::from_path(path).await?);
    }

    let mut handle = client
        .send(Prompt {
            text: prompt,
            attachments: files,
            model,
            system_prompt: system,
        })
        .await?;

    let mut printer = DeltaPrinter {
        show_reasoning,
        ..Default::default()
    };
    let mut stopping = false;
    loop {
        let changed = tokio::select! {
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                client.stop();
                continue;
            }
            changed = handle.draft.changed() => changed,
        };
        if changed.is_err() {
            break;
        }
        let draft = handle.draft.borrow_and_update().clone();
        printer.print(&draft);
        if draft.status.is_terminal() {
            break;
        }
    }

    let state = handle.finished().await;
    let draft = handle.draft.borrow().clone();
    println!();
    match (state, &draft.status) {
        (SessionState::Aborted, _) => println!("{}", "[stopped]".yellow()),
        (SessionState::Errored, DraftStatus::Errored(detail)) => {
            println!("{} {}", "[error]".red().bold(), detail.red())
        }
        (SessionState::Errored, _) => println!("{}", "[error]".red().bold()),
        _ => {}
    }
    if !draft.context.is_empty() {
        for snippet in &draft.context {
            println!(
                "{} {} ({:.2})",
                "source:".dimmed(),
                snippet.file_name.cyan(),
                snippet.similarity
            );
        }
    }
    for image in &draft.images {
        if image.url.starts_with("data:") {
            println!("{} {}", "image:".dimmed(), image.identity);
        } else {
            println!("{} {}", "image:".dimmed(), image.url);
        }
    }
    println!(
        "{} {}",
        "conversation".dimmed(),
        handle.conversation_id.cyan()
    );

    client.shutdown().await;
    Ok(())
}

async fn list(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = ChatClient::new(config);
    client.store().refresh_list().await?;
    let snapshot = client.store().snapshot();
    if snapshot.summaries.is_empty() {
        println!("{}", "no conversations".dimmed());
    }
    for s in &snapshot.summaries {
        println!(
            "{}  {:>4} msgs  {}",
            s.id.cyan(),
            s.message_count,
            s.summary.as_deref().unwrap_or("(no summary)")
        );
    }
    Ok(())
}

async fn watch(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = ChatClient::new(config);
    println!(
        "{} {}",
        "watching".bold(),
        client.config().channel_url().cyan()
    );
    let mut events = client.connect_notifications();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ChannelEvent::Status(status)) => {
                    let label = match status {
                        ChannelStatus::Open => status.to_string().green(),
                        ChannelStatus::Connecting => status.to_string().yellow(),
                        ChannelStatus::Closed => status.to_string().red(),
                    };
                    println!("{} {}", "channel".dimmed(), label);
                }
                Some(ChannelEvent::Notification(n)) => print_notification(&n),
                None => break,
            }
        }
    }
    client.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("turnstream=info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = args.resolve_config()?;

    match args.command {
        Command::Chat {
            prompt,
            conversation,
            model,
            system,
            attachments,
            no_reasoning,
        } => {
            chat(
                config,
                prompt,
                conversation,
                model,
                system,
                attachments,
                !no_reasoning,
            )
            .await
        }
        Command::List => list(config).await,
        Command::Watch => watch(config).await,
    }
}
