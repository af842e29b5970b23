use std::{io::Write as _, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use client_core::{
    format::{format_duration, relative_time},
    identity::sender_label,
    load_settings, ChatSession, ClientEvent, ConnectionState, LocalFile, NotificationHost,
    NotificationPermission, SendOutcome, SessionDependencies, SessionIdentity, StoredProfile,
    UploadOutcome,
};
use shared::domain::{Notification, RoomId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the configured server address.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    /// JSON profile (`firstName`, `username`, `email`) used for the display name.
    #[arg(long)]
    profile: Option<PathBuf>,
    #[arg(long)]
    display_name: Option<String>,
    /// Disable the terminal bell on new messages.
    #[arg(long)]
    quiet: bool,
}

/// Rings the terminal bell; toasts are printed from the event stream.
struct TerminalHost;

#[async_trait]
impl NotificationHost for TerminalHost {
    fn permission(&self) -> NotificationPermission {
        NotificationPermission::Granted
    }

    async fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Granted
    }

    fn is_focused(&self) -> bool {
        true
    }

    fn show_alert(&self, _notification: &Notification) {}

    fn play_cue(&self) {
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07");
        let _ = stderr.flush();
    }
}

fn identity(args: &Args) -> Result<SessionIdentity> {
    if let Some(name) = &args.display_name {
        return Ok(SessionIdentity::new(args.user_id.as_str(), name.as_str()));
    }
    let profile = match &args.profile {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading profile {}", path.display()))?;
            serde_json::from_str::<StoredProfile>(&raw).context("parsing profile")?
        }
        None => StoredProfile::default(),
    };
    Ok(SessionIdentity::from_profile(args.user_id.as_str(), &profile))
}

fn print_event(event: ClientEvent) {
    match event {
        ClientEvent::ConnectionStateChanged(ConnectionState::Reconnecting { attempt, delay }) => {
            println!("* connection lost, retry {attempt} in {}s", delay.as_secs())
        }
        ClientEvent::ConnectionStateChanged(ConnectionState::Failed) => {
            println!("* offline: could not reconnect, use /connect to retry")
        }
        ClientEvent::ConnectionStateChanged(state) => println!("* {state:?}"),
        ClientEvent::ActiveRoomChanged(Some(room_id)) => println!("* joined {room_id}"),
        ClientEvent::ActiveRoomChanged(None) => println!("* left room"),
        ClientEvent::TranscriptAppended(message) => println!(
            "[{}] {}: {}",
            message.timestamp.format("%H:%M"),
            sender_label(&message),
            message.content
        ),
        ClientEvent::TranscriptReplaced { room_id, messages } => {
            println!("* {} earlier messages in {room_id}", messages.len());
            let now = Utc::now();
            for message in messages {
                println!(
                    "[{}] {}: {}",
                    relative_time(message.timestamp, now),
                    sender_label(&message),
                    message.content
                );
            }
        }
        ClientEvent::NotificationRaised(notification) => {
            let room = notification
                .room_id
                .map(|room_id| format!(" in {room_id}"))
                .unwrap_or_default();
            println!("! {}{room}: {}", notification.title, notification.content)
        }
        ClientEvent::MembersResolved(resolved) => {
            let names: Vec<_> = resolved
                .members
                .iter()
                .map(|member| member.display_name.as_str())
                .collect();
            println!("* members ({:?}): {}", resolved.source, names.join(", "))
        }
        ClientEvent::UploadStarted(task) => {
            println!("* uploading {} ({} bytes)", task.file_name, task.size_bytes)
        }
        ClientEvent::UploadSettled { outcome, .. } => match outcome {
            UploadOutcome::Shared { file_url } => println!("* shared {file_url}"),
            UploadOutcome::FellBack { reason } => println!("* upload fell back: {reason}"),
        },
        ClientEvent::RecordingTick { elapsed_secs } => {
            print!("\r* recording {}", format_duration(elapsed_secs));
            let _ = std::io::stdout().flush();
        }
        ClientEvent::Warning(warning) => println!("! {warning}"),
        ClientEvent::ServerError(message) => println!("! server: {message}"),
        ClientEvent::NotificationRemoved(_) | ClientEvent::RecordingStateChanged(_) => {}
    }
}

/// Returns false when the user asked to quit.
async fn handle_line(session: &ChatSession, line: &str) -> Result<bool> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "/quit" => return Ok(false),
        "/connect" => session.connection().connect(),
        "/rooms" => {
            let rooms = if rest.is_empty() {
                session.load_rooms().await?
            } else {
                session.filter_rooms(rest).await
            };
            for room in rooms {
                println!("  {} - {} ({} members)", room.room_id, room.name, room.member_count);
            }
        }
        "/create" => {
            let (name, description) = rest.split_once('|').unwrap_or((rest, ""));
            let room = session.create_room(name, description).await?;
            println!("* created {} ({})", room.name, room.room_id);
        }
        "/join" if !rest.is_empty() => session.switch_room(RoomId::from(rest)).await,
        "/leave" => session.leave_room().await,
        "/members" => {
            session.refresh_members().await;
        }
        "/upload" => {
            let mut files = Vec::new();
            for path in rest.split_whitespace() {
                files.push(LocalFile::read(path).await?);
            }
            session.upload_files(files).await?;
        }
        "/record" => {
            if let Err(err) = session.start_recording().await {
                println!("! {err}");
            }
        }
        "/stop" => match session.stop_recording().await {
            Ok(SendOutcome::Sent) => println!(),
            Ok(SendOutcome::Skipped(guard)) => println!("\n! voice message not sent: {guard:?}"),
            Ok(SendOutcome::Failed) => println!("\n! voice message not sent: write failed"),
            Err(err) => println!("\n! {err}"),
        },
        "/read" => session.notifications().mark_all_read().await,
        _ => {
            match session.send_text(line).await {
                SendOutcome::Sent => {}
                SendOutcome::Skipped(guard) => println!("! not sent: {guard:?}"),
                SendOutcome::Failed => println!("! not sent: write failed"),
            }
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = &args.server_url {
        settings.server_url = url.clone();
    }
    if args.quiet {
        settings.sound_enabled = false;
    }

    let deps = SessionDependencies {
        host: Arc::new(TerminalHost),
        ..SessionDependencies::http(&settings)
    };
    let session = ChatSession::start(settings, identity(&args)?, deps).await?;
    println!("Signed in as {}", session.identity().display_name);

    let mut events = session.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(event),
                Err(RecvError::Lagged(skipped)) => warn!("skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(err) = session.load_rooms().await {
        warn!("rooms unavailable: {err}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle_line(&session, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => println!("! {err:#}"),
        }
    }

    session.shutdown().await;
    printer.abort();
    Ok(())
}
