use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{load_settings, ClientEvent, ClientRuntime, ConnectionState};
use shared::domain::RoomId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    /// Chat room to open.
    #[arg(long)]
    room: i64,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    broker_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.api_url {
        settings.api_base_url = url;
    }
    if let Some(url) = args.broker_url {
        settings.broker_url = url;
    }

    let client = ClientRuntime::new(settings);
    let profile = client.sign_in(&args.email, &args.password).await?;
    println!("Signed in as {} (user {})", profile.name, profile.user_id.0);

    let room_id = RoomId(args.room);
    let room = Arc::new(client.open_room(room_id).await?);

    let mut updates = room.message_stream();
    tokio::spawn(async move {
        while let Some(messages) = updates.next().await {
            println!("--- {} message(s) ---", messages.len());
            for message in messages {
                let when = message
                    .sent_at
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_else(|| "--:--:--".into());
                let read = if message.read_by_recipient {
                    "read"
                } else {
                    "unread"
                };
                println!("[{when}] {}: {} ({read})", message.sender_id.0, message.content);
            }
        }
    });

    // Live delivery has a hole after an outage; re-fetch history whenever the
    // connection comes back.
    {
        let mut events = client.subscribe_events();
        let room = Arc::clone(&room);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ClientEvent::ConnectionChanged(ConnectionState::Connected) => {
                        if let Err(err) = room.refresh().await {
                            warn!("history refresh failed: {err}");
                        }
                    }
                    ClientEvent::SignedOut { .. } => {
                        warn!("session ended, sign in again to continue");
                        break;
                    }
                    _ => {}
                }
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let content = line.trim();
        if content.is_empty() {
            continue;
        }
        if !room.send(content).await {
            // Broker unavailable: send over plain REST instead.
            client.chat().send_message(room_id, content).await?;
        }
    }

    client.sign_out().await;
    Ok(())
}
