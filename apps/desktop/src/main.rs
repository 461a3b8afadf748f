use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use client_core::{load_settings, ChatClient, ClientEvent, MissingPeerConnector};
use shared::domain::{ConversationKey, UserId};
use std::sync::Arc;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    username: String,
    /// Peer to message after logging in.
    #[arg(long)]
    peer: Option<String>,
    #[arg(long, default_value = "hello from the desktop client")]
    message: String,
    /// How long to keep printing incoming events before logging out.
    #[arg(long, default_value_t = 10)]
    listen_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let settings = load_settings();
    let client = ChatClient::new(settings, Arc::new(MissingPeerConnector));
    let mut events = client.subscribe_events();

    client.login(args.username.as_str()).await?;
    println!("Logged in as {}", args.username);

    if let Some(peer) = &args.peer {
        let peer = UserId::new(peer.clone());
        client.send_message(&peer, &args.message).await?;
        println!("Sent to {peer}: {}", args.message);

        let log = client.conversation(&ConversationKey::User(peer)).await;
        println!("Conversation now holds {} message(s)", log.len());
    }

    println!("Listening for events for {}s...", args.listen_secs);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.listen_secs);
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        match event {
            Ok(ClientEvent::MessageReceived { key, message }) => {
                println!("[{key}] {}: {}", message.from, message.content.render());
            }
            Ok(ClientEvent::IncomingCall { caller, call_id }) => {
                println!("Incoming call from {caller} (id {call_id}); no media backend, ignoring");
            }
            Ok(ClientEvent::CallStateChanged { state, .. }) => {
                println!("Call state: {state:?}");
            }
            Ok(ClientEvent::CallEnded { peer, duration_ms }) => {
                println!("Call with {peer} ended after {duration_ms}ms");
            }
            Ok(ClientEvent::CallRejected { by }) => println!("Call rejected by {by}"),
            Ok(ClientEvent::AudioChunk { data }) => {
                println!("Audio chunk: {} bytes (no playback backend)", data.len());
            }
            Ok(ClientEvent::Error(message)) => eprintln!("Error: {message}"),
            Err(_) => break,
        }
    }

    client.logout().await?;
    println!("Logged out.");
    Ok(())
}
