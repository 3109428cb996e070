//! # roomchat
//!
//! Command-line front end for the roomchat sync engine. Every invocation
//! opens the shared store, resumes the device session if there is one, runs
//! one command, and exits. `watch` keeps a conversation open and streams it
//! until Ctrl+C.

mod cli;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use roomchat_shared::{room_key, UserId};
use roomchat_sync::{ConversationEvent, Engine, Session, SessionStore, SyncConfig};

use crate::cli::{Command, USAGE};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,roomchat_sync=debug,roomchat_store=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{USAGE}");
        return Ok(());
    }
    let command = Command::parse(&args)?;

    // -----------------------------------------------------------------------
    // 2. Load configuration and open the stores
    // -----------------------------------------------------------------------
    let config = SyncConfig::from_env();
    info!(?config, "Loaded configuration");

    let engine = Engine::open(config.clone()).context("opening message store")?;
    let store = SessionStore::open(&config.session_path).context("opening session store")?;

    // -----------------------------------------------------------------------
    // 3. Run the command
    // -----------------------------------------------------------------------
    let session = Session::resume(engine.clone(), store.clone()).await?;

    match (command, session) {
        (Command::Register { user, display_name }, _) => {
            let user = engine
                .register_user(&user, display_name.as_deref(), None)
                .await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        (Command::Login(user), _) => {
            let session = Session::login(engine.clone(), store, user).await?;
            println!("signed in as {}", session.user());
        }
        (Command::Logout, Some(session)) => {
            let user = session.user().clone();
            session.logout().await?;
            println!("signed out {user}");
        }
        (Command::Logout, None) => println!("not signed in"),
        (Command::WhoAmI, Some(session)) => {
            println!("{}", session.user());
            if let Some(room) = session.active_room().await? {
                println!("open room: {room}");
            }
            if let Some(channel) = session.active_channel().await? {
                println!("channel: {channel}");
            }
        }
        (Command::WhoAmI, None) => println!("not signed in"),
        (Command::Users, _) => {
            for user in engine.users().await? {
                let state = if user.online { "online" } else { "offline" };
                let seen = user
                    .last_seen
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into());
                println!("{:<24} {:<8} last seen {}", user.id, state, seen);
            }
        }
        (Command::Peers, Some(session)) => {
            for peer in engine.list_peers(session.user()).await? {
                match peer.preview {
                    Some(p) => println!("{:<24} {}: {}", peer.user.id, p.last_sender, p.last_message),
                    None => println!("{:<24} (no messages)", peer.user.id),
                }
            }
        }
        (Command::Send { peer, text }, Some(session)) => {
            let conversation = session.open_conversation(&peer).await?;
            let result = conversation.send(&text).await;
            conversation.leave().await?;
            match result {
                Ok(message) => println!("sent {} at {}", message.id, message.timestamp.to_rfc3339()),
                Err(e) => bail!("{e}; unsent text: {:?}", e.text),
            }
        }
        (Command::History { peer, limit }, Some(session)) => {
            let room = room_key(session.user(), &peer);
            let limit = limit.unwrap_or(config.recent_limit);
            for message in engine.messages().recent(&room, limit).await? {
                let read = if message.is_read_by(&peer) { " (read)" } else { "" };
                println!(
                    "[{}] {}: {}{}",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    message.sender,
                    message.text,
                    read
                );
            }
        }
        (Command::Summary, Some(session)) => {
            let summary = engine.reconciler().unread_summary(session.user()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        (Command::Watch(peer), Some(session)) => watch(&engine, &session, &peer).await?,
        (Command::Channels, _) => {
            for channel in engine.channels().list().await? {
                println!(
                    "{:<32} code {} {}/{} members",
                    channel.id, channel.code, channel.member_count, channel.max_members
                );
            }
        }
        (Command::ChannelCreate { name, max_members }, Some(session)) => {
            let channel = session.create_channel(&name, max_members).await?;
            println!("created {} (join code {})", channel.id, channel.code);
        }
        (Command::ChannelJoin(code), Some(session)) => {
            let channel = session.join_channel(&code).await?;
            println!(
                "joined {} ({}/{} members)",
                channel.id, channel.member_count, channel.max_members
            );
        }
        (Command::ChannelLeave, Some(session)) => match session.leave_channel().await? {
            Some(channel) => println!("left {channel}"),
            None => println!("not in a channel"),
        },
        (Command::ChannelMembers, Some(session)) => {
            let Some(channel) = session.active_channel().await? else {
                bail!("not in a channel, run `roomchat channel join <code>` first");
            };
            for user in engine.channels().members(&channel).await? {
                println!("{}", user.id);
            }
        }
        (command, None) => {
            debug_assert!(command.needs_session());
            bail!("not signed in, run `roomchat login <user>` first");
        }
    }

    engine.flush().await;
    Ok(())
}

/// Stream a conversation until Ctrl+C.
///
/// Other processes write to the same store, so the engine is polled for
/// changes every `feed_poll_ms`.
async fn watch(engine: &std::sync::Arc<Engine>, session: &Session, peer: &UserId) -> Result<()> {
    let mut conversation = session.open_conversation(peer).await?;
    println!("watching {} (Ctrl+C to leave)", conversation.room());

    let poll_ms = engine.config().feed_poll_ms;
    let mut poll = tokio::time::interval(Duration::from_millis(poll_ms.max(1)));
    let mut shown = 0usize;

    loop {
        tokio::select! {
            event = conversation.next_event() => {
                match event {
                    Some(ConversationEvent::Messages(snapshot)) => {
                        for message in snapshot.iter().skip(shown) {
                            println!("{}: {}", message.sender, message.text);
                        }
                        shown = snapshot.len();
                    }
                    Some(ConversationEvent::PeerPresence(record)) => {
                        let state = if record.online { "online" } else { "offline" };
                        println!("-- {} is {state}", record.user_id);
                    }
                    None => break,
                }
            }
            _ = poll.tick(), if poll_ms > 0 => {
                if let Err(e) = engine.refresh().await {
                    warn!(error = %e, "refresh failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving conversation");
                break;
            }
        }
    }

    conversation.leave().await?;
    Ok(())
}
