//! SkillCall CLI tools: configuration, relay diagnostics, local call demo.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use skillcall_client::{
    CallController, CallHandle, CallState, IncomingCall, LoopbackNetwork,
    MemoryRelay, ReconnectPolicy, SignalingTransport, TransportEvent, WsConnector,
};
use skillcall_common::{CallConfig, SignalBody};
use skillcall_media::DummyCapture;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "skillcall")]
#[command(about = "SkillCall CLI tools")]
struct Args {
    /// JSON config file; SKILLCALL_* variables override it
    #[arg(short, long, global = true, env = "SKILLCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective call configuration
    Config,

    /// Connect to a relay and print every event for a room
    Watch {
        /// Relay URL (defaults to the configured signaling URL)
        #[arg(short, long)]
        url: Option<String>,

        /// Bearer credential for the relay
        #[arg(short, long, env = "SKILLCALL_TOKEN")]
        token: String,

        /// Exchange whose room to join
        #[arg(short, long)]
        exchange: String,
    },

    /// Run a call between two in-process participants
    Demo {
        /// Seconds to stay in the call before hanging up
        #[arg(short, long, default_value_t = 2)]
        seconds: u64,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    skillcall_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Config => {
            let config = CallConfig::load(args.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Watch {
            url,
            token,
            exchange,
        } => {
            let config = CallConfig::load(args.config.as_deref())?;
            watch(config, url, &token, &exchange).await?;
        }
        Command::Demo { seconds } => {
            let config = CallConfig::load(args.config.as_deref())?;
            demo(config, Duration::from_secs(seconds)).await?;
        }
        Command::Version => {
            println!("skillcall {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

async fn watch(config: CallConfig, url: Option<String>, token: &str, exchange: &str) -> Result<()> {
    let url = url.unwrap_or_else(|| config.signaling_url.clone());
    let transport = SignalingTransport::new(
        Arc::new(WsConnector::new(url.clone(), config.auth_timeout())),
        ReconnectPolicy::from_settings(&config.reconnect),
    );
    let mut events = transport.subscribe();

    let participant = transport
        .connect(token)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    transport.join_room(exchange)?;
    println!("Connected to {url} as {participant}; watching room {exchange}");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    TransportEvent::Signal(message) => {
                        let from = message.sender_participant_id.as_deref().unwrap_or("?");
                        match &message.body {
                            SignalBody::End(notice) => {
                                println!("[{}] {} from {from}: {}", message.exchange_id, message.kind(), notice.reason)
                            }
                            _ => println!("[{}] {} from {from}", message.exchange_id, message.kind()),
                        }
                    }
                    TransportEvent::Chat(chat) => {
                        let from = chat.sender_participant_id.as_deref().unwrap_or("?");
                        println!("[{}] chat {from}: {}", chat.exchange_id, chat.body);
                    }
                    TransportEvent::Presence(presence) => {
                        let status = if presence.online { "online" } else { "offline" };
                        println!("{} is {status}", presence.participant_id);
                    }
                    TransportEvent::ReconnectFailed { attempts } => {
                        return Err(anyhow!("relay unreachable after {attempts} reconnect attempts"));
                    }
                    TransportEvent::AuthFailed { reason } => {
                        return Err(anyhow!("relay rejected the credential: {reason}"));
                    }
                    other => println!("{other:?}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Leaving room {exchange}");
                break;
            }
        }
    }

    transport.leave_room(exchange).ok();
    transport.close();
    Ok(())
}

struct DemoParty {
    handle: CallHandle,
    incoming: mpsc::UnboundedReceiver<IncomingCall>,
}

async fn demo_party(
    name: &str,
    config: &CallConfig,
    relay: &MemoryRelay,
    net: &LoopbackNetwork,
) -> Result<DemoParty> {
    let token = format!("demo-{name}");
    relay.register(&token, name);
    let transport = SignalingTransport::new(
        Arc::new(relay.connector()),
        ReconnectPolicy::from_settings(&config.reconnect),
    );
    transport.connect(&token).await?;

    let (tx, incoming) = mpsc::unbounded_channel();
    let handle = CallController::new(
        config.clone(),
        transport,
        Arc::new(DummyCapture::new()),
        Arc::new(net.clone()),
    )
    .with_notifier(Arc::new(tx))
    .spawn();
    Ok(DemoParty { handle, incoming })
}

async fn demo(config: CallConfig, hold: Duration) -> Result<()> {
    let relay = MemoryRelay::new();
    let net = LoopbackNetwork::new();
    let exchange = "demo-exchange";

    let alice = demo_party("alice", &config, &relay, &net).await?;
    let mut bob = demo_party("bob", &config, &relay, &net).await?;

    let caller = alice.handle.clone();
    let call = tokio::spawn(async move { caller.start_call_to(exchange, Some("bob")).await });

    let incoming = bob
        .incoming
        .recv()
        .await
        .ok_or_else(|| anyhow!("bob's controller stopped"))?;
    println!(
        "bob: incoming call for {} from {}",
        incoming.exchange_id,
        incoming.caller_participant_id.as_deref().unwrap_or("unknown")
    );
    bob.handle.accept_incoming(&incoming.exchange_id).await?;
    call.await??;
    info!("both sides active");

    let snapshot = alice.handle.snapshot();
    println!(
        "alice: {:?} with {}",
        snapshot.state,
        snapshot.remote_participant_id.as_deref().unwrap_or("?")
    );

    let media = alice.handle.toggle_mute().await?;
    println!("alice: muted={}", !media.audio_enabled);
    let media = alice.handle.toggle_screen_share().await?;
    println!("alice: screen sharing={}", media.screen_sharing);

    tokio::time::sleep(hold).await;
    println!("alice: call time {:?}", alice.handle.snapshot().elapsed);

    alice.handle.hang_up().await?;
    for (name, handle) in [("alice", &alice.handle), ("bob", &bob.handle)] {
        let end = handle.wait_for_state(CallState::is_terminal).await?;
        let reason = end
            .termination
            .map(|r| r.describe())
            .unwrap_or("unknown reason");
        println!("{name}: {:?} ({reason})", end.state);
    }
    Ok(())
}
