use anyhow::{Context, Result};
use campfire_client::{ApplyOutcome, JoinRequest, LocalView, SyncTicker};
use campfire_core::{ClientMessage, MembershipSnapshot, ServerMessage};
use clap::{Parser, Subcommand};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(
    name = "campfire-server",
    author,
    version,
    about = "Campfire presence server and watch client"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind the listener to.
    #[arg(long, env = "CAMPFIRE_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Redis connection URI backing the membership store.
    #[arg(
        long,
        env = "CAMPFIRE_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    /// Seconds of inactivity before room state ages out of the store.
    #[arg(long, env = "CAMPFIRE_ROOM_TTL_SECS", default_value_t = 86_400)]
    pub room_ttl_secs: u64,

    /// Public base URL advertised to clients (http(s)://host[:port]).
    #[arg(long, env = "CAMPFIRE_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Secret keying resume-token MACs. Random per process when unset,
    /// which invalidates outstanding tokens on restart.
    #[arg(long, env = "CAMPFIRE_TOKEN_SECRET")]
    pub resume_token_secret: Option<String>,

    /// Resume token lifetime in seconds.
    #[arg(long, env = "CAMPFIRE_TOKEN_TTL_SECS", default_value_t = 86_400)]
    pub resume_token_ttl_secs: u64,

    /// Silence on a connection for longer than this counts as a
    /// disconnect.
    #[arg(long, env = "CAMPFIRE_HEARTBEAT_TIMEOUT_SECS", default_value_t = 600)]
    pub heartbeat_timeout_secs: u64,

    /// How often to sweep for silent connections.
    #[arg(long, env = "CAMPFIRE_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CAMPFIRE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Join a room and tail its membership as it converges.
    Watch {
        /// Server URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Room passphrase or join code
        #[arg(short, long)]
        passphrase: String,

        /// Display name to join with
        #[arg(short, long)]
        name: Option<String>,
    },
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Debug client: joins a room and prints the member list every time the
/// local view changes. Runs the same sync loop real clients run, so it
/// doubles as an end-to-end check of the self-healing path.
pub async fn run_watch_client(
    url: String,
    passphrase: String,
    name: Option<String>,
) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    let (socket, _) = connect_async(&ws_url)
        .await
        .with_context(|| format!("failed to connect to {ws_url}"))?;
    let (mut tx, mut rx) = socket.split();

    let mut join = JoinRequest::new(passphrase);
    if let Some(name) = name {
        join = join.with_display_name(name);
    }
    send_json(&mut tx, &join.into_message()).await?;

    let mut view = LocalView::new();
    let mut ticker = SyncTicker::with_default_interval();

    loop {
        tokio::select! {
            frame = rx.next() => {
                let Some(frame) = frame else { break };
                match frame? {
                    Message::Text(text) => {
                        if let Some(snapshot) = snapshot_from_frame(&text) {
                            if let ApplyOutcome::Applied { membership_changed: true } =
                                view.apply(snapshot)
                            {
                                print_view(&view);
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            message = ticker.tick() => {
                send_json(&mut tx, &message).await?;
            }
        }
    }
    Ok(())
}

fn snapshot_from_frame(text: &str) -> Option<MembershipSnapshot> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::Joined { snapshot, .. }) => Some(snapshot),
        Ok(ServerMessage::Event { snapshot, .. }) => Some(snapshot),
        Ok(ServerMessage::SyncResponse { snapshot }) => Some(snapshot),
        Ok(ServerMessage::Pong) => None,
        Ok(ServerMessage::Error { kind, message }) => {
            warn!(?kind, message, "server reported an error");
            None
        }
        Err(err) => {
            warn!(%err, "unparseable server frame");
            None
        }
    }
}

fn print_view(view: &LocalView) {
    let Some(snapshot) = view.snapshot() else {
        return;
    };
    println!(
        "room {} [{:?}] v{}: {} member(s)",
        snapshot.room.id,
        snapshot.room.phase,
        snapshot.room.version,
        snapshot.members.len()
    );
    for member in &snapshot.members {
        let role = member
            .role
            .as_deref()
            .map(|role| format!(" [{role}]"))
            .unwrap_or_default();
        println!(
            "  {} {}{}",
            member.id,
            member.display_name.as_deref().unwrap_or("(anonymous)"),
            role
        );
    }
}

async fn send_json(tx: &mut WsSink, message: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    tx.send(Message::Text(json.into())).await?;
    Ok(())
}
