use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sfu_client::engine::rtc::RtcEngine;
use sfu_client::media::SampleSource;
use sfu_client::signaling::WsSignalingClient;
use sfu_client::{ChannelSink, ClientConfig, RenderEvent, RoomSession};

#[derive(Parser, Debug)]
#[command(author, version, about = "SFU room client", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Signaling server URL (e.g. ws://127.0.0.1:7003)
    #[arg(short, long)]
    server: Option<String>,

    /// Room to join on startup
    #[arg(short, long)]
    room: Option<String>,

    /// Local peer id
    #[arg(short, long)]
    peer_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

const HELP: &str = "commands: join <room> | camera | nocamera | screen | noscreen | status | leave | quit";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(server) = args.server {
        config.signaling.url = server;
    }
    if let Some(room) = args.room {
        config.session.room_id = Some(room);
    }
    if let Some(peer_id) = args.peer_id {
        config.session.peer_id = peer_id;
    }

    let channel = WsSignalingClient::connect(&config.signaling.url, config.signaling.request_timeout())
        .await
        .with_context(|| format!("failed to connect to {}", config.signaling.url))?;

    let (sink, mut render_events) = ChannelSink::new();
    tokio::spawn(async move {
        while let Some(event) = render_events.recv().await {
            match event {
                RenderEvent::ConsumerAdded { key, kind, track } => {
                    info!(%key, %kind, track_id = %track.id, "render: consumer added")
                }
                RenderEvent::ConsumerRemoved { key } => info!(%key, "render: consumer removed"),
                RenderEvent::RosterChanged(peers) => info!(?peers, "render: roster changed"),
            }
        }
    });

    let peer_id = config.session.peer_id.clone();
    let session = RoomSession::new(
        peer_id.clone(),
        Arc::new(channel),
        Arc::new(RtcEngine::new(config.ice_servers.clone())),
        Arc::new(SampleSource::new(format!("{}-stream", peer_id))),
        Arc::new(sink),
        config.capture,
    );

    info!(%peer_id, url = %config.signaling.url, "client ready");
    if let Some(room_id) = &config.session.room_id {
        if let Err(e) = session.join(room_id).await {
            error!(%room_id, "join failed: {}", e);
        }
    }
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (None, _) => {}
            (Some("join"), Some(room_id)) => {
                if let Err(e) = session.join(room_id).await {
                    error!(%room_id, "join failed: {}", e);
                }
            }
            (Some("camera"), _) => {
                if let Err(e) = session.start_camera().await {
                    warn!("camera failed: {}", e);
                }
            }
            (Some("nocamera"), _) => {
                session.stop_camera().await;
            }
            (Some("screen"), _) => {
                if let Err(e) = session.start_screen_share().await {
                    warn!("screen share failed: {}", e);
                }
            }
            (Some("noscreen"), _) => {
                session.stop_screen_share().await;
            }
            (Some("status"), _) => print_status(&session).await,
            (Some("leave"), _) => session.leave().await,
            (Some("quit"), _) | (Some("exit"), _) => break,
            _ => println!("{}", HELP),
        }
    }

    session.leave().await;
    info!("bye");
    Ok(())
}

async fn print_status(session: &RoomSession) {
    println!("peer:      {}", session.peer_id());
    println!("state:     {}", session.state());
    if let Some(room_id) = session.room_id().await {
        println!("room:      {}", room_id);
    }
    println!("roster:    {:?}", session.roster().await);
    for transport in session.transports().await {
        println!(
            "transport: {} {} {}",
            transport.direction, transport.id, transport.state
        );
    }
    for producer in session.producers().await {
        println!(
            "producer:  {} {} {} track={}",
            producer.role,
            producer.kind,
            producer.id,
            producer.track.id()
        );
    }
    for consumer in session.consumers().await {
        println!(
            "consumer:  {} {} {}{}",
            consumer.key,
            consumer.kind,
            consumer.id,
            if consumer.paused { " (paused)" } else { "" }
        );
    }
}
