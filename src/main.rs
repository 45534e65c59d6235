//! walkie - Main entry point
//!
//! Terminal push-to-talk client: creates or joins a room over the LAN
//! rendezvous and drives the room controller from stdin commands.

mod args;

use args::Args;
use clap::Parser;
use log::{debug, error, info, warn};
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use walkie_core::audio::{AudioSink, LogSink};
use walkie_core::config::{AudioRoute, Config};
use walkie_core::room::{RoomController, RoomEvent};
use walkie_core::transport::LanRendezvous;
use walkie_core::webrtc::{MediaFactory, RelayMediaFactory};
use walkie_core::WalkieError;

#[cfg(feature = "audio")]
type CaptureHandle = walkie_core::audio::device::StreamHandle;
#[cfg(not(feature = "audio"))]
type CaptureHandle = ();

const HELP: &str = "commands: talk | stop | name <display name> | restart <peer prefix> | peers | create | join <topic> | leave | quit";

#[tokio::main]
async fn main() -> Result<(), WalkieError> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        loaded.as_ref().map(|c| c.logging.level.clone()).unwrap_or_else(|_| "info".to_string())
    };
    env_logger::Builder::new()
        .parse_filters(&env_var("WALKIE_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_sctp", log::LevelFilter::Error)
        .init();

    info!("walkie v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    let rendezvous = Arc::new(LanRendezvous::new(config.rendezvous.clone()));
    let media = media_factory(&mut config, &args);

    let (capture_tx, mut capture_rx) = mpsc::unbounded_channel::<Vec<f32>>();
    let (sink, capture) = open_devices(&config, capture_tx);
    let can_talk = capture.is_some();

    let mut controller = RoomController::new(config.clone(), rendezvous, media, sink);
    info!("Local peer {} ({})", controller.local_id().short(), controller.display_name());

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => render(&event),
                Err(RecvError::Lagged(n)) => debug!("Event renderer lagged by {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    match args.join.as_deref() {
        Some(topic) => controller.join_room(topic).await?,
        None => {
            let topic = controller.create_room().await?;
            println!("Share this topic to let others join:\n  {}", topic);
        }
    }
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut tick = tokio::time::interval(Duration::from_millis(config.room.tick_interval_ms));
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_command(&mut controller, line.trim(), can_talk).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed; waiting for ctrl-c");
                    stdin_open = false;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            Some(chunk) = capture_rx.recv() => {
                controller.on_captured_audio(&chunk).await;
            }
            input = controller.recv() => controller.dispatch(input).await,
            _ = tick.tick() => controller.tick(Instant::now()),
        }
    }

    // Cleanup
    controller.leave_room().await;
    drop(capture);
    info!("walkie stopped");
    Ok(())
}

/// Run one stdin command. Returns false to quit.
async fn handle_command(controller: &mut RoomController, line: &str, can_talk: bool) -> bool {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    match command {
        "" => {}
        "talk" | "t" => {
            if can_talk {
                controller.start_transmitting();
            } else {
                println!("microphone unavailable; receive only");
            }
        }
        "stop" | "s" => controller.stop_transmitting(),
        "name" => controller.set_display_name(rest),
        "restart" => match controller.find_participant(rest) {
            Some(peer) => {
                if let Err(e) = controller.restart_negotiation(&peer).await {
                    println!("restart failed: {}", e);
                }
            }
            None => println!("no unique participant matches {:?}", rest),
        },
        "peers" => {
            let participants = controller.participants();
            if participants.is_empty() {
                println!("no participants");
            }
            for p in participants {
                println!(
                    "  {} {:<16} {:<12} {:?}{}",
                    p.id.short(),
                    p.display_name,
                    p.state.as_str(),
                    p.role,
                    if p.speaking { " (speaking)" } else { "" }
                );
            }
        }
        "create" => match controller.create_room().await {
            Ok(topic) => println!("Share this topic to let others join:\n  {}", topic),
            Err(e) => println!("could not create room: {}", e),
        },
        "join" => {
            if let Err(e) = controller.join_room(rest).await {
                println!("could not join: {}", e);
            }
        }
        "leave" => controller.leave_room().await,
        "quit" | "q" | "exit" => return false,
        _ => println!("{}", HELP),
    }
    true
}

/// Presentation of room events on the terminal
fn render(event: &RoomEvent) {
    match event {
        RoomEvent::RoomCreated { topic } => println!("* room created {}", topic),
        RoomEvent::RoomJoined { topic } => println!("* joined room {}", topic),
        RoomEvent::RoomLeft { .. } => println!("* left room"),
        RoomEvent::ParticipantJoined { peer, name } => println!("* {} ({}) connected", name, peer.short()),
        RoomEvent::ParticipantLeft { peer } => println!("* {} left", peer.short()),
        RoomEvent::ParticipantRenamed { peer, name } => println!("* {} is now {}", peer.short(), name),
        RoomEvent::SessionStateChanged { peer, state } => println!("* {} {}", peer.short(), state.as_str()),
        RoomEvent::NegotiationFailed { peer, reason } => println!("! negotiation with {} failed: {}", peer.short(), reason),
        RoomEvent::MediaPathDegraded { peer } => println!("! media path to {} degraded", peer.short()),
        RoomEvent::TransmissionStateChanged { peer, speaking } => {
            if *speaking {
                println!("> {} is talking", peer.short());
            } else {
                println!("> {} stopped", peer.short());
            }
        }
        RoomEvent::LocalTransmissionChanged { transmitting } => {
            println!("{}", if *transmitting { "[TALKING]" } else { "[idle]" });
        }
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(name) = args.name.clone().or_else(|| env_var("WALKIE_NAME")) {
        config.room.display_name = name;
    }
    if let Some(list) = env_var("WALKIE_STATIC_PEERS") {
        config.rendezvous.static_peers = parse_csv_list(&list);
    }
    if args.relay {
        config.webrtc.enabled = false;
        config.room.audio_route = AudioRoute::Signaling;
    }
}

fn media_factory(config: &mut Config, args: &Args) -> Arc<dyn MediaFactory> {
    if !args.relay {
        if let Some(factory) = webrtc_factory(config) {
            info!("Negotiating direct WebRTC media paths");
            return factory;
        }
    }

    if config.room.audio_route == AudioRoute::Media {
        warn!("Media route needs WebRTC; audio will ride the signaling connection");
        config.room.audio_route = AudioRoute::Signaling;
    }
    info!("Negotiating relay sessions; audio rides the signaling connection");
    Arc::new(RelayMediaFactory::new())
}

#[cfg(feature = "webrtc-media")]
fn webrtc_factory(config: &Config) -> Option<Arc<dyn MediaFactory>> {
    if !config.webrtc.enabled {
        return None;
    }
    Some(Arc::new(walkie_core::webrtc::WebRtcMediaFactory::new(config.webrtc.clone())))
}

#[cfg(not(feature = "webrtc-media"))]
fn webrtc_factory(_config: &Config) -> Option<Arc<dyn MediaFactory>> {
    None
}

#[cfg(feature = "audio")]
fn open_devices(
    config: &Config,
    capture_tx: mpsc::UnboundedSender<Vec<f32>>,
) -> (Box<dyn AudioSink>, Option<CaptureHandle>) {
    use walkie_core::audio::device::{start_capture, DevicePlayback};

    let sink: Box<dyn AudioSink> = if config.audio.enable_playback {
        match DevicePlayback::open(config.audio.sample_rate) {
            Ok(playback) => Box::new(playback),
            Err(e) => {
                warn!("Playback unavailable: {}; logging received frames instead", e);
                Box::new(LogSink)
            }
        }
    } else {
        Box::new(LogSink)
    };

    let capture = if config.audio.enable_capture {
        match start_capture(config.audio.sample_rate, capture_tx) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Microphone unavailable: {}; receive only", e);
                None
            }
        }
    } else {
        None
    };

    (sink, capture)
}

#[cfg(not(feature = "audio"))]
fn open_devices(
    _config: &Config,
    _capture_tx: mpsc::UnboundedSender<Vec<f32>>,
) -> (Box<dyn AudioSink>, Option<CaptureHandle>) {
    warn!("{}; receive only", walkie_core::audio::DeviceError::Unsupported);
    (Box::new(LogSink), None)
}

fn env_var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn parse_csv_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Vec::new();
    }

    trimmed
        .split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}
