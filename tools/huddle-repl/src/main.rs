use std::path::PathBuf;

use clap::Parser;
use futures::StreamExt;
use huddle::{
    config::Config,
    controller::{Args, CallController, CallEvent, CallEventStream},
    loopback::LoopbackBackend,
    relay,
    ui::{CallUi, CallView},
    PeerId, RoomId,
};
use huddle_wrtc::WrtcBackend;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod transport;

use transport::RoomFrame;

#[derive(Parser, Debug)]
/// joins a room on a relay and drives its voice call from stdin
struct Opt {
    /// websocket url of the relay. ex: ws://127.0.0.1:3001
    relay_url: String,
    room: String,
    username: String,
    /// TOML file with call settings
    #[clap(long)]
    config: Option<PathBuf>,
    /// the id announced to the relay. random if omitted
    #[clap(long)]
    peer_id: Option<String>,
    /// run the call without audio devices or network media
    #[clap(long)]
    loopback: bool,
}

/// commands read from stdin
#[derive(Parser, Debug, Eq, PartialEq)]
enum Repl {
    /// start a call, or join the one the room is ringing with
    Call,
    /// join the running call
    Join,
    /// leave the call, or cancel it while nobody has joined
    Leave,
    /// toggle the microphone
    Mute,
    /// show what the call dock would show
    Status,
}

async fn handle_command(ui: &CallUi, cmd: Repl) -> anyhow::Result<()> {
    match cmd {
        Repl::Call => ui.press_call_button().await?,
        Repl::Join => ui.controller().accept_call().await?,
        Repl::Leave => ui.controller().leave_call().await?,
        Repl::Mute => ui.toggle_mute().await?,
        Repl::Status => print_view(&ui.view().await?),
    }
    Ok(())
}

fn print_view(view: &CallView) {
    let enabled = if view.button.enabled { "" } else { " (disabled)" };
    println!("[{}]{enabled}", view.button.label);
    let Some(dock) = view.dock.as_ref() else {
        return;
    };
    println!("{}", dock.banner.headline);
    if let Some(detail) = dock.banner.detail.as_ref() {
        println!("  {detail}");
    }
    for avatar in &dock.avatars {
        let muted = if avatar.muted { " (muted)" } else { "" };
        println!("  ({}) {}{muted}", avatar.initials, avatar.display_name);
    }
    let controls: Vec<&str> = dock.controls.iter().map(|c| c.label()).collect();
    if !controls.is_empty() {
        println!("  controls: {}", controls.join(" | "));
    }
}

async fn handle_event_stream(mut stream: CallEventStream) {
    while let Some(evt) = stream.next().await {
        // one per second while in a call
        if matches!(evt, CallEvent::Elapsed(_)) {
            continue;
        }
        println!("CallEvent: {evt}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Opt::parse();

    let config = match opt.config.as_ref() {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };

    let own_id = PeerId::new(
        opt.peer_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
    );
    let room_id = RoomId::new(opt.room.clone());

    let (client, endpoint) = relay::pair();
    let join = RoomFrame::JoinRoom {
        room_id: room_id.clone(),
        peer_id: own_id.clone(),
        username: opt.username.clone(),
    };
    let pump = transport::connect(&opt.relay_url, join, endpoint).await?;

    let controller = if opt.loopback {
        CallController::new(Args {
            own_id: own_id.clone(),
            own_name: opt.username.clone(),
            room_id,
            backend: LoopbackBackend::new(),
            relay: client,
            config,
        })
    } else {
        let backend = WrtcBackend::new(&config)?;
        CallController::new(Args {
            own_id: own_id.clone(),
            own_name: opt.username.clone(),
            room_id,
            backend,
            relay: client,
            config,
        })
    };

    let events = tokio::spawn(handle_event_stream(controller.get_event_stream()));
    let ui = CallUi::new(controller);

    println!("starting REPL");
    println!("enter --help to see available commands");
    println!("your peer id is {own_id}");

    let mut iter = std::io::stdin().lines();
    while let Some(Ok(line)) = iter.next() {
        let mut v = vec![""];
        v.extend(line.split_ascii_whitespace());
        let cli = match Repl::try_parse_from(v) {
            Ok(r) => r,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if let Err(e) = handle_command(&ui, cli).await {
            println!("command failed: {e}");
        }
    }

    drop(ui);
    events.abort();
    pump.abort();

    Ok(())
}
