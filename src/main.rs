use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use meshcall::{RoomCommand, RoomConfig, RoomSession, SessionState, SyntheticSource};

#[derive(Parser, Debug)]
#[command(name = "meshcall", about = "Join a mesh video call room from the terminal")]
struct Cli {
    /// Room code to join.
    #[arg(long)]
    room: String,

    /// Display name shown to other participants.
    #[arg(long, default_value = "guest")]
    name: String,

    /// Signaling server base URL (http(s) is rewritten to ws(s)).
    #[arg(long, env = "MESHCALL_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Skip the default STUN server; host candidates only.
    #[arg(long)]
    no_stun: bool,
}

/// Translate a stdin line into a room command. Plain text becomes chat.
fn parse_line(line: &str) -> Option<RoomCommand> {
    match line {
        "" => None,
        "/mute" => Some(RoomCommand::ToggleMute),
        "/camera" => Some(RoomCommand::ToggleCamera),
        "/share" => Some(RoomCommand::StartScreenShare),
        "/unshare" => Some(RoomCommand::StopScreenShare),
        "/unpin" => Some(RoomCommand::Pin(None)),
        "/quit" => Some(RoomCommand::Leave),
        _ => {
            if let Some(id) = line.strip_prefix("/pin ") {
                Some(RoomCommand::Pin(Some(id.trim().to_string())))
            } else if line.starts_with('/') {
                eprintln!("unknown command: {line}");
                None
            } else {
                Some(RoomCommand::SendChat(line.to_string()))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshcall=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = RoomConfig::default();
    if let Some(url) = cli.signaling_url {
        config = config.with_signaling_url(url);
    }
    if cli.no_stun {
        config = config.without_ice_servers();
    }

    let handle = RoomSession::join(config, &cli.room, &cli.name, Arc::new(SyntheticSource)).await?;
    let mut view_rx = handle.view();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut chat_seen = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = handle.leave();
            }
            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = view_rx.borrow_and_update().clone();
                for message in &view.chat[chat_seen..] {
                    println!("[chat] {}: {}", message.sender_name, message.text);
                }
                chat_seen = view.chat.len();
                match view.state {
                    SessionState::Active => {
                        let names: Vec<&str> =
                            view.participants.iter().map(|p| p.name.as_str()).collect();
                        let stage = view.stage.as_deref().unwrap_or("(waiting)");
                        println!(
                            "[room] {} participant(s) {names:?}, stage: {stage}",
                            names.len()
                        );
                    }
                    SessionState::Terminated => {
                        println!("[room] session ended");
                        break;
                    }
                    _ => {}
                }
            }
            line = stdin.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(command) = parse_line(line.trim()) {
                            if handle.send(command).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = handle.leave();
                    }
                }
            }
        }
    }
    handle.wait().await;
    Ok(())
}
