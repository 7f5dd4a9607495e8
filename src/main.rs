//! Kommandozeilen-Client
//!
//! Befehle über stdin:
//! `call <peer-id>`, `mute`, `video`, `share`, `camera`, `hangup`,
//! `leave`, `retry`, `quit`

use anyhow::Context;
use peer_call::config::CallConfig;
use peer_call::media::SystemDevices;
use peer_call::render::{Renderer, WatchOutput};
use peer_call::session::{Command, ControllerEvent};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

fn parse_command(line: &str) -> Option<Result<Command, String>> {
    let mut parts = line.split_whitespace();
    let word = parts.next()?;

    let command = match word {
        "call" => match parts.next() {
            Some(id) => Command::Call(id.to_string()),
            None => return Some(Err("usage: call <peer-id>".to_string())),
        },
        "mute" => Command::ToggleMute,
        "video" => Command::ToggleVideo,
        "share" => Command::ShareScreen,
        "camera" => Command::ShareCamera,
        "hangup" => Command::HangUp,
        "leave" => Command::Leave,
        "retry" => Command::RetryMedia,
        other => return Some(Err(format!("unknown command '{}'", other))),
    };
    Some(Ok(command))
}

#[cfg(feature = "video-capture")]
fn system_devices(config: &CallConfig) -> SystemDevices {
    SystemDevices::new().with_camera(peer_call::media::V4lCamera::new(&config.camera_device))
}

#[cfg(not(feature = "video-capture"))]
fn system_devices(_config: &CallConfig) -> SystemDevices {
    tracing::warn!("Built without video-capture, calls are audio only");
    SystemDevices::new()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peer_call::init_logging();

    let config = CallConfig::load().context("Failed to load configuration")?;
    let local = WatchOutput::new("local");
    let remote = WatchOutput::new("remote");
    let renderer = Renderer::new(Arc::new(local), Arc::new(remote));

    let mut controller = peer_call::connect(&config, Arc::new(system_devices(&config)), renderer)
        .context("Failed to set up signaling")?;

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ControllerEvent::StateChanged(state)) => {
                    println!(
                        "[{}] id={} remote={} {} / {} ({:?})",
                        state.call_state,
                        state.my_id.as_deref().unwrap_or("-"),
                        state.remote_id.as_deref().unwrap_or("-"),
                        state.mute_label(),
                        state.video_label(),
                        state.active_kind,
                    );
                }
                Ok(ControllerEvent::Notice(message)) => println!("! {}", message),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    controller
        .start()
        .await
        .context("Failed to register with signaling server")?;

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line == "quit" {
                break;
            }
            match parse_command(line) {
                Some(Ok(command)) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                Some(Err(message)) => eprintln!("{}", message),
                None => {}
            }
        }
    });

    controller.run(rx).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert!(parse_command("   ").is_none());
        assert!(matches!(
            parse_command("call abc-123"),
            Some(Ok(Command::Call(id))) if id == "abc-123"
        ));
        assert!(matches!(parse_command("mute"), Some(Ok(Command::ToggleMute))));
        assert!(matches!(parse_command("call"), Some(Err(_))));
        assert!(matches!(parse_command("dance"), Some(Err(_))));
    }
}
