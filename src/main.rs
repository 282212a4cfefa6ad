use anyhow::Context;
use rand::random;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use call_mesh::{
    CallOrchestrator, Config, RtcConnector, StreamHandle, SyntheticMedia, WsSignalingChannel,
};

const HELP: &str = "\
commands:
  /mute            mute the microphone
  /unmute          unmute the microphone
  /video on|off    turn the camera on or off
  /share           start or stop sharing the screen
  /who             list participants
  /quit            leave the call
anything else is sent as chat";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let meeting_id = std::env::var("CALL_MEETING_ID").unwrap_or_else(|_| "test-room".to_string());
    let user_id =
        std::env::var("CALL_USER_ID").unwrap_or_else(|_| format!("user-{}", random::<u32>()));
    info!(?config, %meeting_id, %user_id, "starting call client");

    let signaling = WsSignalingChannel::connect(&config.signaling_url)
        .await
        .with_context(|| format!("connecting to {}", config.signaling_url))?;
    let connector = RtcConnector::new(&config).context("building WebRTC API")?;

    let call = CallOrchestrator::new(
        config,
        Arc::new(SyntheticMedia::new()),
        Arc::new(connector),
        Arc::new(signaling),
    );
    register_hooks(&call);

    call.initialize(&meeting_id, &user_id)
        .await
        .with_context(|| format!("joining meeting {meeting_id}"))?;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(&call, line.trim()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    call.end_call().await;
    Ok(())
}

/// Returns `false` once the user asked to leave.
async fn run_command(call: &CallOrchestrator, line: &str) -> bool {
    // control failures are already reported through the error hook
    match line {
        "" => {}
        "/quit" => return false,
        "/mute" => {
            let _ = call.toggle_mute(false).await;
        }
        "/unmute" => {
            let _ = call.toggle_mute(true).await;
        }
        "/video on" => {
            let _ = call.toggle_video(true).await;
        }
        "/video off" => {
            let _ = call.toggle_video(false).await;
        }
        "/share" => {
            if let Ok(sharing) = call.toggle_screen_share().await {
                info!(sharing, "screen share toggled");
            }
        }
        "/who" => {
            for p in call.participants() {
                println!(
                    "{}{} muted={} video={} sharing={}",
                    p.user_id,
                    if p.is_local { " (you)" } else { "" },
                    p.is_muted,
                    p.is_video_on,
                    p.is_screen_sharing
                );
            }
        }
        command if command.starts_with('/') => println!("{HELP}"),
        text => {
            let _ = call.send_message(text).await;
        }
    }
    true
}

fn register_hooks(call: &CallOrchestrator) {
    call.on_participant_joined(|p| info!(user_id = %p.user_id, local = p.is_local, "joined"));
    call.on_participant_left(|user_id| info!(user_id, "left"));
    call.on_participant_updated(|p| {
        info!(
            user_id = %p.user_id,
            muted = p.is_muted,
            video = p.is_video_on,
            sharing = p.is_screen_sharing,
            "media state"
        )
    });
    call.on_stream_received(|user_id, stream| {
        if let StreamHandle::Remote(stream) = stream {
            info!(user_id, tracks = stream.tracks.len(), "receiving media");
        }
    });
    call.on_connection_quality_changed(|user_id, quality| {
        if quality == call_mesh::ConnectionQuality::Poor {
            warn!(user_id, %quality, "connection quality");
        } else {
            info!(user_id, %quality, "connection quality");
        }
    });
    call.on_message_received(|m| println!("[{}] {}: {}", m.timestamp.format("%H:%M:%S"), m.user_id, m.text));
    call.on_error(|e| error!("{e}"));
}
