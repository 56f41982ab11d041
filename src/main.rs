use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use log::{error, info};
use tokio::sync::broadcast;

use revoice_rust::config::MediaOptions;
use revoice_rust::connection::ConnectionState;
use revoice_rust::media::MediaPlayer;
use revoice_rust::registry::Revoice;
use revoice_rust::types::events::VoiceEvent;

/// Joins a Revolt voice channel and optionally plays an audio file
/// into it until interrupted.
#[derive(Parser, Debug)]
#[command(name = "revoice")]
struct Args {
    /// Bot token for the Revolt API.
    #[arg(long)]
    token: String,

    /// Voice channel to join.
    #[arg(long)]
    channel: String,

    /// Audio file to play after joining.
    #[arg(long)]
    file: Option<String>,

    /// Playback start offset as HH:MM:SS.
    #[arg(long, default_value = "00:00:00")]
    start: String,

    /// Leave once the room has been empty for this many seconds.
    #[arg(long)]
    leave_if_empty: Option<u64>,

    /// Log ffmpeg output.
    #[arg(long)]
    ffmpeg_logs: bool,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        let revoice = Revoice::new(args.token.clone());
        let idle_leave = args.leave_if_empty.map(Duration::from_secs);

        let connection = match revoice.join(&args.channel, idle_leave).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to join channel {}: {e}", args.channel);
                return;
            }
        };
        info!("Joined channel {}", args.channel);

        // The transport is negotiated asynchronously after the join
        // resolves; wait for the connection to settle before playing.
        let mut events = connection.subscribe();
        loop {
            if connection.state().await == ConnectionState::Idle {
                break;
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    error!("Connection lost before it became ready");
                    return;
                }
            }
        }

        if let Some(file) = args.file.as_deref() {
            let options = MediaOptions {
                start: args.start.clone(),
                log_output: args.ffmpeg_logs,
                ..Default::default()
            };
            let player = match MediaPlayer::new(options).await {
                Ok(player) => Arc::new(player),
                Err(e) => {
                    error!("Failed to start the media player: {e}");
                    return;
                }
            };
            if let Err(e) = connection.play(player.clone()).await {
                error!("Failed to attach the player: {e}");
                return;
            }
            if let Err(e) = player.play_file(file).await {
                error!("Failed to play {file}: {e}");
                return;
            }
            info!("Playing {file}");
        }

        let mut watch = connection.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
            }
            _ = async {
                loop {
                    match watch.recv().await {
                        Ok(VoiceEvent::StateChanged(state)) => {
                            info!("Connection state: {state:?}");
                        }
                        Ok(VoiceEvent::UserJoined(user)) => {
                            info!("User {} joined the room", user.id);
                        }
                        Ok(VoiceEvent::UserLeft(user)) => {
                            info!("User {} left the room", user.id);
                        }
                        Ok(VoiceEvent::Autoleave) => {
                            info!("Room stayed empty, left on our own");
                            return;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            } => {}
        }

        revoice.leave(&args.channel).await;
        info!("Left channel {}", args.channel);
    });
}
