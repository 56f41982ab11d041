use std::io;
use std::process::Stdio;

use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::MediaOptions;

/// Bound on in-flight input chunks, so feeding a file exerts
/// backpressure instead of buffering it whole.
const INPUT_BACKLOG: usize = 64;

/// Notification that a transcoder process exited on its own.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TranscoderExit {
    pub generation: u64,
}

pub(crate) enum TranscoderInput {
    Chunk(Bytes),
    /// Closes the process input so it drains and exits naturally.
    End,
}

struct RunningTranscoder {
    input_tx: mpsc::Sender<TranscoderInput>,
    intent_tx: oneshot::Sender<()>,
    generation: u64,
}

/// Supervises the ffmpeg process that turns raw input into RTP datagrams
/// aimed at the engine's UDP port.
///
/// Exits come in two kinds: deliberate kills (restart, shutdown) which
/// are swallowed, and natural exits (input exhausted) which are reported
/// through the exit channel so the engine can run its finish sequence.
/// Input is written by a dedicated task; the engine loop never blocks on
/// the process pipe.
pub(crate) struct Transcoder {
    current: Option<RunningTranscoder>,
    args: Vec<String>,
    log_output: bool,
    generation: u64,
    exit_tx: mpsc::UnboundedSender<TranscoderExit>,
}

impl Transcoder {
    pub(crate) fn new(
        args: Vec<String>,
        log_output: bool,
    ) -> (Self, mpsc::UnboundedReceiver<TranscoderExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Self {
                current: None,
                args,
                log_output,
                generation: 0,
                exit_tx,
            },
            exit_rx,
        )
    }

    pub(crate) fn is_running(&self) -> bool {
        self.current.is_some()
    }

    /// Whether a process was ever spawned for this engine.
    pub(crate) fn has_spawned(&self) -> bool {
        self.generation > 0
    }

    pub(crate) fn spawn(&mut self) -> io::Result<()> {
        let mut command = Command::new("ffmpeg");
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        command.stderr(if self.log_output {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;

        let (input_tx, input_rx) = mpsc::channel(INPUT_BACKLOG);
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(drive_stdin(stdin, input_rx));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "Transcoder", "{line}");
                }
            });
        }

        self.generation += 1;
        let generation = self.generation;
        let (intent_tx, intent_rx) = oneshot::channel();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(watch_child(child, intent_rx, exit_tx, generation));

        self.current = Some(RunningTranscoder {
            input_tx,
            intent_tx,
            generation,
        });
        Ok(())
    }

    /// Spawns on first use. Returns `false` when the spawn failed.
    pub(crate) fn ensure_spawned(&mut self) -> bool {
        if self.is_running() {
            return true;
        }
        match self.spawn() {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "Transcoder", "Failed to spawn process: {e}");
                false
            }
        }
    }

    /// Kills the current process and brings up a fresh one.
    pub(crate) fn restart(&mut self) -> io::Result<()> {
        self.kill_current();
        self.spawn()
    }

    /// Tells the watcher to terminate the process. Exits caused this way
    /// are never reported as natural.
    pub(crate) fn kill_current(&mut self) {
        if let Some(running) = self.current.take() {
            let _ = running.intent_tx.send(());
        }
    }

    /// Acknowledges a natural exit. Returns `false` when the exit belongs
    /// to a process that has already been replaced.
    pub(crate) fn mark_exited(&mut self, generation: u64) -> bool {
        match &self.current {
            Some(running) if running.generation == generation => {
                self.current = None;
                true
            }
            _ => false,
        }
    }

    /// Handle for feeding input to the current process.
    pub(crate) fn input_sender(&self) -> Option<mpsc::Sender<TranscoderInput>> {
        self.current.as_ref().map(|running| running.input_tx.clone())
    }

    pub(crate) fn shutdown(&mut self) {
        self.kill_current();
    }
}

/// Owns the process stdin. Returning drops the handle, which closes the
/// pipe and lets the process drain and exit on its own.
async fn drive_stdin(mut stdin: ChildStdin, mut input_rx: mpsc::Receiver<TranscoderInput>) {
    while let Some(message) = input_rx.recv().await {
        match message {
            TranscoderInput::Chunk(chunk) => match stdin.write_all(&chunk).await {
                Ok(()) => {}
                // The process can die mid-track; a broken pipe here is routine.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return,
                Err(e) => {
                    warn!(target: "Transcoder", "Failed to write to process input: {e}");
                    return;
                }
            },
            TranscoderInput::End => return,
        }
    }
}

async fn watch_child(
    mut child: Child,
    intent_rx: oneshot::Receiver<()>,
    exit_tx: mpsc::UnboundedSender<TranscoderExit>,
    generation: u64,
) {
    tokio::select! {
        _ = intent_rx => {
            if let Err(e) = child.kill().await {
                debug!(target: "Transcoder", "Failed to kill process: {e}");
            }
        }
        status = child.wait() => {
            match status {
                Ok(status) => debug!(target: "Transcoder", "Process exited with {status}"),
                Err(e) => warn!(target: "Transcoder", "Failed to await process: {e}"),
            }
            let _ = exit_tx.send(TranscoderExit { generation });
        }
    }
}

/// Builds the ffmpeg argument list for one engine. Input comes from
/// stdin, output is opus-in-RTP aimed at the local engine port.
pub(crate) fn ffmpeg_args(options: &MediaOptions, port: u16) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-re".into(),
        "-i".into(),
        "-".into(),
        "-ss".into(),
        options.start.clone(),
    ];
    args.extend(options.custom_args.iter().cloned());
    args.extend([
        "-map".into(),
        "0:a".into(),
        "-b:a".into(),
        "48k".into(),
        "-maxrate".into(),
        "48k".into(),
        "-c:a".into(),
        "libopus".into(),
        "-f".into(),
        "rtp".into(),
        format!("rtp://127.0.0.1:{port}"),
    ]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_target_local_rtp_port() {
        let args = ffmpeg_args(&MediaOptions::default(), 5030);
        assert_eq!(args.first().map(String::as_str), Some("-re"));
        assert_eq!(args.last().map(String::as_str), Some("rtp://127.0.0.1:5030"));
        assert!(args.windows(2).any(|w| w[0] == "-ss" && w[1] == "00:00:00"));
        assert!(args.windows(2).any(|w| w[0] == "-c:a" && w[1] == "libopus"));
    }

    #[test]
    fn custom_args_splice_before_output_mapping() {
        let options = MediaOptions {
            custom_args: vec!["-af".into(), "volume=0.5".into()],
            start: "00:00:10".into(),
            ..Default::default()
        };
        let args = ffmpeg_args(&options, 4000);

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let af = args.iter().position(|a| a == "-af").unwrap();
        let map = args.iter().position(|a| a == "-map").unwrap();
        assert!(ss < af && af < map);
        assert_eq!(args[ss + 1], "00:00:10");
    }
}
