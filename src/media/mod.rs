pub mod timestamp;
mod transcoder;

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};

use crate::config::MediaOptions;
use crate::track::{self, RtpStream, RtpTrack};
use crate::types::events::{CHANNEL_CAPACITY, PlayerEvent};

use self::timestamp::{TimestampError, timestamp_to_seconds};
use self::transcoder::{Transcoder, TranscoderExit, TranscoderInput, ffmpeg_args};

/// Sentinel datagram marking the logical end of a transcoded stream.
pub(crate) const END_OF_STREAM_MARKER: &[u8] = b"FINISHPACKET";

/// Pause between a natural transcoder exit and the synthesized
/// end-of-stream datagram, giving in-flight packets time to land.
const FINISH_SETTLE_DELAY: Duration = Duration::from_millis(1000);

const COMMAND_BACKLOG: usize = 64;
const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("no media source was provided")]
    MissingSource,
    #[error("invalid start offset: {0}")]
    StartOffset(#[from] TimestampError),
    #[error("playback engine is gone")]
    EngineClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A datagram as classified at intake.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamFrame {
    Audio(Bytes),
    EndOfStream,
}

impl StreamFrame {
    fn classify(datagram: &[u8]) -> Self {
        if datagram == END_OF_STREAM_MARKER {
            StreamFrame::EndOfStream
        } else {
            StreamFrame::Audio(Bytes::copy_from_slice(datagram))
        }
    }
}

/// One packet recorded while paused, with the gap to its predecessor.
#[derive(Debug)]
struct BufferedPacket {
    frame: StreamFrame,
    delay: Duration,
}

enum PlayerCommand {
    Play(Box<dyn AsyncRead + Send + Unpin>),
    WriteChunk(Bytes),
    Pause,
    Resume,
    Stop(oneshot::Sender<()>),
    Reset,
    Disconnect(oneshot::Sender<()>),
}

/// Anything a [`VoiceConnection`](crate::connection::VoiceConnection) can
/// stream from. Playback-capable sources drive the connection state
/// machine through their events; raw sources leave the state at
/// `Unknown`.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Takes the read half of the current track. `None` while a
    /// transport is already consuming it.
    async fn take_stream(&self) -> Option<RtpStream>;
    fn is_player(&self) -> bool;
    fn subscribe_events(&self) -> broadcast::Receiver<PlayerEvent>;
    /// Called when the owning connection goes away.
    async fn detach(&self);
}

/// Packet-path state of one playback engine. Lives on its own task;
/// datagrams, commands and transcoder exits are all funneled through one
/// loop, so packet handling is strictly ordered and never concurrent.
struct Engine {
    socket: Arc<UdpSocket>,
    port: u16,
    track: RtpTrack,
    pending_stream: Arc<Mutex<Option<RtpStream>>>,
    transcoder: Transcoder,
    input_handle: Arc<Mutex<Option<mpsc::Sender<TranscoderInput>>>>,
    exit_rx: mpsc::UnboundedReceiver<TranscoderExit>,
    events_tx: broadcast::Sender<PlayerEvent>,
    started: bool,
    paused: bool,
    backlog: VecDeque<BufferedPacket>,
    last_packet_at: Option<Instant>,
    drain_deadline: Option<Instant>,
    feed_task: Option<JoinHandle<()>>,
}

impl Engine {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PlayerCommand>) {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; 2048];
        loop {
            let drain_deadline = self.drain_deadline;
            tokio::select! {
                biased;

                command = cmd_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await {
                                return;
                            }
                        }
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }

                _ = sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                    if drain_deadline.is_some() =>
                {
                    self.drain_step().await;
                }

                exit = self.exit_rx.recv() => {
                    if let Some(exit) = exit {
                        self.handle_transcoder_exit(exit);
                    }
                }

                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, _)) => self.handle_datagram(&buf[..len]).await,
                        Err(e) => warn!(target: "Media", "UDP receive error: {e}"),
                    }
                }
            }
        }
    }

    /// Returns `false` once the engine should wind down.
    async fn handle_command(&mut self, command: PlayerCommand) -> bool {
        match command {
            PlayerCommand::Play(source) => self.begin_cycle(source).await,
            PlayerCommand::WriteChunk(chunk) => self.forward_chunk(chunk).await,
            PlayerCommand::Pause => self.pause(),
            PlayerCommand::Resume => self.resume(),
            PlayerCommand::Stop(ack) => {
                self.finish_cycle().await;
                let _ = ack.send(());
            }
            PlayerCommand::Reset => {
                self.reset_cycle().await;
                self.restart_transcoder().await;
            }
            PlayerCommand::Disconnect(ack) => {
                self.shutdown().await;
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    /// Chunk intake on the command path. Uses a non-blocking send so
    /// pipe backpressure never stalls the packet loop.
    async fn forward_chunk(&mut self, chunk: Bytes) {
        if !self.transcoder.ensure_spawned() {
            return;
        }
        if let Some(input_tx) = self.transcoder.input_sender() {
            if input_tx.try_send(TranscoderInput::Chunk(chunk)).is_err() {
                warn!(target: "Media", "Transcoder input is backed up, dropping a chunk");
            }
        }
        self.publish_input_handle().await;
    }

    /// Intake for one datagram. The dispatch order is load-bearing: the
    /// started check runs first so even a sentinel opens the cycle, and
    /// paused recording takes precedence over sentinel detection so a
    /// finish buffered mid-pause replays in order.
    async fn handle_datagram(&mut self, datagram: &[u8]) {
        if !self.started {
            self.started = true;
            let _ = self.events_tx.send(PlayerEvent::Started);
        }
        if self.paused {
            self.save_packet(StreamFrame::classify(datagram));
            return;
        }
        match StreamFrame::classify(datagram) {
            StreamFrame::EndOfStream => self.finish_cycle().await,
            StreamFrame::Audio(payload) => self.track.write_rtp(payload),
        }
    }

    fn save_packet(&mut self, frame: StreamFrame) {
        let now = Instant::now();
        let delay = match self.last_packet_at {
            Some(last) => now.saturating_duration_since(last),
            None => Duration::ZERO,
        };
        self.last_packet_at = Some(now);
        self.backlog.push_back(BufferedPacket { frame, delay });
    }

    fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        // First recorded packet measures its gap from this instant.
        self.last_packet_at = Some(Instant::now());
        let _ = self.events_tx.send(PlayerEvent::Paused);
    }

    fn resume(&mut self) {
        if !self.paused || self.drain_deadline.is_some() {
            return;
        }
        let _ = self.events_tx.send(PlayerEvent::Started);
        self.start_drain();
    }

    fn start_drain(&mut self) {
        match self.backlog.front() {
            Some(packet) => {
                self.drain_deadline = Some(Instant::now() + packet.delay);
            }
            None => self.finish_drain(),
        }
    }

    /// Forwards the front of the backlog, then schedules the next packet
    /// by its recorded gap so the drain replays the original cadence.
    async fn drain_step(&mut self) {
        let Some(packet) = self.backlog.pop_front() else {
            self.finish_drain();
            return;
        };
        match packet.frame {
            StreamFrame::EndOfStream => self.finish_cycle().await,
            StreamFrame::Audio(payload) => {
                self.track.write_rtp(payload);
                self.start_drain();
            }
        }
    }

    fn finish_drain(&mut self) {
        self.drain_deadline = None;
        self.paused = false;
        self.last_packet_at = None;
    }

    /// Starts a new playback cycle from the given source.
    async fn begin_cycle(&mut self, source: Box<dyn AsyncRead + Send + Unpin>) {
        self.abort_feed();
        self.started = false;
        let _ = self.events_tx.send(PlayerEvent::Buffering);

        if !self.transcoder.ensure_spawned() {
            return;
        }
        self.publish_input_handle().await;
        let Some(input_tx) = self.transcoder.input_sender() else {
            return;
        };
        self.feed_task = Some(tokio::spawn(feed_source(source, input_tx)));
    }

    /// The finish sequence: fresh track, cleared backlog and flags,
    /// transcoder replaced, finish emitted. Runs for the sentinel path
    /// and for an explicit stop alike.
    async fn finish_cycle(&mut self) {
        self.reset_cycle().await;
        self.restart_transcoder().await;
        let _ = self.events_tx.send(PlayerEvent::Finished);
    }

    async fn reset_cycle(&mut self) {
        self.abort_feed();
        self.replace_track().await;
        self.started = false;
        self.paused = false;
        self.backlog.clear();
        self.drain_deadline = None;
        self.last_packet_at = None;
    }

    async fn restart_transcoder(&mut self) {
        if !self.transcoder.has_spawned() {
            return;
        }
        if let Err(e) = self.transcoder.restart() {
            warn!(target: "Media", "Failed to restart transcoder: {e}");
        }
        self.publish_input_handle().await;
    }

    /// Publishes the current transcoder input for the direct write path.
    async fn publish_input_handle(&self) {
        *self.input_handle.lock().await = self.transcoder.input_sender();
    }

    /// Swaps in a fresh track pair. The old stream's transport sees its
    /// feed end; the new stream waits in the pending slot for the next
    /// attach.
    async fn replace_track(&mut self) {
        let (track, stream) = track::channel();
        self.track = track;
        *self.pending_stream.lock().await = Some(stream);
    }

    /// A natural exit means the input was exhausted. After a settle
    /// delay, a sentinel is sent to our own socket so finish detection
    /// flows through the normal intake path.
    fn handle_transcoder_exit(&mut self, exit: TranscoderExit) {
        if !self.transcoder.mark_exited(exit.generation) {
            return;
        }
        debug!(target: "Media", "Transcoder drained its input, scheduling end-of-stream marker");
        let socket = self.socket.clone();
        let port = self.port;
        tokio::spawn(async move {
            sleep(FINISH_SETTLE_DELAY).await;
            if let Err(e) = socket.send_to(END_OF_STREAM_MARKER, ("127.0.0.1", port)).await {
                warn!(target: "Media", "Failed to send end-of-stream marker: {e}");
            }
        });
    }

    fn abort_feed(&mut self) {
        if let Some(task) = self.feed_task.take() {
            task.abort();
        }
    }

    async fn shutdown(&mut self) {
        self.abort_feed();
        self.backlog.clear();
        self.drain_deadline = None;
        self.input_handle.lock().await.take();
        self.transcoder.shutdown();
    }
}

/// Pumps a source into the transcoder. Runs off the engine loop so pipe
/// backpressure never stalls packet handling.
async fn feed_source(
    mut source: Box<dyn AsyncRead + Send + Unpin>,
    input_tx: mpsc::Sender<TranscoderInput>,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if input_tx.send(TranscoderInput::Chunk(chunk)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(target: "Media", "Failed to read media source: {e}");
                break;
            }
        }
    }
    let _ = input_tx.send(TranscoderInput::End).await;
}

/// Buffering playback engine with pause/resume and end-of-stream
/// detection.
///
/// Owns a UDP endpoint fed by its ffmpeg transcoder. Handles are cheap
/// to clone behind an [`Arc`]; dropping the last one winds the engine
/// down.
pub struct MediaPlayer {
    commands: mpsc::Sender<PlayerCommand>,
    events_tx: broadcast::Sender<PlayerEvent>,
    pending_stream: Arc<Mutex<Option<RtpStream>>>,
    input_handle: Arc<Mutex<Option<mpsc::Sender<TranscoderInput>>>>,
    port: u16,
}

impl MediaPlayer {
    pub async fn new(options: MediaOptions) -> Result<Self, MediaError> {
        timestamp_to_seconds(&options.start, false)?;

        let socket = UdpSocket::bind(("127.0.0.1", options.port)).await?;
        let port = socket.local_addr()?.port();

        let (transcoder, exit_rx) =
            Transcoder::new(ffmpeg_args(&options, port), options.log_output);
        let (track, stream) = track::channel();
        let pending_stream = Arc::new(Mutex::new(Some(stream)));
        let input_handle = Arc::new(Mutex::new(None));
        let (events_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BACKLOG);

        let engine = Engine {
            socket: Arc::new(socket),
            port,
            track,
            pending_stream: pending_stream.clone(),
            transcoder,
            input_handle: input_handle.clone(),
            exit_rx,
            events_tx: events_tx.clone(),
            started: false,
            paused: false,
            backlog: VecDeque::new(),
            last_packet_at: None,
            drain_deadline: None,
            feed_task: None,
        };
        tokio::spawn(engine.run(cmd_rx));

        Ok(Self {
            commands: cmd_tx,
            events_tx,
            pending_stream,
            input_handle,
            port,
        })
    }

    /// Port the engine listens on. Useful when the options asked for an
    /// ephemeral one.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events_tx.subscribe()
    }

    pub async fn play_file(&self, path: impl AsRef<Path>) -> Result<(), MediaError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(MediaError::MissingSource);
        }
        let file = tokio::fs::File::open(path).await?;
        self.play_stream(file).await
    }

    pub async fn play_stream(
        &self,
        stream: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<(), MediaError> {
        self.send_command(PlayerCommand::Play(Box::new(stream)))
            .await
    }

    /// Feeds one raw chunk straight to the transcoder, for callers that
    /// produce audio incrementally instead of from a stream. Waits for
    /// pipe room on the caller's task, so a backed-up transcoder never
    /// stalls the engine loop.
    pub async fn write_chunk(&self, chunk: Bytes) -> Result<(), MediaError> {
        let handle = self.input_handle.lock().await.clone();
        let Some(input_tx) = handle else {
            // No transcoder yet; the engine spawns one and publishes
            // its input handle.
            return self.send_command(PlayerCommand::WriteChunk(chunk)).await;
        };
        match input_tx.send(TranscoderInput::Chunk(chunk)).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(TranscoderInput::Chunk(chunk))) => {
                // The handle went stale when the transcoder was
                // replaced; recover the chunk and go through the engine.
                self.input_handle.lock().await.take();
                self.send_command(PlayerCommand::WriteChunk(chunk)).await
            }
            Err(_) => Ok(()),
        }
    }

    pub async fn pause(&self) -> Result<(), MediaError> {
        self.send_command(PlayerCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<(), MediaError> {
        self.send_command(PlayerCommand::Resume).await
    }

    /// Cuts the current track short. The transcoder is replaced and a
    /// finish notification fires once the engine acknowledges.
    pub async fn stop(&self) -> Result<(), MediaError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_command(PlayerCommand::Stop(ack_tx)).await?;
        ack_rx.await.map_err(|_| MediaError::EngineClosed)
    }

    /// Tears the engine down for good.
    pub async fn destroy(&self) -> Result<(), MediaError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_command(PlayerCommand::Disconnect(ack_tx)).await?;
        ack_rx.await.map_err(|_| MediaError::EngineClosed)
    }

    async fn send_command(&self, command: PlayerCommand) -> Result<(), MediaError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MediaError::EngineClosed)
    }
}

#[async_trait]
impl MediaSource for MediaPlayer {
    async fn take_stream(&self) -> Option<RtpStream> {
        self.pending_stream.lock().await.take()
    }

    fn is_player(&self) -> bool {
        true
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events_tx.subscribe()
    }

    async fn detach(&self) {
        let _ = self.send_command(PlayerCommand::Reset).await;
    }
}

/// Handler invoked for every datagram a raw [`Media`] relay receives.
pub type PacketHandler = Box<dyn FnMut(&[u8], &RtpTrack) + Send>;

enum RawCommand {
    Play(Box<dyn AsyncRead + Send + Unpin>),
    WriteChunk(Bytes),
    Destroy(oneshot::Sender<()>),
}

/// Plain relay without buffering, pause or finish handling: every
/// datagram goes through the packet handler as it arrives. For callers
/// that manage the stream themselves.
pub struct Media {
    commands: mpsc::Sender<RawCommand>,
    events_tx: broadcast::Sender<PlayerEvent>,
    pending_stream: Arc<Mutex<Option<RtpStream>>>,
    input_handle: Arc<Mutex<Option<mpsc::Sender<TranscoderInput>>>>,
    port: u16,
}

impl Media {
    pub async fn new(options: MediaOptions) -> Result<Self, MediaError> {
        Self::with_packet_handler(
            options,
            Box::new(|datagram, track| track.write_rtp(Bytes::copy_from_slice(datagram))),
        )
        .await
    }

    pub async fn with_packet_handler(
        options: MediaOptions,
        handler: PacketHandler,
    ) -> Result<Self, MediaError> {
        timestamp_to_seconds(&options.start, false)?;

        let socket = UdpSocket::bind(("127.0.0.1", options.port)).await?;
        let port = socket.local_addr()?.port();

        let (transcoder, exit_rx) =
            Transcoder::new(ffmpeg_args(&options, port), options.log_output);
        let (track, stream) = track::channel();
        let pending_stream = Arc::new(Mutex::new(Some(stream)));
        let input_handle = Arc::new(Mutex::new(None));
        let (events_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BACKLOG);

        tokio::spawn(relay_loop(
            socket,
            track,
            transcoder,
            input_handle.clone(),
            exit_rx,
            handler,
            cmd_rx,
        ));

        Ok(Self {
            commands: cmd_tx,
            events_tx,
            pending_stream,
            input_handle,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn play_stream(
        &self,
        stream: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<(), MediaError> {
        self.send_command(RawCommand::Play(Box::new(stream))).await
    }

    /// Same contract as [`MediaPlayer::write_chunk`]: backpressure lands
    /// on the caller, not on the relay loop.
    pub async fn write_chunk(&self, chunk: Bytes) -> Result<(), MediaError> {
        let handle = self.input_handle.lock().await.clone();
        let Some(input_tx) = handle else {
            return self.send_command(RawCommand::WriteChunk(chunk)).await;
        };
        match input_tx.send(TranscoderInput::Chunk(chunk)).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(TranscoderInput::Chunk(chunk))) => {
                self.input_handle.lock().await.take();
                self.send_command(RawCommand::WriteChunk(chunk)).await
            }
            Err(_) => Ok(()),
        }
    }

    pub async fn destroy(&self) -> Result<(), MediaError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_command(RawCommand::Destroy(ack_tx)).await?;
        ack_rx.await.map_err(|_| MediaError::EngineClosed)
    }

    async fn send_command(&self, command: RawCommand) -> Result<(), MediaError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MediaError::EngineClosed)
    }
}

#[async_trait]
impl MediaSource for Media {
    async fn take_stream(&self) -> Option<RtpStream> {
        self.pending_stream.lock().await.take()
    }

    fn is_player(&self) -> bool {
        false
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events_tx.subscribe()
    }

    async fn detach(&self) {}
}

async fn relay_loop(
    socket: UdpSocket,
    track: RtpTrack,
    mut transcoder: Transcoder,
    input_handle: Arc<Mutex<Option<mpsc::Sender<TranscoderInput>>>>,
    mut exit_rx: mpsc::UnboundedReceiver<TranscoderExit>,
    mut handler: PacketHandler,
    mut cmd_rx: mpsc::Receiver<RawCommand>,
) {
    let mut feed_task: Option<JoinHandle<()>> = None;
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            biased;

            command = cmd_rx.recv() => {
                match command {
                    Some(RawCommand::Play(source)) => {
                        if let Some(task) = feed_task.take() {
                            task.abort();
                        }
                        if transcoder.ensure_spawned() {
                            *input_handle.lock().await = transcoder.input_sender();
                            if let Some(input_tx) = transcoder.input_sender() {
                                feed_task = Some(tokio::spawn(feed_source(source, input_tx)));
                            }
                        }
                    }
                    Some(RawCommand::WriteChunk(chunk)) => {
                        if transcoder.ensure_spawned() {
                            if let Some(input_tx) = transcoder.input_sender() {
                                // A full pipe must not stall datagram relaying.
                                if input_tx.try_send(TranscoderInput::Chunk(chunk)).is_err() {
                                    warn!(target: "Media", "Transcoder input is backed up, dropping a chunk");
                                }
                            }
                            *input_handle.lock().await = transcoder.input_sender();
                        }
                    }
                    Some(RawCommand::Destroy(ack)) => {
                        if let Some(task) = feed_task.take() {
                            task.abort();
                        }
                        input_handle.lock().await.take();
                        transcoder.shutdown();
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        if let Some(task) = feed_task.take() {
                            task.abort();
                        }
                        input_handle.lock().await.take();
                        transcoder.shutdown();
                        return;
                    }
                }
            }

            exit = exit_rx.recv() => {
                if let Some(exit) = exit {
                    // Raw relays have no finish sequence to run.
                    if transcoder.mark_exited(exit.generation) {
                        debug!(target: "Media", "Transcoder for raw relay exited");
                    }
                }
            }

            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, _)) => handler(&buf[..len], &track),
                    Err(e) => warn!(target: "Media", "UDP receive error: {e}"),
                }
            }
        }
    }
}
