use bytes::Bytes;
use tokio::sync::mpsc;

/// Queue depth of one RTP pipe, roughly ten seconds of opus packets.
const PIPE_CAPACITY: usize = 512;

/// Write half of an RTP pipe. Packets written here reach whatever
/// transport the matching [`RtpStream`] is attached to.
#[derive(Debug, Clone)]
pub struct RtpTrack {
    tx: mpsc::Sender<Bytes>,
}

/// Read half of an RTP pipe. Handed to a transport when playback starts.
#[derive(Debug)]
pub struct RtpStream {
    rx: mpsc::Receiver<Bytes>,
}

pub fn channel() -> (RtpTrack, RtpStream) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    (RtpTrack { tx }, RtpStream { rx })
}

impl RtpTrack {
    /// Forwards one RTP packet. Dropped silently when the stream half is
    /// gone, or when nobody is draining it and the pipe has filled up.
    pub fn write_rtp(&self, packet: Bytes) {
        let _ = self.tx.try_send(packet);
    }
}

impl RtpStream {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Bytes, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Handle to an audio producer registered with the signaling server.
#[derive(Debug, Clone)]
pub struct Producer {
    pub id: String,
}
