use std::sync::Arc;

use async_trait::async_trait;

use crate::signaling::protocol::{
    DtlsParameters, RtpCapabilities, RtpParameters, TransportDescriptor,
};
use crate::track::RtpStream;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to load device capabilities: {0}")]
    Load(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// WebRTC-side media device. The signaling layer negotiates capability
/// and transport blobs; an implementation turns those into an actual
/// RTP path to the server.
#[async_trait]
pub trait MediaDevice: Send + Sync {
    async fn load(&self, capabilities: RtpCapabilities) -> Result<(), DeviceError>;
    async fn create_send_transport(
        &self,
        descriptor: TransportDescriptor,
    ) -> Result<Arc<dyn SendTransport>, DeviceError>;
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> String;
    fn dtls_parameters(&self) -> DtlsParameters;
    /// Starts consuming the stream and returns the RTP parameters to
    /// announce when producing.
    async fn attach(&self, stream: RtpStream) -> Result<RtpParameters, DeviceError>;
    async fn close(&self);
}

/// Builds one [`MediaDevice`] per voice connection.
pub trait DeviceFactory: Send + Sync {
    fn create_device(&self) -> Arc<dyn MediaDevice>;
}

/// Device that negotiates like a real one but discards every packet.
/// Default when no WebRTC stack is wired in, and handy in tests.
#[derive(Debug, Default)]
pub struct NullDevice;

#[async_trait]
impl MediaDevice for NullDevice {
    async fn load(&self, _capabilities: RtpCapabilities) -> Result<(), DeviceError> {
        Ok(())
    }

    async fn create_send_transport(
        &self,
        descriptor: TransportDescriptor,
    ) -> Result<Arc<dyn SendTransport>, DeviceError> {
        Ok(Arc::new(NullTransport { descriptor }))
    }
}

pub struct NullTransport {
    descriptor: TransportDescriptor,
}

#[async_trait]
impl SendTransport for NullTransport {
    fn id(&self) -> String {
        match self.descriptor.0.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => "null-transport".to_string(),
        }
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        DtlsParameters(serde_json::json!({
            "role": "client",
            "fingerprints": [],
        }))
    }

    async fn attach(&self, mut stream: RtpStream) -> Result<RtpParameters, DeviceError> {
        tokio::spawn(async move { while stream.recv().await.is_some() {} });
        Ok(RtpParameters(serde_json::json!({
            "codecs": [{
                "mimeType": "audio/opus",
                "clockRate": 48000,
                "payloadType": 100,
                "channels": 2,
            }],
        })))
    }

    async fn close(&self) {}
}

#[derive(Debug, Default)]
pub struct NullDeviceFactory;

impl DeviceFactory for NullDeviceFactory {
    fn create_device(&self) -> Arc<dyn MediaDevice> {
        Arc::new(NullDevice)
    }
}
